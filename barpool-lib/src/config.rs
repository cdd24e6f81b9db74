use crate::Result;
use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use core::num::NonZero;
use core::time::Duration;
use ohno::{IntoAppError, app_err};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

/// The default configuration TOML content, embedded from `default_config.toml`
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../default_config.toml");

/// Name of the configuration file looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "barpool.toml";

const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How workers execute tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    /// Each worker is a child process re-running a program in worker mode
    #[default]
    Process,

    /// Each worker is a thread of the coordinating process
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of workers; 0 means the available parallelism
    #[serde(default)]
    pub workers: usize,

    /// Maximum messages drained per progress channel per loop iteration
    #[serde(default = "default_flood_cap")]
    pub flood_cap: usize,

    /// Pause between coordinator loop iterations
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How workers run
    #[serde(default)]
    pub mode: WorkerMode,

    /// Program started for each process worker; defaults to the current executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,

    /// Arguments passed to the worker program
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
}

const fn default_flood_cap() -> usize {
    1000
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

impl PoolConfig {
    /// Load configuration from a file or use defaults
    ///
    /// Without an explicit path, `barpool.toml` in the working directory is used when it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds invalid values
    pub fn load(config_path: Option<&Utf8Path>) -> Result<Self> {
        let (final_path, text) = if let Some(path) = config_path {
            let text = fs::read_to_string(path).into_app_err_with(|| format!("reading barpool configuration file '{path}'"))?;
            (path.to_path_buf(), text)
        } else {
            let path = Utf8PathBuf::from(CONFIG_FILE_NAME);
            match fs::read_to_string(&path) {
                Ok(text) => (path, text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
                Err(e) => return Err(e).into_app_err_with(|| format!("reading barpool configuration file '{path}'")),
            }
        };

        let config: Self = toml::from_str(&text).into_app_err_with(|| format!("parsing configuration file '{final_path}'"))?;
        config.validate()?;

        Ok(config)
    }

    /// Save the default configuration to a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written
    pub fn save_default(output_path: &Utf8Path) -> Result<()> {
        fs::write(output_path, DEFAULT_CONFIG_TOML).into_app_err_with(|| format!("writing default configuration to {output_path}"))?;
        Ok(())
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of range
    pub fn validate(&self) -> Result<()> {
        if self.flood_cap == 0 {
            return Err(app_err!("flood_cap must be at least 1"));
        }

        if self.poll_interval > MAX_POLL_INTERVAL {
            return Err(app_err!(
                "poll_interval must be at most {MAX_POLL_INTERVAL:?}, got {:?}",
                self.poll_interval
            ));
        }

        if self.mode == WorkerMode::Process && self.worker_args.is_empty() {
            return Err(app_err!("worker_args must not be empty in process mode"));
        }

        Ok(())
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_flood_cap(mut self, flood_cap: usize) -> Self {
        self.flood_cap = flood_cap;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: WorkerMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    #[must_use]
    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// The number of workers to start.
    #[must_use]
    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map_or(1, NonZero::get)
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("default_config.toml should be valid TOML that deserializes to PoolConfig")
    }
}

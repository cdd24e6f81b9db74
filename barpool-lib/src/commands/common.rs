//! Logging and color settings shared by the commands.

use crate::Result;
use crate::worker::WorkerAwareLogger;
use camino::Utf8Path;
use clap::ValueEnum;
use indicatif::MultiProgress;
use ohno::IntoAppError;
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};

/// Color mode configuration for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    /// Always use colors
    Always,

    /// Never use colors
    Never,

    /// Use colors if the output is a terminal, otherwise don't use colors
    Auto,
}

impl ColorMode {
    /// Whether to color output written to a stream with the given terminal status.
    #[must_use]
    pub const fn use_colors(self, is_terminal: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => is_terminal,
        }
    }

    #[must_use]
    pub fn for_stdout(self) -> bool {
        self.use_colors(io::stdout().is_terminal())
    }

    #[must_use]
    pub fn for_stderr(self) -> bool {
        self.use_colors(io::stderr().is_terminal())
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// No logging output
    None,

    /// Only error messages
    Error,

    /// Warning and error messages
    Warn,

    /// Info, warning, and error messages
    Info,

    /// Debug, info, warning, and error messages
    Debug,

    /// Trace, debug, info, warning, and error messages
    Trace,
}

impl LogLevel {
    const fn filter(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Error => Some("error"),
            Self::Warn => Some("warn"),
            Self::Info => Some("info"),
            Self::Debug => Some("debug"),
            Self::Trace => Some("trace"),
        }
    }
}

/// Writes log lines while the bars are hidden, so lines land above the bars instead of
/// through them, and appends them to the log file if there is one.
struct LogWriter {
    multi: MultiProgress,
    file: Option<File>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }

        self.multi.suspend(|| io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }

        io::stderr().flush()
    }
}

/// Initialize the logger, writing around the bars of `multi` and, when `log_file` is given,
/// appending to that file as well.
///
/// Targets are always shown: records relayed from workers carry the worker's identity as
/// their target.
pub fn init_logging(log_level: LogLevel, multi: &MultiProgress, log_file: Option<&Utf8Path>) -> Result<()> {
    let Some(level) = log_level.filter() else {
        return Ok(());
    };

    let file = log_file
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .into_app_err_with(|| format!("opening log file '{path}'"))
        })
        .transpose()?;

    let env = env_logger::Env::default().filter_or("RUST_LOG", level);

    let logger = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(true)
        .target(env_logger::Target::Pipe(Box::new(LogWriter { multi: multi.clone(), file })))
        .write_style(if log_file.is_some() { env_logger::WriteStyle::Never } else { env_logger::WriteStyle::Auto })
        .build();

    let max_level = logger.filter();
    if log::set_boxed_logger(Box::new(WorkerAwareLogger::new(logger))).is_ok() {
        log::set_max_level(max_level);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_color_modes_ignore_the_terminal() {
        assert!(ColorMode::Always.use_colors(false));
        assert!(!ColorMode::Never.use_colors(true));
        assert!(ColorMode::Auto.use_colors(true));
        assert!(!ColorMode::Auto.use_colors(false));
    }

    #[test]
    fn none_disables_logging() {
        assert_eq!(LogLevel::None.filter(), None);
        assert_eq!(LogLevel::Debug.filter(), Some("debug"));
    }

    #[test]
    fn none_does_not_touch_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("run.log")).unwrap();

        init_logging(LogLevel::None, &MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden()), Some(path.as_path())).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn log_lines_are_appended_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let mut writer = LogWriter {
            multi: MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden()),
            file: Some(OpenOptions::new().append(true).open(&path).unwrap()),
        };
        writer.write_all(b"[WARN    worker-0] careful\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier run\n[WARN    worker-0] careful\n");
    }
}

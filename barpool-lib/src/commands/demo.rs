use super::Host;
use super::common::{ColorMode, LogLevel, init_logging};
use crate::bars::{BarFactory, IndicatifBars};
use crate::config::{PoolConfig, WorkerMode};
use crate::pool::Pool;
use crate::protocol::BarSpec;
use crate::proxy::{BarProxy, ProgressFactory};
use crate::task::{Task, TaskOutcome, TaskRegistry};
use crate::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use core::time::Duration;
use ohno::bail;
use owo_colors::OwoColorize;
use serde::Deserialize;
use serde_json::{Value, json};
use std::io::Write;
use std::sync::Arc;

const LOG_TARGET: &str = "      demo";

/// Name of the demo task in the registry.
pub const NESTED_TASK: &str = "nested";

#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Number of workers (default comes from the configuration)
    #[arg(long, short = 'w', value_name = "N")]
    pub workers: Option<usize>,

    /// Number of tasks to run
    #[arg(long, short = 't', value_name = "N", default_value_t = 10)]
    pub tasks: usize,

    /// How workers run (default comes from the configuration)
    #[arg(long, value_name = "MODE")]
    pub mode: Option<WorkerMode>,

    /// Path to configuration file (default is `barpool.toml`)
    #[arg(long, short = 'c', value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,

    /// Set the logging level for diagnostic output
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Also append log output to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<Utf8PathBuf>,

    /// Make every K-th task report failure
    #[arg(long, value_name = "K")]
    pub fail_every: Option<usize>,

    /// Steps of the innermost bar
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub steps: u64,

    /// Simulated work per innermost step, in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 10)]
    pub delay_ms: u64,

    /// Control when to use colored output
    #[arg(long, value_name = "WHEN", default_value = "auto")]
    pub color: ColorMode,
}

#[derive(Debug, Deserialize)]
struct NestedArgs {
    index: usize,
    #[serde(default = "default_succeed")]
    succeed: bool,
    #[serde(default = "default_steps")]
    steps: u64,
    #[serde(default)]
    delay_ms: u64,
}

const fn default_succeed() -> bool {
    true
}

const fn default_steps() -> u64 {
    100
}

const MIDDLE_ROUNDS: u64 = 5;
const OUTER_ROUNDS: u64 = 2;

/// The tasks the demo dispatches. Workers started by the demo serve this same registry.
#[must_use]
pub fn demo_tasks() -> TaskRegistry {
    TaskRegistry::new().with(NESTED_TASK, nested)
}

/// Three nested bars driven together, with log records at several levels along the way.
fn nested(args: &Value, progress: &ProgressFactory, global: &BarProxy) -> Result<Value> {
    let args: NestedArgs = serde_json::from_value(args.clone())?;
    let delay = Duration::from_millis(args.delay_ms);

    log::debug!(target: LOG_TARGET, "Task {} starting, this line only shows at debug level", args.index);
    log::info!(target: LOG_TARGET, "Task {} starting", args.index);

    let outer = progress.create(BarSpec::new().total(args.steps * MIDDLE_ROUNDS * OUTER_ROUNDS).description("outer"));
    let outer = outer.scope();

    for _ in 0..OUTER_ROUNDS {
        log::info!(target: LOG_TARGET, "Task {} outer round", args.index);

        let middle = progress.create(BarSpec::new().total(args.steps * MIDDLE_ROUNDS).description("middle").leave(false));
        let middle = middle.scope();

        for _ in 0..MIDDLE_ROUNDS {
            let inner = progress.create(BarSpec::new().total(args.steps).leave(false));
            let inner = inner.scope();
            inner.set_description("inner");

            for _ in 0..args.steps {
                std::thread::sleep(delay);
                inner.inc();
                middle.inc();
                outer.inc();
            }
        }
    }

    drop(outer);
    global.inc();

    if args.succeed {
        log::warn!(target: LOG_TARGET, "Task {} warning test message", args.index);
    } else {
        log::error!(target: LOG_TARGET, "Task {} error test message", args.index);
    }

    Ok(Value::Bool(args.succeed))
}

/// Run the demo: a batch of nested-bar tasks over a pool, with a global "Tasks" bar.
pub async fn run_demo<H: Host>(host: &mut H, args: &DemoArgs) -> Result<()> {
    if args.fail_every == Some(0) {
        bail!("--fail-every must be at least 1");
    }

    let bars = IndicatifBars::new(args.color.for_stderr());
    init_logging(args.log_level, bars.multi(), args.log_file.as_deref())?;

    let mut config = PoolConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(mode) = args.mode {
        config = config.with_mode(mode);
    }

    let mut pool = Pool::start(config, Arc::new(demo_tasks()), bars.clone())?;
    let mut global = bars.create(&BarSpec::new().total(args.tasks as u64).description("Tasks").unit("tasks"));

    let tasks = (0..args.tasks)
        .map(|index| {
            let succeed = args.fail_every.is_none_or(|k| (index + 1) % k != 0);
            Task::new(
                NESTED_TASK,
                json!({ "index": index, "succeed": succeed, "steps": args.steps, "delay_ms": args.delay_ms }),
            )
        })
        .collect();

    let mut errors = 0;
    let results = pool
        .map(
            host,
            global.as_mut(),
            tasks,
            |outcome| {
                errors += 1;
                log::warn!(target: LOG_TARGET, "Error! A task reported {outcome}");
            },
            |_| {},
        )
        .await?;

    global.close();
    pool.shutdown().await;

    let use_colors = args.color.for_stdout();
    let rendered: Vec<String> = results.iter().map(|outcome| render(outcome, use_colors)).collect();

    let mut out = host.output();
    let _ = writeln!(out, "[{}]", rendered.join(", "));
    let _ = writeln!(out, "{} of {} task(s) failed", errors, results.len());

    Ok(())
}

fn render(outcome: &TaskOutcome, use_colors: bool) -> String {
    let text = match outcome {
        TaskOutcome::Completed(value) => value.to_string(),
        TaskOutcome::Failed { .. } => "failed".to_string(),
        TaskOutcome::Lost { .. } => "lost".to_string(),
    };

    match (use_colors, outcome.is_success()) {
        (false, _) => text,
        (true, true) => text.green().to_string(),
        (true, false) => text.red().to_string(),
    }
}

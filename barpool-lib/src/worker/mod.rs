//! The entry point executed inside each worker process.
//!
//! A pool starts its workers by re-running a program with [`SLOT_ENV`] set. That program
//! calls [`slot_from_env`] early and, when it returns a slot, hands control to [`serve`]
//! with the same task registry the coordinator uses.
//!
//! A worker reads one job per line from stdin and writes frames to stdout: the log records
//! and bar operations produced while a task runs, followed by the task's outcome. It exits
//! when stdin reaches end of file.

mod log_forward;

pub use log_forward::{ForwardingLogger, WorkerAwareLogger};
pub(crate) use log_forward::forward_thread_logs;

use crate::Result;
use crate::protocol::{Frame, WireJob, WorkerId, decode_line, encode_line};
use crate::proxy::{BarIds, BarProxy, FrameSink, ProgressFactory};
use crate::task::{TaskRegistry, execute};
use log::LevelFilter;
use ohno::{IntoAppError, app_err};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Environment variable carrying a worker's slot.
pub const SLOT_ENV: &str = "BARPOOL_WORKER_SLOT";

/// Environment variable carrying the coordinator's maximum log level.
pub const LOG_LEVEL_ENV: &str = "BARPOOL_LOG_LEVEL";

/// The slot assigned to this process, if it was started as a worker.
#[must_use]
pub fn slot_from_env() -> Option<WorkerId> {
    std::env::var(SLOT_ENV).ok()?.trim().parse().ok().map(WorkerId)
}

fn level_from_env() -> LevelFilter {
    std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Writes frames to stdout, one per line.
#[derive(Debug)]
struct StdoutSink {
    out: Mutex<io::Stdout>,
}

impl FrameSink for StdoutSink {
    fn emit(&self, frame: Frame) {
        let Ok(line) = encode_line(&frame) else {
            return;
        };

        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = out.write_all(line.as_bytes());
        let _ = out.flush();
    }
}

/// Run as worker `slot` until stdin closes.
///
/// Local log records are forwarded to the coordinator rather than printed, and interrupts are
/// ignored: the coordinator owns interrupt handling and closes stdin when the pool shuts down.
///
/// # Errors
///
/// Fails if the log forwarder cannot be installed, if stdin cannot be read, or if a job
/// cannot be decoded.
pub fn serve(slot: WorkerId, registry: &TaskRegistry) -> Result<()> {
    let sink: Arc<dyn FrameSink> = Arc::new(StdoutSink { out: Mutex::new(io::stdout()) });

    let level = level_from_env();
    log::set_boxed_logger(Box::new(ForwardingLogger::new(Arc::clone(&sink), level)))
        .into_app_err("installing the worker log forwarder")?;
    log::set_max_level(level);

    if let Err(e) = ctrlc::set_handler(|| {}) {
        log::warn!("{slot} is unable to ignore interrupts: {e}");
    }

    log::debug!("{slot} ready");
    run_jobs(registry, io::stdin().lock(), &sink)
}

/// Execute every job read from `input`, emitting frames through `sink`.
fn run_jobs(registry: &TaskRegistry, input: impl BufRead, sink: &Arc<dyn FrameSink>) -> Result<()> {
    // one counter for the worker's lifetime keeps bar ids unique across tasks
    let ids = BarIds::default();
    let global = BarProxy::global(Arc::clone(sink));

    for line in input.lines() {
        let line = line.into_app_err("reading a job from the coordinator")?;
        if line.trim().is_empty() {
            continue;
        }

        let job: WireJob = decode_line(&line).map_err(|e| app_err!("malformed job from the coordinator: {e:#}"))?;
        let factory = ProgressFactory::new(Arc::clone(sink), ids.clone());
        let outcome = execute(registry, &job.operation, &job.args, &factory, &global);

        sink.emit(Frame::Done { task: job.task, outcome });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BarOp, BarSpec};
    use crate::task::TaskOutcome;
    use serde_json::{Value, json};

    #[derive(Debug, Default)]
    struct VecSink(Mutex<Vec<Frame>>);

    impl FrameSink for VecSink {
        fn emit(&self, frame: Frame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    fn registry() -> TaskRegistry {
        TaskRegistry::new().with("bar", |_: &Value, progress: &ProgressFactory, _: &BarProxy| {
            let bar = progress.create(BarSpec::new().total(1));
            bar.inc();
            bar.close();
            Ok(json!(true))
        })
    }

    fn job(task: u64, operation: &str) -> String {
        encode_line(&WireJob {
            task,
            operation: operation.to_string(),
            args: Value::Null,
        })
        .unwrap()
    }

    #[test]
    fn every_job_ends_with_done() {
        let sink = Arc::new(VecSink::default());
        let input = format!("{}\n{}", job(0, "bar"), job(1, "missing"));

        run_jobs(&registry(), input.as_bytes(), &(Arc::clone(&sink) as Arc<dyn FrameSink>)).unwrap();

        let frames = sink.0.lock().unwrap();
        assert!(matches!(frames[0], Frame::Progress { op: BarOp::Create(_), .. }));
        assert_eq!(frames[3], Frame::Done { task: 0, outcome: TaskOutcome::Completed(json!(true)) });
        assert!(matches!(&frames[4], Frame::Done { task: 1, outcome: TaskOutcome::Failed { .. } }));
        assert_eq!(frames.len(), 5);
    }

    #[test]
    fn bar_ids_are_not_reused_across_jobs() {
        let sink = Arc::new(VecSink::default());
        let input = format!("{}{}", job(0, "bar"), job(1, "bar"));

        run_jobs(&registry(), input.as_bytes(), &(Arc::clone(&sink) as Arc<dyn FrameSink>)).unwrap();

        let created: Vec<_> = sink
            .0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Progress { bar, op: BarOp::Create(_) } => Some(*bar),
                _ => None,
            })
            .collect();
        assert_eq!(created.len(), 2);
        assert_ne!(created[0], created[1]);
    }

    #[test]
    fn malformed_job_is_an_error() {
        let sink: Arc<dyn FrameSink> = Arc::new(VecSink::default());
        assert!(run_jobs(&registry(), "not json\n".as_bytes(), &sink).is_err());
    }
}

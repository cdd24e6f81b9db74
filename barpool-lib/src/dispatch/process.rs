use super::{Job, JobQueue};
use crate::Result;
use crate::channel::Routes;
use crate::protocol::{Frame, WireJob, WorkerId, decode_line, encode_line};
use crate::task::TaskOutcome;
use crate::worker::{LOG_LEVEL_ENV, SLOT_ENV};
use log::LevelFilter;
use ohno::{IntoAppError, app_err};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "   process";

type FrameLines = Lines<BufReader<ChildStdout>>;

/// Start a worker process and the link task that feeds it jobs.
///
/// The worker learns its slot and log level through the environment. Its stdin carries jobs
/// and its stdout carries frames; stderr is left attached to the coordinator's terminal.
pub(crate) fn spawn_process(
    slot: WorkerId,
    program: &Path,
    args: &[String],
    log_level: LevelFilter,
    queue: JobQueue,
    routes: Routes,
) -> Result<JoinHandle<()>> {
    let mut child = Command::new(program)
        .args(args)
        .env(SLOT_ENV, slot.0.to_string())
        .env(LOG_LEVEL_ENV, log_level.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .into_app_err_with(|| format!("starting {slot} from '{}'", program.display()))?;

    let stdin = child.stdin.take().ok_or_else(|| app_err!("{slot} has no stdin pipe"))?;
    let stdout = child.stdout.take().ok_or_else(|| app_err!("{slot} has no stdout pipe"))?;

    log::debug!(target: LOG_TARGET, "Started {slot} as pid {}", child.id().unwrap_or_default());

    queue.join();
    Ok(tokio::spawn(link(slot, child, stdin, BufReader::new(stdout).lines(), queue, routes)))
}

async fn link(slot: WorkerId, mut child: Child, mut stdin: ChildStdin, mut lines: FrameLines, queue: JobQueue, routes: Routes) {
    let mut alive = true;

    while let Some(job) = queue.next().await {
        let Job { task, operation, args, reply } = job;

        let line = match encode_line(&WireJob { task, operation, args }) {
            Ok(line) => line,
            Err(e) => {
                let _ = reply.send(TaskOutcome::Failed { reason: format!("{e:#}") });
                continue;
            }
        };

        if let Err(e) = send_line(&mut stdin, &line).await {
            log::error!(target: LOG_TARGET, "Unable to hand task {task} to {slot}: {e}");
            let _ = reply.send(TaskOutcome::Lost {
                reason: format!("{slot} stopped accepting work"),
            });
            alive = false;
            break;
        }

        if let Some(outcome) = pump(slot, &mut lines, &routes, task).await {
            let _ = reply.send(outcome);
        } else {
            log::error!(target: LOG_TARGET, "{slot} exited while running task {task}");
            let _ = reply.send(TaskOutcome::Lost {
                reason: format!("{slot} exited while running the task"),
            });
            alive = false;
            break;
        }
    }

    // closing stdin is the worker's signal to exit
    drop(stdin);

    if alive {
        // output written while the worker shuts down still counts
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some((task, _)) = route_line(slot, &line, &routes) {
                log::warn!(target: LOG_TARGET, "{slot} reported task {task} after its queue closed");
            }
        }
    }

    queue.leave().await;

    match child.wait().await {
        Ok(status) if status.success() => log::debug!(target: LOG_TARGET, "{slot} exited"),
        Ok(status) => log::warn!(target: LOG_TARGET, "{slot} exited with {status}"),
        Err(e) => log::warn!(target: LOG_TARGET, "Unable to wait for {slot}: {e}"),
    }
}

async fn send_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Route frames from the worker until it reports `task` as done.
///
/// Returns `None` if the worker's output ends first.
async fn pump(slot: WorkerId, lines: &mut FrameLines, routes: &Routes, task: u64) -> Option<TaskOutcome> {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Unable to read from {slot}: {e}");
                return None;
            }
        };

        match route_line(slot, &line, routes) {
            Some((done, outcome)) if done == task => return Some(outcome),
            Some((done, _)) => log::warn!(target: LOG_TARGET, "{slot} reported task {done} while running task {task}, ignoring it"),
            None => {}
        }
    }
}

/// Decode a line of worker output and route it.
///
/// A line that is not a frame, such as stray output printed by a task, is logged and
/// discarded.
fn route_line(slot: WorkerId, line: &str, routes: &Routes) -> Option<(u64, TaskOutcome)> {
    if line.trim().is_empty() {
        return None;
    }

    match decode_line::<Frame>(line) {
        Ok(frame) => routes.route(slot, frame),
        Err(e) => {
            log::warn!(target: LOG_TARGET, "Discarding undecodable output from {slot}: {e:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Recv, routes};
    use crate::protocol::{BarId, BarOp};

    #[test]
    fn stray_output_is_discarded() {
        let (routes, mut inboxes) = routes();
        assert!(route_line(WorkerId(0), "hello from a task", &routes).is_none());
        assert!(route_line(WorkerId(0), "   ", &routes).is_none());
        assert_eq!(inboxes.progress.try_next(), Recv::Empty);
        assert_eq!(inboxes.log.try_next(), Recv::Empty);
    }

    #[test]
    fn frames_are_routed() {
        let (routes, mut inboxes) = routes();
        let line = encode_line(&Frame::Progress {
            bar: BarId(4),
            op: BarOp::Update { n: 1 },
        })
        .unwrap();

        assert!(route_line(WorkerId(2), line.trim_end(), &routes).is_none());
        let Recv::Message(message) = inboxes.progress.try_next() else {
            panic!("expected a progress message");
        };
        assert_eq!(message.source, WorkerId(2));
        assert_eq!(message.bar, BarId(4));
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let (_dispatcher, queue) = crate::dispatch::Dispatcher::new(std::sync::Arc::default());
        let (routes, _inboxes) = routes();
        let result = spawn_process(
            WorkerId(0),
            Path::new("/nonexistent/barpool-worker"),
            &[],
            LevelFilter::Off,
            queue,
            routes,
        );
        assert!(result.is_err());
    }
}

//! Hands tasks to workers and tracks their completion.
//!
//! Submitted tasks go onto a single job queue shared by every worker link. Whichever link is
//! idle takes the next job, runs it on its worker, and answers through the job's reply
//! channel, which backs the [`TaskHandle`] returned by [`Dispatcher::submit`].

mod local;
mod process;

pub(crate) use local::spawn_local;
pub(crate) use process::spawn_process;

use crate::Result;
use crate::task::{Task, TaskOutcome, TaskRegistry};
use core::sync::atomic::{AtomicUsize, Ordering};
use ohno::bail;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

const LOG_TARGET: &str = "  dispatch";

/// One task on its way to a worker.
#[derive(Debug)]
pub(crate) struct Job {
    pub task: u64,
    pub operation: String,
    pub args: Value,
    pub reply: oneshot::Sender<TaskOutcome>,
}

/// The consuming side of the job queue, shared by every worker link.
#[derive(Debug, Clone)]
pub(crate) struct JobQueue {
    jobs: Arc<tokio::sync::Mutex<UnboundedReceiver<Job>>>,
    live_links: Arc<AtomicUsize>,
}

impl JobQueue {
    /// Wait for the next job. Returns `None` once the dispatcher is closed and the queue is empty.
    pub async fn next(&self) -> Option<Job> {
        self.jobs.lock().await.recv().await
    }

    /// Count a link that will be taking jobs from the queue.
    pub fn join(&self) {
        let _ = self.live_links.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by a link whose worker is gone.
    ///
    /// When the last link leaves, queued jobs can no longer run: they are answered as lost and
    /// the queue stops accepting work.
    pub async fn leave(&self) {
        if self.live_links.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        let mut jobs = self.jobs.lock().await;
        jobs.close();

        let mut abandoned = 0;
        while let Ok(job) = jobs.try_recv() {
            let _ = job.reply.send(TaskOutcome::Lost {
                reason: "no worker is left to run the task".to_string(),
            });
            abandoned += 1;
        }

        if abandoned > 0 {
            log::warn!(target: LOG_TARGET, "Every worker is gone, abandoning {abandoned} queued task(s)");
        }
    }
}

/// Accepts tasks and hands out one [`TaskHandle`] per task.
#[derive(Debug)]
pub struct Dispatcher {
    jobs: Option<UnboundedSender<Job>>,
    next_task: u64,
    registry: Arc<TaskRegistry>,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<TaskRegistry>) -> (Self, JobQueue) {
        let (tx, rx) = unbounded_channel();
        let dispatcher = Self {
            jobs: Some(tx),
            next_task: 0,
            registry,
        };

        let queue = JobQueue {
            jobs: Arc::new(tokio::sync::Mutex::new(rx)),
            live_links: Arc::new(AtomicUsize::new(0)),
        };

        (dispatcher, queue)
    }

    /// Queue `tasks` for execution, returning their handles in the same order.
    ///
    /// Never waits for a worker. A task naming an operation missing from the registry is not
    /// dispatched; its handle is immediately ready with a failure.
    ///
    /// # Errors
    ///
    /// Fails if the dispatcher has been closed.
    pub fn submit(&mut self, tasks: impl IntoIterator<Item = Task>) -> Result<Vec<TaskHandle>> {
        let Some(jobs) = &self.jobs else {
            bail!("the pool is closed and accepts no more tasks");
        };

        let mut handles = Vec::new();
        for task in tasks {
            let id = self.next_task;
            self.next_task += 1;

            if !self.registry.contains(&task.operation) {
                handles.push(TaskHandle::ready(
                    id,
                    TaskOutcome::Failed {
                        reason: format!(
                            "unknown operation '{}' (known: {})",
                            task.operation,
                            self.registry.names().collect::<Vec<_>>().join(", ")
                        ),
                    },
                ));
                continue;
            }

            let (reply, rx) = oneshot::channel();
            let job = Job {
                task: id,
                operation: task.operation,
                args: task.args,
                reply,
            };

            if jobs.send(job).is_err() {
                handles.push(TaskHandle::ready(
                    id,
                    TaskOutcome::Lost {
                        reason: "no worker is left to run the task".to_string(),
                    },
                ));
                continue;
            }

            log::trace!(target: LOG_TARGET, "Queued task {id}");
            handles.push(TaskHandle {
                task: id,
                rx: Some(rx),
                outcome: None,
            });
        }

        Ok(handles)
    }

    /// Stop accepting tasks. Tasks already queued still run.
    pub fn close(&mut self) {
        if self.jobs.take().is_some() {
            log::debug!(target: LOG_TARGET, "Dispatcher closed");
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.jobs.is_none()
    }
}

/// A task whose outcome may not be known yet.
#[derive(Debug)]
pub struct TaskHandle {
    task: u64,
    rx: Option<oneshot::Receiver<TaskOutcome>>,
    outcome: Option<TaskOutcome>,
}

impl TaskHandle {
    fn ready(task: u64, outcome: TaskOutcome) -> Self {
        Self {
            task,
            rx: None,
            outcome: Some(outcome),
        }
    }

    /// The id the task was dispatched under, as seen by worker links.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.task
    }

    /// Check, without waiting, whether the outcome is known.
    ///
    /// If the worker running the task went away without answering, the handle becomes ready
    /// with [`TaskOutcome::Lost`].
    pub fn is_ready(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }

        let Some(rx) = self.rx.as_mut() else {
            return false;
        };

        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Closed) => TaskOutcome::Lost {
                reason: "the worker went away without reporting an outcome".to_string(),
            },
        };

        self.rx = None;
        self.outcome = Some(outcome);
        true
    }

    /// Take the outcome. Returns `None` unless [`Self::is_ready`] has returned `true`, and on
    /// every call after the first.
    pub const fn value(&mut self) -> Option<TaskOutcome> {
        self.outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry::new().with("echo", |args, _, _| Ok(args.clone())))
    }

    #[tokio::test]
    async fn handles_follow_submission_order() {
        let (mut dispatcher, queue) = Dispatcher::new(registry());
        let mut handles = dispatcher.submit((0..3).map(|i| Task::new("echo", json!(i)))).unwrap();
        assert_eq!(handles.iter().map(TaskHandle::id).collect::<Vec<_>>(), [0, 1, 2]);
        assert!(!handles[0].is_ready());

        for expected in 0..3 {
            let job = queue.next().await.unwrap();
            assert_eq!(job.task, expected);
            job.reply.send(TaskOutcome::Completed(job.args)).unwrap();
        }

        for (i, handle) in handles.iter_mut().enumerate() {
            assert!(handle.is_ready());
            assert_eq!(handle.value(), Some(TaskOutcome::Completed(json!(i))));
            assert_eq!(handle.value(), None);
        }
    }

    #[test]
    fn unknown_operation_is_ready_at_once() {
        let (mut dispatcher, _queue) = Dispatcher::new(registry());
        let mut handles = dispatcher.submit([Task::new("nope", json!(null))]).unwrap();

        assert!(handles[0].is_ready());
        assert!(matches!(handles[0].value(), Some(TaskOutcome::Failed { reason }) if reason.contains("nope") && reason.contains("echo")));
    }

    #[test]
    fn dropped_reply_means_lost() {
        let (mut dispatcher, queue) = Dispatcher::new(registry());
        let mut handles = dispatcher.submit([Task::new("echo", json!(1))]).unwrap();

        drop(queue);
        assert!(handles[0].is_ready());
        assert!(matches!(handles[0].value(), Some(TaskOutcome::Lost { .. })));
    }

    #[test]
    fn closed_dispatcher_rejects_tasks() {
        let (mut dispatcher, _queue) = Dispatcher::new(registry());
        dispatcher.close();
        assert!(dispatcher.is_closed());
        assert!(dispatcher.submit([Task::new("echo", json!(1))]).is_err());
    }

    #[tokio::test]
    async fn last_link_leaving_abandons_queued_work() {
        let (mut dispatcher, queue) = Dispatcher::new(registry());
        queue.join();
        queue.join();

        let mut handles = dispatcher.submit([Task::new("echo", json!(1))]).unwrap();

        queue.leave().await;
        assert!(!handles[0].is_ready());

        queue.leave().await;
        assert!(handles[0].is_ready());
        assert!(matches!(handles[0].value(), Some(TaskOutcome::Lost { .. })));

        let mut late = dispatcher.submit([Task::new("echo", json!(2))]).unwrap();
        assert!(late[0].is_ready());
        assert!(matches!(late[0].value(), Some(TaskOutcome::Lost { .. })));
    }
}

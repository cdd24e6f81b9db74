//! The control loop of a pool run.
//!
//! Each iteration relays worker log records to the local logger, replays a bounded number
//! of bar operations, and polls every unfinished task once. Nothing in the loop waits on a
//! channel or a task; between iterations the loop yields to the runtime for the configured
//! poll interval.
//!
//! The loop runs until every task is done or the cancel token is set. Its owner then calls
//! [`Coordinator::final_drain`], one unbounded pass over all channels, so the bars show their
//! true final state.

use crate::bars::{Bar, BarFactory, ProgressRegistry, replay};
use crate::channel::{Inboxes, Recv};
use crate::dispatch::TaskHandle;
use crate::protocol::{BarOp, GlobalMessage, WorkerLog};
use crate::shutdown::CancelToken;
use crate::task::{TaskOutcome, is_truthy};
use core::time::Duration;
use log::Record;

const LOG_TARGET: &str = "     coord";

/// How a run of the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Every task has an outcome.
    Done,

    /// The cancel token was set before every task finished.
    Terminated,
}

#[derive(Debug)]
struct TaskRecord {
    operation: String,
    handle: TaskHandle,
    result: Option<TaskOutcome>,
}

/// The tasks of one run, in submission order.
#[derive(Debug, Default)]
pub struct TaskTable {
    records: Vec<TaskRecord>,
    pending: usize,
}

impl TaskTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: impl Into<String>, handle: TaskHandle) {
        self.records.push(TaskRecord {
            operation: operation.into(),
            handle,
            result: None,
        });
        self.pending += 1;
    }

    /// Number of tasks without an outcome yet.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The outcomes in submission order. Tasks that never finished are reported as lost.
    #[must_use]
    pub fn into_results(self) -> Vec<TaskOutcome> {
        self.records
            .into_iter()
            .map(|record| {
                record.result.unwrap_or_else(|| TaskOutcome::Lost {
                    reason: "the run ended before the task finished".to_string(),
                })
            })
            .collect()
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Tasks that got their outcome during the iteration.
    pub finished: usize,

    /// The flood cap stopped the worker progress drain with messages still queued.
    pub progress_flooded: bool,

    /// The flood cap stopped the global progress drain with messages still queued.
    pub global_flooded: bool,
}

/// Callback invoked with a task's outcome.
pub type OutcomeFn<'a> = dyn FnMut(&TaskOutcome) + 'a;

/// Multiplexes the worker channels onto the local logger and bars, and tracks completion.
pub struct Coordinator<'a, F> {
    inboxes: &'a mut Inboxes,
    registry: &'a mut ProgressRegistry<F>,
    global: &'a mut dyn Bar,
    flood_cap: usize,
    poll_interval: Duration,
}

impl<'a, F: BarFactory> Coordinator<'a, F> {
    #[must_use]
    pub fn new(
        inboxes: &'a mut Inboxes,
        registry: &'a mut ProgressRegistry<F>,
        global: &'a mut dyn Bar,
        flood_cap: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inboxes,
            registry,
            global,
            flood_cap: flood_cap.max(1),
            poll_interval,
        }
    }

    /// Run until every task is done or `cancel` is set.
    pub async fn run(&mut self, table: &mut TaskTable, cancel: &CancelToken, on_error: &mut OutcomeFn<'_>, on_done: &mut OutcomeFn<'_>) -> LoopExit {
        let exit = loop {
            if cancel.is_cancelled() {
                break LoopExit::Terminated;
            }

            if table.pending() == 0 {
                break LoopExit::Done;
            }

            let _ = self.step(table, on_error, on_done);

            if table.pending() > 0 && !cancel.is_cancelled() {
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        log::debug!(target: LOG_TARGET, "Loop exited ({exit:?})");
        exit
    }

    /// One loop iteration.
    pub fn step(&mut self, table: &mut TaskTable, on_error: &mut OutcomeFn<'_>, on_done: &mut OutcomeFn<'_>) -> StepReport {
        let _ = self.drain_logs();

        let progress_flooded = self.drain_progress(Some(self.flood_cap)) == self.flood_cap && !self.inboxes.progress.is_empty();
        if progress_flooded {
            log::warn!(
                target: LOG_TARGET,
                "Worker progress flooded: {} messages this iteration, deferring the rest",
                self.flood_cap
            );
        }

        let global_flooded = self.drain_global(Some(self.flood_cap)) == self.flood_cap && !self.inboxes.global.is_empty();
        if global_flooded {
            log::warn!(
                target: LOG_TARGET,
                "Global progress flooded: {} messages this iteration, deferring the rest",
                self.flood_cap
            );
        }

        StepReport {
            finished: poll_tasks(table, on_error, on_done),
            progress_flooded,
            global_flooded,
        }
    }

    /// Drain every channel without a cap.
    pub fn final_drain(&mut self) {
        let logs = self.drain_logs();
        let progress = self.drain_progress(None);
        let global = self.drain_global(None);

        log::trace!(target: LOG_TARGET, "Final drain: {logs} log, {progress} progress, {global} global message(s)");
    }

    fn drain_logs(&mut self) -> usize {
        let mut count = 0;
        while let Recv::Message(message) = self.inboxes.log.try_next() {
            relay(&message);
            count += 1;
        }

        count
    }

    fn drain_progress(&mut self, cap: Option<usize>) -> usize {
        let mut count = 0;
        while cap.is_none_or(|cap| count < cap) {
            let Recv::Message(message) = self.inboxes.progress.try_next() else {
                break;
            };

            let _ = self.registry.apply(message);
            count += 1;
        }

        count
    }

    fn drain_global(&mut self, cap: Option<usize>) -> usize {
        let mut count = 0;
        while cap.is_none_or(|cap| count < cap) {
            let Recv::Message(message) = self.inboxes.global.try_next() else {
                break;
            };

            self.apply_global(&message);
            count += 1;
        }

        count
    }

    // The global bar belongs to the caller of the run: workers may drive it but not create or end it.
    fn apply_global(&mut self, message: &GlobalMessage) {
        match message.op {
            BarOp::Create(_) | BarOp::Exit | BarOp::Close => {
                log::debug!(
                    target: LOG_TARGET,
                    "Ignoring '{}' on the global bar from {}",
                    message.op.name(),
                    message.source
                );
            }
            _ => {
                let _ = replay(self.global, &message.op);
            }
        }
    }
}

impl<F> core::fmt::Debug for Coordinator<'_, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Coordinator")
            .field("global", &"<dyn Bar>")
            .field("flood_cap", &self.flood_cap)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

/// Re-emit a worker's log record through the local logger, tagged with the worker's identity.
fn relay(message: &WorkerLog) {
    let record = &message.record;
    if record.level > log::max_level() {
        return;
    }

    let target = format!("{:>10}", message.source.to_string());
    log::logger().log(
        &Record::builder()
            .level(record.level)
            .target(&target)
            .args(format_args!("{}", record.message))
            .build(),
    );
}

/// Check every unfinished task once, returning how many finished now.
fn poll_tasks(table: &mut TaskTable, on_error: &mut OutcomeFn<'_>, on_done: &mut OutcomeFn<'_>) -> usize {
    let mut finished = 0;

    for (index, record) in table.records.iter_mut().enumerate() {
        if record.result.is_some() || !record.handle.is_ready() {
            continue;
        }

        let Some(outcome) = record.handle.value() else {
            continue;
        };

        match &outcome {
            TaskOutcome::Completed(value) if !is_truthy(value) => {
                log::info!(target: LOG_TARGET, "Task {index} ({}) returned {value}", record.operation);
            }
            TaskOutcome::Completed(_) => {
                log::trace!(target: LOG_TARGET, "Task {index} ({}) completed", record.operation);
            }
            TaskOutcome::Failed { reason } => {
                log::error!(target: LOG_TARGET, "Task {index} ({}, job {}) failed: {reason}", record.operation, record.handle.id());
            }
            TaskOutcome::Lost { reason } => {
                log::error!(target: LOG_TARGET, "Task {index} ({}, job {}) was lost: {reason}", record.operation, record.handle.id());
            }
        }

        table.pending -= 1;
        finished += 1;

        if !outcome.is_success() {
            on_error(&outcome);
        }
        on_done(&outcome);

        record.result = Some(outcome);
    }

    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::RecordingBars;
    use crate::channel::{Routes, routes};
    use crate::dispatch::Dispatcher;
    use crate::protocol::{BarId, BarSpec, Frame, WorkerId};
    use crate::task::{Task, TaskRegistry};
    use futures_util::FutureExt;
    use serde_json::{Value, json};
    use std::sync::Arc;

    struct Fixture {
        routes: Routes,
        inboxes: Inboxes,
        registry: ProgressRegistry<RecordingBars>,
        bars: RecordingBars,
        global: Box<dyn Bar>,
    }

    impl Fixture {
        fn new() -> Self {
            let (routes, inboxes) = routes();
            let bars = RecordingBars::new();
            let global = bars.create(&BarSpec::new().description("Tasks"));

            Self {
                routes,
                inboxes,
                registry: ProgressRegistry::new(bars.clone()),
                bars,
                global,
            }
        }

        fn coordinator(&mut self, flood_cap: usize) -> Coordinator<'_, RecordingBars> {
            Coordinator::new(
                &mut self.inboxes,
                &mut self.registry,
                self.global.as_mut(),
                flood_cap,
                Duration::from_millis(1),
            )
        }
    }

    /// A table of `n` tasks whose outcomes are delivered by hand.
    fn table(n: usize) -> (TaskTable, Vec<tokio::sync::oneshot::Sender<TaskOutcome>>, Dispatcher) {
        let registry = Arc::new(TaskRegistry::new().with("noop", |_, _, _| Ok(Value::Null)));
        let (mut dispatcher, queue) = Dispatcher::new(registry);
        let handles = dispatcher.submit((0..n).map(|_| Task::new("noop", Value::Null))).unwrap();

        let mut replies = Vec::new();
        let mut table = TaskTable::new();
        for handle in handles {
            table.push("noop", handle);
            let job = queue.next().now_or_never().flatten().unwrap();
            replies.push(job.reply);
        }

        (table, replies, dispatcher)
    }

    #[test]
    fn falsy_result_calls_each_callback_once() {
        let mut fixture = Fixture::new();
        let (mut table, mut replies, _dispatcher) = table(1);
        replies.remove(0).send(TaskOutcome::Completed(json!(false))).unwrap();

        let mut errors = 0;
        let mut dones = 0;
        let mut coordinator = fixture.coordinator(10);
        for _ in 0..3 {
            let _ = coordinator.step(&mut table, &mut |_| errors += 1, &mut |_| dones += 1);
        }

        assert_eq!((errors, dones), (1, 1));
        assert_eq!(table.pending(), 0);
        assert_eq!(table.into_results(), [TaskOutcome::Completed(json!(false))]);
    }

    #[test]
    fn results_keep_submission_order() {
        let mut fixture = Fixture::new();
        let (mut table, replies, _dispatcher) = table(3);

        for (i, reply) in replies.into_iter().enumerate().rev() {
            reply.send(TaskOutcome::Completed(json!(i))).unwrap();
        }

        let report = fixture.coordinator(10).step(&mut table, &mut |_| {}, &mut |_| {});
        assert_eq!(report.finished, 3);
        assert_eq!(
            table.into_results(),
            [TaskOutcome::Completed(json!(0)), TaskOutcome::Completed(json!(1)), TaskOutcome::Completed(json!(2))]
        );
    }

    #[test]
    fn failures_reach_on_error_without_stopping() {
        let mut fixture = Fixture::new();
        let (mut table, mut replies, _dispatcher) = table(2);
        replies.remove(0).send(TaskOutcome::Failed { reason: "boom".into() }).unwrap();
        drop(replies);

        let mut errors = Vec::new();
        let _ = fixture.coordinator(10).step(&mut table, &mut |outcome| errors.push(outcome.clone()), &mut |_| {});

        assert_eq!(table.pending(), 0);
        assert!(matches!(errors[0], TaskOutcome::Failed { .. }));
        assert!(matches!(errors[1], TaskOutcome::Lost { .. }));
    }

    #[test]
    fn flood_cap_bounds_each_iteration() {
        let mut fixture = Fixture::new();
        let source = WorkerId(0);
        let _ = fixture.routes.route(source, Frame::Progress { bar: BarId(0), op: BarOp::Create(BarSpec::new()) });
        for _ in 0..25 {
            let _ = fixture.routes.route(source, Frame::Progress { bar: BarId(0), op: BarOp::Update { n: 1 } });
            let _ = fixture.routes.route(source, Frame::Global { op: BarOp::Update { n: 1 } });
        }

        let (mut table, _replies, _dispatcher) = table(1);
        let mut coordinator = fixture.coordinator(10);
        let report = coordinator.step(&mut table, &mut |_| {}, &mut |_| {});
        drop(coordinator);

        assert!(report.progress_flooded);
        assert!(report.global_flooded);

        let records = fixture.bars.snapshot();
        assert_eq!(records[1].updates, 9);
        assert_eq!(records[0].updates, 10);

        fixture.coordinator(10).final_drain();
        let records = fixture.bars.snapshot();
        assert_eq!(records[1].updates, 25);
        assert_eq!(records[0].updates, 25);
    }

    #[test]
    fn draining_exactly_the_cap_is_not_a_flood() {
        let mut fixture = Fixture::new();
        let source = WorkerId(0);
        let _ = fixture.routes.route(source, Frame::Progress { bar: BarId(0), op: BarOp::Create(BarSpec::new()) });
        for _ in 0..9 {
            let _ = fixture.routes.route(source, Frame::Progress { bar: BarId(0), op: BarOp::Update { n: 1 } });
        }
        for _ in 0..10 {
            let _ = fixture.routes.route(source, Frame::Global { op: BarOp::Update { n: 1 } });
        }

        let (mut table, _replies, _dispatcher) = table(1);
        let report = fixture.coordinator(10).step(&mut table, &mut |_| {}, &mut |_| {});

        assert!(!report.progress_flooded);
        assert!(!report.global_flooded);
        assert_eq!(fixture.inboxes.progress.try_next(), Recv::Empty);
        assert_eq!(fixture.inboxes.global.try_next(), Recv::Empty);
        assert_eq!(fixture.bars.snapshot()[1].updates, 9);
    }

    #[test]
    fn global_bar_lifetime_is_not_driven_by_workers() {
        let mut fixture = Fixture::new();
        let _ = fixture.routes.route(WorkerId(1), Frame::Global { op: BarOp::Create(BarSpec::new()) });
        let _ = fixture.routes.route(WorkerId(1), Frame::Global { op: BarOp::Close });
        let _ = fixture.routes.route(WorkerId(1), Frame::Global { op: BarOp::SetPostfix { text: "half".into() } });

        fixture.coordinator(10).final_drain();

        let records = fixture.bars.snapshot();
        assert_eq!(records.len(), 1);
        assert!(!records[0].closed);
        assert_eq!(records[0].postfix.as_deref(), Some("half"));
    }

    #[tokio::test]
    async fn run_finishes_once_all_tasks_are_done() {
        let mut fixture = Fixture::new();
        let (mut table, replies, _dispatcher) = table(2);
        for reply in replies {
            reply.send(TaskOutcome::Completed(json!(true))).unwrap();
        }

        let mut dones = 0;
        let exit = fixture.coordinator(10).run(&mut table, &CancelToken::new(), &mut |_| {}, &mut |_| dones += 1).await;

        assert_eq!(exit, LoopExit::Done);
        assert_eq!(dones, 2);
    }

    #[tokio::test]
    async fn cancel_stops_within_one_iteration() {
        let mut fixture = Fixture::new();
        let (mut table, mut replies, _dispatcher) = table(2);
        replies.remove(0).send(TaskOutcome::Completed(json!(true))).unwrap();
        let _ = fixture.routes.route(WorkerId(0), Frame::Global { op: BarOp::Update { n: 1 } });

        // the second task never finishes; cancelling from the first completion must end the run
        let cancel = CancelToken::new();
        let mut iterations = 0;
        let exit = fixture
            .coordinator(10)
            .run(&mut table, &cancel, &mut |_| {}, &mut |_| {
                iterations += 1;
                cancel.cancel();
            })
            .await;

        assert_eq!(exit, LoopExit::Terminated);
        assert_eq!(iterations, 1);
        assert_eq!(table.pending(), 1);
        assert_eq!(fixture.bars.snapshot()[0].updates, 1);
        drop(replies);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_no_iteration() {
        let mut fixture = Fixture::new();
        let (mut table, _replies, _dispatcher) = table(1);
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut dones = 0;
        let exit = fixture.coordinator(10).run(&mut table, &cancel, &mut |_| {}, &mut |_| dones += 1).await;

        assert_eq!(exit, LoopExit::Terminated);
        assert_eq!(dones, 0);
    }
}

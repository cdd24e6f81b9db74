//! The pool facade.
//!
//! A [`Pool`] starts its workers eagerly and can run any number of batches with
//! [`Pool::map`] before being shut down.

use crate::bars::{Bar, BarFactory, ProgressRegistry};
use crate::channel::{Inboxes, routes};
use crate::config::{PoolConfig, WorkerMode};
use crate::coordinator::{Coordinator, LoopExit, TaskTable};
use crate::dispatch::{Dispatcher, spawn_local, spawn_process};
use crate::protocol::WorkerId;
use crate::shutdown::{CancelToken, InterruptGuard};
use crate::task::{Task, TaskOutcome, TaskRegistry};
use crate::{Host, Result};
use core::fmt::{Debug, Formatter};
use futures_util::future::join_all;
use ohno::{IntoAppError, app_err};
use std::io::Write;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "      pool";

/// A fixed set of workers plus the coordinator state that renders their progress.
pub struct Pool<F> {
    config: PoolConfig,
    dispatcher: Dispatcher,
    inboxes: Inboxes,
    registry: ProgressRegistry<F>,
    links: Vec<JoinHandle<()>>,
}

impl<F: BarFactory> Pool<F> {
    /// Start the workers.
    ///
    /// Must be called from within a Tokio runtime. Process workers run
    /// `config.worker_program` (or the current executable) with `config.worker_args`; that
    /// program must serve jobs with the same task registry as `tasks`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, if there is no runtime, or if a worker cannot
    /// be started.
    pub fn start(config: PoolConfig, tasks: Arc<TaskRegistry>, bars: F) -> Result<Self> {
        config.validate()?;
        let _ = Handle::try_current().into_app_err("a pool must be started from within a Tokio runtime")?;

        let (routes, inboxes) = routes();
        let (dispatcher, queue) = Dispatcher::new(Arc::clone(&tasks));
        let workers = config.resolved_workers();

        let mut links = Vec::with_capacity(workers);
        match config.mode {
            WorkerMode::Process => {
                let program = match &config.worker_program {
                    Some(program) => program.clone(),
                    None => std::env::current_exe().into_app_err("locating the current executable")?,
                };

                for slot in 0..workers {
                    let slot = WorkerId(u32::try_from(slot).into_app_err("too many workers")?);
                    links.push(spawn_process(
                        slot,
                        &program,
                        &config.worker_args,
                        log::max_level(),
                        queue.clone(),
                        routes.clone(),
                    )?);
                }
            }

            WorkerMode::InProcess => {
                for slot in 0..workers {
                    let slot = WorkerId(u32::try_from(slot).into_app_err("too many workers")?);
                    links.push(spawn_local(slot, Arc::clone(&tasks), queue.clone(), routes.clone()));
                }
            }
        }

        log::info!(target: LOG_TARGET, "Started {workers} {:?} worker(s)", config.mode);

        Ok(Self {
            config,
            dispatcher,
            inboxes,
            registry: ProgressRegistry::new(bars),
            links,
        })
    }

    /// Number of workers started.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.links.len()
    }

    /// The bars materialized on behalf of workers so far.
    #[must_use]
    pub const fn registry(&self) -> &ProgressRegistry<F> {
        &self.registry
    }

    /// Run `tasks` on the workers and return their outcomes in submission order.
    ///
    /// `global` is the bar every task reports into through its global proxy. `on_error` is
    /// called for every task that did not succeed, and `on_done` for every task; both receive
    /// the task's outcome as soon as it is known.
    ///
    /// Ctrl-C is routed to the run while it lasts. An interrupt closes the pool and every
    /// bar, then asks `host` to exit with code 0.
    ///
    /// Once the run ends, Ctrl-C goes back to the enclosing run, if any, or else exits the
    /// process with code 130. The first `map` installs a process-wide interrupt handler
    /// that stays in place, so a custom handler the program had installed beforehand is not
    /// restored. Programs that need their own handling can arm an outer [`InterruptGuard`]
    /// with their own token, or call [`Self::map_with`] instead.
    ///
    /// # Errors
    ///
    /// Fails if the pool is closed, if the interrupt handler cannot be installed, or if the
    /// run was interrupted.
    pub async fn map<H: Host>(
        &mut self,
        host: &mut H,
        global: &mut dyn Bar,
        tasks: Vec<Task>,
        on_error: impl FnMut(&TaskOutcome),
        on_done: impl FnMut(&TaskOutcome),
    ) -> Result<Vec<TaskOutcome>> {
        let guard = InterruptGuard::arm(CancelToken::new())?;
        let cancel = guard.token().clone();

        let results = self.map_with(host, &cancel, global, tasks, on_error, on_done).await?;

        guard.restore();
        Ok(results)
    }

    /// Like [`Self::map`], with cancellation driven by the caller's token instead of Ctrl-C.
    ///
    /// # Errors
    ///
    /// Fails if the pool is closed or if `cancel` was set before every task finished.
    pub async fn map_with<H: Host>(
        &mut self,
        host: &mut H,
        cancel: &CancelToken,
        global: &mut dyn Bar,
        tasks: Vec<Task>,
        mut on_error: impl FnMut(&TaskOutcome),
        mut on_done: impl FnMut(&TaskOutcome),
    ) -> Result<Vec<TaskOutcome>> {
        let operations: Vec<String> = tasks.iter().map(|task| task.operation.clone()).collect();
        let handles = self.dispatcher.submit(tasks)?;

        let mut table = TaskTable::new();
        for (operation, handle) in operations.into_iter().zip(handles) {
            table.push(operation, handle);
        }

        log::debug!(target: LOG_TARGET, "Running {} task(s)", table.len());

        let mut coordinator = Coordinator::new(
            &mut self.inboxes,
            &mut self.registry,
            &mut *global,
            self.config.flood_cap,
            self.config.poll_interval,
        );

        let exit = coordinator.run(&mut table, cancel, &mut on_error, &mut on_done).await;
        if exit == LoopExit::Terminated {
            let _ = writeln!(host.error(), "Interrupt detected, closing pool. Please wait.");
        }

        coordinator.final_drain();

        match exit {
            LoopExit::Done => Ok(table.into_results()),
            LoopExit::Terminated => {
                let unfinished = table.pending();

                self.dispatcher.close();
                let closed = self.registry.close_all();
                global.close();
                log::debug!(target: LOG_TARGET, "Closed {closed} bar(s), abandoning {unfinished} task(s)");

                let _ = writeln!(host.error(), "Terminating.");
                host.exit(0);

                Err(app_err!("interrupted with {unfinished} task(s) unfinished"))
            }
        }
    }

    /// Stop accepting work and wait for every worker to exit.
    ///
    /// Tasks already queued still run to completion first.
    pub async fn shutdown(mut self) {
        self.dispatcher.close();

        for result in join_all(self.links.drain(..)).await {
            if let Err(e) = result {
                log::warn!(target: LOG_TARGET, "A worker link ended abnormally: {e}");
            }
        }

        let closed = self.registry.close_all();
        log::debug!(target: LOG_TARGET, "Pool shut down, closed {closed} leftover bar(s)");
    }
}

impl<F: Debug> Debug for Pool<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .field("registry", &self.registry)
            .field("workers", &self.links.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::RecordingBars;
    use crate::host::TestHost;
    use crate::protocol::BarSpec;
    use serde_json::{Value, json};

    fn in_process(workers: usize) -> PoolConfig {
        PoolConfig::default()
            .with_mode(WorkerMode::InProcess)
            .with_workers(workers)
            .with_poll_interval(core::time::Duration::from_millis(1))
    }

    #[test]
    fn start_needs_a_runtime() {
        let result = Pool::start(in_process(1), Arc::new(TaskRegistry::new()), RecordingBars::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = Pool::start(in_process(1).with_flood_cap(0), Arc::new(TaskRegistry::new()), RecordingBars::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn pool_is_reusable_across_maps() {
        let tasks = Arc::new(TaskRegistry::new().with("double", |args, _, _| Ok(json!(args.as_i64().unwrap_or_default() * 2))));

        let bars = RecordingBars::new();
        let mut pool = Pool::start(in_process(2), tasks, bars.clone()).unwrap();
        assert_eq!(pool.workers(), 2);

        let mut host = TestHost::default();
        let mut global = bars.create(&BarSpec::new());
        let cancel = CancelToken::new();

        for round in 1..=2 {
            let tasks = (0..3).map(|i| Task::new("double", json!(i * round))).collect();
            let results = pool.map_with(&mut host, &cancel, global.as_mut(), tasks, |_| {}, |_| {}).await.unwrap();
            let expected: Vec<_> = (0..3).map(|i| TaskOutcome::Completed(json!(i * round * 2))).collect();
            assert_eq!(results, expected);
        }

        pool.shutdown().await;
        assert_eq!(host.exit_code, None);
    }

    #[tokio::test]
    async fn cancelled_run_closes_everything_and_exits_zero() {
        let tasks = Arc::new(TaskRegistry::new().with("open", |_, progress, _| {
            let _bar = progress.create(BarSpec::new().total(1));
            Ok(json!(true))
        }));

        let bars = RecordingBars::new();
        let mut pool = Pool::start(in_process(1), tasks, bars.clone()).unwrap();
        let mut host = TestHost::default();
        let mut global = bars.create(&BarSpec::new().description("Tasks"));

        let cancel = CancelToken::new();
        let result = pool
            .map_with(
                &mut host,
                &cancel,
                global.as_mut(),
                vec![Task::new("open", Value::Null); 4],
                |_| {},
                |_| cancel.cancel(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(host.exit_code, Some(0));

        let stderr = String::from_utf8(core::mem::take(&mut host.error_buf)).unwrap();
        assert!(stderr.contains("Interrupt detected, closing pool. Please wait."));
        assert!(stderr.ends_with("Terminating.\n"));

        assert!(bars.snapshot().iter().all(|record| record.closed));
        assert_eq!(pool.registry().open_count(), 0);

        // closed pools take no more work
        let again = pool.map_with(&mut host, &CancelToken::new(), global.as_mut(), Vec::new(), |_| {}, |_| {}).await;
        assert!(again.is_err());
    }
}

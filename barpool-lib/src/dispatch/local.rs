use super::{Job, JobQueue};
use crate::channel::Routes;
use crate::protocol::WorkerId;
use crate::proxy::{BarIds, BarProxy, FrameSink, ProgressFactory, RouteSink};
use crate::task::{TaskOutcome, TaskRegistry, execute};
use crate::worker::forward_thread_logs;
use std::sync::Arc;
use tokio::task::JoinHandle;

const LOG_TARGET: &str = "     local";

/// Start a worker that runs task bodies on the blocking thread pool of the current runtime.
///
/// Its frames go straight into the coordinator's channels. Records a task logs join them
/// when the process logger is a [`WorkerAwareLogger`](crate::worker::WorkerAwareLogger);
/// otherwise they go to the process logger untagged.
pub(crate) fn spawn_local(slot: WorkerId, registry: Arc<TaskRegistry>, queue: JobQueue, routes: Routes) -> JoinHandle<()> {
    queue.join();

    tokio::spawn(async move {
        let sink: Arc<dyn FrameSink> = Arc::new(RouteSink::new(slot, routes));
        let ids = BarIds::default();

        while let Some(job) = queue.next().await {
            let Job { task, operation, args, reply } = job;
            let registry = Arc::clone(&registry);
            let sink = Arc::clone(&sink);
            let ids = ids.clone();

            log::trace!(target: LOG_TARGET, "{slot} running task {task} ({operation})");
            let outcome = tokio::task::spawn_blocking(move || {
                let _logs = forward_thread_logs(Arc::clone(&sink));
                let factory = ProgressFactory::new(Arc::clone(&sink), ids);
                let global = BarProxy::global(sink);
                execute(&registry, &operation, &args, &factory, &global)
            })
            .await
            .unwrap_or_else(|e| TaskOutcome::Failed {
                reason: format!("task did not run to completion: {e}"),
            });

            let _ = reply.send(outcome);
        }

        queue.leave().await;
        log::debug!(target: LOG_TARGET, "{slot} stopped");
    })
}

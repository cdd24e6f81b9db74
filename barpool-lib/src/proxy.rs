//! Worker-side stand-ins for progress bars.
//!
//! A [`BarProxy`] never draws anything. Every operation invoked on it is turned into a
//! [`BarOp`] and handed to a [`FrameSink`], which ships it to the coordinator where the real
//! bar lives. Proxy operations never fail and never block on the terminal.

use crate::channel::Routes;
use crate::protocol::{BarId, BarOp, BarSpec, Frame, WorkerId};
use core::fmt::{Debug, Formatter};
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const LOG_TARGET: &str = "     proxy";

/// Destination for frames produced inside a worker.
pub trait FrameSink: Send + Sync {
    /// Ship a frame to the coordinator. Must not fail or block on shared terminal state.
    fn emit(&self, frame: Frame);
}

/// Frame sink for workers running inside the coordinator process.
///
/// Frames skip the wire entirely and go straight into the coordinator's channels.
#[derive(Debug, Clone)]
pub struct RouteSink {
    source: WorkerId,
    routes: Routes,
}

impl RouteSink {
    #[must_use]
    pub const fn new(source: WorkerId, routes: Routes) -> Self {
        Self { source, routes }
    }
}

impl FrameSink for RouteSink {
    fn emit(&self, frame: Frame) {
        if let Some((task, _)) = self.routes.route(self.source, frame) {
            log::debug!(target: LOG_TARGET, "Ignoring completion frame for task {task} emitted through a progress sink");
        }
    }
}

/// Allocates bar ids for a single worker.
///
/// The counter outlives individual tasks, so bars opened by consecutive tasks on the same
/// worker never collide in the coordinator's registry.
#[derive(Debug, Clone, Default)]
pub struct BarIds(Arc<AtomicU64>);

impl BarIds {
    fn next(&self) -> BarId {
        BarId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// Creates progress bar proxies for the task currently running on a worker.
#[derive(Clone)]
pub struct ProgressFactory {
    sink: Arc<dyn FrameSink>,
    ids: BarIds,
}

impl ProgressFactory {
    #[must_use]
    pub fn new(sink: Arc<dyn FrameSink>, ids: BarIds) -> Self {
        Self { sink, ids }
    }

    /// Open a new bar. The coordinator materializes it as soon as the create frame arrives.
    #[must_use]
    pub fn create(&self, spec: BarSpec) -> BarProxy {
        let bar = BarProxy {
            target: Target::Bar(self.ids.next()),
            sink: Arc::clone(&self.sink),
        };

        bar.send(BarOp::Create(spec));
        bar
    }
}

impl Debug for ProgressFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressFactory")
            .field("sink", &"<dyn FrameSink>")
            .field("ids", &self.ids)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Bar(BarId),
    Global,
}

/// A progress bar whose operations are forwarded to the coordinator.
#[derive(Clone)]
pub struct BarProxy {
    target: Target,
    sink: Arc<dyn FrameSink>,
}

impl BarProxy {
    /// Proxy for the global bar.
    ///
    /// The global bar already exists on the coordinator side, so no create frame is sent.
    #[must_use]
    pub fn global(sink: Arc<dyn FrameSink>) -> Self {
        Self { target: Target::Global, sink }
    }

    /// The bar's id, or `None` for the global bar.
    #[must_use]
    pub const fn id(&self) -> Option<BarId> {
        match self.target {
            Target::Bar(id) => Some(id),
            Target::Global => None,
        }
    }

    fn send(&self, op: BarOp) {
        let frame = match self.target {
            Target::Bar(bar) => Frame::Progress { bar, op },
            Target::Global => Frame::Global { op },
        };

        self.sink.emit(frame);
    }

    /// Enter a scope in which the bar is live; the scope exits the bar when dropped.
    #[must_use]
    pub fn scope(&self) -> BarScope<'_> {
        self.enter();
        BarScope { bar: self }
    }

    pub fn enter(&self) {
        self.send(BarOp::Enter);
    }

    pub fn exit(&self) {
        self.send(BarOp::Exit);
    }

    /// Advance the bar by `n` steps.
    pub fn update(&self, n: u64) {
        self.send(BarOp::Update { n });
    }

    /// Advance the bar by a single step.
    pub fn inc(&self) {
        self.update(1);
    }

    pub fn set_description(&self, text: impl Into<String>) {
        self.send(BarOp::SetDescription { text: text.into() });
    }

    pub fn set_postfix(&self, text: impl Into<String>) {
        self.send(BarOp::SetPostfix { text: text.into() });
    }

    pub fn set_total(&self, total: Option<u64>) {
        self.send(BarOp::SetTotal { total });
    }

    pub fn set_position(&self, position: u64) {
        self.send(BarOp::SetPosition { position });
    }

    pub fn reset(&self, total: Option<u64>) {
        self.send(BarOp::Reset { total });
    }

    pub fn refresh(&self) {
        self.send(BarOp::Refresh);
    }

    /// Print a line above the bars on the coordinator's terminal.
    pub fn write(&self, text: impl Into<String>) {
        self.send(BarOp::Write { text: text.into() });
    }

    pub fn close(&self) {
        self.send(BarOp::Close);
    }
}

impl Debug for BarProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BarProxy")
            .field("target", &self.target)
            .field("sink", &"<dyn FrameSink>")
            .finish()
    }
}

/// Scoped use of a [`BarProxy`]; sends `Exit` when dropped.
#[derive(Debug)]
pub struct BarScope<'a> {
    bar: &'a BarProxy,
}

impl Deref for BarScope<'_> {
    type Target = BarProxy;

    fn deref(&self) -> &BarProxy {
        self.bar
    }
}

impl Drop for BarScope<'_> {
    fn drop(&mut self) {
        self.bar.exit();
    }
}

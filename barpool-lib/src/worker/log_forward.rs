use crate::protocol::{Frame, LogRecord};
use crate::proxy::FrameSink;
use chrono::Utc;
use core::cell::RefCell;
use core::fmt::{Debug, Formatter};
use log::{LevelFilter, Log, Metadata, Record};
use std::sync::Arc;

thread_local! {
    static THREAD_SINK: RefCell<Option<Arc<dyn FrameSink>>> = const { RefCell::new(None) };
}

fn capture(record: &Record<'_>) -> Frame {
    Frame::Log(LogRecord {
        level: record.level(),
        target: record.target().to_string(),
        message: record.args().to_string(),
        timestamp: Utc::now(),
    })
}

/// A logger that ships every record to the coordinator instead of printing it.
pub struct ForwardingLogger {
    sink: Arc<dyn FrameSink>,
    level: LevelFilter,
}

impl ForwardingLogger {
    #[must_use]
    pub fn new(sink: Arc<dyn FrameSink>, level: LevelFilter) -> Self {
        Self { sink, level }
    }
}

impl Log for ForwardingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        self.sink.emit(capture(record));
    }

    fn flush(&self) {}
}

/// Ships records logged on the current thread to `sink` until the returned scope is dropped.
///
/// Only has an effect when the process logger is a [`WorkerAwareLogger`].
pub(crate) fn forward_thread_logs(sink: Arc<dyn FrameSink>) -> ThreadLogScope {
    let previous = THREAD_SINK.with_borrow_mut(|current| current.replace(sink));
    ThreadLogScope { previous }
}

/// Restores the thread's previous log routing on drop.
pub(crate) struct ThreadLogScope {
    previous: Option<Arc<dyn FrameSink>>,
}

impl Drop for ThreadLogScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_SINK.with_borrow_mut(|current| *current = previous);
    }
}

impl Debug for ThreadLogScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadLogScope").finish_non_exhaustive()
    }
}

/// Wraps the process logger so records logged by in-process workers travel through the
/// coordinator's log channel, like those of process workers, and come out tagged with the
/// worker's identity. Records logged anywhere else go to the wrapped logger.
pub struct WorkerAwareLogger<L> {
    inner: L,
}

impl<L> WorkerAwareLogger<L> {
    #[must_use]
    pub const fn new(inner: L) -> Self {
        Self { inner }
    }
}

impl<L: Log> Log for WorkerAwareLogger<L> {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }

        let sink = THREAD_SINK.with_borrow(|sink| sink.as_ref().map(Arc::clone));
        match sink {
            Some(sink) => sink.emit(capture(record)),
            None => self.inner.log(record),
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

impl<L> Debug for WorkerAwareLogger<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerAwareLogger").finish_non_exhaustive()
    }
}

impl Debug for ForwardingLogger {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ForwardingLogger")
            .field("sink", &"<dyn FrameSink>")
            .field("level", &self.level)
            .finish()
    }
}

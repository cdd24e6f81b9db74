//! Non-blocking multi-producer, single-consumer channels.
//!
//! Workers only ever send and the coordinator only ever receives. Receiving never blocks:
//! an empty channel is reported as [`Recv::Empty`], which is distinct from a channel whose
//! senders are all gone ([`Recv::Closed`]).

use crate::protocol::{Frame, GlobalMessage, ProgressMessage, WorkerId, WorkerLog};
use crate::task::TaskOutcome;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Result of a non-blocking receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv<T> {
    /// A message was available.
    Message(T),

    /// Nothing is queued right now.
    Empty,

    /// Every sender has been dropped and the queue is exhausted.
    Closed,
}

/// The producing half of a channel.
#[derive(Debug)]
pub struct Sender<T> {
    inner: UnboundedSender<T>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Sender<T> {
    /// Enqueue a message.
    ///
    /// Never blocks. A message sent after the receiver is gone is silently discarded: the
    /// producer has no one left to report to.
    pub fn send(&self, message: T) {
        let _ = self.inner.send(message);
    }
}

/// The consuming half of a channel.
#[derive(Debug)]
pub struct Receiver<T> {
    inner: UnboundedReceiver<T>,
}

impl<T> Receiver<T> {
    /// Take the next message without waiting.
    pub fn try_next(&mut self) -> Recv<T> {
        match self.inner.try_recv() {
            Ok(message) => Recv::Message(message),
            Err(TryRecvError::Empty) => Recv::Empty,
            Err(TryRecvError::Disconnected) => Recv::Closed,
        }
    }

    /// Whether nothing is queued right now.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Create a new unbounded channel.
#[must_use]
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = unbounded_channel();
    (Sender { inner: tx }, Receiver { inner: rx })
}

/// The three producer endpoints handed to every worker link.
#[derive(Debug, Clone)]
pub struct Routes {
    pub log: Sender<WorkerLog>,
    pub progress: Sender<ProgressMessage>,
    pub global: Sender<GlobalMessage>,
}

/// The three consumer endpoints owned by the coordinator.
#[derive(Debug)]
pub struct Inboxes {
    pub log: Receiver<WorkerLog>,
    pub progress: Receiver<ProgressMessage>,
    pub global: Receiver<GlobalMessage>,
}

/// Create the log, per-worker progress and global progress channels.
#[must_use]
pub fn routes() -> (Routes, Inboxes) {
    let (log_tx, log_rx) = channel();
    let (progress_tx, progress_rx) = channel();
    let (global_tx, global_rx) = channel();

    (
        Routes {
            log: log_tx,
            progress: progress_tx,
            global: global_tx,
        },
        Inboxes {
            log: log_rx,
            progress: progress_rx,
            global: global_rx,
        },
    )
}

impl Routes {
    /// Stamp a frame with the identity of the worker that produced it and forward it to the
    /// matching channel.
    ///
    /// A `Done` frame is not a channel message; its task id and outcome are handed back to
    /// the caller, which owns the pending task replies.
    pub fn route(&self, source: WorkerId, frame: Frame) -> Option<(u64, TaskOutcome)> {
        match frame {
            Frame::Log(record) => self.log.send(WorkerLog { source, record }),
            Frame::Progress { bar, op } => self.progress.send(ProgressMessage { source, bar, op }),
            Frame::Global { op } => self.global.send(GlobalMessage { source, op }),
            Frame::Done { task, outcome } => return Some((task, outcome)),
        }

        None
    }
}

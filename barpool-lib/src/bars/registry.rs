use super::{Bar, BarFactory, replay};
use crate::protocol::{BarId, BarOp, ProgressMessage, WorkerId};
use core::fmt::{Debug, Formatter};
use std::collections::HashMap;

const LOG_TARGET: &str = "  registry";

/// What [`ProgressRegistry::apply`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new bar was materialized.
    Created,

    /// A bar was materialized under a key that was already in use; the old bar was closed.
    Replaced,

    /// The operation was replayed on an open bar.
    Replayed,

    /// The operation was replayed and ended the bar's life.
    Closed,

    /// No bar exists under the message's key.
    DroppedUnknown,

    /// The bar under the message's key is already closed.
    DroppedClosed,
}

struct Slot {
    bar: Box<dyn Bar>,
    closed: bool,
}

/// Owns every bar created on behalf of a worker, keyed by (worker, bar).
///
/// Only the coordinator loop touches the registry, so no locking is involved.
pub struct ProgressRegistry<F> {
    factory: F,
    bars: HashMap<(WorkerId, BarId), Slot>,
}

impl<F: BarFactory> ProgressRegistry<F> {
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            bars: HashMap::new(),
        }
    }

    /// Replay a worker's bar operation.
    ///
    /// A create operation materializes the bar. Any other operation is replayed on the bar
    /// under the message's key; messages for a key with no bar yet, or for a closed bar, are
    /// dropped with a diagnostic instead of failing.
    pub fn apply(&mut self, message: ProgressMessage) -> Applied {
        let key = (message.source, message.bar);

        if let BarOp::Create(spec) = &message.op {
            let slot = Slot {
                bar: self.factory.create(spec),
                closed: false,
            };

            return match self.bars.insert(key, slot) {
                None => Applied::Created,
                Some(mut previous) => {
                    log::warn!(target: LOG_TARGET, "Bar {} of {} was created twice, replacing it", key.1.0, key.0);
                    if !previous.closed {
                        previous.bar.close();
                    }
                    Applied::Replaced
                }
            };
        }

        let Some(slot) = self.bars.get_mut(&key) else {
            log::warn!(target: LOG_TARGET, "Dropping '{}' for unknown bar {} of {}", message.op.name(), key.1.0, key.0);
            return Applied::DroppedUnknown;
        };

        if slot.closed {
            log::debug!(target: LOG_TARGET, "Dropping '{}' for closed bar {} of {}", message.op.name(), key.1.0, key.0);
            return Applied::DroppedClosed;
        }

        let _ = replay(slot.bar.as_mut(), &message.op);
        if message.op.is_terminal() {
            slot.closed = true;
            Applied::Closed
        } else {
            Applied::Replayed
        }
    }

    /// Close every bar that is still open. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for slot in self.bars.values_mut().filter(|slot| !slot.closed) {
            slot.bar.close();
            slot.closed = true;
            closed += 1;
        }

        closed
    }

    /// Number of bars materialized so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Number of bars not yet closed.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.bars.values().filter(|slot| !slot.closed).count()
    }
}

impl<F: Debug> Debug for ProgressRegistry<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressRegistry")
            .field("factory", &self.factory)
            .field("bars", &self.bars.len())
            .finish()
    }
}

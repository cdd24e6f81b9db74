use super::{Bar, BarFactory};
use crate::protocol::{BarOp, BarSpec};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything that happened to one bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarRecord {
    pub spec: BarSpec,
    pub description: Option<String>,
    pub postfix: Option<String>,
    pub total: Option<u64>,
    pub position: u64,
    /// Number of update operations received, regardless of their step size.
    pub updates: u64,
    pub closed: bool,
    /// Every operation replayed on the bar, in order.
    pub ops: Vec<BarOp>,
    /// Lines printed through the bar.
    pub lines: Vec<String>,
}

impl BarRecord {
    fn new(spec: &BarSpec) -> Self {
        Self {
            spec: spec.clone(),
            description: spec.description.clone(),
            postfix: None,
            total: spec.total,
            position: 0,
            updates: 0,
            closed: false,
            ops: Vec::new(),
            lines: Vec::new(),
        }
    }
}

/// A bar backend that draws nothing and records every operation.
///
/// Clones share the same record book, so a clone kept by the caller observes the bars created
/// by the clone handed to a pool.
#[derive(Debug, Clone, Default)]
pub struct RecordingBars {
    records: Arc<Mutex<Vec<BarRecord>>>,
}

impl RecordingBars {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every bar record, in creation order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BarRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl BarFactory for RecordingBars {
    fn create(&self, spec: &BarSpec) -> Box<dyn Bar> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(BarRecord::new(spec));

        Box::new(RecordingBar {
            index: records.len() - 1,
            records: Arc::clone(&self.records),
        })
    }
}

#[derive(Debug)]
struct RecordingBar {
    index: usize,
    records: Arc<Mutex<Vec<BarRecord>>>,
}

impl RecordingBar {
    fn record(&self, op: BarOp, apply: impl FnOnce(&mut BarRecord)) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = records.get_mut(self.index) {
            apply(record);
            record.ops.push(op);
        }
    }
}

impl Bar for RecordingBar {
    fn enter(&mut self) {
        self.record(BarOp::Enter, |_| {});
    }

    fn exit(&mut self) {
        self.record(BarOp::Exit, |r| r.closed = true);
    }

    fn update(&mut self, n: u64) {
        self.record(BarOp::Update { n }, |r| {
            r.position += n;
            r.updates += 1;
        });
    }

    fn set_description(&mut self, text: &str) {
        self.record(BarOp::SetDescription { text: text.to_string() }, |r| r.description = Some(text.to_string()));
    }

    fn set_postfix(&mut self, text: &str) {
        self.record(BarOp::SetPostfix { text: text.to_string() }, |r| r.postfix = Some(text.to_string()));
    }

    fn set_total(&mut self, total: Option<u64>) {
        self.record(BarOp::SetTotal { total }, |r| r.total = total);
    }

    fn set_position(&mut self, position: u64) {
        self.record(BarOp::SetPosition { position }, |r| r.position = position);
    }

    fn reset(&mut self, total: Option<u64>) {
        self.record(BarOp::Reset { total }, |r| {
            r.position = 0;
            if total.is_some() {
                r.total = total;
            }
        });
    }

    fn refresh(&mut self) {
        self.record(BarOp::Refresh, |_| {});
    }

    fn write(&mut self, text: &str) {
        self.record(BarOp::Write { text: text.to_string() }, |r| r.lines.push(text.to_string()));
    }

    fn close(&mut self) {
        self.record(BarOp::Close, |r| r.closed = true);
    }
}

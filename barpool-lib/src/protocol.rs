//! Messages exchanged between workers and the coordinator.
//!
//! Every operation a worker performs on a progress bar becomes a [`BarOp`], and every log
//! record it emits becomes a [`LogRecord`]. Process workers write one JSON-encoded [`Frame`]
//! per line to their stdout and read one JSON-encoded [`WireJob`] per line from their stdin.

use crate::Result;
use crate::task::TaskOutcome;
use chrono::{DateTime, Utc};
use core::fmt::{Display, Formatter};
use ohno::IntoAppError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of a worker, assigned at pool construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identity of a bar within a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarId(pub u64);

/// Construction arguments for a progress bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarSpec {
    /// Expected number of iterations, or `None` for an open-ended spinner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Unit label shown after the counter (e.g. "it", "files").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Keep the bar on screen once it is closed.
    #[serde(default = "default_leave")]
    pub leave: bool,
}

const fn default_leave() -> bool {
    true
}

impl Default for BarSpec {
    fn default() -> Self {
        Self::new()
    }
}

impl BarSpec {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total: None,
            description: None,
            unit: None,
            leave: true,
        }
    }

    #[must_use]
    pub const fn total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    #[must_use]
    pub const fn leave(mut self, leave: bool) -> Self {
        self.leave = leave;
        self
    }
}

/// The closed set of operations that can be forwarded to a progress bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BarOp {
    /// Materialize the bar. Always the first operation for a given bar.
    Create(BarSpec),
    Enter,
    Exit,
    Update { n: u64 },
    SetDescription { text: String },
    SetPostfix { text: String },
    SetTotal { total: Option<u64> },
    SetPosition { position: u64 },
    Reset { total: Option<u64> },
    Refresh,
    /// Print a line above the bars.
    Write { text: String },
    Close,
}

impl BarOp {
    /// Operation name, for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Enter => "enter",
            Self::Exit => "exit",
            Self::Update { .. } => "update",
            Self::SetDescription { .. } => "set_description",
            Self::SetPostfix { .. } => "set_postfix",
            Self::SetTotal { .. } => "set_total",
            Self::SetPosition { .. } => "set_position",
            Self::Reset { .. } => "reset",
            Self::Refresh => "refresh",
            Self::Write { .. } => "write",
            Self::Close => "close",
        }
    }

    /// Whether this operation ends the bar's life.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit | Self::Close)
    }
}

/// A log record captured inside a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: log::Level,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A log record tagged with the worker that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLog {
    pub source: WorkerId,
    pub record: LogRecord,
}

/// An operation on one of a worker's own bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
    pub source: WorkerId,
    pub bar: BarId,
    pub op: BarOp,
}

/// An operation on the single global bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalMessage {
    pub source: WorkerId,
    pub op: BarOp,
}

/// Everything a worker can send to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Log(LogRecord),
    Progress { bar: BarId, op: BarOp },
    Global { op: BarOp },
    Done { task: u64, outcome: TaskOutcome },
}

/// A unit of work sent to a process worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireJob {
    pub task: u64,
    pub operation: String,
    pub args: serde_json::Value,
}

/// Encode a message as a single line, terminator included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message).into_app_err("encoding wire message")?;
    line.push('\n');
    Ok(line)
}

/// Decode a single line produced by [`encode_line`].
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end()).into_app_err_with(|| format!("decoding wire message '{}'", truncate(line, 80)))
}

fn truncate(text: &str, max_chars: usize) -> &str {
    text.char_indices().nth(max_chars).map_or(text, |(index, _)| text.get(..index).unwrap_or(text))
}

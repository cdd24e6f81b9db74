//! Coordinator-side progress bars.
//!
//! The terminal widget itself is opaque: anything implementing [`Bar`] can be driven by the
//! coordinator, and a [`BarFactory`] decides how bars are materialized. Two backends are
//! provided: [`IndicatifBars`] renders to the terminal, [`RecordingBars`] records every
//! replayed operation for headless runs and assertions.
//!
//! The [`ProgressRegistry`] owns every bar created on behalf of a worker and replays the
//! operations workers send, in arrival order.

mod indicatif_bars;
mod recording;
mod registry;

pub use indicatif_bars::IndicatifBars;
pub use recording::{BarRecord, RecordingBars};
pub use registry::{Applied, ProgressRegistry};

use crate::protocol::{BarOp, BarSpec};

/// The fixed operation set of a progress bar.
pub trait Bar: Send {
    fn enter(&mut self) {}

    fn exit(&mut self) {
        self.close();
    }

    fn update(&mut self, n: u64);

    fn set_description(&mut self, text: &str);

    fn set_postfix(&mut self, text: &str);

    fn set_total(&mut self, total: Option<u64>);

    fn set_position(&mut self, position: u64);

    fn reset(&mut self, total: Option<u64>);

    fn refresh(&mut self) {}

    /// Print a line without disrupting the bars.
    fn write(&mut self, text: &str);

    /// Finish the bar. Closing an already closed bar has no effect.
    fn close(&mut self);
}

/// Materializes bars from their construction arguments.
pub trait BarFactory: Send {
    fn create(&self, spec: &BarSpec) -> Box<dyn Bar>;
}

/// Apply a forwarded operation to a bar.
///
/// Returns `false` for [`BarOp::Create`], which is not an operation on an existing bar.
pub fn replay(bar: &mut dyn Bar, op: &BarOp) -> bool {
    match op {
        BarOp::Create(_) => return false,
        BarOp::Enter => bar.enter(),
        BarOp::Exit => bar.exit(),
        BarOp::Update { n } => bar.update(*n),
        BarOp::SetDescription { text } => bar.set_description(text),
        BarOp::SetPostfix { text } => bar.set_postfix(text),
        BarOp::SetTotal { total } => bar.set_total(*total),
        BarOp::SetPosition { position } => bar.set_position(*position),
        BarOp::Reset { total } => bar.reset(*total),
        BarOp::Refresh => bar.refresh(),
        BarOp::Write { text } => bar.write(text),
        BarOp::Close => bar.close(),
    }

    true
}

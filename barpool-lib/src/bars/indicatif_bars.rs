use super::{Bar, BarFactory};
use crate::protocol::BarSpec;
use core::fmt::{Debug, Formatter};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const DETERMINATE_TEMPLATE: &str = "{prefix:>12.bold.cyan} [{bar:25}] {pos}/{len} {unit} {msg}";
const DETERMINATE_TEMPLATE_NO_COLOR: &str = "{prefix:>12} [{bar:25}] {pos}/{len} {unit} {msg}";
const INDETERMINATE_TEMPLATE: &str = "{prefix:>12.bold.cyan} [{spinner}] {pos} {unit} {msg}";
const INDETERMINATE_TEMPLATE_NO_COLOR: &str = "{prefix:>12} [{spinner}] {pos} {unit} {msg}";

/// Bars rendered on the terminal, stacked in creation order.
///
/// The global bar is normally created first and therefore sits on top, with each worker's
/// bars below it in the order the workers opened them.
#[derive(Clone)]
pub struct IndicatifBars {
    multi: MultiProgress,
    use_colors: bool,
}

impl IndicatifBars {
    /// Bars drawn on stderr.
    #[must_use]
    pub fn new(use_colors: bool) -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            use_colors,
        }
    }

    /// Bars that keep their state but are never drawn.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            use_colors: false,
        }
    }

    /// The shared display, used to print log lines above the bars.
    #[must_use]
    pub const fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Debug for IndicatifBars {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IndicatifBars")
            .field("multi", &"<MultiProgress>")
            .field("use_colors", &self.use_colors)
            .finish()
    }
}

impl BarFactory for IndicatifBars {
    fn create(&self, spec: &BarSpec) -> Box<dyn Bar> {
        Box::new(self.make(spec))
    }
}

impl IndicatifBars {
    fn make(&self, spec: &BarSpec) -> IndicatifBar {
        let bar = match spec.total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };

        let bar = IndicatifBar {
            bar: self.multi.add(bar),
            multi: self.multi.clone(),
            unit: sanitize_unit(spec.unit.as_deref().unwrap_or("it")),
            use_colors: self.use_colors,
            leave: spec.leave,
            closed: false,
        };

        bar.apply_style(spec.total.is_some());
        if let Some(description) = &spec.description {
            bar.bar.set_prefix(description.clone());
        }

        bar
    }
}

struct IndicatifBar {
    bar: ProgressBar,
    multi: MultiProgress,
    unit: String,
    use_colors: bool,
    leave: bool,
    closed: bool,
}

impl IndicatifBar {
    fn apply_style(&self, determinate: bool) {
        let template = match (determinate, self.use_colors) {
            (true, true) => DETERMINATE_TEMPLATE,
            (true, false) => DETERMINATE_TEMPLATE_NO_COLOR,
            (false, true) => INDETERMINATE_TEMPLATE,
            (false, false) => INDETERMINATE_TEMPLATE_NO_COLOR,
        };

        let template = template.replace("{unit}", &self.unit);
        let style = if determinate {
            ProgressStyle::default_bar()
                .template(&template)
                .map(|style| style.progress_chars("=> "))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
        } else {
            ProgressStyle::default_spinner()
                .template(&template)
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
        };

        self.bar.set_style(style);
    }
}

impl Bar for IndicatifBar {
    fn enter(&mut self) {
        self.bar.tick();
    }

    fn update(&mut self, n: u64) {
        self.bar.inc(n);
    }

    fn set_description(&mut self, text: &str) {
        self.bar.set_prefix(text.to_string());
    }

    fn set_postfix(&mut self, text: &str) {
        self.bar.set_message(text.to_string());
    }

    fn set_total(&mut self, total: Option<u64>) {
        if let Some(total) = total {
            self.bar.set_length(total);
        }

        self.apply_style(total.is_some());
    }

    fn set_position(&mut self, position: u64) {
        self.bar.set_position(position);
    }

    fn reset(&mut self, total: Option<u64>) {
        self.bar.reset();
        if total.is_some() {
            self.set_total(total);
        }
    }

    fn refresh(&mut self) {
        self.bar.tick();
    }

    fn write(&mut self, text: &str) {
        let _ = self.multi.println(text);
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        if self.leave {
            self.bar.finish();
        } else {
            self.bar.finish_and_clear();
            self.multi.remove(&self.bar);
        }
    }
}

/// Template placeholders are delimited by braces, so they cannot appear in a unit label.
fn sanitize_unit(unit: &str) -> String {
    unit.chars().filter(|c| !matches!(c, '{' | '}')).collect()
}

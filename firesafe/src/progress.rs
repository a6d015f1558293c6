use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::checkpoint::SourceStatus;
use crate::sources::SourceKind;

/// Per-source spinners on stderr.
///
/// Sources have no known total up front, so each bar counts records and
/// shows the rate. A hidden instance keeps the counters without drawing.
pub struct ExportProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<SourceKind, ProgressBar>>,
}

impl ExportProgress {
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {prefix:>12.bold} {pos} records ({per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    /// Register a source, counting records already exported by earlier runs.
    pub fn start_source(&self, kind: SourceKind, already_processed: u64) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(Self::style());
        bar.set_prefix(kind.as_str());
        bar.set_position(already_processed);
        if already_processed > 0 {
            bar.set_message("resumed");
        }
        self.bars.lock().insert(kind, bar);
    }

    pub fn inc(&self, kind: SourceKind, count: u64) {
        if let Some(bar) = self.bars.lock().get(&kind) {
            bar.inc(count);
            bar.tick();
        }
    }

    pub fn finish_source(&self, kind: SourceKind, status: SourceStatus) {
        if let Some(bar) = self.bars.lock().get(&kind) {
            bar.finish_with_message(status.to_string());
        }
    }

    pub fn processed(&self, kind: SourceKind) -> u64 {
        self.bars
            .lock()
            .get(&kind)
            .map(|bar| bar.position())
            .unwrap_or(0)
    }
}

impl Default for ExportProgress {
    fn default() -> Self {
        Self::hidden()
    }
}

use drp_core::pipeline::ProgressReporter;
use indicatif::{ProgressBar, ProgressStyle};

/// Drives one progress bar per processing step.
pub struct BarReporter {
    bar: ProgressBar,
}

impl BarReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{msg:16} [{bar:40}] {pos}/{len} batches")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for BarReporter {
    fn begin_step(&self, key: &str, total_batches: usize) {
        self.bar.set_message(key.to_string());
        self.bar.set_length(total_batches as u64);
        self.bar.set_position(0);
    }

    fn advance(&self, batches_done: usize) {
        self.bar.set_position(batches_done as u64);
    }

    fn finish_step(&self) {
        self.bar.tick();
    }
}

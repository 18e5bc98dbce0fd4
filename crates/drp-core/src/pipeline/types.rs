/// Thread-safe progress reporting for reductions.
///
/// Implementors can use this to drive progress bars, logging, or any other
/// UI feedback. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    /// A processing step has started over `total_batches` batches.
    fn begin_step(&self, _key: &str, _total_batches: usize) {}

    /// `batches_done` batches of the current step have completed.
    fn advance(&self, _batches_done: usize) {}

    /// The current step is finished.
    fn finish_step(&self) {}
}

/// No-op progress reporter, used when no UI is attached.
pub struct NoOpReporter;
impl ProgressReporter for NoOpReporter {}

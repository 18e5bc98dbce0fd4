//! Structured failure reports collected over a reduction run.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::ops::AddAssign;
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::Result;
use crate::processor::{ErrorClass, ProcessorError};

/// Record of one failed batch.
#[derive(Clone, Debug)]
pub struct ErrorReport {
    /// Key of the processor (or component, e.g. `monitor`) that failed.
    pub processor: String,
    pub class: ErrorClass,
    pub error_type: String,
    pub message: String,
    /// File names of the raw images contributing to the failed batch.
    pub contents: Vec<String>,
    pub time: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(processor: &str, error: &ProcessorError, contents: Vec<String>) -> Self {
        Self {
            processor: processor.to_string(),
            class: error.class(),
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            contents,
            time: Utc::now(),
        }
    }

    /// Multi-line description used in verbose summaries.
    pub fn log_message(&self) -> String {
        let mut msg = format!(
            "[{}] {} ({}, {}): {}\n",
            self.time.to_rfc3339(),
            self.processor,
            self.error_type,
            self.class,
            self.message
        );
        if !self.contents.is_empty() {
            let _ = writeln!(msg, "  images: {}", self.contents.join(", "));
        }
        msg
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.processor, self.message)
    }
}

/// Append-only collection of [`ErrorReport`]s.
#[derive(Clone, Debug, Default)]
pub struct ErrorStack {
    reports: Vec<ErrorReport>,
}

impl ErrorStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_report(&mut self, report: ErrorReport) {
        self.reports.push(report);
    }

    pub fn reports(&self) -> &[ErrorReport] {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Number of reports whose batch was carried forward.
    pub fn noncritical_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.class == ErrorClass::Noncritical)
            .count()
    }

    /// Sorted, de-duplicated names of every image mentioned in a report.
    pub fn failed_images(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .reports
            .iter()
            .flat_map(|r| r.contents.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Human-readable summary: counts by processor and error type, the
    /// affected images and, when `verbose`, every report in full.
    pub fn summarise(&self, verbose: bool) -> String {
        let mut by_processor: BTreeMap<&str, usize> = BTreeMap::new();
        let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
        for r in &self.reports {
            *by_processor.entry(r.processor.as_str()).or_default() += 1;
            *by_type.entry(r.error_type.as_str()).or_default() += 1;
        }

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Error report summarising {} errors ({} noncritical).",
            self.len(),
            self.noncritical_count()
        );
        if self.is_empty() {
            return out;
        }

        let _ = writeln!(out, "\nErrors by processor:");
        for (proc, n) in &by_processor {
            let _ = writeln!(out, "  {proc}: {n}");
        }
        let _ = writeln!(out, "\nErrors by type:");
        for (ty, n) in &by_type {
            let _ = writeln!(out, "  {ty}: {n}");
        }

        let failed = self.failed_images();
        let _ = writeln!(out, "\nImages with errors ({}):", failed.len());
        for name in &failed {
            let _ = writeln!(out, "  {name}");
        }

        if verbose {
            let _ = writeln!(out, "\nFull error log:");
            for r in &self.reports {
                out.push_str(&r.log_message());
            }
        }
        out
    }

    /// Write [`summarise`](Self::summarise) to `path`, creating parent
    /// directories as needed.
    pub fn write_summary(&self, path: &Path, verbose: bool) -> Result<String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let summary = self.summarise(verbose);
        fs::write(path, &summary)?;
        info!(path = %path.display(), errors = self.len(), "Wrote error summary");
        Ok(summary)
    }
}

impl Extend<ErrorReport> for ErrorStack {
    fn extend<I: IntoIterator<Item = ErrorReport>>(&mut self, iter: I) {
        self.reports.extend(iter);
    }
}

impl AddAssign for ErrorStack {
    fn add_assign(&mut self, other: Self) {
        self.reports.extend(other.reports);
    }
}

impl IntoIterator for ErrorStack {
    type Item = ErrorReport;
    type IntoIter = std::vec::IntoIter<ErrorReport>;

    fn into_iter(self) -> Self::IntoIter {
        self.reports.into_iter()
    }
}

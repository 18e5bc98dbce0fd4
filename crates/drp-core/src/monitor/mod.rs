//! Real-time reduction: watch a night's raw directory and reduce every new
//! science image as it lands.
//!
//! A [`Monitor`] owns a fixed pool of worker threads draining one shared
//! queue of created-file paths fed by a [`RawDirWatcher`]. The main thread
//! only polls for the final deadline or cancellation. One midway
//! postprocessing pass (plus a summary email, if configured) runs once the
//! midway deadline passes; a final pass always runs after watching stops.

pub mod calhunter;
pub mod email;
pub mod watcher;

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{DrpConfig, MonitorDefaults};
use crate::consts::{
    MAX_FILE_SETTLE_MS, MAX_STALLED_SIZE_CHECKS, MIDWAY_CLAMP_FRACTION, OBSCLASS_KEY,
    PACKAGE_NAME, PACKAGE_VERSION, SCIENCE_OBSCLASS,
};
use crate::data::{Batch, Dataset};
use crate::error::{DrpError, Result};
use crate::io::fits;
use crate::pipeline::{get_instrument, CalRequirement, Instrument, Pipeline, ProcessorList};
use crate::processor::utils::ImageLoader;
use crate::processor::{ProcessorError, StepContext};
use crate::report::{ErrorReport, ErrorStack};

pub use email::{EmailMessage, EmailSettings, LogNotifier, Notifier};
pub use tokio_util::sync::CancellationToken;
pub use watcher::RawDirWatcher;

/// Report source for failures outside any processor.
const MONITOR_REPORT_KEY: &str = "monitor";
const CALHUNTER_REPORT_KEY: &str = "calhunter";
const POSTPROCESS_REPORT_KEY: &str = "postprocess";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub night: String,
    pub instrument: String,
    /// Run on every new science image. Empty means the instrument default.
    pub realtime_configurations: Vec<String>,
    pub postprocess_configurations: Option<Vec<String>>,
    /// Calibration images to pre-fetch. `None` means the instrument default.
    pub cal_requirements: Option<Vec<CalRequirement>>,
    pub email_sender: Option<String>,
    pub email_recipients: Vec<String>,
    pub midway_postprocess_hours: f64,
    pub final_postprocess_hours: f64,
    pub raw_sub_dir: String,
    /// `None` uses [`DrpConfig::workers`].
    pub max_workers: Option<usize>,
    pub poll_interval_ms: u64,
    pub file_settle_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_defaults("", "generic", &MonitorDefaults::default())
    }
}

impl MonitorConfig {
    pub fn from_defaults(night: &str, instrument: &str, defaults: &MonitorDefaults) -> Self {
        Self {
            night: night.to_string(),
            instrument: instrument.to_string(),
            realtime_configurations: Vec::new(),
            postprocess_configurations: None,
            cal_requirements: None,
            email_sender: None,
            email_recipients: Vec::new(),
            midway_postprocess_hours: defaults.midway_postprocess_hours,
            final_postprocess_hours: defaults.final_postprocess_hours,
            raw_sub_dir: defaults.raw_sub_dir.clone(),
            max_workers: None,
            poll_interval_ms: defaults.poll_interval_ms,
            file_settle_ms: defaults.file_settle_ms,
        }
    }
}

/// Watches one night's raw directory and reduces new images in real time.
pub struct Monitor {
    state: Arc<MonitorState>,
    workers: usize,
    warnings: Vec<String>,
}

struct MonitorState {
    pipeline: Pipeline,
    realtime_configurations: Vec<String>,
    postprocess_configurations: Option<Vec<String>>,
    raw_sub_dir: String,
    raw_dir: PathBuf,
    email: Option<EmailSettings>,
    notifier: Arc<dyn Notifier>,
    cal_images: Batch,
    errors: Mutex<ErrorStack>,
    processed: Mutex<Vec<PathBuf>>,
    latest_csv_log: Mutex<Option<PathBuf>>,
    midway_done: AtomicBool,
    start: Instant,
    midway: Duration,
    final_deadline: Duration,
    poll: Duration,
    settle: Duration,
    cancel: CancellationToken,
}

impl Monitor {
    /// Monitor a built-in instrument, logging instead of emailing.
    pub fn for_config(config: MonitorConfig, drp: &DrpConfig) -> Result<Self> {
        let instrument = get_instrument(&config.instrument)?;
        Self::new(config, instrument, drp, Arc::new(LogNotifier))
    }

    pub fn new(
        config: MonitorConfig,
        instrument: Arc<dyn Instrument>,
        drp: &DrpConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        info!("Software version: {PACKAGE_NAME}=={PACKAGE_VERSION}");

        let email = EmailSettings::from_parts(config.email_sender.as_deref(), &config.email_recipients)
            .inspect_err(|e| error!("{e}"))?;

        let final_hours = config.final_postprocess_hours;
        let mut midway_hours = config.midway_postprocess_hours;
        let valid = |h: f64| h.is_finite() && h >= 0.0;
        if !valid(final_hours) || !valid(midway_hours) {
            return Err(DrpError::Config(format!(
                "Postprocess hours must be finite and non-negative (midway {midway_hours}, final {final_hours})"
            )));
        }
        let mut warnings = Vec::new();
        if midway_hours > final_hours {
            let clamped = MIDWAY_CLAMP_FRACTION * final_hours;
            let msg = format!(
                "Midway postprocessing was set to {midway_hours} hours, but the monitor \
                 terminates after {final_hours} hours. Using {clamped} hours instead."
            );
            warn!("{msg}");
            warnings.push(msg);
            midway_hours = clamped;
        }
        let midway = hours(midway_hours)?;
        let final_deadline = hours(final_hours)?;
        info!(hours = final_hours, "Will terminate after the final deadline");
        match &email {
            Some(_) => info!(hours = midway_hours, "Will send an email summary after midway"),
            None => info!("No email notification configured"),
        }

        let realtime_configurations = if config.realtime_configurations.is_empty() {
            instrument.default_realtime_configurations()
        } else {
            config.realtime_configurations.clone()
        };

        let ctx = StepContext::new(
            &config.night,
            &drp.paths.raw_data_dir,
            &drp.paths.output_data_dir,
        );
        let raw_dir = ctx.raw_dir(&config.raw_sub_dir);
        fs::create_dir_all(&raw_dir)?;

        let pipeline = Pipeline::new(instrument.clone(), ctx, &realtime_configurations)?;
        if let Some(post) = &config.postprocess_configurations {
            instrument.postprocess_configuration(&[], post)?.validate()?;
        }

        let mut errors = ErrorStack::new();
        let requirements = config
            .cal_requirements
            .clone()
            .unwrap_or_else(|| instrument.default_cal_requirements());
        let cal_images = if requirements.is_empty() {
            Batch::new()
        } else {
            match calhunter::find_required_cals(
                &drp.paths.raw_data_dir,
                &config.night,
                &config.raw_sub_dir,
                &instrument.raw_loader(),
                &requirements,
            ) {
                Ok(found) => found,
                Err(e) => {
                    error!("No calibration images found, relying on nightly data: {e}");
                    let err = ProcessorError::from(e);
                    errors.add_report(ErrorReport::new(CALHUNTER_REPORT_KEY, &err, Vec::new()));
                    Batch::new()
                }
            }
        };

        let workers = config.max_workers.unwrap_or_else(|| drp.workers()).max(1);
        let state = MonitorState {
            pipeline,
            realtime_configurations,
            postprocess_configurations: config.postprocess_configurations,
            raw_sub_dir: config.raw_sub_dir,
            raw_dir,
            email,
            notifier,
            cal_images,
            errors: Mutex::new(errors),
            processed: Mutex::new(Vec::new()),
            latest_csv_log: Mutex::new(None),
            midway_done: AtomicBool::new(false),
            start: Instant::now(),
            midway,
            final_deadline,
            poll: Duration::from_millis(config.poll_interval_ms.max(1)),
            settle: Duration::from_millis(config.file_settle_ms.max(1)),
            cancel: CancellationToken::new(),
        };
        Ok(Self {
            state: Arc::new(state),
            workers,
            warnings,
        })
    }

    /// Configuration problems that were corrected at construction.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn midway_postprocess_hours(&self) -> f64 {
        self.state.midway.as_secs_f64() / 3600.0
    }

    pub fn final_postprocess_hours(&self) -> f64 {
        self.state.final_deadline.as_secs_f64() / 3600.0
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn raw_dir(&self) -> &Path {
        &self.state.raw_dir
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.state.pipeline
    }

    pub fn error_path(&self) -> PathBuf {
        self.state.pipeline.error_log_path()
    }

    pub fn log_path(&self) -> PathBuf {
        self.state.pipeline.processing_log_path()
    }

    /// Calibration images merged into every realtime reduction.
    pub fn cal_images(&self) -> &Batch {
        &self.state.cal_images
    }

    pub fn processed_images(&self) -> Vec<PathBuf> {
        lock(&self.state.processed).clone()
    }

    pub fn errors(&self) -> ErrorStack {
        lock(&self.state.errors).clone()
    }

    pub fn latest_csv_log(&self) -> Option<PathBuf> {
        lock(&self.state.latest_csv_log).clone()
    }

    /// Watch and reduce until the final deadline or cancellation, then join
    /// every worker and run the final postprocessing pass.
    pub fn process_realtime(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<PathBuf>();
        let rx = Arc::new(Mutex::new(rx));
        let watcher = RawDirWatcher::start(&self.state.raw_dir, tx)?;

        let mut handles = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let state = Arc::clone(&self.state);
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("drp-worker-{i}"))
                .spawn(move || state.worker_loop(&rx));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.state.cancel.cancel();
                    join_all(handles);
                    return Err(e.into());
                }
            }
        }
        info!(workers = self.workers, "Monitor started");

        while !self.state.cancel.is_cancelled()
            && self.state.start.elapsed() < self.state.final_deadline
        {
            thread::sleep(self.state.poll);
        }

        info!("No longer waiting for new images");
        watcher.stop();
        self.state.cancel.cancel();
        join_all(handles);
        drain_queued(&rx);
        self.postprocess();
        Ok(())
    }

    /// Reduce one raw file the way a worker does. Failures become reports.
    pub fn process_new_file(&self, path: &Path) {
        self.state.handle_event(path);
    }

    /// Rerun the postprocess configurations over every processed image and
    /// rewrite the error summary.
    pub fn postprocess(&self) {
        self.state.postprocess();
    }

    /// Write the verbose error summary and send (or log) the short summary.
    pub fn summarise_errors(&self) -> String {
        self.state.summarise_errors()
    }

    pub fn update_error_log(&self) {
        self.state.update_error_log();
    }
}

impl MonitorState {
    fn worker_loop(&self, rx: &Mutex<Receiver<PathBuf>>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.check_midway();
            let next = lock(rx).recv_timeout(self.poll);
            match next {
                Ok(path) => self.handle_event(&path),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Worker exiting");
    }

    fn check_midway(&self) {
        if self.start.elapsed() < self.midway || self.midway_done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Midway postprocessing");
        self.postprocess();
        if self.email.is_some() {
            info!(
                hours = self.midway.as_secs_f64() / 3600.0,
                "Midway deadline passed, sending summary email"
            );
            self.summarise_errors();
        }
    }

    fn handle_event(&self, path: &Path) {
        if !path.extension().is_some_and(|e| e == "fits") {
            debug!(path = %path.display(), "Ignoring non-FITS file");
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.reduce_new_image(path)));
        let err = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => ProcessorError::from(e),
            Err(_) => ProcessorError::Unexpected(format!("panic while reducing {}", path.display())),
        };
        error!(path = %path.display(), "Failed to reduce new image: {err}");
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        lock(&self.errors).add_report(ErrorReport::new(MONITOR_REPORT_KEY, &err, vec![name]));
        self.update_error_log();
    }

    fn reduce_new_image(&self, path: &Path) -> Result<()> {
        if !self.wait_until_complete(path)? {
            return Ok(());
        }
        let images = self.pipeline.load_raw_image(path)?;
        let is_science = images.iter().any(|img| {
            img.header()
                .get_text(OBSCLASS_KEY)
                .is_some_and(|c| c.eq_ignore_ascii_case(SCIENCE_OBSCLASS))
        });
        if !is_science {
            info!(path = %path.display(), "Skipping calibration image");
            return Ok(());
        }

        info!(
            path = %path.display(),
            thread = ?thread::current().name(),
            "Reducing science image"
        );
        let batch = Batch::images(images).concat(self.cal_images.clone())?;
        let (_, errors) = self.pipeline.reduce_images(
            Dataset::from(batch),
            &self.realtime_configurations,
            true,
        )?;
        lock(&self.processed).push(path.to_path_buf());
        *lock(&self.errors) += errors;
        self.update_error_log();
        Ok(())
    }

    /// Wait until `path` has a stable size and complete FITS data. Returns
    /// `false` if cancelled first. A file that stops growing while still
    /// incomplete is an error.
    fn wait_until_complete(&self, path: &Path) -> Result<bool> {
        let max_delay = Duration::from_millis(MAX_FILE_SETTLE_MS);
        let mut delay = self.settle;
        let mut last_size = None;
        let mut stalled = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let size = fs::metadata(path)?.len();
            if last_size == Some(size) {
                if fits::is_complete(path)? {
                    return Ok(true);
                }
                stalled += 1;
                if stalled > MAX_STALLED_SIZE_CHECKS {
                    return Err(DrpError::Fits(format!(
                        "{} stopped growing before its data unit was complete",
                        path.display()
                    )));
                }
            } else {
                stalled = 0;
            }
            if last_size.is_some() {
                debug!(path = %path.display(), size, "File not fully transferred, waiting");
            }
            last_size = Some(size);
            thread::sleep(delay);
            delay = (delay * 2).min(max_delay);
        }
    }

    fn postprocess(&self) {
        self.update_error_log();
        let Some(selected) = &self.postprocess_configurations else {
            return;
        };
        let names: Vec<String> = lock(&self.processed)
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        if names.is_empty() {
            info!("No processed science images to postprocess");
            return;
        }

        info!(images = names.len(), "Running postprocess steps");
        let instrument = self.pipeline.instrument();
        let loader = ImageLoader::new(&self.raw_sub_dir)
            .with_loader(instrument.raw_loader())
            .only(names.iter().cloned());
        let list = match instrument.postprocess_configuration(&names, selected) {
            Ok(steps) => ProcessorList::new().then(loader) + steps,
            Err(e) => {
                self.report_postprocess_failure(e);
                return;
            }
        };

        let csv_log = list
            .iter()
            .flat_map(|step| step.artifacts(self.pipeline.context()))
            .filter(|p| p.extension().is_some_and(|e| e == "csv"))
            .last();
        if csv_log.is_some() {
            *lock(&self.latest_csv_log) = csv_log;
        }

        match self
            .pipeline
            .reduce_with(Dataset::from(Batch::new()), &list, true)
        {
            Ok((_, errors)) => *lock(&self.errors) += errors,
            Err(e) => self.report_postprocess_failure(e),
        }
        self.update_error_log();
    }

    fn report_postprocess_failure(&self, e: DrpError) {
        error!("Postprocessing failed: {e}");
        let err = ProcessorError::from(e);
        lock(&self.errors).add_report(ErrorReport::new(POSTPROCESS_REPORT_KEY, &err, Vec::new()));
    }

    fn summarise_errors(&self) -> String {
        let processed = lock(&self.processed).len();
        let (short, written) = {
            let errors = lock(&self.errors);
            let path = self.pipeline.error_log_path();
            (errors.summarise(false), errors.write_summary(&path, true))
        };
        if let Err(e) = written {
            warn!("Could not write error log: {e}");
        }
        let summary = format!("Processed a total of {processed} science images.\n\n{short}\n");

        match &self.email {
            Some(settings) => {
                let mut attachments = vec![
                    self.pipeline.processing_log_path(),
                    self.pipeline.error_log_path(),
                ];
                if let Some(csv) = lock(&self.latest_csv_log).clone() {
                    attachments.push(csv);
                }
                let message = EmailMessage {
                    sender: settings.sender.clone(),
                    recipients: settings.recipients.clone(),
                    subject: format!(
                        "{}: Summary for night {}",
                        self.pipeline.instrument().name(),
                        self.pipeline.night()
                    ),
                    body: summary.clone(),
                    attachments,
                };
                if let Err(e) = self.notifier.send(&message) {
                    error!("Failed to send summary email: {e}");
                }
            }
            None => info!("{summary}"),
        }
        summary
    }

    /// Rewrite the cumulative error file. Holding the stack lock serialises
    /// writers.
    fn update_error_log(&self) {
        let errors = lock(&self.errors);
        if let Err(e) = errors.write_summary(&self.pipeline.error_log_path(), true) {
            warn!("Could not write error log: {e}");
        }
    }
}

fn hours(h: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(h * 3600.0)
        .map_err(|e| DrpError::Config(format!("Postprocess hours {h} out of range: {e}")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_all(handles: Vec<thread::JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!("Monitor worker panicked");
        }
    }
}

/// Empty the event queue after the workers stopped, logging every file that
/// will not be reduced. Returns how many were skipped.
fn drain_queued(rx: &Mutex<Receiver<PathBuf>>) -> usize {
    let skipped: Vec<PathBuf> = lock(rx).try_iter().collect();
    for path in &skipped {
        warn!(path = %path.display(), "Queued file not reduced before shutdown");
    }
    if !skipped.is_empty() {
        warn!(skipped = skipped.len(), "Dropped queued files at shutdown");
    }
    skipped.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_files_are_drained_at_shutdown() {
        let (tx, rx) = mpsc::channel();
        tx.send(PathBuf::from("a.fits")).unwrap();
        tx.send(PathBuf::from("b.fits")).unwrap();
        let rx = Mutex::new(rx);

        assert_eq!(drain_queued(&rx), 2);
        assert_eq!(drain_queued(&rx), 0);
    }

    #[test]
    fn out_of_range_hours_are_config_errors() {
        assert!(hours(1.5).is_ok());
        assert!(matches!(hours(1e20), Err(DrpError::Config(_))));
    }
}

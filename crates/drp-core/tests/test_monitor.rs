#[allow(dead_code)]
mod common;

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use drp_core::config::{DrpConfig, MonitorDefaults, PathsConfig};
use drp_core::error::{DrpError, Result};
use drp_core::io::fits;
use drp_core::monitor::{EmailMessage, Monitor, MonitorConfig, Notifier};
use drp_core::pipeline::get_instrument;
use drp_core::processor::StepContext;
use tempfile::TempDir;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<EmailMessage>>,
}

impl Notifier for RecordingNotifier {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn drp_config(root: &Path) -> DrpConfig {
    DrpConfig {
        paths: PathsConfig {
            raw_data_dir: root.join("raw"),
            output_data_dir: root.join("output"),
            scratch_dir: None,
        },
        ..DrpConfig::default()
    }
}

fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        max_workers: Some(2),
        poll_interval_ms: 20,
        file_settle_ms: 5,
        ..MonitorConfig::from_defaults(common::NIGHT, "generic", &MonitorDefaults::default())
    }
}

/// Calibration frames for `night`, written to its raw directory.
fn write_calibrations(root: &Path, night: &str) {
    let ctx = StepContext::new(night, &root.join("raw"), &root.join("output"));
    for img in common::calibration_images() {
        common::write_raw(&ctx, &img);
    }
}

fn monitor(root: &Path, config: MonitorConfig) -> Monitor {
    Monitor::for_config(config, &drp_config(root)).unwrap()
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[test]
fn test_midway_after_final_is_clamped_with_warning() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(
        dir.path(),
        MonitorConfig {
            midway_postprocess_hours: 10.0,
            final_postprocess_hours: 4.0,
            ..monitor_config()
        },
    );

    assert_eq!(m.warnings().len(), 1);
    assert!((m.midway_postprocess_hours() - 3.8).abs() < 1e-9);
    assert!((m.final_postprocess_hours() - 4.0).abs() < 1e-9);
}

#[test]
fn test_negative_hours_are_rejected() {
    let dir = TempDir::new().unwrap();
    let result = Monitor::for_config(
        MonitorConfig {
            final_postprocess_hours: -1.0,
            ..monitor_config()
        },
        &drp_config(dir.path()),
    );
    assert!(matches!(result, Err(DrpError::Config(_))));
}

#[test]
fn test_huge_hours_are_rejected() {
    let dir = TempDir::new().unwrap();
    let result = Monitor::for_config(
        MonitorConfig {
            final_postprocess_hours: 1e20,
            ..monitor_config()
        },
        &drp_config(dir.path()),
    );
    assert!(matches!(result, Err(DrpError::Config(_))));
}

#[test]
fn test_sender_without_recipients_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = Monitor::for_config(
        MonitorConfig {
            email_sender: Some("drp@obs.org".to_string()),
            ..monitor_config()
        },
        &drp_config(dir.path()),
    );
    assert!(matches!(result, Err(DrpError::Config(_))));
}

#[test]
fn test_unknown_instrument_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = Monitor::for_config(
        MonitorConfig {
            instrument: "wirc".to_string(),
            ..monitor_config()
        },
        &drp_config(dir.path()),
    );
    assert!(matches!(result, Err(DrpError::UnknownInstrument(_))));
}

#[test]
fn test_raw_dir_is_created() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(dir.path(), monitor_config());
    assert!(m.raw_dir().is_dir());
    assert_eq!(m.raw_dir(), common::context(dir.path()).raw_dir("raw"));
}

// ---------------------------------------------------------------------------
// Calibration hunting
// ---------------------------------------------------------------------------

#[test]
fn test_missing_calibrations_become_a_report() {
    let dir = TempDir::new().unwrap();
    let m = monitor(dir.path(), monitor_config());

    assert!(m.cal_images().is_empty());
    let errors = m.errors();
    assert_eq!(errors.len(), 1);
    let report = &errors.reports()[0];
    assert_eq!(report.processor, "calhunter");
    assert_eq!(report.error_type, "MissingCalibration");
}

#[test]
fn test_calibrations_found_on_earlier_night() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), "20231231");
    let m = monitor(dir.path(), monitor_config());

    assert!(m.errors().is_empty(), "{}", m.errors().summarise(true));
    assert_eq!(m.cal_images().len(), common::calibration_images().len());
}

#[test]
fn test_no_requirements_skips_hunting() {
    let dir = TempDir::new().unwrap();
    let m = monitor(
        dir.path(),
        MonitorConfig {
            cal_requirements: Some(Vec::new()),
            ..monitor_config()
        },
    );
    assert!(m.cal_images().is_empty());
    assert!(m.errors().is_empty());
}

// ---------------------------------------------------------------------------
// New files
// ---------------------------------------------------------------------------

#[test]
fn test_new_science_file_is_reduced() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), "20231231");
    let m = monitor(dir.path(), monitor_config());
    let ctx = common::context(dir.path());

    let path = common::write_raw(&ctx, &common::science("sci.fits"));
    m.process_new_file(&path);

    assert!(m.errors().is_empty(), "{}", m.errors().summarise(true));
    assert_eq!(m.processed_images(), vec![path]);

    let reduced = fits::open_image(&ctx.output_dir("final").join("sci.fits")).unwrap();
    assert!(reduced
        .data()
        .unwrap()
        .iter()
        .all(|v| (v - common::SCIENCE_SIGNAL).abs() < 1e-2));
    assert!(m.error_path().exists());
}

#[test]
fn test_calibration_file_is_skipped() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(dir.path(), monitor_config());

    let bias = m.raw_dir().join("bias_1.fits");
    m.process_new_file(&bias);

    assert!(m.processed_images().is_empty());
    assert!(m.errors().is_empty());
}

#[test]
fn test_non_fits_file_is_ignored() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(dir.path(), monitor_config());

    let notes = m.raw_dir().join("notes.txt");
    fs::write(&notes, "clouds").unwrap();
    m.process_new_file(&notes);

    assert!(m.processed_images().is_empty());
    assert!(m.errors().is_empty());
}

#[test]
fn test_truncated_file_becomes_monitor_report() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(dir.path(), monitor_config());

    let path = m.raw_dir().join("partial.fits");
    fs::write(&path, b"SIMPLE  =                    T").unwrap();
    m.process_new_file(&path);

    assert!(m.processed_images().is_empty());
    let errors = m.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.reports()[0].processor, "monitor");
    assert_eq!(errors.reports()[0].contents, vec!["partial.fits"]);
}

#[test]
fn test_vanished_file_becomes_monitor_report() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(dir.path(), monitor_config());

    m.process_new_file(&m.raw_dir().join("gone.fits"));

    assert_eq!(m.errors().len(), 1);
    assert_eq!(m.errors().reports()[0].processor, "monitor");
}

// ---------------------------------------------------------------------------
// Postprocessing and summaries
// ---------------------------------------------------------------------------

#[test]
fn test_postprocess_reloads_processed_images() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(
        dir.path(),
        MonitorConfig {
            postprocess_configurations: Some(vec!["log".to_string()]),
            ..monitor_config()
        },
    );
    let ctx = common::context(dir.path());
    let path = common::write_raw(&ctx, &common::science("sci.fits"));
    m.process_new_file(&path);

    m.postprocess();

    assert!(m.errors().is_empty(), "{}", m.errors().summarise(true));
    let csv_path = m.latest_csv_log().unwrap();
    let csv = fs::read_to_string(csv_path).unwrap();
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].starts_with("sci.fits,science"));
}

#[test]
fn test_postprocess_skips_unprocessed_images() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(
        dir.path(),
        MonitorConfig {
            postprocess_configurations: Some(vec!["log".to_string()]),
            ..monitor_config()
        },
    );
    let ctx = common::context(dir.path());
    let path = common::write_raw(&ctx, &common::science("sci.fits"));
    common::write_raw(&ctx, &common::science("other.fits"));
    m.process_new_file(&path);

    m.postprocess();

    assert!(m.errors().is_empty(), "{}", m.errors().summarise(true));
    let csv = fs::read_to_string(m.latest_csv_log().unwrap()).unwrap();
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    assert_eq!(rows.len(), 1, "{csv}");
    assert!(rows[0].starts_with("sci.fits,science"));
}

#[test]
fn test_postprocess_without_processed_images_does_nothing() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(
        dir.path(),
        MonitorConfig {
            postprocess_configurations: Some(vec!["log".to_string()]),
            ..monitor_config()
        },
    );

    m.postprocess();

    assert!(m.latest_csv_log().is_none());
    assert!(m.errors().is_empty());
}

#[test]
fn test_unknown_postprocess_configuration_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let result = Monitor::for_config(
        MonitorConfig {
            postprocess_configurations: Some(vec!["nope".to_string()]),
            ..monitor_config()
        },
        &drp_config(dir.path()),
    );
    assert!(matches!(result, Err(DrpError::UnknownConfiguration { .. })));
}

#[test]
fn test_summary_email_is_sent() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let notifier = Arc::new(RecordingNotifier::default());
    let m = Monitor::new(
        MonitorConfig {
            email_sender: Some("drp@obs.org".to_string()),
            email_recipients: vec!["team@obs.org".to_string()],
            ..monitor_config()
        },
        get_instrument("generic").unwrap(),
        &drp_config(dir.path()),
        notifier.clone(),
    )
    .unwrap();
    let path = common::write_raw(&common::context(dir.path()), &common::science("sci.fits"));
    m.process_new_file(&path);

    let summary = m.summarise_errors();

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let message = &sent[0];
    assert_eq!(message.subject, format!("generic: Summary for night {}", common::NIGHT));
    assert_eq!(message.recipients, vec!["team@obs.org"]);
    assert!(message.body.starts_with("Processed a total of 1 science images."));
    assert_eq!(message.body, summary);
    assert!(message.attachments.contains(&m.error_path()));
    assert!(message.attachments.contains(&m.log_path()));
    assert!(m.error_path().exists());
}

#[test]
fn test_summary_without_email_is_returned() {
    let dir = TempDir::new().unwrap();
    let m = monitor(dir.path(), monitor_config());
    let summary = m.summarise_errors();
    assert!(summary.starts_with("Processed a total of 0 science images."));
    assert!(summary.contains("calhunter"));
}

// ---------------------------------------------------------------------------
// Realtime loop
// ---------------------------------------------------------------------------

#[test]
fn test_realtime_loop_reduces_new_files_until_cancelled() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), "20231231");
    let m = monitor(
        dir.path(),
        MonitorConfig {
            midway_postprocess_hours: 1.0,
            final_postprocess_hours: 1.0,
            ..monitor_config()
        },
    );
    let ctx = common::context(dir.path());
    let cancel = m.cancel_token();

    thread::scope(|s| {
        let running = s.spawn(|| m.process_realtime());

        thread::sleep(Duration::from_millis(300));
        let img = common::science("sci.fits");
        fits::write_image(&img, &m.raw_dir().join("sci.fits")).unwrap();

        let reduced = wait_for(Duration::from_secs(20), || m.processed_images().len() == 1);
        cancel.cancel();
        running.join().unwrap().unwrap();
        assert!(reduced, "new file was never reduced");
    });

    assert!(ctx.output_dir("final").join("sci.fits").exists());
    assert!(m.errors().is_empty(), "{}", m.errors().summarise(true));
}

#[test]
fn test_cancelled_before_start_returns_promptly() {
    let dir = TempDir::new().unwrap();
    write_calibrations(dir.path(), common::NIGHT);
    let m = monitor(dir.path(), monitor_config());
    let cancel = m.cancel_token();
    let child = cancel.child_token();
    cancel.cancel();
    assert!(m.cancel_token().is_cancelled());
    assert!(child.is_cancelled());

    let start = Instant::now();
    m.process_realtime().unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(m.processed_images().is_empty());
}

use anyhow::{Context, Result};
use clap::Args;
use drp_core::config::DrpConfig;
use drp_core::data::storage;
use drp_core::monitor::{Monitor, MonitorConfig};

#[derive(Args)]
pub struct MonitorArgs {
    /// Night to watch (YYYYMMDD). Defaults to yesterday (UTC).
    #[arg(short, long)]
    pub night: Option<String>,

    /// Instrument pipeline
    #[arg(short, long, default_value = "generic")]
    pub pipeline: String,

    /// Comma-separated configurations run on every new science image
    #[arg(short, long, value_delimiter = ',')]
    pub configurations: Vec<String>,

    /// Comma-separated configurations run at the midway and final checkpoints
    #[arg(long, value_delimiter = ',')]
    pub postprocess: Vec<String>,

    /// Sender address of summary emails
    #[arg(long)]
    pub email_sender: Option<String>,

    /// Comma-separated recipients of summary emails
    #[arg(long, value_delimiter = ',')]
    pub email_recipients: Vec<String>,

    /// Hours after start of the midway postprocess and summary
    #[arg(long)]
    pub midway_hours: Option<f64>,

    /// Hours after start when watching stops
    #[arg(long)]
    pub final_hours: Option<f64>,

    /// Raw image sub-directory of the night
    #[arg(long)]
    pub raw_dir: Option<String>,

    /// Number of worker threads
    #[arg(short, long)]
    pub workers: Option<usize>,
}

pub fn run(args: &MonitorArgs, config: &DrpConfig) -> Result<()> {
    let night = super::resolve_night(args.night.as_deref());
    let _scratch = if config.use_scratch_cache {
        Some(
            storage::enable_disk_backing(&config.paths.scratch_dir())
                .context("Failed to enable scratch cache")?,
        )
    } else {
        None
    };

    let mut monitor_config = MonitorConfig::from_defaults(&night, &args.pipeline, &config.monitor);
    monitor_config.realtime_configurations = args.configurations.clone();
    if !args.postprocess.is_empty() {
        monitor_config.postprocess_configurations = Some(args.postprocess.clone());
    }
    monitor_config.email_sender = args.email_sender.clone();
    monitor_config.email_recipients = args.email_recipients.clone();
    if let Some(h) = args.midway_hours {
        monitor_config.midway_postprocess_hours = h;
    }
    if let Some(h) = args.final_hours {
        monitor_config.final_postprocess_hours = h;
    }
    if let Some(dir) = &args.raw_dir {
        monitor_config.raw_sub_dir = dir.clone();
    }
    monitor_config.max_workers = args.workers.or(config.max_workers);

    let monitor = Monitor::for_config(monitor_config, config).context("Failed to start monitor")?;
    for warning in monitor.warnings() {
        eprintln!("warning: {warning}");
    }
    println!(
        "Watching {} with {} workers for {:.1} hours",
        monitor.raw_dir().display(),
        monitor.workers(),
        monitor.final_postprocess_hours()
    );

    monitor.process_realtime()?;

    let errors = monitor.errors();
    println!(
        "Processed {} science images, {} errors (see {})",
        monitor.processed_images().len(),
        errors.len(),
        monitor.error_path().display()
    );
    Ok(())
}

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use drp_core::config::DrpConfig;
use drp_core::data::storage;
use drp_core::data::{Batch, Dataset};
use drp_core::pipeline::get_pipeline;
use drp_core::processor::StepContext;
use tracing::info;

use crate::progress::BarReporter;
use crate::summary::{print_run_summary, RunSummary};

#[derive(Args)]
pub struct RunArgs {
    /// Night to reduce (YYYYMMDD). Defaults to yesterday (UTC).
    #[arg(short, long)]
    pub night: Option<String>,

    /// Instrument pipeline
    #[arg(short, long, default_value = "generic")]
    pub pipeline: String,

    /// Comma-separated configurations to run
    #[arg(short, long, value_delimiter = ',', default_value = "default")]
    pub configurations: Vec<String>,

    /// Comma-separated configurations rerun afterwards over the reloaded night
    #[arg(long, value_delimiter = ',')]
    pub postprocess: Vec<String>,

    /// Abort at the first failed batch instead of isolating it
    #[arg(long)]
    pub fail_fast: bool,

    /// Download the night's raw images first
    #[arg(long)]
    pub download: bool,
}

pub fn run(args: &RunArgs, config: &DrpConfig) -> Result<()> {
    let night = super::resolve_night(args.night.as_deref());
    let _scratch = if config.use_scratch_cache {
        Some(
            storage::enable_disk_backing(&config.paths.scratch_dir())
                .context("Failed to enable scratch cache")?,
        )
    } else {
        None
    };

    let ctx = StepContext::new(
        &night,
        &config.paths.raw_data_dir,
        &config.paths.output_data_dir,
    );
    let reporter = Arc::new(BarReporter::new());
    let pipeline = get_pipeline(&args.pipeline, ctx, &args.configurations)
        .with_context(|| format!("Failed to build pipeline '{}'", args.pipeline))?
        .with_reporter(reporter.clone());

    if args.download {
        pipeline
            .instrument()
            .download_raw_images_for_night(&night)
            .context("Download failed")?;
    }

    let start = Instant::now();
    let catch_all = !args.fail_fast;
    let (dataset, mut errors) = pipeline
        .reduce(Dataset::from(Batch::new()), catch_all)
        .context("Reduction aborted")?;
    if !args.postprocess.is_empty() {
        let list = pipeline
            .postprocess_list(&[], &args.postprocess)
            .context("Invalid postprocess configuration")?;
        let (_, post_errors) = pipeline
            .reduce_with(Dataset::from(Batch::new()), &list, catch_all)
            .context("Postprocessing aborted")?;
        errors += post_errors;
    }
    reporter.finish();

    let error_path = pipeline.error_log_path();
    errors
        .write_summary(&error_path, true)
        .with_context(|| format!("Failed to write {}", error_path.display()))?;
    info!(night = %night, batches = dataset.len(), errors = errors.len(), "Reduction complete");

    let mut configurations = args.configurations.clone();
    configurations.extend(args.postprocess.iter().cloned());
    let artifacts = pipeline.artifacts(&configurations)?;
    print_run_summary(&RunSummary {
        night: &night,
        instrument: &args.pipeline,
        configurations: &configurations,
        dataset: &dataset,
        errors: &errors,
        error_path: &error_path,
        artifacts: &artifacts,
        elapsed: start.elapsed(),
    });
    Ok(())
}

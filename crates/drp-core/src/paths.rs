//! Directory layout of raw data and reduction products.
//!
//! ```text
//! {raw_root}/{night}/{raw_sub_dir}/*.fits
//! {output_root}/{night}/{dir_root}/...
//! {output_root}/{night}/errors/{instrument}_{night}_errors.txt
//! {output_root}/{night}/{night}_processing_log.txt
//! ```

use std::path::{Path, PathBuf};

use crate::consts::ERROR_OUTPUT_SUB_DIR;

/// Environment variable overriding the raw data root.
pub const RAW_DATA_DIR_ENV: &str = "RAW_DATA_DIR";
/// Environment variable overriding the output root.
pub const OUTPUT_DATA_DIR_ENV: &str = "OUTPUT_DATA_DIR";
/// Environment variable capping the number of monitor workers.
pub const MAX_N_CPU_ENV: &str = "MAX_N_CPU";
/// Environment variable toggling disk-backed payloads (`true`/`false`).
pub const SCRATCH_CACHE_ENV: &str = "DRP_SCRATCH_CACHE";

pub fn raw_img_dir(raw_root: &Path, night: &str, raw_sub_dir: &str) -> PathBuf {
    raw_root.join(night).join(raw_sub_dir)
}

pub fn output_dir(output_root: &Path, night: &str, dir_root: &str) -> PathBuf {
    output_root.join(night).join(dir_root)
}

pub fn error_log_path(output_root: &Path, instrument: &str, night: &str) -> PathBuf {
    output_dir(output_root, night, ERROR_OUTPUT_SUB_DIR)
        .join(format!("{instrument}_{night}_errors.txt"))
}

pub fn processing_log_path(output_root: &Path, night: &str) -> PathBuf {
    output_root
        .join(night)
        .join(format!("{night}_processing_log.txt"))
}

/// Worker count: `MAX_N_CPU` when set to a positive number, else half the
/// available CPUs, at least one.
pub fn default_max_workers() -> usize {
    if let Some(n) = std::env::var(MAX_N_CPU_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        return n;
    }
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    (cpus / 2).max(1)
}

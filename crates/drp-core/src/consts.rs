/// Header key holding the stable logical name of a data block.
pub const BASE_NAME_KEY: &str = "BASENAME";

/// Header key holding the comma-separated raw image provenance list.
pub const RAW_IMG_KEY: &str = "RAWPATH";

/// Header key mirroring the processing history when a block is written out.
pub const PROC_HISTORY_KEY: &str = "CALSTEPS";

/// Header key mirroring the processing failure flag.
pub const PROC_FAIL_KEY: &str = "PROCFAIL";

/// Header key classifying an exposure (science, bias, dark, flat, ...).
pub const OBSCLASS_KEY: &str = "OBSCLASS";

/// Header key for the last path a block was saved to.
pub const LATEST_SAVE_KEY: &str = "SAVEPATH";

/// Provenance: operator running the reduction.
pub const REDUCER_KEY: &str = "REDUCER";

/// Provenance: host running the reduction.
pub const REDUCTION_MACHINE_KEY: &str = "REDMACH";

/// Provenance: UTC timestamp of the latest step.
pub const REDUCTION_TIME_KEY: &str = "REDTIME";

/// Provenance: software name and version.
pub const REDUCTION_SOFTWARE_KEY: &str = "REDSOFT";

pub const BIAS_FRAME_KEY: &str = "BIASNAME";
pub const DARK_FRAME_KEY: &str = "DARKNAME";
pub const FLAT_FRAME_KEY: &str = "FLATNAME";

/// Header key holding the exposure time in seconds.
pub const EXPTIME_KEY: &str = "EXPTIME";

/// Value of [`OBSCLASS_KEY`] for exposures that should be reduced in real time.
pub const SCIENCE_OBSCLASS: &str = "science";
pub const BIAS_OBSCLASS: &str = "bias";
pub const DARK_OBSCLASS: &str = "dark";
pub const FLAT_OBSCLASS: &str = "flat";

/// Software identifier stamped into every processed header.
pub const PACKAGE_NAME: &str = "drp-core";
pub const PACKAGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default sub-directory of a night holding raw images.
pub const RAW_IMG_SUB_DIR: &str = "raw";

/// Default sub-directory of a night holding cached calibration products.
pub const CAL_OUTPUT_SUB_DIR: &str = "calibration";

/// Default sub-directory of a night holding the error summary.
pub const ERROR_OUTPUT_SUB_DIR: &str = "errors";

/// Extension of scratch payload files.
pub const SCRATCH_EXTENSION: &str = "scratch";

/// FITS logical record length in bytes.
pub const FITS_BLOCK_SIZE: usize = 2880;

/// FITS header card length in bytes.
pub const FITS_CARD_SIZE: usize = 80;

/// Minimum pixel count (h*w) to use row-level Rayon parallelism.
pub const PARALLEL_PIXEL_THRESHOLD: usize = 65_536;

/// Midway postprocessing is clamped to this fraction of the final duration
/// when configured past it.
pub const MIDWAY_CLAMP_FRACTION: f64 = 0.95;

pub const DEFAULT_MIDWAY_POSTPROCESS_HOURS: f64 = 16.0;
pub const DEFAULT_FINAL_POSTPROCESS_HOURS: f64 = 48.0;

/// Interval between deadline checks of the monitor main thread and workers.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;

/// First wait while a new raw file is still being written. Doubles up to
/// [`MAX_FILE_SETTLE_MS`].
pub const DEFAULT_FILE_SETTLE_MS: u64 = 500;
pub const MAX_FILE_SETTLE_MS: u64 = 8_000;

/// Consecutive unchanged-size checks of an incomplete raw file before the
/// monitor gives up on it.
pub const MAX_STALLED_SIZE_CHECKS: u32 = 5;

/// How many earlier nights the calibration search looks back through.
pub const CALHUNTER_MAX_NIGHTS: usize = 30;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::{
    DEFAULT_FILE_SETTLE_MS, DEFAULT_FINAL_POSTPROCESS_HOURS, DEFAULT_MIDWAY_POSTPROCESS_HOURS,
    DEFAULT_POLL_INTERVAL_MS, RAW_IMG_SUB_DIR,
};
use crate::error::{DrpError, Result};
use crate::paths::{
    default_max_workers, MAX_N_CPU_ENV, OUTPUT_DATA_DIR_ENV, RAW_DATA_DIR_ENV, SCRATCH_CACHE_ENV,
};
use crate::processor::cache::CacheSettings;

/// Top-level configuration, usually read from a TOML file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DrpConfig {
    pub paths: PathsConfig,
    /// Spill image payloads to scratch files instead of holding them in memory.
    pub use_scratch_cache: bool,
    /// Monitor worker count. `None` uses [`default_max_workers`].
    pub max_workers: Option<usize>,
    pub cache: CacheSettings,
    pub monitor: MonitorDefaults,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_data_dir: PathBuf,
    pub output_data_dir: PathBuf,
    /// Directory of scratch payload files. Defaults to a `scratch`
    /// directory under the output root.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_data_dir: PathBuf::from("data/raw"),
            output_data_dir: PathBuf::from("data/output"),
            scratch_dir: None,
        }
    }
}

impl PathsConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| self.output_data_dir.join("scratch"))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorDefaults {
    pub midway_postprocess_hours: f64,
    pub final_postprocess_hours: f64,
    pub raw_sub_dir: String,
    pub poll_interval_ms: u64,
    pub file_settle_ms: u64,
}

impl Default for MonitorDefaults {
    fn default() -> Self {
        Self {
            midway_postprocess_hours: DEFAULT_MIDWAY_POSTPROCESS_HOURS,
            final_postprocess_hours: DEFAULT_FINAL_POSTPROCESS_HOURS,
            raw_sub_dir: RAW_IMG_SUB_DIR.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            file_settle_ms: DEFAULT_FILE_SETTLE_MS,
        }
    }
}

impl DrpConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DrpError::Config(e.to_string()))
    }

    /// Load `path` (or defaults when `None`), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                debug!(path = %p.display(), "Loaded configuration");
                Self::from_toml(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `RAW_DATA_DIR`, `OUTPUT_DATA_DIR`, `DRP_SCRATCH_CACHE` and
    /// `MAX_N_CPU`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = get(RAW_DATA_DIR_ENV) {
            self.paths.raw_data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get(OUTPUT_DATA_DIR_ENV) {
            self.paths.output_data_dir = PathBuf::from(dir);
        }
        if let Some(flag) = get(SCRATCH_CACHE_ENV) {
            self.use_scratch_cache = match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                other => {
                    return Err(DrpError::Config(format!(
                        "{SCRATCH_CACHE_ENV} must be true or false, got '{other}'"
                    )))
                }
            };
        }
        if let Some(n) = get(MAX_N_CPU_ENV) {
            let n: usize = n
                .trim()
                .parse()
                .map_err(|_| DrpError::Config(format!("{MAX_N_CPU_ENV} must be a number, got '{n}'")))?;
            self.max_workers = Some(n.max(1));
        }
        Ok(())
    }

    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(default_max_workers).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_uses_defaults() {
        let config = DrpConfig::from_toml(
            r#"
            use_scratch_cache = true

            [paths]
            raw_data_dir = "/data/raw"

            [monitor]
            final_postprocess_hours = 10.0
            "#,
        )
        .unwrap();
        assert!(config.use_scratch_cache);
        assert_eq!(config.paths.raw_data_dir, PathBuf::from("/data/raw"));
        assert_eq!(config.paths.output_data_dir, PathBuf::from("data/output"));
        assert_eq!(config.monitor.final_postprocess_hours, 10.0);
        assert_eq!(
            config.monitor.midway_postprocess_hours,
            DEFAULT_MIDWAY_POSTPROCESS_HOURS
        );
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = DrpConfig::default();
        config
            .apply_overrides(|key| match key {
                RAW_DATA_DIR_ENV => Some("/env/raw".into()),
                SCRATCH_CACHE_ENV => Some("TRUE".into()),
                MAX_N_CPU_ENV => Some("0".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.paths.raw_data_dir, PathBuf::from("/env/raw"));
        assert!(config.use_scratch_cache);
        assert_eq!(config.workers(), 1);
    }

    #[test]
    fn bad_scratch_flag_is_rejected() {
        let mut config = DrpConfig::default();
        let err = config
            .apply_overrides(|key| (key == SCRATCH_CACHE_ENV).then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, DrpError::Config(_)));
    }
}

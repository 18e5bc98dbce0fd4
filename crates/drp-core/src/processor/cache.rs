//! Reuse of expensive derived products (master frames, references) keyed by
//! a fingerprint of the inputs that produced them.
//!
//! The fingerprint only covers base names and processing histories, so a
//! cached product is valid as long as equal names and histories imply equal
//! pixel data. [`FingerprintMode::IdentityAndPayload`] hashes the pixels too.
//!
//! Within a process at most one computation per cache path runs at a time;
//! later callers wait and then load the product. Across processes there is
//! no lock: products are written to a temporary file and renamed into
//! place, and the last writer wins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::consts::{CAL_OUTPUT_SUB_DIR, LATEST_SAVE_KEY};
use crate::data::{fingerprint, Batch, FingerprintMode, Image};
use crate::io::fits;

use super::{ProcessorError, StepContext, StepResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Sub-directory of the night output directory holding products.
    pub sub_dir: String,
    pub try_load_cache: bool,
    pub write_to_cache: bool,
    /// Rewrite a product even when the file already exists.
    pub overwrite: bool,
    pub fingerprint_mode: FingerprintMode,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sub_dir: CAL_OUTPUT_SUB_DIR.to_string(),
            try_load_cache: true,
            write_to_cache: true,
            overwrite: true,
            fingerprint_mode: FingerprintMode::Identity,
        }
    }
}

/// A processor step that derives one product image from a batch.
pub trait CacheProducer: Send + Sync {
    /// Prefix of the cache file name; normally the processor key.
    fn cache_key(&self) -> &str;

    /// The blocks the product depends on. Defaults to the whole batch.
    fn select_cache_images(&self, batch: &Batch) -> StepResult<Batch> {
        Ok(batch.clone())
    }

    /// Compute the product from the selected images.
    fn make_image(&self, selected: &Batch, ctx: &StepContext) -> StepResult<Image>;
}

fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let table = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(table.entry(path.to_path_buf()).or_default())
}

/// Fingerprint-keyed product cache.
#[derive(Clone, Debug, Default)]
pub struct ProductCache {
    settings: CacheSettings,
}

impl ProductCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// `{output}/{night}/{sub_dir}/{key}_{fingerprint}.fits`
    pub fn cache_path(&self, key: &str, fingerprint: &str, ctx: &StepContext) -> PathBuf {
        ctx.output_dir(&self.settings.sub_dir)
            .join(format!("{key}_{fingerprint}.fits"))
    }

    /// Return the cached product for `batch`, computing and storing it when
    /// no valid copy exists.
    pub fn get_or_make(
        &self,
        producer: &dyn CacheProducer,
        batch: &Batch,
        ctx: &StepContext,
    ) -> StepResult<Image> {
        let selected = producer.select_cache_images(batch)?;
        if selected.is_empty() {
            return Err(ProcessorError::MissingCalibration(format!(
                "no input images for {}",
                producer.cache_key()
            )));
        }
        let fp = fingerprint(&selected, self.settings.fingerprint_mode)?;
        let path = self.cache_path(producer.cache_key(), &fp, ctx);

        let lock = path_lock(&path);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let exists = path.exists();
        if self.settings.try_load_cache && exists {
            debug!(path = %path.display(), "Loading cached product");
            return Ok(fits::open_image(&path)?);
        }

        let mut image = producer.make_image(&selected, ctx)?;
        if let Some(name) = path.file_name() {
            image.set_base_name(name.to_string_lossy());
        }

        if self.settings.write_to_cache && (!exists || self.settings.overwrite) {
            image
                .header_mut()
                .insert(LATEST_SAVE_KEY, path.display().to_string());
            fits::write_image_atomic(&image, &path)?;
            info!(
                key = producer.cache_key(),
                inputs = selected.len(),
                path = %path.display(),
                "Cached product"
            );
        }
        Ok(image)
    }
}

/// A product supplied up front, e.g. a master flat from another night.
#[derive(Clone, Debug)]
pub struct PremadeCache {
    path: PathBuf,
}

impl PremadeCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StepResult<Image> {
        if !self.path.exists() {
            return Err(ProcessorError::MissingCalibration(format!(
                "premade product {} does not exist",
                self.path.display()
            )));
        }
        Ok(fits::open_image(&self.path)?)
    }
}

/// Where a calibration step gets its product from.
#[derive(Clone, Debug)]
pub enum ProductSource {
    Computed(ProductCache),
    Premade(PremadeCache),
}

impl Default for ProductSource {
    fn default() -> Self {
        Self::Computed(ProductCache::default())
    }
}

impl ProductSource {
    pub fn resolve(
        &self,
        producer: &dyn CacheProducer,
        batch: &Batch,
        ctx: &StepContext,
    ) -> StepResult<Image> {
        match self {
            Self::Computed(cache) => cache.get_or_make(producer, batch, ctx),
            Self::Premade(premade) => premade.load(),
        }
    }
}

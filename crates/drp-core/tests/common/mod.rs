use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use drp_core::consts::{BASE_NAME_KEY, EXPTIME_KEY, OBSCLASS_KEY};
use drp_core::data::{Batch, Header, Image};
use drp_core::io::fits;
use drp_core::pipeline::{Instrument, Pipeline, ProcessorList};
use drp_core::processor::cache::CacheProducer;
use drp_core::processor::utils::{load_fits_image, LoadImageFn};
use drp_core::processor::{Processor, ProcessorError, StepContext, StepResult};
use indexmap::IndexMap;
use ndarray::Array2;

pub const NIGHT: &str = "20240101";
pub const WIDTH: usize = 8;
pub const HEIGHT: usize = 6;

/// Pixel levels of the synthetic calibration set: bias offset, dark current
/// per second, flat illumination, science signal.
pub const BIAS_LEVEL: f32 = 100.0;
pub const DARK_RATE: f32 = 2.0;
pub const FLAT_LEVEL: f32 = 1000.0;
pub const SCIENCE_SIGNAL: f32 = 500.0;

pub fn header(name: &str, obsclass: &str, exptime: f64) -> Header {
    Header::new()
        .with(BASE_NAME_KEY, name)
        .with(OBSCLASS_KEY, obsclass)
        .with(EXPTIME_KEY, exptime)
}

pub fn image(name: &str, obsclass: &str, exptime: f64, value: f32) -> Image {
    Image::new(
        Array2::from_elem((HEIGHT, WIDTH), value),
        header(name, obsclass, exptime),
    )
    .expect("valid test image")
}

pub fn science(name: &str) -> Image {
    image(name, "science", 30.0, science_level(30.0))
}

/// Raw science level for an exposure of `exptime` seconds.
pub fn science_level(exptime: f64) -> f32 {
    BIAS_LEVEL + DARK_RATE * exptime as f32 + SCIENCE_SIGNAL
}

/// Three biases, two 10 s darks and two 1 s flats.
pub fn calibration_images() -> Vec<Image> {
    vec![
        image("bias_1.fits", "bias", 0.0, BIAS_LEVEL),
        image("bias_2.fits", "bias", 0.0, BIAS_LEVEL),
        image("bias_3.fits", "bias", 0.0, BIAS_LEVEL),
        image("dark_1.fits", "dark", 10.0, BIAS_LEVEL + DARK_RATE * 10.0),
        image("dark_2.fits", "dark", 10.0, BIAS_LEVEL + DARK_RATE * 10.0),
        image("flat_1.fits", "flat", 1.0, BIAS_LEVEL + DARK_RATE + FLAT_LEVEL),
        image("flat_2.fits", "flat", 1.0, BIAS_LEVEL + DARK_RATE + FLAT_LEVEL),
    ]
}

/// Raw root `{root}/raw`, output root `{root}/output`.
pub fn context(root: &Path) -> StepContext {
    StepContext::new(NIGHT, &root.join("raw"), &root.join("output"))
}

/// Write `image` as `{raw_root}/{night}/raw/{base_name}`.
pub fn write_raw(ctx: &StepContext, image: &Image) -> PathBuf {
    let dir = ctx.raw_dir("raw");
    fs::create_dir_all(&dir).expect("create raw dir");
    let path = dir.join(image.base_name());
    fits::write_image(image, &path).expect("write raw image");
    path
}

pub fn single_image_batches(names: &[&str]) -> Vec<Batch> {
    names.iter().map(|n| Batch::images([science(n)])).collect()
}

/// Image step that fails every batch containing one of `fail_on`.
pub struct FailOn {
    pub key: &'static str,
    pub fail_on: HashSet<String>,
    pub make_error: fn(&str) -> ProcessorError,
}

impl FailOn {
    pub fn domain(key: &'static str, names: &[&str]) -> Self {
        Self {
            key,
            fail_on: names.iter().map(|n| n.to_string()).collect(),
            make_error: |name| ProcessorError::MissingCalibration(name.to_string()),
        }
    }

    pub fn noncritical(key: &'static str, names: &[&str]) -> Self {
        Self {
            make_error: |name| ProcessorError::Noncritical(format!("{name} is marginal")),
            ..Self::domain(key, names)
        }
    }
}

impl Processor for FailOn {
    fn key(&self) -> &'static str {
        self.key
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        if let Some(name) = batch.base_names().into_iter().find(|n| self.fail_on.contains(*n)) {
            return Err((self.make_error)(name));
        }
        Ok(batch)
    }
}

/// Image step that passes batches through unchanged.
pub struct PassThrough(pub &'static str);

impl Processor for PassThrough {
    fn key(&self) -> &'static str {
        self.0
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        Ok(batch)
    }
}

/// Product step that counts how often it actually computes.
#[derive(Default)]
pub struct CountingProducer {
    pub calls: AtomicUsize,
}

impl CountingProducer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CacheProducer for CountingProducer {
    fn cache_key(&self) -> &str {
        "stack"
    }

    fn make_image(&self, selected: &Batch, _ctx: &StepContext) -> StepResult<Image> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let images = selected.image_refs()?;
        let mut sum = Array2::<f32>::zeros((HEIGHT, WIDTH));
        for img in &images {
            sum += &*img.data()?;
        }
        Ok(Image::new(
            sum,
            Header::new().with(BASE_NAME_KEY, "stack.fits"),
        )?)
    }
}

/// Instrument with caller-supplied configurations and a plain FITS loader.
pub struct TestInstrument {
    pub configurations: IndexMap<String, ProcessorList>,
}

impl TestInstrument {
    pub fn new(configurations: impl IntoIterator<Item = (&'static str, ProcessorList)>) -> Self {
        Self {
            configurations: configurations
                .into_iter()
                .map(|(name, list)| (name.to_string(), list))
                .collect(),
        }
    }
}

impl Instrument for TestInstrument {
    fn name(&self) -> &str {
        "test"
    }

    fn configurations(&self) -> &IndexMap<String, ProcessorList> {
        &self.configurations
    }

    fn raw_loader(&self) -> LoadImageFn {
        load_fits_image()
    }
}

/// Pipeline over a single configuration named `"main"`.
pub fn pipeline(root: &Path, list: ProcessorList) -> Pipeline {
    let instrument = Arc::new(TestInstrument::new([("main", list)]));
    Pipeline::new(instrument, context(root), &["main".to_string()]).expect("valid pipeline")
}

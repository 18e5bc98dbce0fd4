//! General-purpose steps: loading, saving, regrouping, filtering and
//! header editing.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::consts::{LATEST_SAVE_KEY, RAW_IMG_SUB_DIR};
use crate::data::{Batch, DataBlock, Dataset, Header, HeaderValue, Image};
use crate::error::Result;
use crate::io::fits;

use super::{Processor, ProcessorError, StepContext, StepResult};

/// Turns one raw file into one or more images.
pub type LoadImageFn = Arc<dyn Fn(&Path) -> Result<Vec<Image>> + Send + Sync>;

/// Default loader: one image per single-HDU FITS file.
pub fn load_fits_image() -> LoadImageFn {
    Arc::new(|path: &Path| Ok(vec![fits::open_image(path)?]))
}

/// List `*.fits` files of a directory in name order.
pub fn list_fits_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "fits"))
        .collect();
    files.sort();
    Ok(files)
}

/// Loads every FITS file of `{root}/{night}/{input_sub_dir}`. The loaded
/// images replace whatever the incoming batch held.
pub struct ImageLoader {
    input_sub_dir: String,
    input_img_dir: Option<PathBuf>,
    load_image: LoadImageFn,
    only: Option<HashSet<String>>,
}

impl Default for ImageLoader {
    fn default() -> Self {
        Self {
            input_sub_dir: RAW_IMG_SUB_DIR.to_string(),
            input_img_dir: None,
            load_image: load_fits_image(),
            only: None,
        }
    }
}

impl ImageLoader {
    pub const KEY: &'static str = "load";

    pub fn new(input_sub_dir: &str) -> Self {
        Self {
            input_sub_dir: input_sub_dir.to_string(),
            ..Self::default()
        }
    }

    /// Read from `{dir}/{night}/{input_sub_dir}` instead of the raw root.
    pub fn with_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_img_dir = Some(dir.into());
        self
    }

    pub fn with_loader(mut self, load_image: LoadImageFn) -> Self {
        self.load_image = load_image;
        self
    }

    /// Only load files with these names.
    pub fn only(mut self, file_names: impl IntoIterator<Item = String>) -> Self {
        self.only = Some(file_names.into_iter().collect());
        self
    }

    pub fn input_dir(&self, ctx: &StepContext) -> PathBuf {
        match &self.input_img_dir {
            Some(root) => root.join(&ctx.night_sub_dir).join(&self.input_sub_dir),
            None => ctx.raw_dir(&self.input_sub_dir),
        }
    }
}

impl Processor for ImageLoader {
    fn key(&self) -> &'static str {
        Self::KEY
    }

    fn description(&self) -> String {
        format!("Load images from '{}'", self.input_sub_dir)
    }

    fn process(&self, batch: Batch, ctx: &StepContext) -> StepResult<Batch> {
        let dir = self.input_dir(ctx);
        if !dir.is_dir() {
            return Err(ProcessorError::Domain(format!(
                "input directory {} does not exist",
                dir.display()
            )));
        }

        let files: Vec<PathBuf> = list_fits_files(&dir)?
            .into_iter()
            .filter(|p| match (&self.only, p.file_name()) {
                (Some(only), Some(name)) => only.contains(name.to_string_lossy().as_ref()),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        if files.is_empty() {
            return Err(ProcessorError::Domain(format!(
                "no images found in {}",
                dir.display()
            )));
        }

        if !batch.is_empty() {
            debug!(replaced = batch.len(), "Loader discards the incoming batch");
        }
        let mut loaded = Batch::new();
        for path in &files {
            for image in (self.load_image)(path)? {
                loaded.append(image)?;
            }
        }
        info!(dir = %dir.display(), images = loaded.len(), "Loaded images");
        Ok(loaded)
    }
}

/// Writes every image to `{output}/{night}/{output_dir_name}/{base_name}`.
pub struct ImageSaver {
    output_dir_name: String,
}

impl ImageSaver {
    pub fn new(output_dir_name: &str) -> Self {
        Self {
            output_dir_name: output_dir_name.to_string(),
        }
    }
}

impl Processor for ImageSaver {
    fn key(&self) -> &'static str {
        "save"
    }

    fn description(&self) -> String {
        format!("Save images to '{}'", self.output_dir_name)
    }

    fn process(&self, batch: Batch, ctx: &StepContext) -> StepResult<Batch> {
        let dir = ctx.output_dir(&self.output_dir_name);
        fs::create_dir_all(&dir)?;
        let mut images = batch.into_images()?;
        for img in images.iter_mut() {
            let path = dir.join(img.base_name());
            img.header_mut()
                .insert(LATEST_SAVE_KEY, path.display().to_string());
            fits::write_image_atomic(img, &path)?;
            debug!(path = %path.display(), "Saved image");
        }
        Ok(Batch::images(images))
    }
}

/// Regroups all images of the dataset into one batch per distinct
/// combination of the split key values, in order of first appearance.
pub struct ImageBatcher {
    split_keys: Vec<String>,
}

impl ImageBatcher {
    pub fn new<S: Into<String>>(split_keys: impl IntoIterator<Item = S>) -> Self {
        Self {
            split_keys: split_keys.into_iter().map(Into::into).collect(),
        }
    }

    fn group_id(&self, header: &Header) -> Vec<String> {
        self.split_keys
            .iter()
            .map(|k| header.get_text(k).unwrap_or_default())
            .collect()
    }
}

impl Processor for ImageBatcher {
    fn key(&self) -> &'static str {
        "batch"
    }

    fn description(&self) -> String {
        format!("Group images by {:?}", self.split_keys)
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        for block in batch.iter() {
            for key in &self.split_keys {
                block.header().require(key, block.base_name())?;
            }
        }
        Ok(batch)
    }

    fn regroup(&self, dataset: Dataset) -> Dataset {
        let mut groups: IndexMap<Vec<String>, Vec<DataBlock>> = IndexMap::new();
        for block in dataset.into_iter().flat_map(Batch::into_blocks) {
            groups
                .entry(self.group_id(block.header()))
                .or_default()
                .push(block);
        }
        debug!(batches = groups.len(), keys = ?self.split_keys, "Regrouped dataset");
        collect_batches(groups.into_values())
    }
}

/// Merges every batch of the dataset into one.
#[derive(Default)]
pub struct ImageDebatcher;

impl Processor for ImageDebatcher {
    fn key(&self) -> &'static str {
        "debatch"
    }

    fn description(&self) -> String {
        "Merge all batches into one".into()
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        Ok(batch)
    }

    fn regroup(&self, dataset: Dataset) -> Dataset {
        let blocks: Vec<DataBlock> = dataset.into_iter().flat_map(Batch::into_blocks).collect();
        collect_batches(std::iter::once(blocks))
    }
}

fn collect_batches(groups: impl Iterator<Item = Vec<DataBlock>>) -> Dataset {
    groups
        .filter_map(|blocks| match Batch::from_blocks(blocks) {
            Ok(batch) => Some(batch),
            Err(e) => {
                warn!(error = %e, "Dropping inconsistent group");
                None
            }
        })
        .collect()
}

/// `(key, accepted values)` pairs compared against header values as text.
type Criteria = Vec<(String, Vec<String>)>;

fn matches_all(header: &Header, name: &str, criteria: &Criteria) -> StepResult<bool> {
    for (key, values) in criteria {
        let value = header.require(key, name)?.to_string();
        if !values.iter().any(|v| *v == value) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn criteria_from<K, V, I>(key: K, values: I) -> Criteria
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = V>,
{
    vec![(key.into(), values.into_iter().map(Into::into).collect())]
}

/// Keeps the images whose header matches every criterion.
pub struct ImageSelector {
    criteria: Criteria,
}

impl ImageSelector {
    pub fn new<K, V, I>(key: K, values: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = V>,
    {
        Self {
            criteria: criteria_from(key, values),
        }
    }

    pub fn and<K, V, I>(mut self, key: K, values: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = V>,
    {
        self.criteria.extend(criteria_from(key, values));
        self
    }
}

impl Processor for ImageSelector {
    fn key(&self) -> &'static str {
        "select"
    }

    fn description(&self) -> String {
        format!("Keep images matching {:?}", self.criteria)
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        let mut kept = Batch::of_kind(crate::data::DataKind::Image);
        for block in batch {
            if matches_all(block.header(), block.base_name(), &self.criteria)? {
                kept.append(block)?;
            }
        }
        Ok(kept)
    }
}

/// Drops the images whose header matches every criterion.
pub struct ImageRejector {
    criteria: Criteria,
}

impl ImageRejector {
    pub fn new<K, V, I>(key: K, values: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = V>,
    {
        Self {
            criteria: criteria_from(key, values),
        }
    }
}

impl Processor for ImageRejector {
    fn key(&self) -> &'static str {
        "reject"
    }

    fn description(&self) -> String {
        format!("Drop images matching {:?}", self.criteria)
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        let mut kept = Batch::of_kind(crate::data::DataKind::Image);
        for block in batch {
            if !matches_all(block.header(), block.base_name(), &self.criteria)? {
                kept.append(block)?;
            }
        }
        Ok(kept)
    }
}

/// Writes the comma-joined values of `input_keys` into `output_key`.
pub struct HeaderAnnotator {
    input_keys: Vec<String>,
    output_key: String,
}

impl HeaderAnnotator {
    pub fn new<S: Into<String>>(input_keys: impl IntoIterator<Item = S>, output_key: &str) -> Self {
        Self {
            input_keys: input_keys.into_iter().map(Into::into).collect(),
            output_key: output_key.to_string(),
        }
    }
}

impl Processor for HeaderAnnotator {
    fn key(&self) -> &'static str {
        "annotate"
    }

    fn process(&self, mut batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        for block in batch.iter_mut() {
            let name = block.base_name().to_string();
            let values = self
                .input_keys
                .iter()
                .map(|k| Ok(block.header().require(k, &name)?.to_string()))
                .collect::<StepResult<Vec<String>>>()?;
            block
                .header_mut()
                .insert(self.output_key.as_str(), values.join(","));
        }
        Ok(batch)
    }
}

/// Sets fixed header values on every image.
pub struct HeaderEditor {
    edits: Vec<(String, HeaderValue)>,
}

impl HeaderEditor {
    pub fn new(key: &str, value: impl Into<HeaderValue>) -> Self {
        Self {
            edits: vec![(key.to_string(), value.into())],
        }
    }

    pub fn and(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.edits.push((key.to_string(), value.into()));
        self
    }
}

impl Processor for HeaderEditor {
    fn key(&self) -> &'static str {
        "edit_header"
    }

    fn process(&self, mut batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        for block in batch.iter_mut() {
            for (key, value) in &self.edits {
                block.header_mut().insert(key.as_str(), value.clone());
            }
        }
        Ok(batch)
    }
}

pub type BatchModifierFn = Arc<dyn Fn(Batch) -> StepResult<Batch> + Send + Sync>;

/// Applies an arbitrary function to each image batch.
pub struct CustomImageBatchModifier {
    modifier: BatchModifierFn,
}

impl CustomImageBatchModifier {
    pub fn new<F>(modifier: F) -> Self
    where
        F: Fn(Batch) -> StepResult<Batch> + Send + Sync + 'static,
    {
        Self {
            modifier: Arc::new(modifier),
        }
    }
}

impl Processor for CustomImageBatchModifier {
    fn key(&self) -> &'static str {
        "custom"
    }

    fn process(&self, batch: Batch, _ctx: &StepContext) -> StepResult<Batch> {
        (self.modifier)(batch)
    }
}

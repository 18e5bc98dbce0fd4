use std::fs;
use std::path::Path;

use tracing::debug;

use crate::data::Batch;
use crate::io::image_io::save_preview_png;

use super::{Processor, StepContext, StepResult};

/// Saves a PNG preview of every image to `{output}/{night}/{sub_dir}`.
pub struct ImagePlotter {
    output_sub_dir: String,
}

impl ImagePlotter {
    pub fn new(output_sub_dir: &str) -> Self {
        Self {
            output_sub_dir: output_sub_dir.to_string(),
        }
    }
}

impl Default for ImagePlotter {
    fn default() -> Self {
        Self::new("plots")
    }
}

impl Processor for ImagePlotter {
    fn key(&self) -> &'static str {
        "plot"
    }

    fn description(&self) -> String {
        format!("Save PNG previews to '{}'", self.output_sub_dir)
    }

    fn process(&self, batch: Batch, ctx: &StepContext) -> StepResult<Batch> {
        let dir = ctx.output_dir(&self.output_sub_dir);
        fs::create_dir_all(&dir)?;
        for img in batch.image_refs()? {
            let stem = Path::new(img.base_name())
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| img.base_name().to_string());
            let path = dir.join(format!("{stem}.png"));
            save_preview_png(img, &path)?;
            debug!(path = %path.display(), "Saved preview");
        }
        Ok(batch)
    }
}

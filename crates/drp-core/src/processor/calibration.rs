//! Master-frame detrending: bias subtraction, dark subtraction scaled by
//! exposure time, and flat-field division.
//!
//! Each step builds a master frame from the matching calibration exposures
//! of the batch (by `OBSCLASS`) through a [`ProductSource`], then applies it
//! to every image of the batch, calibration exposures included.

use std::sync::Arc;

use ndarray::{Array2, Zip};
use rayon::prelude::*;
use tracing::debug;

use crate::consts::{
    BIAS_FRAME_KEY, BIAS_OBSCLASS, DARK_FRAME_KEY, DARK_OBSCLASS, EXPTIME_KEY, FLAT_FRAME_KEY,
    FLAT_OBSCLASS, OBSCLASS_KEY, PARALLEL_PIXEL_THRESHOLD,
};
use crate::data::{Batch, Header, Image};

use super::cache::{CacheProducer, ProductSource};
use super::{Processor, ProcessorError, Requirement, StepContext, StepResult};

/// Which master frame a [`MasterFrameCalibrator`] builds and applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MasterFrame {
    Bias,
    Dark,
    Flat,
}

impl MasterFrame {
    fn key(self) -> &'static str {
        match self {
            Self::Bias => "bias",
            Self::Dark => "dark",
            Self::Flat => "flat",
        }
    }

    fn obsclass(self) -> &'static str {
        match self {
            Self::Bias => BIAS_OBSCLASS,
            Self::Dark => DARK_OBSCLASS,
            Self::Flat => FLAT_OBSCLASS,
        }
    }

    fn header_key(self) -> &'static str {
        match self {
            Self::Bias => BIAS_FRAME_KEY,
            Self::Dark => DARK_FRAME_KEY,
            Self::Flat => FLAT_FRAME_KEY,
        }
    }
}

pub struct MasterFrameCalibrator {
    frame: MasterFrame,
    source: ProductSource,
    requirements: Vec<Requirement>,
}

impl MasterFrameCalibrator {
    pub fn new(frame: MasterFrame) -> Self {
        let requirements = match frame {
            MasterFrame::Bias => vec![],
            MasterFrame::Dark | MasterFrame::Flat => vec![Requirement::Key("bias")],
        };
        Self {
            frame,
            source: ProductSource::default(),
            requirements,
        }
    }

    pub fn bias() -> Self {
        Self::new(MasterFrame::Bias)
    }

    pub fn dark() -> Self {
        Self::new(MasterFrame::Dark)
    }

    pub fn flat() -> Self {
        Self::new(MasterFrame::Flat)
    }

    pub fn with_source(mut self, source: ProductSource) -> Self {
        self.source = source;
        self
    }

    fn exptime(header: &Header, name: &str) -> StepResult<f32> {
        Ok(header.get_f64(EXPTIME_KEY, name)? as f32)
    }
}

impl CacheProducer for MasterFrameCalibrator {
    fn cache_key(&self) -> &str {
        self.frame.key()
    }

    fn select_cache_images(&self, batch: &Batch) -> StepResult<Batch> {
        let selected = batch
            .image_refs()?
            .into_iter()
            .filter(|img| {
                img.header()
                    .get_text(OBSCLASS_KEY)
                    .is_some_and(|c| c.eq_ignore_ascii_case(self.frame.obsclass()))
            })
            .cloned();
        Ok(Batch::images(selected))
    }

    fn make_image(&self, selected: &Batch, _ctx: &StepContext) -> StepResult<Image> {
        let images = selected.image_refs()?;
        let mut frames = Vec::with_capacity(images.len());
        for img in &images {
            let data = img.data()?;
            let frame = match self.frame {
                MasterFrame::Bias => data,
                MasterFrame::Dark => {
                    let t = Self::exptime(img.header(), img.base_name())?;
                    if t <= 0.0 {
                        return Err(ProcessorError::Domain(format!(
                            "dark {} has non-positive exposure time",
                            img.base_name()
                        )));
                    }
                    Arc::new(data.mapv(|v| v / t))
                }
                MasterFrame::Flat => {
                    let norm = finite_median(&data).filter(|m| *m != 0.0).ok_or_else(|| {
                        ProcessorError::Domain(format!("flat {} has no usable pixels", img.base_name()))
                    })?;
                    Arc::new(data.mapv(|v| v / norm))
                }
            };
            frames.push(frame);
        }

        let mut master = median_combine(&frames)?;
        if self.frame == MasterFrame::Flat {
            if let Some(norm) = finite_median(&master).filter(|m| *m != 0.0) {
                master.mapv_inplace(|v| v / norm);
            }
        }
        debug!(frame = self.frame.key(), inputs = frames.len(), "Built master frame");

        let mut header = images[0].header().clone();
        header.insert(OBSCLASS_KEY, format!("master{}", self.frame.key()));
        Ok(Image::new(master, header)?)
    }
}

impl Processor for MasterFrameCalibrator {
    fn key(&self) -> &'static str {
        self.frame.key()
    }

    fn description(&self) -> String {
        match self.frame {
            MasterFrame::Bias => "Subtract a median master bias".into(),
            MasterFrame::Dark => "Subtract a median master dark scaled by exposure time".into(),
            MasterFrame::Flat => "Divide by a normalised median master flat".into(),
        }
    }

    fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    fn process(&self, batch: Batch, ctx: &StepContext) -> StepResult<Batch> {
        let master = self.source.resolve(self, &batch, ctx)?;
        let master_data = master.data()?;
        let master_name = master.base_name().to_string();

        let mut images = batch.into_images()?;
        for img in images.iter_mut() {
            let data = img.data()?;
            if data.dim() != master_data.dim() {
                return Err(ProcessorError::Domain(format!(
                    "{} has shape {:?}, master {} has {:?}",
                    img.base_name(),
                    data.dim(),
                    self.frame.key(),
                    master_data.dim()
                )));
            }
            let mut out = (*data).clone();
            match self.frame {
                MasterFrame::Bias => {
                    Zip::from(&mut out)
                        .and(&*master_data)
                        .for_each(|o, m| *o -= m);
                }
                MasterFrame::Dark => {
                    let t = Self::exptime(img.header(), img.base_name())?;
                    Zip::from(&mut out)
                        .and(&*master_data)
                        .for_each(|o, m| *o -= m * t);
                }
                MasterFrame::Flat => {
                    Zip::from(&mut out)
                        .and(&*master_data)
                        .for_each(|o, m| {
                            *o = if m.is_finite() && *m > 0.0 { *o / m } else { f32::NAN }
                        });
                }
            }
            img.set_data(out);
            img.header_mut()
                .insert(self.frame.header_key(), master_name.as_str());
        }
        Ok(Batch::images(images))
    }
}

/// Pixel-wise median of equally shaped frames.
///
/// Parallelizes at the row level for frames of at least
/// [`PARALLEL_PIXEL_THRESHOLD`] pixels.
pub fn median_combine(frames: &[Arc<Array2<f32>>]) -> StepResult<Array2<f32>> {
    let first = frames
        .first()
        .ok_or_else(|| ProcessorError::MissingCalibration("no frames to combine".into()))?;
    let (h, w) = first.dim();
    if let Some(bad) = frames.iter().find(|f| f.dim() != (h, w)) {
        return Err(ProcessorError::Domain(format!(
            "cannot combine frames of shape {:?} and {:?}",
            (h, w),
            bad.dim()
        )));
    }
    let n = frames.len();

    let row_median = |row: usize| -> Vec<f32> {
        let mut pixel_values = vec![0.0f32; n];
        let mut row_result = vec![0.0f32; w];
        for (col, result) in row_result.iter_mut().enumerate() {
            for (i, frame) in frames.iter().enumerate() {
                pixel_values[i] = frame[[row, col]];
            }
            *result = compute_median(&mut pixel_values);
        }
        row_result
    };

    let rows: Vec<Vec<f32>> = if h * w >= PARALLEL_PIXEL_THRESHOLD && n > 1 {
        (0..h).into_par_iter().map(row_median).collect()
    } else {
        (0..h).map(row_median).collect()
    };

    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((h, w), flat).map_err(|e| ProcessorError::Unexpected(e.to_string()))
}

fn finite_median(data: &Array2<f32>) -> Option<f32> {
    let mut values: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        None
    } else {
        Some(compute_median(&mut values))
    }
}

fn compute_median(values: &mut [f32]) -> f32 {
    let n = values.len();
    if n == 1 {
        values[0]
    } else if n % 2 == 1 {
        *values.select_nth_unstable_by(n / 2, |a, b| a.total_cmp(b)).1
    } else {
        let mid = n / 2;
        values.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
        values[..mid].select_nth_unstable_by(mid - 1, |a, b| a.total_cmp(b));
        (values[mid - 1] + values[mid]) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_and_even_counts() {
        assert_eq!(compute_median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(compute_median(&mut [4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn combine_rejects_mismatched_shapes() {
        let frames = vec![
            Arc::new(Array2::zeros((2, 2))),
            Arc::new(Array2::zeros((3, 2))),
        ];
        assert!(matches!(
            median_combine(&frames),
            Err(ProcessorError::Domain(_))
        ));
    }

    #[test]
    fn combine_is_pixelwise() {
        let frames: Vec<_> = [1.0, 5.0, 2.0]
            .iter()
            .map(|v| Arc::new(Array2::from_elem((2, 3), *v)))
            .collect();
        let master = median_combine(&frames).unwrap();
        assert!(master.iter().all(|v| *v == 2.0));
    }
}

use std::path::Path;

use image::{GrayImage, ImageFormat, Luma};
use ndarray::Array2;

use crate::data::Image;
use crate::error::Result;

/// Lower/upper percentiles mapped to black/white in previews.
const PREVIEW_LOW_PERCENTILE: f64 = 0.01;
const PREVIEW_HIGH_PERCENTILE: f64 = 0.99;

/// Display range `(lo, hi)` of the finite pixels, clipped at percentiles.
pub fn display_limits(data: &Array2<f32>) -> (f32, f32) {
    let mut finite: Vec<f32> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return (0.0, 1.0);
    }
    finite.sort_unstable_by(|a, b| a.total_cmp(b));
    let pick = |q: f64| finite[((finite.len() - 1) as f64 * q).round() as usize];
    let (lo, hi) = (pick(PREVIEW_LOW_PERCENTILE), pick(PREVIEW_HIGH_PERCENTILE));
    if hi > lo {
        (lo, hi)
    } else {
        (lo, lo + 1.0)
    }
}

/// Save an image as an 8-bit grayscale PNG stretched between its
/// percentile limits. Non-finite pixels are drawn black.
pub fn save_preview_png(image: &Image, path: &Path) -> Result<()> {
    let data = image.data()?;
    let (h, w) = data.dim();
    let (lo, hi) = display_limits(&data);

    let mut img = GrayImage::new(w as u32, h as u32);
    for row in 0..h {
        for col in 0..w {
            let v = data[[row, col]];
            let norm = if v.is_finite() {
                ((v - lo) / (hi - lo)).clamp(0.0, 1.0)
            } else {
                0.0
            };
            // FITS rows run bottom-up.
            img.put_pixel(col as u32, (h - 1 - row) as u32, Luma([(norm * 255.0) as u8]));
        }
    }

    img.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_ignore_nan() {
        let mut data = Array2::from_shape_fn((10, 10), |(r, c)| (r * 10 + c) as f32);
        data[[0, 0]] = f32::NAN;
        let (lo, hi) = display_limits(&data);
        assert!(lo >= 1.0);
        assert!(hi <= 99.0);
    }

    #[test]
    fn flat_image_gets_nonzero_range() {
        let data = Array2::from_elem((4, 4), 3.0);
        let (lo, hi) = display_limits(&data);
        assert!(hi > lo);
    }
}

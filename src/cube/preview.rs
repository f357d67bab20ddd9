//! RGB preview rendering.

use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array3, ArrayView2, Axis};
use std::path::Path;

use super::envi::write_atomically;
use crate::error::{AppResult, SnapError};

const LOW_PERCENTILE: f64 = 0.02;
const HIGH_PERCENTILE: f64 = 0.98;

/// Render three bands of `data` as an 8-bit RGB image.
///
/// Each channel is stretched linearly between its 2nd and 98th percentile.
pub fn render_rgb(data: &Array3<f64>, bands: [usize; 3]) -> AppResult<RgbImage> {
    let (lines, samples, band_count) = data.dim();
    if let Some(&bad) = bands.iter().find(|&&b| b >= band_count) {
        return Err(SnapError::Processing(format!(
            "preview band {bad} out of range for a cube with {band_count} bands"
        )));
    }
    let width = u32::try_from(samples)
        .map_err(|_| SnapError::Processing(format!("cube too wide for a preview: {samples}")))?;
    let height = u32::try_from(lines)
        .map_err(|_| SnapError::Processing(format!("cube too tall for a preview: {lines}")))?;

    let channels: Vec<(ArrayView2<f64>, Stretch)> = bands
        .iter()
        .map(|&b| {
            let plane = data.index_axis(Axis(2), b);
            let stretch = Stretch::from_plane(&plane);
            (plane, stretch)
        })
        .collect();

    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (l, s) = (y as usize, x as usize);
        let mut pixel = [0u8; 3];
        for (out, (plane, stretch)) in pixel.iter_mut().zip(&channels) {
            *out = stretch.apply(plane[[l, s]]);
        }
        Rgb(pixel)
    }))
}

/// Render and write a PNG preview, replacing `path` atomically.
pub fn save_rgb_png(data: &Array3<f64>, bands: [usize; 3], path: &Path) -> AppResult<()> {
    let image = render_rgb(data, bands)?;
    let mut encoded = std::io::Cursor::new(Vec::new());
    image.write_to(&mut encoded, ImageFormat::Png)?;
    let bytes = encoded.into_inner();
    write_atomically(path, |writer| std::io::Write::write_all(writer, &bytes))?;
    tracing::info!("RGB preview saved at {}", path.display());
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Stretch {
    low: f64,
    high: f64,
}

impl Stretch {
    fn from_plane(plane: &ArrayView2<f64>) -> Self {
        let mut values: Vec<f64> = plane.iter().copied().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return Self { low: 0.0, high: 0.0 };
        }
        values.sort_by(f64::total_cmp);
        let at = |p: f64| values[((values.len() - 1) as f64 * p).round() as usize];
        Self {
            low: at(LOW_PERCENTILE),
            high: at(HIGH_PERCENTILE),
        }
    }

    fn apply(self, value: f64) -> u8 {
        if !value.is_finite() || self.high <= self.low {
            return 0;
        }
        let scaled = ((value - self.low) / (self.high - self.low)).clamp(0.0, 1.0);
        (scaled * 255.0).round() as u8
    }
}

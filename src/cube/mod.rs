//! Hyperspectral cubes: ENVI I/O, aggregation and RGB previews.

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, CubeShape};

pub mod aggregate;
pub mod envi;
pub mod preview;

pub use aggregate::{combine, CubeAggregator, WavelengthProduct};
pub use envi::EnviHeader;

/// Band indices used for the red, green and blue preview channels.
pub const DEFAULT_RGB_BANDS: [usize; 3] = [29, 19, 9];

/// How a set of same-shape cubes is reduced to one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    /// Element-wise sum.
    #[default]
    Sum,
    /// Element-wise mean.
    Average,
}

/// A loaded cube, `(lines, samples, bands)`, with the header it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Cube {
    /// Human-readable origin, used in error messages.
    pub label: String,
    /// Wavelength group, when the cube came from a harvested shot.
    pub wavelength: Option<String>,
    /// Header the cube was read with, or the one it will be written with.
    pub metadata: EnviHeader,
    /// Samples as `(lines, samples, bands)`.
    pub data: Array3<f64>,
}

impl Cube {
    /// Wrap loaded data.
    pub fn new(label: impl Into<String>, metadata: EnviHeader, data: Array3<f64>) -> Self {
        Self {
            label: label.into(),
            wavelength: None,
            metadata,
            data,
        }
    }

    /// Tag the cube with its wavelength group.
    pub fn with_wavelength(mut self, wavelength: impl Into<String>) -> Self {
        self.wavelength = Some(wavelength.into());
        self
    }

    /// Cube with a fresh f32 header matching `data`.
    pub fn from_data(label: impl Into<String>, data: Array3<f64>) -> Self {
        let (lines, samples, bands) = data.dim();
        Self::new(label, EnviHeader::for_shape(lines, samples, bands), data)
    }

    /// Load a header/raster pair.
    pub fn open(label: impl Into<String>, header_path: &Path, data_path: &Path) -> AppResult<Self> {
        let (header, data) = envi::read_cube(header_path, data_path)?;
        Ok(Self::new(label, header, data))
    }

    /// Load the cube pair stored in a shot folder, labelled by the folder name.
    pub fn open_folder(folder: &Path, header_name: &str, data_name: &str) -> AppResult<Self> {
        let label = folder
            .file_name()
            .map_or_else(|| folder.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self::open(label, &folder.join(header_name), &folder.join(data_name))
    }

    /// `(lines, samples, bands)`.
    pub fn shape(&self) -> CubeShape {
        self.data.dim()
    }

    /// Write as f32 BSQ, atomically.
    pub fn save(&self, header_path: &Path, data_path: &Path) -> AppResult<()> {
        envi::write_cube(header_path, data_path, &self.metadata, &self.data)
    }
}

//! Sum and average same-shape cubes.

use ndarray::Array3;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{preview, CombineMode, Cube};
use crate::config::ProcessingConfig;
use crate::error::{AppResult, SnapError};
use crate::harvest::StepArtifact;

/// Reduce `cubes` to one.
///
/// Every shape is checked against the first cube before anything is
/// accumulated. The result carries the first cube's header.
pub fn combine(cubes: &[Cube], mode: CombineMode) -> AppResult<Cube> {
    let first = cubes.first().ok_or(SnapError::EmptyCombine)?;
    let expected = first.shape();
    if let Some(offending) = cubes.iter().find(|c| c.shape() != expected) {
        return Err(SnapError::ShapeMismatch {
            reference: first.label.clone(),
            expected,
            offending: offending.label.clone(),
            found: offending.shape(),
        });
    }

    for cube in &cubes[1..] {
        if cube.metadata.fields != first.metadata.fields {
            debug!(
                "Metadata of '{}' differs from '{}'; keeping the first header",
                cube.label, first.label
            );
        }
    }

    let mut total = Array3::<f64>::zeros(expected);
    for cube in cubes {
        total += &cube.data;
    }
    if mode == CombineMode::Average {
        total /= cubes.len() as f64;
    }

    let verb = match mode {
        CombineMode::Sum => "sum",
        CombineMode::Average => "average",
    };
    let mut result = Cube::new(
        format!("{verb} of {} cubes", cubes.len()),
        first.metadata.clone(),
        total,
    );
    result.wavelength = first.wavelength.clone();
    Ok(result)
}

/// Files written for one wavelength by [`CubeAggregator::combine_by_wavelength`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavelengthProduct {
    /// Wavelength shared by the combined shots.
    pub wavelength: String,
    /// Number of cubes summed.
    pub cube_count: usize,
    /// Written `_union.hdr`.
    pub header_path: PathBuf,
    /// Written `_union.img`.
    pub data_path: PathBuf,
    /// Written `_combined.png`.
    pub preview_path: PathBuf,
}

/// Combines cubes and writes their artifacts.
#[derive(Debug, Clone)]
pub struct CubeAggregator {
    rgb_bands: [usize; 3],
    header_name: String,
    data_name: String,
}

impl Default for CubeAggregator {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

impl CubeAggregator {
    /// Aggregator using the configured file names and preview bands.
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            rgb_bands: config.rgb_bands,
            header_name: config.cube_header_name.clone(),
            data_name: config.cube_data_name.clone(),
        }
    }

    /// Override the preview bands.
    pub fn with_rgb_bands(mut self, bands: [usize; 3]) -> Self {
        self.rgb_bands = bands;
        self
    }

    /// Preview bands as red, green, blue.
    pub fn rgb_bands(&self) -> [usize; 3] {
        self.rgb_bands
    }

    /// Load the cube pair from each shot folder.
    pub fn load_folders(&self, folders: &[PathBuf]) -> AppResult<Vec<Cube>> {
        folders
            .iter()
            .map(|f| Cube::open_folder(f, &self.header_name, &self.data_name))
            .collect()
    }

    /// Combine and write a PNG preview of the result.
    pub fn combine_with_preview(
        &self,
        cubes: &[Cube],
        mode: CombineMode,
        preview_path: &Path,
    ) -> AppResult<(Cube, PathBuf)> {
        let combined = combine(cubes, mode)?;
        preview::save_rgb_png(&combined.data, self.rgb_bands, preview_path)?;
        Ok((combined, preview_path.to_path_buf()))
    }

    /// Sum each wavelength's shots and write `{project}_{date}_{wavelength}_union`
    /// cubes with a `_combined.png` preview.
    ///
    /// Every group is loaded and combined before the first file is written.
    pub fn combine_by_wavelength(
        &self,
        artifacts: &[StepArtifact],
        output_dir: &Path,
        project_name: &str,
        date_tag: &str,
    ) -> AppResult<Vec<WavelengthProduct>> {
        let mut groups: Vec<(&str, Vec<&StepArtifact>)> = Vec::new();
        for artifact in artifacts {
            match groups.iter_mut().find(|(w, _)| *w == artifact.wavelength) {
                Some((_, members)) => members.push(artifact),
                None => groups.push((artifact.wavelength.as_str(), vec![artifact])),
            }
        }
        if groups.is_empty() {
            return Err(SnapError::EmptyCombine);
        }

        let mut combined = Vec::with_capacity(groups.len());
        for (wavelength, members) in &groups {
            let cubes = members
                .iter()
                .map(|a| {
                    Cube::open_folder(&a.folder, &self.header_name, &self.data_name)
                        .map(|c| c.with_wavelength(*wavelength))
                })
                .collect::<AppResult<Vec<_>>>()?;
            combined.push((*wavelength, cubes.len(), combine(&cubes, CombineMode::Sum)?));
        }

        std::fs::create_dir_all(output_dir)?;
        let mut products = Vec::with_capacity(combined.len());
        for (wavelength, cube_count, cube) in combined {
            let stem = format!("{project_name}_{date_tag}_{wavelength}");
            let header_path = output_dir.join(format!("{stem}_union.hdr"));
            let data_path = output_dir.join(format!("{stem}_union.img"));
            let preview_path = output_dir.join(format!("{stem}_combined.png"));

            cube.save(&header_path, &data_path)?;
            preview::save_rgb_png(&cube.data, self.rgb_bands, &preview_path)?;
            info!(
                "Saved combined cube for wavelength {} ({} shots) at {}",
                wavelength,
                cube_count,
                header_path.display()
            );
            products.push(WavelengthProduct {
                wavelength: wavelength.to_string(),
                cube_count,
                header_path,
                data_path,
                preview_path,
            });
        }
        Ok(products)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(label: &str, shape: (usize, usize, usize), value: f64) -> Cube {
        Cube::from_data(label, Array3::from_elem(shape, value))
    }

    #[test]
    fn test_sum_and_average() {
        let cubes = vec![cube("a", (2, 2, 3), 1.0), cube("b", (2, 2, 3), 3.0)];

        let sum = combine(&cubes, CombineMode::Sum).unwrap();
        let avg = combine(&cubes, CombineMode::Average).unwrap();

        assert!(sum.data.iter().all(|&v| v == 4.0));
        assert!(avg.data.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_average_uses_float_division() {
        let cubes = vec![
            cube("a", (1, 1, 1), 1.0),
            cube("b", (1, 1, 1), 2.0),
            cube("c", (1, 1, 1), 2.0),
        ];
        let avg = combine(&cubes, CombineMode::Average).unwrap();
        assert!((avg.data[[0, 0, 0]] - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_average_of_identical_cubes_is_identity() {
        let data = Array3::from_shape_fn((2, 3, 4), |(l, s, b)| (l * 12 + s * 4 + b) as f64 / 7.0);
        let cubes: Vec<Cube> = (0..5)
            .map(|i| Cube::from_data(format!("c{i}"), data.clone()).with_wavelength("500"))
            .collect();

        let avg = combine(&cubes, CombineMode::Average).unwrap();

        assert_eq!(avg.wavelength.as_deref(), Some("500"));
        for (a, b) in avg.data.iter().zip(data.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_combine() {
        assert!(matches!(
            combine(&[], CombineMode::Sum),
            Err(SnapError::EmptyCombine)
        ));
    }

    #[test]
    fn test_shape_mismatch_names_cubes() {
        let cubes = vec![
            cube("first", (2, 2, 3), 1.0),
            cube("second", (2, 2, 3), 1.0),
            cube("third", (2, 3, 3), 1.0),
        ];
        match combine(&cubes, CombineMode::Sum) {
            Err(SnapError::ShapeMismatch {
                reference,
                expected,
                offending,
                found,
            }) => {
                assert_eq!(reference, "first");
                assert_eq!(expected, (2, 2, 3));
                assert_eq!(offending, "third");
                assert_eq!(found, (2, 3, 3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_keeps_first_header() {
        let mut a = cube("a", (1, 1, 1), 1.0);
        a.metadata.fields.push(("description".into(), "first".into()));
        let mut b = cube("b", (1, 1, 1), 1.0);
        b.metadata.fields.push(("description".into(), "second".into()));

        let sum = combine(&[a, b], CombineMode::Sum).unwrap();
        assert_eq!(sum.metadata.field("description"), Some("first"));
    }
}

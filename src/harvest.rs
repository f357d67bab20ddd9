//! Collect the camera's per-shot folders after a run.
//!
//! The camera software saves every shot as a folder under its own
//! saved-images directory. A [`SavedImagesSnapshot`] taken before the run
//! tells the harvester which folders are new; those are matched to the plan
//! by modification time and copied into the project's output folder as
//! `{project}_{date}_{wavelength}_{picture}`.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::error::{AppResult, SnapError};
use crate::plan::AcquisitionPlan;

/// A shot folder holding one cube pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepArtifact {
    /// Wavelength parsed from the folder name.
    pub wavelength: String,
    /// Shot number within the wavelength, when present.
    pub picture_number: Option<u32>,
    /// Harvested folder.
    pub folder: PathBuf,
}

/// Listing of the saved-images directory at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedImagesSnapshot {
    /// Listed directory.
    pub directory: PathBuf,
    /// RFC 3339 time of the listing.
    pub taken_at: String,
    /// Entry names present at that time.
    pub entries: BTreeSet<String>,
}

impl SavedImagesSnapshot {
    /// List `directory` now.
    pub fn take(directory: &Path) -> AppResult<Self> {
        let entries = list_names(directory)?;
        info!(
            "Snapshot of {} taken: {} entries",
            directory.display(),
            entries.len()
        );
        Ok(Self {
            directory: directory.to_path_buf(),
            taken_at: Local::now().to_rfc3339(),
            entries,
        })
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SnapError::Processing(format!("failed to serialize snapshot: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read a snapshot written by [`save`](Self::save).
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            SnapError::Processing(format!("malformed snapshot {}: {e}", path.display()))
        })
    }

    /// Directories that appeared since the snapshot, oldest first.
    pub fn new_folders(&self) -> AppResult<Vec<PathBuf>> {
        let mut folders: Vec<(SystemTime, PathBuf)> = Vec::new();
        for name in list_names(&self.directory)?.difference(&self.entries) {
            let path = self.directory.join(name);
            let metadata = fs::metadata(&path)?;
            if metadata.is_dir() {
                folders.push((metadata.modified()?, path));
            }
        }
        folders.sort();
        Ok(folders.into_iter().map(|(_, p)| p).collect())
    }
}

/// Date tag used in harvested folder and product names.
pub fn date_tag() -> String {
    Local::now().format("%m-%d").to_string()
}

/// Copy the folders created since `snapshot` into `output_dir`, one per
/// planned shot, in plan order.
///
/// The number of new folders must equal the plan's shot count. Each copy is
/// made under a `.partial` name and renamed into place; existing
/// destinations are never overwritten.
pub fn harvest(
    snapshot: &SavedImagesSnapshot,
    plan: &AcquisitionPlan,
    project_name: &str,
    output_dir: &Path,
    date_tag: &str,
) -> AppResult<Vec<StepArtifact>> {
    plan.validate()?;
    let new_folders = snapshot.new_folders()?;
    let expected = plan.total_shots();
    if new_folders.len() != expected {
        return Err(SnapError::Processing(format!(
            "found {} new folders in {} but the plan has {} shots",
            new_folders.len(),
            snapshot.directory.display(),
            expected
        )));
    }

    fs::create_dir_all(output_dir)?;
    let targets = plan.rows.iter().flat_map(|row| {
        (1..=row.shot_count).map(move |picture| (row.wavelength.as_str(), picture))
    });

    let mut artifacts = Vec::with_capacity(expected);
    for (source, (wavelength, picture)) in new_folders.iter().zip(targets) {
        let name = format!("{project_name}_{date_tag}_{wavelength}_{picture}");
        let destination = output_dir.join(&name);
        if destination.exists() {
            return Err(SnapError::Processing(format!(
                "refusing to overwrite {}",
                destination.display()
            )));
        }

        let staging = output_dir.join(format!("{name}.partial"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        copy_dir(source, &staging)?;
        fs::rename(&staging, &destination)?;
        info!(
            "Copied and renamed folder: {} -> {}",
            source.display(),
            destination.display()
        );

        artifacts.push(StepArtifact {
            wavelength: wavelength.to_string(),
            picture_number: Some(picture),
            folder: destination,
        });
    }
    Ok(artifacts)
}

/// Shot folders under `folder` that hold a complete cube pair, sorted by name.
///
/// Folder names follow `{project}_{date}_{wavelength}[_{picture}]`.
pub fn discover_artifacts(
    folder: &Path,
    header_name: &str,
    data_name: &str,
) -> AppResult<Vec<StepArtifact>> {
    let mut subfolders: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    subfolders.sort();

    let mut artifacts = Vec::new();
    for path in subfolders {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".partial") {
            continue;
        }
        let Some((wavelength, picture_number)) = parse_folder_name(name) else {
            continue;
        };
        if !(path.join(header_name).is_file() && path.join(data_name).is_file()) {
            warn!("Hyperspectral files not found in {}", path.display());
            continue;
        }
        artifacts.push(StepArtifact {
            wavelength,
            picture_number,
            folder: path,
        });
    }
    info!("Found {} shot folders in {}", artifacts.len(), folder.display());
    Ok(artifacts)
}

/// Wavelength and picture number from a harvested folder name.
///
/// The wavelength follows the `MM-DD` date segment, so project names may
/// contain underscores. Without a date segment the third field is used.
fn parse_folder_name(name: &str) -> Option<(String, Option<u32>)> {
    let parts: Vec<&str> = name.split('_').collect();
    let is_date = |s: &str| {
        let b = s.as_bytes();
        b.len() == 5
            && b[2] == b'-'
            && b[..2].iter().chain(&b[3..]).all(u8::is_ascii_digit)
    };
    let wavelength_at = match parts.iter().position(|p| is_date(*p)) {
        Some(i) if i > 0 => i + 1,
        _ => 2,
    };
    let wavelength = parts.get(wavelength_at).filter(|w| !w.is_empty())?;
    let picture = parts.get(wavelength_at + 1).and_then(|p| p.parse().ok());
    Some((wavelength.to_string(), picture))
}

fn list_names(directory: &Path) -> AppResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    for entry in fs::read_dir(directory)? {
        names.insert(entry?.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

fn copy_dir(source: &Path, destination: &Path) -> AppResult<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

//! Durable per-run acquisition ledger.
//!
//! The ledger is a CSV table with one row per [`AcquisitionStep`]. It is the
//! source of truth for resuming an interrupted run, so every mutation is
//! written through immediately: the whole table is serialized to a sibling
//! temporary file, synced, and renamed over the ledger. A crash therefore
//! leaves either the previous or the new table on disk, never a torn one.
//!
//! ```text
//! Index,Wavelength,Picture_Number,Expected_Name,Raw_Filename,Status,Timestamp,File_Size_Bytes
//! 0,500,1,demo_500_1,frame_0001.bin,completed,2024-05-02 14:03:11,16777216
//! 1,500,2,demo_500_2,,timeout,2024-05-02 14:04:20,0
//! ```

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{AppResult, SnapError};
use crate::plan::{AcquisitionPlan, PlanRow};

/// Column names, in file order.
pub const LEDGER_HEADER: [&str; 8] = [
    "Index",
    "Wavelength",
    "Picture_Number",
    "Expected_Name",
    "Raw_Filename",
    "Status",
    "Timestamp",
    "File_Size_Bytes",
];

const LEDGER_PREFIX: &str = "acquisition_log_";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Lifecycle of a single step.
///
/// `Pending` is initial. `Completed` and `Cancelled` are terminal. `Timeout`
/// is terminal for the step but may still be cancelled when the operator
/// stops the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not yet acquired.
    Pending,
    /// A raw file arrived.
    Completed,
    /// No raw file within the budget.
    Timeout,
    /// Skipped by a halt or cancel.
    Cancelled,
}

impl StepStatus {
    /// Forward-only transition check. Rewriting the same status is allowed.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            StepStatus::Pending => true,
            StepStatus::Timeout => next == StepStatus::Cancelled,
            StepStatus::Completed | StepStatus::Cancelled => false,
        }
    }

    /// Anything short of `Completed` is eligible for a resumed run.
    pub fn is_incomplete(self) -> bool {
        self != StepStatus::Completed
    }

    /// Ledger spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Completed => "completed",
            StepStatus::Timeout => "timeout",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(StepStatus::Pending),
            "completed" => Ok(StepStatus::Completed),
            "timeout" => Ok(StepStatus::Timeout),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

/// One shot of the plan, as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionStep {
    /// Position in the plan, from 0.
    #[serde(rename = "Index")]
    pub index: usize,
    /// Wavelength as written in the plan.
    #[serde(rename = "Wavelength")]
    pub wavelength: String,
    /// Shot number within the wavelength, from 1.
    #[serde(rename = "Picture_Number")]
    pub picture_number: u32,
    /// `{project}_{wavelength}_{picture}`.
    #[serde(rename = "Expected_Name")]
    pub expected_name: String,
    /// Arrived file name, empty until completed.
    #[serde(rename = "Raw_Filename")]
    pub raw_filename: String,
    /// Current state.
    #[serde(rename = "Status")]
    pub status: StepStatus,
    /// Time of the last status change.
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    /// Size of the arrived file, 0 until completed.
    #[serde(rename = "File_Size_Bytes")]
    pub file_size_bytes: u64,
}

impl AcquisitionStep {
    /// Copy of this step moved to `status`, with the artifact fields cleared.
    pub fn with_status(&self, status: StepStatus) -> Self {
        Self {
            status,
            raw_filename: String::new(),
            file_size_bytes: 0,
            ..self.clone()
        }
    }

    /// Copy of this step resolved to an observed artifact.
    pub fn completed(&self, raw_filename: impl Into<String>, file_size_bytes: u64) -> Self {
        Self {
            status: StepStatus::Completed,
            raw_filename: raw_filename.into(),
            file_size_bytes,
            ..self.clone()
        }
    }
}

/// Aggregate counts shown to the operator before resuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    /// All records.
    pub total: usize,
    /// Records marked completed.
    pub completed: usize,
    /// Everything else.
    pub incomplete: usize,
}

/// Non-completed records grouped by wavelength, in first-appearance order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncompleteSet {
    groups: Vec<(String, u32)>,
}

impl IncompleteSet {
    fn from_steps<'a>(steps: impl IntoIterator<Item = &'a AcquisitionStep>) -> Self {
        let mut groups: Vec<(String, u32)> = Vec::new();
        for step in steps.into_iter().filter(|s| s.status.is_incomplete()) {
            match groups.iter_mut().find(|(w, _)| *w == step.wavelength) {
                Some((_, count)) => *count += 1,
                None => groups.push((step.wavelength.clone(), 1)),
            }
        }
        Self { groups }
    }

    /// `(wavelength, count)` in first-appearance order.
    pub fn groups(&self) -> &[(String, u32)] {
        &self.groups
    }

    /// Incomplete shots for one wavelength.
    pub fn count_for(&self, wavelength: &str) -> u32 {
        self.groups
            .iter()
            .find(|(w, _)| w == wavelength)
            .map_or(0, |(_, n)| *n)
    }

    /// Incomplete shots overall.
    pub fn total(&self) -> usize {
        self.groups.iter().map(|(_, n)| *n as usize).sum()
    }

    /// No incomplete shots.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The reconstructed plan a resumed run executes.
    pub fn to_plan(&self) -> AcquisitionPlan {
        AcquisitionPlan {
            rows: self
                .groups
                .iter()
                .map(|(w, n)| PlanRow::new(w.clone(), *n))
                .collect(),
        }
    }
}

/// Handle to a ledger file and its in-memory mirror.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    records: BTreeMap<usize, AcquisitionStep>,
}

impl Ledger {
    /// Allocate a new, empty ledger in `output_dir` for `project_name`.
    ///
    /// The file name embeds the creation time; a numeric suffix is added if a
    /// ledger with the same name already exists.
    pub fn create(output_dir: &Path, project_name: &str) -> AppResult<Self> {
        fs::create_dir_all(output_dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("{LEDGER_PREFIX}{project_name}_{stamp}");

        let mut path = output_dir.join(format!("{base}.csv"));
        let mut n = 1;
        while path.exists() {
            path = output_dir.join(format!("{base}_{n}.csv"));
            n += 1;
        }

        let ledger = Self {
            path,
            records: BTreeMap::new(),
        };
        ledger.persist(&ledger.records).map_err(|e| match e {
            SnapError::LedgerWrite { source, .. } => SnapError::Io(source),
            other => other,
        })?;
        info!("Ledger created at '{}'", ledger.path.display());
        Ok(ledger)
    }

    /// Load an existing ledger.
    pub fn open(path: &Path) -> AppResult<Self> {
        let records = read_records(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    /// Ledger file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record by step index.
    pub fn get(&self, index: usize) -> Option<&AcquisitionStep> {
        self.records.get(&index)
    }

    /// All records in index order.
    pub fn steps(&self) -> impl Iterator<Item = &AcquisitionStep> {
        self.records.values()
    }

    /// Write or overwrite the record for `step.index` and persist.
    pub fn upsert(&mut self, step: AcquisitionStep) -> AppResult<()> {
        self.upsert_many(std::iter::once(step))
    }

    /// Apply several records with a single write.
    ///
    /// Either every record is applied and persisted or none is: on a failed
    /// write the in-memory mirror is left untouched.
    pub fn upsert_many(&mut self, steps: impl IntoIterator<Item = AcquisitionStep>) -> AppResult<()> {
        let mut next = self.records.clone();
        let now = now_timestamp();
        for mut step in steps {
            match next.get(&step.index) {
                Some(existing) => {
                    if !existing.status.can_transition_to(step.status) {
                        return Err(SnapError::InvalidTransition {
                            index: step.index,
                            from: existing.status,
                            to: step.status,
                        });
                    }
                }
                // New rows may only extend the table.
                None if step.index != next.len() => return Err(SnapError::UnknownStep(step.index)),
                None => {}
            }
            step.timestamp = now.clone();
            next.insert(step.index, step);
        }
        self.persist(&next)?;
        self.records = next;
        Ok(())
    }

    /// Put a non-completed step back to `pending` so it can run again.
    ///
    /// This bypasses the forward-only rule and is reserved for the resume path.
    pub fn reopen(&mut self, index: usize) -> AppResult<AcquisitionStep> {
        let existing = self.records.get(&index).ok_or(SnapError::UnknownStep(index))?;
        if existing.status == StepStatus::Completed {
            return Err(SnapError::InvalidTransition {
                index,
                from: StepStatus::Completed,
                to: StepStatus::Pending,
            });
        }
        let mut reopened = existing.with_status(StepStatus::Pending);
        reopened.timestamp = now_timestamp();

        let mut next = self.records.clone();
        next.insert(index, reopened.clone());
        self.persist(&next)?;
        self.records = next;
        debug!("Reopened step {} for re-acquisition", index);
        Ok(reopened)
    }

    /// Completed versus incomplete counts.
    pub fn summary(&self) -> LedgerSummary {
        summarize_steps(self.records.values())
    }

    /// Incomplete shots grouped by wavelength.
    pub fn incomplete(&self) -> IncompleteSet {
        IncompleteSet::from_steps(self.records.values())
    }

    fn persist(&self, records: &BTreeMap<usize, AcquisitionStep>) -> AppResult<()> {
        write_records(&self.path, records).map_err(|source| SnapError::LedgerWrite {
            path: self.path.clone(),
            source,
        })
    }
}

/// Group a ledger's non-completed records by wavelength.
pub fn load_incomplete(path: &Path) -> AppResult<IncompleteSet> {
    let records = read_records(path)?;
    Ok(IncompleteSet::from_steps(records.values()))
}

/// Count total, completed and incomplete records of a ledger.
pub fn summarize(path: &Path) -> AppResult<LedgerSummary> {
    let records = read_records(path)?;
    Ok(summarize_steps(records.values()))
}

/// Newest ledger file in a prior-run output folder, by modification time.
pub fn find_latest_ledger(dir: &Path) -> AppResult<Option<PathBuf>> {
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with(LEDGER_PREFIX) && name.ends_with(".csv")) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified >= *t) {
            newest = Some((modified, entry.path()));
        }
    }
    Ok(newest.map(|(_, p)| p))
}

/// Project name encoded in a ledger file name, if it follows the naming scheme.
pub fn project_name_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix(LEDGER_PREFIX)?;
    let parts: Vec<&str> = rest.split('_').collect();
    let is_digits = |s: &str, len: usize| s.len() == len && s.bytes().all(|b| b.is_ascii_digit());
    (1..parts.len().saturating_sub(1))
        .rev()
        .find(|&i| is_digits(parts[i], 8) && is_digits(parts[i + 1], 6))
        .map(|i| parts[..i].join("_"))
}

fn summarize_steps<'a>(steps: impl Iterator<Item = &'a AcquisitionStep>) -> LedgerSummary {
    let mut summary = LedgerSummary::default();
    for step in steps {
        summary.total += 1;
        if step.status.is_incomplete() {
            summary.incomplete += 1;
        } else {
            summary.completed += 1;
        }
    }
    summary
}

fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

fn read_records(path: &Path) -> AppResult<BTreeMap<usize, AcquisitionStep>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| csv_read_error(path, e))?;

    let headers = reader.headers().map_err(|e| csv_read_error(path, e))?;
    if headers.iter().map(str::trim).ne(LEDGER_HEADER.iter().copied()) {
        return Err(SnapError::ledger_format(
            path,
            format!("unexpected header row: {:?}", headers.iter().collect::<Vec<_>>()),
        ));
    }

    let mut records = BTreeMap::new();
    for row in reader.deserialize::<AcquisitionStep>() {
        let step = row.map_err(|e| csv_read_error(path, e))?;
        if records.contains_key(&step.index) {
            return Err(SnapError::ledger_format(
                path,
                format!("duplicate index {}", step.index),
            ));
        }
        records.insert(step.index, step);
    }

    if let Some((pos, index)) = records.keys().enumerate().find(|(pos, index)| pos != *index) {
        return Err(SnapError::ledger_format(
            path,
            format!("indices are not contiguous: expected {pos}, found {index}"),
        ));
    }
    Ok(records)
}

fn csv_read_error(path: &Path, err: csv::Error) -> SnapError {
    if !err.is_io_error() {
        return SnapError::ledger_format(path, err.to_string());
    }
    match err.into_kind() {
        csv::ErrorKind::Io(io_err) => SnapError::Io(io_err),
        other => SnapError::ledger_format(path, format!("{other:?}")),
    }
}

fn write_records(path: &Path, records: &BTreeMap<usize, AcquisitionStep>) -> io::Result<()> {
    let tmp_path = path.with_extension("csv.tmp");
    let file = File::create(&tmp_path)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(LEDGER_HEADER).map_err(io::Error::other)?;
    for step in records.values() {
        writer.serialize(step).map_err(io::Error::other)?;
    }
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_wavelength_ledger(dir: &Path) -> Ledger {
        let plan = AcquisitionPlan::from_pairs([("500", 2), ("600", 2)]).unwrap();
        let mut ledger = Ledger::create(dir, "demo").unwrap();
        ledger.upsert_many(plan.expand("demo")).unwrap();
        ledger
    }

    #[test]
    fn test_create_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "demo").unwrap();

        let text = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.trim_end(), LEDGER_HEADER.join(","));
        assert!(ledger.is_empty());
        let name = ledger.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("acquisition_log_demo_"));
    }

    #[test]
    fn test_create_never_collides() {
        let dir = tempfile::tempdir().unwrap();
        let a = Ledger::create(dir.path(), "demo").unwrap();
        let b = Ledger::create(dir.path(), "demo").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_upsert_is_idempotent_per_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = two_wavelength_ledger(dir.path());

        let step = ledger.get(1).unwrap().clone();
        ledger.upsert(step.with_status(StepStatus::Timeout)).unwrap();
        ledger.upsert(step.with_status(StepStatus::Cancelled)).unwrap();

        let reloaded = Ledger::open(ledger.path()).unwrap();
        assert_eq!(reloaded.len(), 4);
        assert_eq!(
            reloaded.steps().filter(|s| s.index == 1).count(),
            1,
            "updates must overwrite in place"
        );
        assert_eq!(reloaded.get(1).unwrap().status, StepStatus::Cancelled);
    }

    #[test]
    fn test_completed_record_round_trips_artifact_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = two_wavelength_ledger(dir.path());

        let step = ledger.get(0).unwrap().completed("frame_0001.bin", 4096);
        ledger.upsert(step).unwrap();

        let reloaded = Ledger::open(ledger.path()).unwrap();
        let step = reloaded.get(0).unwrap();
        assert_eq!(step.raw_filename, "frame_0001.bin");
        assert_eq!(step.file_size_bytes, 4096);
        assert_eq!(step.status, StepStatus::Completed);
        assert!(!step.timestamp.is_empty());
    }

    #[test]
    fn test_status_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = two_wavelength_ledger(dir.path());

        let step = ledger.get(0).unwrap().completed("a.bin", 1);
        ledger.upsert(step.clone()).unwrap();

        let err = ledger
            .upsert(step.with_status(StepStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, SnapError::InvalidTransition { index: 0, .. }));
        assert_eq!(ledger.get(0).unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn test_new_rows_must_extend_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = two_wavelength_ledger(dir.path());
        let mut stray = ledger.get(0).unwrap().clone();
        stray.index = 9;
        assert!(matches!(ledger.upsert(stray), Err(SnapError::UnknownStep(9))));
    }

    #[test]
    fn test_load_incomplete_filters_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = two_wavelength_ledger(dir.path());
        let steps: Vec<_> = ledger.steps().cloned().collect();
        ledger
            .upsert_many([
                steps[0].completed("a.bin", 10),
                steps[1].with_status(StepStatus::Timeout),
                steps[2].with_status(StepStatus::Cancelled),
            ])
            .unwrap();

        let incomplete = load_incomplete(ledger.path()).unwrap();
        assert_eq!(
            incomplete.groups(),
            &[("500".to_string(), 1), ("600".to_string(), 2)]
        );
        assert_eq!(incomplete.total(), 3);

        let summary = summarize(ledger.path()).unwrap();
        assert_eq!(
            summary,
            LedgerSummary {
                total: 4,
                completed: 1,
                incomplete: 3
            }
        );
    }

    #[test]
    fn test_reopen_only_non_completed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = two_wavelength_ledger(dir.path());
        let steps: Vec<_> = ledger.steps().cloned().collect();
        ledger
            .upsert_many([
                steps[0].completed("a.bin", 10),
                steps[1].with_status(StepStatus::Timeout),
            ])
            .unwrap();

        assert_eq!(ledger.reopen(1).unwrap().status, StepStatus::Pending);
        assert!(ledger.reopen(0).is_err());
        assert!(matches!(ledger.reopen(42), Err(SnapError::UnknownStep(42))));
    }

    #[test]
    fn test_malformed_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquisition_log_bad_20240101_000000.csv");
        fs::write(
            &path,
            format!("{}\n0,500,1,x,,finished,,0\n", LEDGER_HEADER.join(",")),
        )
        .unwrap();
        assert!(matches!(
            summarize(&path),
            Err(SnapError::LedgerFormat { .. })
        ));

        fs::write(&path, "Index,Wavelength\n0,500\n").unwrap();
        assert!(matches!(
            load_incomplete(&path),
            Err(SnapError::LedgerFormat { .. })
        ));
    }

    #[test]
    fn test_gap_in_indices_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquisition_log_gap_20240101_000000.csv");
        fs::write(
            &path,
            format!(
                "{}\n0,500,1,x,,pending,,0\n2,500,2,y,,pending,,0\n",
                LEDGER_HEADER.join(",")
            ),
        )
        .unwrap();
        assert!(matches!(Ledger::open(&path), Err(SnapError::LedgerFormat { .. })));
    }

    #[test]
    fn test_find_latest_and_project_name() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::create(dir.path(), "my_sample").unwrap();
        fs::write(dir.path().join("notes.csv"), "x").unwrap();

        let found = find_latest_ledger(dir.path()).unwrap().unwrap();
        assert_eq!(found, ledger.path());
        assert_eq!(project_name_from_path(&found).as_deref(), Some("my_sample"));
        assert_eq!(
            project_name_from_path(Path::new("acquisition_log_a_b_20240102_030405_2.csv"))
                .as_deref(),
            Some("a_b")
        );
        assert_eq!(project_name_from_path(Path::new("other.csv")), None);
    }

    #[test]
    fn test_status_parse_and_transitions() {
        assert_eq!("timeout".parse::<StepStatus>(), Ok(StepStatus::Timeout));
        assert!("done".parse::<StepStatus>().is_err());
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(StepStatus::Timeout.can_transition_to(StepStatus::Cancelled));
        assert!(!StepStatus::Timeout.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Cancelled.can_transition_to(StepStatus::Pending));
    }
}

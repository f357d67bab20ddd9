//! Resume engine.
//!
//! Inspects the newest ledger in a prior-run output folder and turns its
//! non-completed records back into runnable steps. Execution itself goes
//! through [`Sequencer::resume`](crate::sequencer::Sequencer::resume), the
//! same path a fresh run takes.

use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{AppResult, SnapError};
use crate::ledger::{self, AcquisitionStep, IncompleteSet, Ledger, LedgerSummary};

/// What a prior run left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeReport {
    /// Newest ledger in the folder.
    pub ledger_path: PathBuf,
    /// Completed versus incomplete counts.
    pub summary: LedgerSummary,
    /// Shots left to acquire.
    pub incomplete: IncompleteSet,
    /// Project name recovered from the ledger file name.
    pub project_name: Option<String>,
}

impl ResumeReport {
    /// Every step is already completed.
    pub fn nothing_to_resume(&self) -> bool {
        self.incomplete.is_empty()
    }
}

/// Finds unfinished ledgers and reopens their steps.
pub struct ResumeEngine;

impl ResumeEngine {
    /// Find the newest ledger in `output_folder` and summarize it.
    pub fn inspect(output_folder: &Path) -> AppResult<ResumeReport> {
        let ledger_path = ledger::find_latest_ledger(output_folder)?.ok_or_else(|| {
            SnapError::Configuration(format!(
                "no acquisition ledger found in {}",
                output_folder.display()
            ))
        })?;
        let summary = ledger::summarize(&ledger_path)?;
        let incomplete = ledger::load_incomplete(&ledger_path)?;
        let project_name = ledger::project_name_from_path(&ledger_path);

        info!(
            "Ledger {}: {} total, {} completed, {} incomplete",
            ledger_path.display(),
            summary.total,
            summary.completed,
            summary.incomplete
        );
        Ok(ResumeReport {
            ledger_path,
            summary,
            incomplete,
            project_name,
        })
    }

    /// Reopen every non-completed step of `ledger` as pending.
    ///
    /// Steps come back grouped by wavelength in first-appearance order, with
    /// the original picture order inside each group.
    pub fn reopen_incomplete(ledger: &mut Ledger) -> AppResult<Vec<AcquisitionStep>> {
        let incomplete = ledger.incomplete();
        let mut indices: Vec<usize> = Vec::with_capacity(incomplete.total());
        for (wavelength, _) in incomplete.groups() {
            indices.extend(
                ledger
                    .steps()
                    .filter(|s| s.status.is_incomplete() && s.wavelength == *wavelength)
                    .map(|s| s.index),
            );
        }

        indices
            .into_iter()
            .map(|index| ledger.reopen(index))
            .collect()
    }
}

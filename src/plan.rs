//! Operator-defined acquisition plans and their expansion into steps.
//!
//! A plan is an ordered list of `(wavelength, shot count)` rows. Row order
//! defines step order and the same wavelength may appear in several rows.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{AppResult, SnapError};
use crate::ledger::{AcquisitionStep, StepStatus};

/// One row of the acquisition form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRow {
    /// Wavelength as the light source expects it.
    pub wavelength: String,
    /// Pictures to take at this wavelength.
    #[serde(rename = "shots")]
    pub shot_count: u32,
}

impl PlanRow {
    /// Row for `shot_count` pictures at `wavelength`.
    pub fn new(wavelength: impl Into<String>, shot_count: u32) -> Self {
        Self {
            wavelength: wavelength.into(),
            shot_count,
        }
    }
}

/// Ordered sequence of plan rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Rows in acquisition order.
    pub rows: Vec<PlanRow>,
}

impl AcquisitionPlan {
    /// Build and validate a plan from `(wavelength, count)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        let plan = Self {
            rows: pairs
                .into_iter()
                .map(|(w, n)| PlanRow::new(w, n))
                .collect(),
        };
        plan.validate()?;
        Ok(plan)
    }

    /// Parse a `WAVELENGTH:COUNT` argument as typed on the command line.
    pub fn parse_row(arg: &str) -> AppResult<PlanRow> {
        let (wavelength, count) = arg.split_once(':').ok_or_else(|| {
            SnapError::InvalidPlan(format!("expected WAVELENGTH:COUNT, got '{arg}'"))
        })?;
        let shot_count = count.trim().parse::<u32>().map_err(|e| {
            SnapError::InvalidPlan(format!("bad shot count in '{arg}': {e}"))
        })?;
        Ok(PlanRow::new(wavelength.trim(), shot_count))
    }

    /// Load a plan from a TOML file with `[[rows]]` tables.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let plan: AcquisitionPlan = toml::from_str(&text).map_err(|e| {
            SnapError::InvalidPlan(format!("{}: {e}", path.display()))
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reject empty plans, blank wavelengths and zero counts.
    pub fn validate(&self) -> AppResult<()> {
        if self.rows.is_empty() {
            return Err(SnapError::InvalidPlan("plan has no rows".into()));
        }
        for (i, row) in self.rows.iter().enumerate() {
            if row.wavelength.trim().is_empty() {
                return Err(SnapError::InvalidPlan(format!("row {i} has no wavelength")));
            }
            if row.shot_count == 0 {
                return Err(SnapError::InvalidPlan(format!(
                    "row {i} ({}) has a shot count of zero",
                    row.wavelength
                )));
            }
        }
        Ok(())
    }

    /// Total number of shots across all rows.
    pub fn total_shots(&self) -> usize {
        self.rows.iter().map(|r| r.shot_count as usize).sum()
    }

    /// Expand into one pending step per shot, indexed from zero.
    pub fn expand(&self, project_name: &str) -> Vec<AcquisitionStep> {
        let mut steps = Vec::with_capacity(self.total_shots());
        for row in &self.rows {
            for picture_number in 1..=row.shot_count {
                steps.push(AcquisitionStep {
                    index: steps.len(),
                    wavelength: row.wavelength.clone(),
                    picture_number,
                    expected_name: expected_name(project_name, &row.wavelength, picture_number),
                    raw_filename: String::new(),
                    status: StepStatus::Pending,
                    timestamp: String::new(),
                    file_size_bytes: 0,
                });
            }
        }
        steps
    }
}

/// Bookkeeping label for a shot. Never used to match files on disk.
pub fn expected_name(project_name: &str, wavelength: &str, picture_number: u32) -> String {
    format!("{project_name}_{wavelength}_{picture_number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_counts_and_indices() {
        let plan = AcquisitionPlan::from_pairs([("500", 2), ("600", 1), ("500", 3)]).unwrap();
        let steps = plan.expand("demo");

        assert_eq!(steps.len(), 6);
        assert_eq!(steps.len(), plan.total_shots());
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.index, i);
            assert_eq!(step.status, StepStatus::Pending);
        }
        assert_eq!(steps[1].expected_name, "demo_500_2");
        assert_eq!(steps[2].wavelength, "600");
        assert_eq!(steps[2].picture_number, 1);
        // Duplicate wavelength rows restart picture numbering.
        assert_eq!(steps[3].wavelength, "500");
        assert_eq!(steps[3].picture_number, 1);
    }

    #[test]
    fn test_zero_shots_rejected() {
        let err = AcquisitionPlan::from_pairs([("500", 0)]).unwrap_err();
        assert!(matches!(err, SnapError::InvalidPlan(_)));
    }

    #[test]
    fn test_blank_wavelength_rejected() {
        assert!(AcquisitionPlan::from_pairs([("  ", 1)]).is_err());
        assert!(AcquisitionPlan::from_pairs(Vec::<(String, u32)>::new()).is_err());
    }

    #[test]
    fn test_parse_row() {
        assert_eq!(
            AcquisitionPlan::parse_row("532.5:4").unwrap(),
            PlanRow::new("532.5", 4)
        );
        assert!(AcquisitionPlan::parse_row("532").is_err());
        assert!(AcquisitionPlan::parse_row("532:x").is_err());
    }

    #[test]
    fn test_load_toml_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(
            &path,
            "[[rows]]\nwavelength = \"500\"\nshots = 2\n\n[[rows]]\nwavelength = \"600\"\nshots = 1\n",
        )
        .unwrap();

        let plan = AcquisitionPlan::load(&path).unwrap();
        assert_eq!(plan.rows, vec![PlanRow::new("500", 2), PlanRow::new("600", 1)]);
    }
}

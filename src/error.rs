//! Custom error types for the application.
//!
//! `SnapError` is the single error type of the library. It is built with
//! `thiserror` and groups the failure classes of an acquisition run:
//!
//! - **`Device`**: the light source or trigger rejected a command or could not
//!   be reached. Fatal to the current run.
//! - **`LedgerWrite`** / **`LedgerFormat`**: the ledger could not be persisted
//!   or parsed. Both are fatal because resumability depends on the ledger.
//! - **`ShapeMismatch`**: cubes handed to a combine operation disagree on their
//!   raster shape. Nothing is written when this is raised.
//! - **`Io`**: artifact copy/rename and other filesystem failures.
//!
//! A watcher timeout is deliberately *not* an error; it is an ordinary
//! [`Arrival`](crate::watcher::Arrival) variant that drives the
//! confirm-or-cancel branch of the sequencer.

use std::path::PathBuf;
use thiserror::Error;

use crate::ledger::StepStatus;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SnapError>;

/// Raster shape as (rows, columns, bands).
pub type CubeShape = (usize, usize, usize);

/// Every failure the library reports.
#[derive(Error, Debug)]
pub enum SnapError {
    /// Configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A setting or run parameter is invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The wavelength plan is empty or malformed.
    #[error("Invalid acquisition plan: {0}")]
    InvalidPlan(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The light source or trigger failed.
    #[error("Device error: {0}")]
    Device(String),

    /// The ledger could not be rewritten.
    #[error("Failed to write ledger {path}: {source}")]
    LedgerWrite {
        /// Ledger file.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },

    /// The ledger could not be parsed.
    #[error("Malformed ledger {path}: {reason}")]
    LedgerFormat {
        /// Ledger file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// A status change the ledger does not allow.
    #[error("Step {index} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Step index.
        index: usize,
        /// Current status.
        from: StepStatus,
        /// Requested status.
        to: StepStatus,
    },

    /// No record with this index.
    #[error("No ledger record with index {0}")]
    UnknownStep(usize),

    #[error(
        "Cube shape mismatch: '{offending}' is {found:?} but '{reference}' is {expected:?}"
    )]
    /// Cubes of different shapes in one combine.
    ShapeMismatch {
        /// Label of the first cube.
        reference: String,
        /// Shape of the first cube.
        expected: CubeShape,
        /// Label of the cube that differs.
        offending: String,
        /// Its shape.
        found: CubeShape,
    },

    /// Combine called with no cubes.
    #[error("Cannot combine an empty set of cubes")]
    EmptyCombine,

    /// Malformed ENVI header or raster.
    #[error("Malformed ENVI file {path}: {reason}")]
    EnviFormat {
        /// Offending file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// PNG encoding failed.
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    /// Harvest or preview failure.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// Several artifacts appeared while multiple arrivals are rejected.
    #[error("More than one new artifact appeared at once: {0:?}")]
    AmbiguousArrival(Vec<String>),

    /// The run was cancelled.
    #[error("Run cancelled")]
    Cancelled,

    /// The named cargo feature is required.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl SnapError {
    /// Whether the error leaves the run unable to continue.
    ///
    /// Everything except plan and configuration validation is fatal once a
    /// run has started.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SnapError::InvalidPlan(_) | SnapError::Configuration(_) | SnapError::Config(_)
        )
    }

    pub(crate) fn ledger_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SnapError::LedgerFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn envi(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SnapError::EnviFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

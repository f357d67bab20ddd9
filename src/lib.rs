//! Core library for the laser_snap acquisition tool.
//!
//! Sweeps a tunable light source through an operator-defined wavelength plan,
//! fires the hyperspectral camera once per shot and confirms every capture by
//! watching the camera's raw data folder. Progress is recorded in a CSV
//! ledger that survives interruption, so an unfinished run can be resumed.
//! After a run, the per-shot cubes can be harvested, summed or averaged.

pub mod cancel;
pub mod config;
pub mod cube;
pub mod error;
pub mod gateway;
pub mod harvest;
pub mod ledger;
pub mod plan;
pub mod resume;
pub mod sequencer;
pub mod watcher;

pub use cancel::CancelHandle;
pub use error::{AppResult, SnapError};
pub use ledger::{AcquisitionStep, Ledger, StepStatus};
pub use plan::{AcquisitionPlan, PlanRow};
pub use sequencer::{
    spawn_run, ProgressEvent, RunContext, RunHandle, RunOutcome, RunReport, RunRequest,
    Sequencer,
};

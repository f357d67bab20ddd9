//! Acquisition sequencer.
//!
//! Drives one run: for every step it tunes the light source, waits the
//! settling delay, fires the camera and waits for a new raw file, recording
//! each outcome in the ledger before moving on. Progress is published as
//! [`ProgressEvent`]s over an unbounded channel; the operator is consulted
//! through [`OperatorPrompt`] when a capture times out.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelHandle;
use crate::error::{AppResult, SnapError};
use crate::gateway::DeviceGateway;
use crate::ledger::{AcquisitionStep, Ledger, StepStatus};
use crate::plan::AcquisitionPlan;
use crate::resume::ResumeEngine;
use crate::watcher::{Arrival, FileWatcher, WatcherConfig};

/// Operator-confirmed parameters for one run.
///
/// Nothing here is persisted: a resumed run needs a freshly confirmed
/// context because the ledger does not record the raw folder or timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Prefix of ledger and expected file names.
    pub project_name: String,
    /// Folder holding the ledger.
    pub output_path: PathBuf,
    /// Folder the camera writes raw files into.
    pub raw_data_folder: PathBuf,
    /// Per-step budget for a raw file.
    pub file_timeout: Duration,
}

impl RunContext {
    /// Build and validate a context, creating the output folder if needed.
    pub fn new(
        project_name: impl Into<String>,
        output_path: impl Into<PathBuf>,
        raw_data_folder: impl Into<PathBuf>,
        file_timeout: Duration,
    ) -> AppResult<Self> {
        let context = Self {
            project_name: project_name.into(),
            output_path: output_path.into(),
            raw_data_folder: raw_data_folder.into(),
            file_timeout,
        };
        std::fs::create_dir_all(&context.output_path)?;
        context.validate()?;
        Ok(context)
    }

    /// Check the project name, both folders and the timeout.
    pub fn validate(&self) -> AppResult<()> {
        let project = self.project_name.trim();
        if project.is_empty() {
            return Err(SnapError::Configuration("project name must not be empty".into()));
        }
        if project.contains(['/', '\\']) {
            return Err(SnapError::Configuration(format!(
                "project name '{project}' must not contain path separators"
            )));
        }
        if !self.output_path.is_dir() {
            return Err(SnapError::Configuration(format!(
                "output folder {} does not exist",
                self.output_path.display()
            )));
        }
        if !self.raw_data_folder.is_dir() {
            return Err(SnapError::Configuration(format!(
                "raw data folder {} does not exist",
                self.raw_data_folder.display()
            )));
        }
        if self.file_timeout.is_zero() {
            return Err(SnapError::Configuration("file timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Why a run stopped before its last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The operator declined to continue after a timeout.
    OperatorDeclined,
    /// A cancel request.
    Cancelled,
}

/// Final tally of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Steps that received a file.
    pub completed: usize,
    /// Steps that timed out.
    pub timed_out: usize,
    /// Steps marked cancelled by a halt.
    pub cancelled: usize,
    /// Why the run stopped early, if it did.
    pub halted: Option<HaltReason>,
}

impl RunOutcome {
    /// Whether the run stopped before its last step.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }
}

/// Progress notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A step is about to be acquired.
    StepStarted {
        /// Ledger index.
        index: usize,
        /// Wavelength being set.
        wavelength: String,
        /// Shot number within the wavelength.
        picture_number: u32,
        /// 1-based position within this run.
        position: usize,
        /// Steps in this run.
        total: usize,
    },
    /// A step's raw file arrived.
    StepCompleted {
        /// Ledger index.
        index: usize,
        /// Arrived file name.
        raw_filename: String,
        /// Its size.
        file_size_bytes: u64,
    },
    /// A step timed out.
    StepTimedOut {
        /// Ledger index.
        index: usize,
        /// Wavelength of the step.
        wavelength: String,
        /// Shot number within the wavelength.
        picture_number: u32,
    },
    /// The run stopped before its last step.
    RunHalted {
        /// Why.
        reason: HaltReason,
        /// Steps marked cancelled, the in-flight one included.
        cancelled_steps: usize,
    },
    /// The run stopped on an error; `RunFinished` follows.
    RunFailed {
        /// Rendered error.
        error: String,
    },
    /// Last event of every run.
    RunFinished(RunOutcome),
}

/// Asks the operator whether to keep going after a capture timed out.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// `true` keeps the run going; `false` cancels the remaining steps.
    async fn continue_after_timeout(&self, step: &AcquisitionStep) -> bool;
}

/// Always continues. Used for unattended runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysContinue;

#[async_trait]
impl OperatorPrompt for AlwaysContinue {
    async fn continue_after_timeout(&self, _step: &AcquisitionStep) -> bool {
        true
    }
}

/// Always stops at the first timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysStop;

#[async_trait]
impl OperatorPrompt for AlwaysStop {
    async fn continue_after_timeout(&self, _step: &AcquisitionStep) -> bool {
        false
    }
}

/// Replays a fixed list of answers, then falls back to `default`.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<usize>>,
    default: bool,
}

impl ScriptedPrompt {
    /// Answer with `answers` in order, then `default`.
    pub fn new(answers: impl IntoIterator<Item = bool>, default: bool) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            asked: Mutex::new(Vec::new()),
            default,
        }
    }

    /// Indices of the steps the operator was asked about.
    pub fn asked(&self) -> Vec<usize> {
        self.asked.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn continue_after_timeout(&self, step: &AcquisitionStep) -> bool {
        self.asked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(step.index);
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(self.default)
    }
}

/// Ledger location and outcome of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Ledger the run wrote to.
    pub ledger_path: PathBuf,
    /// Counts and halt reason.
    pub outcome: RunOutcome,
}

/// What a background run should do.
#[derive(Debug, Clone)]
pub enum RunRequest {
    /// Start a new ledger for this plan.
    Fresh(AcquisitionPlan),
    /// Re-acquire the incomplete steps of an existing ledger.
    Resume(PathBuf),
}

/// Handle on a run executing on a background task.
pub struct RunHandle {
    join: JoinHandle<AppResult<RunReport>>,
    cancel: CancelHandle,
}

impl RunHandle {
    /// Handle that cancels this run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to end.
    pub async fn join(self) -> AppResult<RunReport> {
        self.join
            .await
            .map_err(|e| SnapError::Processing(format!("run task failed: {e}")))?
    }
}

/// Drives plan steps through the gateway and records them in the ledger.
pub struct Sequencer {
    context: RunContext,
    gateway: Arc<dyn DeviceGateway>,
    prompt: Arc<dyn OperatorPrompt>,
    watcher: FileWatcher,
    settling_delay: Duration,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    cancel: CancelHandle,
}

impl Sequencer {
    /// Sequencer with default watcher settings and a 5 s settling delay.
    pub fn new(
        context: RunContext,
        gateway: Arc<dyn DeviceGateway>,
        prompt: Arc<dyn OperatorPrompt>,
    ) -> Self {
        Self {
            context,
            gateway,
            prompt,
            watcher: FileWatcher::default(),
            settling_delay: Duration::from_secs(5),
            progress: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Override the watcher settings.
    pub fn with_watcher(mut self, config: WatcherConfig) -> Self {
        self.watcher = FileWatcher::new(config);
        self
    }

    /// Override the settling delay.
    pub fn with_settling_delay(mut self, delay: Duration) -> Self {
        self.settling_delay = delay;
        self
    }

    /// Send [`ProgressEvent`]s to `sender`.
    pub fn with_progress(mut self, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Share an existing cancel handle.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Folders, project name and timeout of this run.
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Handle that cancels runs of this sequencer.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Create the run's ledger and pre-populate it with every step as pending.
    pub fn prepare(&self, plan: &AcquisitionPlan) -> AppResult<(Ledger, Vec<AcquisitionStep>)> {
        plan.validate()?;
        let steps = plan.expand(&self.context.project_name);
        let mut ledger = Ledger::create(&self.context.output_path, &self.context.project_name)?;
        ledger.upsert_many(steps.iter().cloned())?;
        info!(
            "Prepared {} steps in {}",
            steps.len(),
            ledger.path().display()
        );
        Ok((ledger, steps))
    }

    /// Fresh run: prepare the ledger, then execute every step.
    pub async fn run_plan(&self, plan: &AcquisitionPlan) -> AppResult<RunReport> {
        let (mut ledger, steps) = self.prepare(plan)?;
        let outcome = self.execute(&mut ledger, steps).await?;
        Ok(RunReport {
            ledger_path: ledger.path().to_path_buf(),
            outcome,
        })
    }

    /// Re-acquire the incomplete steps recorded in `ledger_path`.
    ///
    /// Returns `None` when the ledger has nothing left to do.
    pub async fn resume(&self, ledger_path: &Path) -> AppResult<Option<RunReport>> {
        let mut ledger = Ledger::open(ledger_path)?;
        let steps = ResumeEngine::reopen_incomplete(&mut ledger)?;
        if steps.is_empty() {
            info!("Nothing to resume in {}", ledger_path.display());
            return Ok(None);
        }
        info!("Resuming {} steps from {}", steps.len(), ledger_path.display());
        let outcome = self.execute(&mut ledger, steps).await?;
        Ok(Some(RunReport {
            ledger_path: ledger.path().to_path_buf(),
            outcome,
        }))
    }

    /// Drive `steps` in order, recording each outcome in `ledger`.
    ///
    /// Every step must already exist in the ledger as `pending`. A device
    /// error stops the run and leaves the in-flight step pending.
    ///
    /// `RunFinished` is always the last event, including after a failure.
    pub async fn execute(
        &self,
        ledger: &mut Ledger,
        steps: Vec<AcquisitionStep>,
    ) -> AppResult<RunOutcome> {
        let mut outcome = RunOutcome::default();
        let result = self.run_steps(ledger, &steps, &mut outcome).await;
        match &result {
            Ok(()) => info!(
                "Run finished: {} completed, {} timed out, {} cancelled",
                outcome.completed, outcome.timed_out, outcome.cancelled
            ),
            Err(e) => {
                error!("Run aborted: {}", e);
                self.emit(ProgressEvent::RunFailed {
                    error: e.to_string(),
                });
            }
        }
        self.emit(ProgressEvent::RunFinished(outcome.clone()));
        result.map(|()| outcome)
    }

    async fn run_steps(
        &self,
        ledger: &mut Ledger,
        steps: &[AcquisitionStep],
        outcome: &mut RunOutcome,
    ) -> AppResult<()> {
        let total = steps.len();
        let raw_folder = self.context.raw_data_folder.as_path();

        for (position, step) in steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.halt(ledger, &steps[position..], HaltReason::Cancelled, outcome)?;
                break;
            }

            info!(
                "Step {}/{}: wavelength {} picture {}",
                position + 1,
                total,
                step.wavelength,
                step.picture_number
            );
            self.emit(ProgressEvent::StepStarted {
                index: step.index,
                wavelength: step.wavelength.clone(),
                picture_number: step.picture_number,
                position: position + 1,
                total,
            });

            // Snapshot before any command so a fast camera is not absorbed into the baseline
            let baseline = self.watcher.baseline(raw_folder).await?;

            debug!("Setting wavelength {}", step.wavelength);
            self.gateway.set_wavelength(&step.wavelength).await?;
            if !self.cancel.sleep(self.settling_delay).await {
                self.halt(ledger, &steps[position..], HaltReason::Cancelled, outcome)?;
                break;
            }

            debug!("Triggering capture for step {}", step.index);
            self.gateway.trigger().await?;

            match baseline.wait(self.context.file_timeout, &self.cancel).await? {
                Arrival::Found(file) => {
                    ledger.upsert(step.completed(&file.name, file.size_bytes))?;
                    outcome.completed += 1;
                    info!("Step {} completed: {} ({} bytes)", step.index, file.name, file.size_bytes);
                    self.emit(ProgressEvent::StepCompleted {
                        index: step.index,
                        raw_filename: file.name,
                        file_size_bytes: file.size_bytes,
                    });
                }
                Arrival::TimedOut => {
                    ledger.upsert(step.with_status(StepStatus::Timeout))?;
                    outcome.timed_out += 1;
                    warn!(
                        "No file for wavelength {} picture {} within {:?}",
                        step.wavelength, step.picture_number, self.context.file_timeout
                    );
                    self.emit(ProgressEvent::StepTimedOut {
                        index: step.index,
                        wavelength: step.wavelength.clone(),
                        picture_number: step.picture_number,
                    });

                    if !self.prompt.continue_after_timeout(step).await {
                        self.halt(
                            ledger,
                            &steps[position + 1..],
                            HaltReason::OperatorDeclined,
                            outcome,
                        )?;
                        break;
                    }
                }
                Arrival::Cancelled => {
                    self.halt(ledger, &steps[position..], HaltReason::Cancelled, outcome)?;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Mark `remaining` cancelled in a single ledger write.
    fn halt(
        &self,
        ledger: &mut Ledger,
        remaining: &[AcquisitionStep],
        reason: HaltReason,
        outcome: &mut RunOutcome,
    ) -> AppResult<()> {
        ledger.upsert_many(
            remaining
                .iter()
                .map(|step| step.with_status(StepStatus::Cancelled)),
        )?;
        outcome.cancelled += remaining.len();
        outcome.halted = Some(reason);
        warn!("Run halted ({:?}); {} steps cancelled", reason, remaining.len());
        self.emit(ProgressEvent::RunHalted {
            reason,
            cancelled_steps: remaining.len(),
        });
        Ok(())
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.progress {
            // A dropped receiver only means nobody is watching
            let _ = sender.send(event);
        }
    }
}

/// Move `sequencer` onto a background task.
pub fn spawn_run(sequencer: Sequencer, request: RunRequest) -> RunHandle {
    let cancel = sequencer.cancel_handle();
    let join = tokio::spawn(async move {
        match request {
            RunRequest::Fresh(plan) => sequencer.run_plan(&plan).await,
            RunRequest::Resume(ledger_path) => {
                let report = sequencer.resume(&ledger_path).await?;
                Ok(report.unwrap_or(RunReport {
                    ledger_path,
                    outcome: RunOutcome::default(),
                }))
            }
        }
    });
    RunHandle { join, cancel }
}

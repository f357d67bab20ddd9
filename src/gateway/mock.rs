//! Simulated gateway for tests and `--simulate` runs.
//!
//! Records every call, supports failure injection, and can stand in for the
//! camera by dropping a raw frame into the watched folder on each trigger.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::DeviceGateway;
use crate::cancel::CancelHandle;
use crate::error::{AppResult, SnapError};

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `set_wavelength` with its argument.
    SetWavelength(String),
    /// `trigger`.
    Trigger,
}

/// In-memory gateway for tests and `--simulate` runs.
#[derive(Clone)]
pub struct MockGateway {
    raw_folder: Option<PathBuf>,
    frame_bytes: usize,
    latency: Duration,
    triggers: Arc<AtomicUsize>,
    silent_triggers: Arc<Mutex<HashSet<usize>>>,
    should_fail_next: Arc<AtomicBool>,
    cancel_on_trigger: Option<(usize, CancelHandle)>,
    call_log: Arc<Mutex<Vec<GatewayCall>>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    /// A gateway that accepts every command and produces no files.
    pub fn new() -> Self {
        Self {
            raw_folder: None,
            frame_bytes: 1024,
            latency: Duration::ZERO,
            triggers: Arc::new(AtomicUsize::new(0)),
            silent_triggers: Arc::new(Mutex::new(HashSet::new())),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            cancel_on_trigger: None,
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Emulate the camera: each trigger writes a frame into `raw_folder`.
    pub fn with_camera(mut self, raw_folder: impl Into<PathBuf>) -> Self {
        self.raw_folder = Some(raw_folder.into());
        self
    }

    /// Size of each written frame.
    pub fn with_frame_bytes(mut self, bytes: usize) -> Self {
        self.frame_bytes = bytes;
        self
    }

    /// Simulated command latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Request cancellation on `handle` when the `n`th trigger (1-based) fires.
    pub fn cancel_on_trigger(mut self, n: usize, handle: CancelHandle) -> Self {
        self.cancel_on_trigger = Some((n, handle));
        self
    }

    /// The `n`th trigger (1-based) will not produce a file.
    pub fn drop_frame(&self, n: usize) {
        self.silent_triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(n);
    }

    /// Fail the next call with a device error.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every call received, in order.
    pub fn call_log(&self) -> Vec<GatewayCall> {
        self.call_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Triggers received so far.
    pub fn trigger_count(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    fn record(&self, call: GatewayCall) {
        self.call_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    async fn simulate(&self, operation: &str) -> AppResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(SnapError::Device(format!("simulated {operation} failure")));
        }
        Ok(())
    }

    async fn write_frame(&self, n: usize) -> AppResult<()> {
        let Some(folder) = &self.raw_folder else {
            return Ok(());
        };
        let silent = self
            .silent_triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&n);
        if silent {
            debug!("Mock camera skipping frame {}", n);
            return Ok(());
        }

        // Never reuse a name left by an earlier run
        let mut k = n;
        let mut final_path = folder.join(format!("frame_{k:04}.bin"));
        while tokio::fs::try_exists(&final_path).await? {
            k += 1;
            final_path = folder.join(format!("frame_{k:04}.bin"));
        }
        // Write under a temporary name so a watcher never sees a partial frame
        let temp_path = folder.join(format!("frame_{k:04}.partial"));
        let frame: Vec<u8> = (0..self.frame_bytes).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&temp_path, frame).await?;
        tokio::fs::rename(&temp_path, &final_path).await?;
        debug!("Mock camera wrote {}", final_path.display());
        Ok(())
    }
}

#[async_trait]
impl DeviceGateway for MockGateway {
    async fn set_wavelength(&self, wavelength: &str) -> AppResult<()> {
        self.simulate("set_wavelength").await?;
        self.record(GatewayCall::SetWavelength(wavelength.to_string()));
        Ok(())
    }

    async fn trigger(&self) -> AppResult<()> {
        self.simulate("trigger").await?;
        self.record(GatewayCall::Trigger);
        let n = self.triggers.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((at, handle)) = &self.cancel_on_trigger {
            if *at == n {
                handle.cancel();
            }
        }
        self.write_frame(n).await
    }
}

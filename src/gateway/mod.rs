//! Device gateway: the two commands the sequencer issues.
//!
//! The core never speaks a device protocol itself. It asks a [`DeviceGateway`]
//! to tune the light source and to fire the camera, and tolerates whatever
//! latency those calls carry. Neither call reports completion of the physical
//! action; the sequencer applies fixed delays and watches the filesystem.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::AppResult;

pub mod hardware;
pub mod mock;

pub use hardware::{
    discover_light_source, discover_trigger_port, HardwareGateway, SerialTrigger, VisaLightSource,
};
pub use mock::{GatewayCall, MockGateway};

/// Light source + camera trigger, as seen by the sequencer.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Send the textual wavelength command. Does not wait for the move.
    async fn set_wavelength(&self, wavelength: &str) -> AppResult<()>;

    /// Fire a single capture.
    async fn trigger(&self) -> AppResult<()>;
}

#[async_trait]
impl<T: DeviceGateway + ?Sized> DeviceGateway for Arc<T> {
    async fn set_wavelength(&self, wavelength: &str) -> AppResult<()> {
        (**self).set_wavelength(wavelength).await
    }

    async fn trigger(&self) -> AppResult<()> {
        (**self).trigger().await
    }
}

/// Expand a command template such as `gowave {wavelength}`.
pub fn format_wavelength_command(template: &str, wavelength: &str) -> String {
    template.replace("{wavelength}", wavelength.trim())
}

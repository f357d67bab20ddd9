//! Hardware gateway: VISA light source and serial capture trigger.
//!
//! Both halves are behind feature flags. When a feature is off the type still
//! exists but every call fails with [`SnapError::FeatureNotEnabled`], so the
//! sequencer and the CLI compile the same way in every configuration.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::DeviceGateway;
use crate::config::DeviceConfig;
use crate::error::{AppResult, SnapError};

// ============================================================================
// Serial trigger
// ============================================================================

/// Capture trigger on a microcontroller serial port.
///
/// Each trigger opens the port, waits the warm-up delay (the board resets on
/// open), writes the trigger token and closes the port again.
#[derive(Debug, Clone)]
pub struct SerialTrigger {
    port_name: String,
    baud_rate: u32,
    token: String,
    warmup: Duration,
}

impl SerialTrigger {
    /// Trigger on `port_name` with the default token and warm-up.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        let defaults = DeviceConfig::default();
        Self {
            port_name: port_name.into(),
            baud_rate,
            token: defaults.trigger_token,
            warmup: Duration::from_millis(defaults.trigger_warmup_ms),
        }
    }

    /// Trigger on `port_name` using the device settings.
    pub fn from_config(port_name: impl Into<String>, config: &DeviceConfig) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: config.trigger_baud_rate,
            token: config.trigger_token.clone(),
            warmup: Duration::from_millis(config.trigger_warmup_ms),
        }
    }

    /// Serial port path.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Send one trigger.
    #[cfg(feature = "instrument_serial")]
    pub async fn fire(&self) -> AppResult<()> {
        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let token = self.token.clone();
        let warmup = self.warmup;

        // Blocking serial I/O runs on a dedicated thread
        tokio::task::spawn_blocking(move || -> AppResult<()> {
            use std::io::Write;

            let mut port = serialport::new(&port_name, baud_rate)
                .timeout(Duration::from_secs(1))
                .open()
                .map_err(|e| {
                    SnapError::Device(format!(
                        "failed to open trigger port '{port_name}' at {baud_rate} baud: {e}"
                    ))
                })?;

            std::thread::sleep(warmup);

            port.write_all(token.as_bytes())
                .and_then(|()| port.flush())
                .map_err(|e| SnapError::Device(format!("failed to write trigger: {e}")))?;
            info!("Sent: {}", token.trim());
            Ok(())
        })
        .await
        .map_err(|e| SnapError::Device(format!("trigger task panicked: {e}")))?
    }

    /// Send one trigger.
    #[cfg(not(feature = "instrument_serial"))]
    pub async fn fire(&self) -> AppResult<()> {
        Err(SnapError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

/// First serial port that looks like the trigger board.
///
/// Matches USB ports whose product or manufacturer string mentions an
/// Arduino or a CP210x bridge.
#[cfg(feature = "instrument_serial")]
pub fn discover_trigger_port() -> AppResult<Option<String>> {
    let ports = serialport::available_ports()
        .map_err(|e| SnapError::Device(format!("failed to enumerate serial ports: {e}")))?;
    tracing::debug!("Available serial ports: {:?}", ports);

    let found = ports.into_iter().find(|port| match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => [&usb.product, &usb.manufacturer]
            .into_iter()
            .flatten()
            .any(|s| is_trigger_description(s)),
        _ => false,
    });
    match &found {
        Some(port) => info!("Trigger board found at {}", port.port_name),
        None => info!("Trigger board not found"),
    }
    Ok(found.map(|p| p.port_name))
}

/// First serial port that looks like the trigger board.
#[cfg(not(feature = "instrument_serial"))]
pub fn discover_trigger_port() -> AppResult<Option<String>> {
    Err(SnapError::FeatureNotEnabled("instrument_serial".to_string()))
}

fn is_trigger_description(description: &str) -> bool {
    description.contains("Arduino") || description.contains("CP210")
}

// ============================================================================
// VISA light source
// ============================================================================

#[cfg(feature = "instrument_visa")]
mod visa_enabled {
    use super::*;
    use crate::gateway::format_wavelength_command;
    use std::ffi::CString;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use visa_rs::prelude::*;

    fn visa_string(text: &str) -> AppResult<visa_rs::VisaString> {
        let c_string = CString::new(text)
            .map_err(|e| SnapError::Device(format!("invalid VISA string '{text}': {e}")))?;
        Ok(visa_rs::VisaString::from(c_string))
    }

    fn open_session(rm: &DefaultRM, resource: &str, timeout: Duration) -> AppResult<Instrument> {
        rm.open(&visa_string(resource)?, AccessMode::NO_LOCK, timeout)
            .map_err(|e| SnapError::Device(format!("failed to open '{resource}': {e}")))
    }

    /// Tunable light source driven through a VISA session.
    pub struct VisaLightSource {
        resource: String,
        command_template: String,
        session: Arc<Mutex<Instrument>>,
    }

    impl VisaLightSource {
        /// Open a session on `resource`.
        pub fn connect(resource: &str, command_template: &str, timeout: Duration) -> AppResult<Self> {
            let rm = DefaultRM::new()
                .map_err(|e| SnapError::Device(format!("VISA resource manager unavailable: {e}")))?;
            let session = open_session(&rm, resource, timeout)?;
            info!("Connected to light source at {}", resource);
            Ok(Self {
                resource: resource.to_string(),
                command_template: command_template.to_string(),
                session: Arc::new(Mutex::new(session)),
            })
        }

        /// VISA resource string.
        pub fn resource(&self) -> &str {
            &self.resource
        }

        /// Send the formatted wavelength command.
        pub async fn set_wavelength(&self, wavelength: &str) -> AppResult<()> {
            let command = format_wavelength_command(&self.command_template, wavelength);
            let session = self.session.clone();

            // Blocking VISA I/O runs on a dedicated thread
            tokio::task::spawn_blocking(move || -> AppResult<()> {
                let mut session = session.blocking_lock();
                session
                    .write_all(format!("{command}\r\n").as_bytes())
                    .map_err(|e| SnapError::Device(format!("'{command}' failed: {e}")))?;
                info!("Light source command sent: {}", command);
                Ok(())
            })
            .await
            .map_err(|e| SnapError::Device(format!("light source task panicked: {e}")))?
        }
    }

    /// First VISA resource whose `*IDN?` reply contains `identity`.
    ///
    /// Resources that fail to open or answer are skipped.
    pub async fn discover_light_source(identity: &str, timeout: Duration) -> AppResult<Option<String>> {
        let identity = identity.to_string();
        tokio::task::spawn_blocking(move || -> AppResult<Option<String>> {
            let rm = DefaultRM::new()
                .map_err(|e| SnapError::Device(format!("VISA resource manager unavailable: {e}")))?;
            let mut resources = rm
                .find_res_list(&visa_string("?*INSTR")?)
                .map_err(|e| SnapError::Device(format!("failed to list VISA resources: {e}")))?;

            while let Some(resource) = resources
                .find_next()
                .map_err(|e| SnapError::Device(format!("failed to list VISA resources: {e}")))?
            {
                let resource = resource.to_string();
                let Ok(mut session) = open_session(&rm, &resource, timeout) else {
                    continue;
                };
                let mut buf = [0u8; 256];
                let reply = session
                    .write_all(b"*IDN?\r\n")
                    .and_then(|()| session.read(&mut buf));
                match reply {
                    Ok(n) => {
                        let idn = String::from_utf8_lossy(&buf[..n]);
                        tracing::debug!("{} identifies as {}", resource, idn.trim());
                        if idn.contains(identity.as_str()) {
                            info!("Light source found at {}", resource);
                            return Ok(Some(resource));
                        }
                    }
                    Err(e) => tracing::debug!("{} did not answer *IDN?: {}", resource, e),
                }
            }
            info!("Light source not found");
            Ok(None)
        })
        .await
        .map_err(|e| SnapError::Device(format!("discovery task panicked: {e}")))?
    }
}

#[cfg(not(feature = "instrument_visa"))]
mod visa_disabled {
    use super::*;

    /// Tunable light source driven through a VISA session.
    pub struct VisaLightSource;

    impl VisaLightSource {
        /// Open a session on `resource`.
        pub fn connect(_resource: &str, _command_template: &str, _timeout: Duration) -> AppResult<Self> {
            Err(SnapError::FeatureNotEnabled("instrument_visa".to_string()))
        }

        /// VISA resource string.
        pub fn resource(&self) -> &str {
            ""
        }

        /// Send the formatted wavelength command.
        pub async fn set_wavelength(&self, _wavelength: &str) -> AppResult<()> {
            Err(SnapError::FeatureNotEnabled("instrument_visa".to_string()))
        }
    }

    /// First VISA resource whose `*IDN?` reply contains `identity`.
    pub async fn discover_light_source(_identity: &str, _timeout: Duration) -> AppResult<Option<String>> {
        Err(SnapError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

#[cfg(feature = "instrument_visa")]
pub use visa_enabled::{discover_light_source, VisaLightSource};

#[cfg(not(feature = "instrument_visa"))]
pub use visa_disabled::{discover_light_source, VisaLightSource};

// ============================================================================
// Combined gateway
// ============================================================================

/// Physical light source and trigger behind one [`DeviceGateway`].
pub struct HardwareGateway {
    light_source: VisaLightSource,
    trigger: SerialTrigger,
}

impl HardwareGateway {
    /// Combine an open light source and a trigger.
    pub fn new(light_source: VisaLightSource, trigger: SerialTrigger) -> Self {
        Self {
            light_source,
            trigger,
        }
    }

    /// Open the light source and resolve the trigger port from configuration,
    /// falling back to discovery for whichever is unset.
    pub async fn connect(config: &DeviceConfig) -> AppResult<Self> {
        let timeout = Duration::from_millis(config.light_source_timeout_ms);
        let resource = match &config.light_source_resource {
            Some(resource) => resource.clone(),
            None => discover_light_source(&config.light_source_identity, timeout)
                .await?
                .ok_or_else(|| {
                    SnapError::Configuration(format!(
                        "devices.light_source_resource is not set and no VISA resource identifies as '{}'",
                        config.light_source_identity
                    ))
                })?,
        };
        let light_source =
            VisaLightSource::connect(&resource, &config.wavelength_command, timeout)?;

        let port = match &config.trigger_port {
            Some(port) => port.clone(),
            None => discover_trigger_port()?
                .ok_or_else(|| SnapError::Device("trigger board not found".into()))?,
        };
        Ok(Self::new(light_source, SerialTrigger::from_config(port, config)))
    }
}

#[async_trait]
impl DeviceGateway for HardwareGateway {
    async fn set_wavelength(&self, wavelength: &str) -> AppResult<()> {
        self.light_source.set_wavelength(wavelength).await
    }

    async fn trigger(&self) -> AppResult<()> {
        self.trigger.fire().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_description_matching() {
        assert!(is_trigger_description("Arduino Uno"));
        assert!(is_trigger_description("CP2102 USB to UART Bridge Controller"));
        assert!(!is_trigger_description("FTDI FT232R"));
    }

    #[test]
    fn test_serial_trigger_from_config() {
        let config = DeviceConfig {
            trigger_baud_rate: 115_200,
            ..DeviceConfig::default()
        };
        let trigger = SerialTrigger::from_config("/dev/ttyACM0", &config);
        assert_eq!(trigger.port_name(), "/dev/ttyACM0");
        assert_eq!(trigger.baud_rate, 115_200);
        assert_eq!(trigger.token, "trigger\n");
        assert_eq!(trigger.warmup, Duration::from_secs(2));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_connect_without_resource_needs_visa_discovery() {
        let result = HardwareGateway::connect(&DeviceConfig::default()).await;
        assert!(matches!(result, Err(SnapError::FeatureNotEnabled(f)) if f == "instrument_visa"));
        assert!(matches!(
            discover_light_source("CS130B", Duration::from_secs(1)).await,
            Err(SnapError::FeatureNotEnabled(_))
        ));
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_visa_disabled_reports_feature() {
        let result = VisaLightSource::connect("GPIB0::4::INSTR", "gowave {wavelength}", Duration::from_secs(1));
        assert!(matches!(result, Err(SnapError::FeatureNotEnabled(f)) if f == "instrument_visa"));
    }
}

//! Configuration loading using Figment.
//!
//! Settings are layered in this order, later layers overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. An optional TOML file (`laser_snap.toml` unless another path is given)
//! 3. Environment variables prefixed with `LASERSNAP_`, nested with `__`
//!
//! ```text
//! LASERSNAP_APPLICATION__LOG_LEVEL=debug
//! LASERSNAP_ACQUISITION__FILE_TIMEOUT_SECS=90
//! LASERSNAP_DEVICES__TRIGGER_PORT=/dev/ttyACM0
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, SnapError};
use crate::watcher::{TieBreak, WatcherConfig};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "laser_snap.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "LASERSNAP_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Logging.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Run loop timing and artifact filtering.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Light source and trigger.
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Post-run cube processing.
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error), used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Timing and filtering for the acquisition loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Per-step budget for a new raw file to appear
    pub file_timeout_secs: u64,
    /// Fixed wait after a wavelength command before triggering
    pub settling_delay_ms: u64,
    /// Raw folder polling period
    pub poll_interval_ms: u64,
    /// Size must hold still this long before a file is accepted
    pub stability_window_ms: u64,
    /// Extension of raw artifacts written by the camera (without the dot)
    pub artifact_extension: String,
    /// What to do when several new files show up in one poll
    pub tie_break: TieBreak,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            file_timeout_secs: 60,
            settling_delay_ms: 5_000,
            poll_interval_ms: 1_000,
            stability_window_ms: 2_000,
            artifact_extension: "bin".to_string(),
            tie_break: TieBreak::FirstListed,
        }
    }
}

impl AcquisitionConfig {
    /// Per-step file budget.
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs)
    }

    /// Wait between the wavelength command and the trigger.
    pub fn settling_delay(&self) -> Duration {
        Duration::from_millis(self.settling_delay_ms)
    }

    /// Watcher parameters derived from this section.
    pub fn watcher(&self) -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stability_window: Duration::from_millis(self.stability_window_ms),
            extension: self.artifact_extension.clone(),
            tie_break: self.tie_break,
        }
    }
}

/// Light source and trigger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// VISA resource of the tunable light source (e.g. "GPIB0::4::INSTR")
    #[serde(default)]
    pub light_source_resource: Option<String>,
    /// Command template; `{wavelength}` is substituted
    pub wavelength_command: String,
    /// Substring of the `*IDN?` reply used to find the light source when no
    /// resource is configured
    pub light_source_identity: String,
    /// VISA I/O timeout
    pub light_source_timeout_ms: u64,
    /// Serial port of the capture trigger; discovered when unset
    #[serde(default)]
    pub trigger_port: Option<String>,
    /// Trigger port baud rate.
    pub trigger_baud_rate: u32,
    /// Bytes written to fire the camera
    pub trigger_token: String,
    /// Wait after opening the port (board resets on open)
    pub trigger_warmup_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            light_source_resource: None,
            wavelength_command: "gowave {wavelength}".to_string(),
            light_source_identity: "CS130B".to_string(),
            light_source_timeout_ms: 6_000,
            trigger_port: None,
            trigger_baud_rate: 9_600,
            trigger_token: "trigger\n".to_string(),
            trigger_warmup_ms: 2_000,
        }
    }
}

/// Post-run cube processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Band indices used as the red, green and blue preview channels
    pub rgb_bands: [usize; 3],
    /// Directory where the camera software stores one folder per shot
    #[serde(default)]
    pub saved_images_dir: Option<PathBuf>,
    /// ENVI header file name inside each shot folder.
    pub cube_header_name: String,
    /// ENVI raster file name inside each shot folder.
    pub cube_data_name: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            rgb_bands: crate::cube::DEFAULT_RGB_BANDS,
            saved_images_dir: None,
            cube_header_name: "spectral_image_processed_image.hdr".to_string(),
            cube_data_name: "spectral_image_processed_image.bin".to_string(),
        }
    }
}

impl Settings {
    /// Load from the default file (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load with an explicit TOML file. A missing file is not an error.
    pub fn load_from(path: &Path) -> AppResult<Self> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject values that would make the run loop misbehave.
    pub fn validate(&self) -> AppResult<()> {
        let acq = &self.acquisition;
        // Settling delay and trigger warmup are plain waits and may be zero
        let budgets = [
            ("acquisition.file_timeout_secs", acq.file_timeout_secs),
            ("acquisition.poll_interval_ms", acq.poll_interval_ms),
            ("acquisition.stability_window_ms", acq.stability_window_ms),
            ("devices.light_source_timeout_ms", self.devices.light_source_timeout_ms),
        ];
        if let Some((key, _)) = budgets.iter().find(|(_, value)| *value == 0) {
            return Err(SnapError::Configuration(format!(
                "{key} must be greater than zero"
            )));
        }
        if acq.artifact_extension.trim().is_empty() {
            return Err(SnapError::Configuration(
                "acquisition.artifact_extension must not be empty".into(),
            ));
        }
        if !self.devices.wavelength_command.contains("{wavelength}") {
            return Err(SnapError::Configuration(
                "devices.wavelength_command must contain a {wavelength} placeholder".into(),
            ));
        }
        if self.devices.trigger_baud_rate == 0 {
            return Err(SnapError::Configuration(
                "devices.trigger_baud_rate must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_instrument_protocol() {
        let settings = Settings::default();
        assert_eq!(settings.acquisition.file_timeout(), Duration::from_secs(60));
        assert_eq!(settings.acquisition.settling_delay(), Duration::from_secs(5));
        assert_eq!(settings.devices.trigger_token, "trigger\n");
        assert_eq!(settings.processing.rgb_bands, [29, 19, 9]);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laser_snap.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[acquisition]\nfile_timeout_secs = 90\n\n[processing]\nrgb_bands = [3, 2, 1]"
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.acquisition.file_timeout_secs, 90);
        assert_eq!(settings.acquisition.poll_interval_ms, 1_000);
        assert_eq!(settings.processing.rgb_bands, [3, 2, 1]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.acquisition.artifact_extension, "bin");
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut settings = Settings::default();
        settings.acquisition.file_timeout_secs = 0;
        assert!(matches!(
            settings.validate(),
            Err(SnapError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_budgets() {
        let cases: [fn(&mut Settings); 3] = [
            |s| s.acquisition.stability_window_ms = 0,
            |s| s.acquisition.poll_interval_ms = 0,
            |s| s.devices.light_source_timeout_ms = 0,
        ];
        for zero_out in cases {
            let mut settings = Settings::default();
            zero_out(&mut settings);
            assert!(matches!(
                settings.validate(),
                Err(SnapError::Configuration(_))
            ));
        }

        let mut settings = Settings::default();
        settings.acquisition.stability_window_ms = 0;
        match settings.validate() {
            Err(SnapError::Configuration(msg)) => assert!(msg.contains("stability_window_ms")),
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_allows_zero_waits() {
        let mut settings = Settings::default();
        settings.acquisition.settling_delay_ms = 0;
        settings.devices.trigger_warmup_ms = 0;
        assert!(settings.validate().is_ok());
    }
}

//! Configuration system using Figment.
//!
//! Configuration is loaded from (in order of precedence, highest first):
//! 1. Environment variables prefixed with `RUST_SCPI_` (nested keys are
//!    separated by a double underscore)
//! 2. TOML configuration file (default: `config/rust_scpi.toml`)
//! 3. Built-in defaults matching the MCP3561 development board
//!
//! # Example
//!
//! ```no_run
//! use rust_scpi::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load()?;
//!     println!("Link kind: {}", settings.link.kind);
//!     println!("Sampling frequency: {} Hz", settings.adc.sampling_frequency_hz);
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! ```text
//! RUST_SCPI_APPLICATION__LOG_LEVEL=debug
//! RUST_SCPI_LINK__KIND=bus
//! RUST_SCPI_ADC__N_SAMPLES=10000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::codec::{ByteOrder, WordFormat, MAX_BITS};

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/rust_scpi.toml";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "RUST_SCPI_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Physical link type used to reach an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Message-based instrument bus (VISA resource).
    Bus,
    /// Raw serial port.
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Bus => f.write_str("bus"),
            TransportKind::Serial => f.write_str("serial"),
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Link parameters applied when a transport is opened
    pub link: LinkConfig,
    /// Candidate filtering and open retry policy
    pub discovery: DiscoveryConfig,
    /// ADC board acquisition parameters
    pub adc: AdcConfig,
    /// Stepper motor parameters
    pub motor: MotorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_scpi".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Link parameters. Immutable once a transport has been opened with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Bus or serial
    pub kind: TransportKind,
    /// Terminator stripped from replies
    pub read_terminator: String,
    /// Terminator appended to commands
    pub write_terminator: String,
    /// Baud rate (serial only)
    pub baud_rate: u32,
    /// Base read timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            read_terminator: "\r\n".to_string(),
            write_terminator: "\n".to_string(),
            baud_rate: 9600,
            timeout_ms: 50,
        }
    }
}

impl LinkConfig {
    /// Base timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Identity string to match exactly (empty accepts the first resource)
    pub device_name: String,
    /// Substrings selecting serial ports; earlier patterns are probed first
    pub port_patterns: Vec<String>,
    /// Maximum open attempts per candidate
    pub max_open_attempts: u32,
    /// Delay between open attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            device_name: "MCP3561 Dev Board v1".to_string(),
            port_patterns: vec![
                "usbmodem".to_string(),
                "usbserial".to_string(),
                "ttyACM".to_string(),
                "ttyUSB".to_string(),
            ],
            max_open_attempts: 3,
            retry_delay_ms: 100,
        }
    }
}

/// Wire commands of the ADC board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcCommands {
    /// Sample count configuration, sent as `<configure> <n>`
    pub configure: String,
    /// Measurement request, answered by a binary frame
    pub measure: String,
    /// Query for the number of recorded sync pulses
    pub sync_count: String,
    /// Query for the binary sync index frame
    pub sync_data: String,
}

impl Default for AdcCommands {
    fn default() -> Self {
        Self {
            configure: "CONFIGURE".to_string(),
            measure: "MEASURE?".to_string(),
            sync_count: "SYNC:NUMPOINTS?".to_string(),
            sync_data: "SYNC:DATA?".to_string(),
        }
    }
}

/// ADC board acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcConfig {
    /// Fixed sampling frequency of the board in Hz
    pub sampling_frequency_hz: f64,
    /// Samples per measurement
    pub n_samples: usize,
    /// Bytes per sample word
    pub bytes_per_word: usize,
    /// Byte order of sample words
    pub byte_order: ByteOrder,
    /// ADC resolution in bits
    pub bits: u32,
    /// Full-scale reference voltage in volts
    pub full_scale_v: f64,
    /// Calibrated zero-point voltage subtracted from every sample
    pub offset_v: f64,
    /// Safety margin added to the computed measurement time
    pub timeout_margin_ms: u64,
    /// Wire commands
    pub commands: AdcCommands,
}

impl Default for AdcConfig {
    fn default() -> Self {
        Self {
            sampling_frequency_hz: 9765.65,
            n_samples: 1,
            bytes_per_word: 3,
            byte_order: ByteOrder::MsbFirst,
            bits: 24,
            full_scale_v: 3.3,
            offset_v: 3.12512,
            timeout_margin_ms: 100,
            commands: AdcCommands::default(),
        }
    }
}

impl AdcConfig {
    /// Word layout of the sample frames.
    pub fn word_format(&self) -> WordFormat {
        WordFormat {
            width: self.bytes_per_word,
            order: self.byte_order,
        }
    }

    /// Safety margin as a `Duration`.
    pub fn timeout_margin(&self) -> Duration {
        Duration::from_millis(self.timeout_margin_ms)
    }

    /// Time the board needs to record `n_samples` at the sampling frequency.
    ///
    /// Fails when the result is not a representable `Duration` (zero, NaN or
    /// vanishingly small frequencies).
    pub fn measurement_time(&self, n_samples: usize) -> Result<Duration, ConfigError> {
        let seconds = n_samples as f64 / self.sampling_frequency_hz;
        Duration::try_from_secs_f64(seconds).map_err(|_| {
            ConfigError::ValidationError(format!(
                "{} samples at {} Hz is not a representable measurement time",
                n_samples, self.sampling_frequency_hz
            ))
        })
    }

    /// Check the acquisition parameters.
    ///
    /// `bits` is limited to `MAX_BITS` as well as to the word width.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_samples == 0 {
            return Err(ConfigError::ValidationError(
                "adc.n_samples must be >= 1".to_string(),
            ));
        }
        if !(1..=8).contains(&self.bytes_per_word) {
            return Err(ConfigError::ValidationError(format!(
                "adc.bytes_per_word {} out of range 1..=8",
                self.bytes_per_word
            )));
        }
        let max_bits = (8 * self.bytes_per_word).min(MAX_BITS as usize);
        if self.bits == 0 || self.bits as usize > max_bits {
            return Err(ConfigError::ValidationError(format!(
                "adc.bits {} out of range 1..={} for {}-byte words",
                self.bits, max_bits, self.bytes_per_word
            )));
        }
        if !(self.sampling_frequency_hz.is_finite() && self.sampling_frequency_hz > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "adc.sampling_frequency_hz must be positive, got {}",
                self.sampling_frequency_hz
            )));
        }
        if !(self.full_scale_v.is_finite() && self.full_scale_v > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "adc.full_scale_v must be positive, got {}",
                self.full_scale_v
            )));
        }
        self.measurement_time(self.n_samples)?;
        Ok(())
    }
}

/// Stepper motor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Interval between rotation status polls in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for a rotation to finish in milliseconds
    pub max_wait_ms: u64,
    /// Pause after enabling the driver in milliseconds
    pub enable_settle_ms: u64,
    /// Smallest accepted step period
    pub min_period: i64,
    /// Largest accepted step period
    pub max_period: i64,
    /// Microsteps per nanometre of the monochromator drive
    pub microsteps_per_nm: f64,
    /// Quadratic correction applied to large wavelength moves
    pub microsteps_correction: f64,
    /// Wavelength assumed when no settings file exists
    pub initial_wavelength_nm: f64,
    /// JSON file holding the last known wavelength
    pub settings_file: Option<PathBuf>,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_wait_ms: 60_000,
            enable_settle_ms: 10,
            min_period: 1,
            max_period: 1_000_000,
            // calibrated from 800nm - 1700nm, optimized for 5nm steps
            microsteps_per_nm: 30.3716 * 1.011,
            microsteps_correction: -6.17e-6,
            initial_wavelength_nm: 850.0,
            settings_file: Some(PathBuf::from("device_settings.txt")),
        }
    }
}

impl MotorConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum wait as a `Duration`.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Settle time after enabling as a `Duration`.
    pub fn enable_settle(&self) -> Duration {
        Duration::from_millis(self.enable_settle_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from `config/rust_scpi.toml` and environment variables.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path, then validate them.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Self::figment(path.as_ref())
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.link.read_terminator.is_empty() || self.link.write_terminator.is_empty() {
            return Err(ConfigError::ValidationError(
                "Link terminators cannot be empty".to_string(),
            ));
        }
        if self.link.kind == TransportKind::Serial && self.link.baud_rate == 0 {
            return Err(ConfigError::ValidationError(
                "Serial baud_rate must be > 0".to_string(),
            ));
        }

        if self.discovery.max_open_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "discovery.max_open_attempts must be >= 1".to_string(),
            ));
        }

        self.adc.validate()?;

        let motor = &self.motor;
        if motor.min_period > motor.max_period {
            return Err(ConfigError::ValidationError(format!(
                "motor.min_period {} exceeds motor.max_period {}",
                motor.min_period, motor.max_period
            )));
        }
        if motor.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "motor.poll_interval_ms must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

//! Stepper motor on the ADC board, and monochromator wavelength tracking.
//!
//! The motor shares the board's serial link, so a [`Motor`] is a short-lived
//! view borrowing the board's transport. Rotation is blocking: `rotate`
//! returns once the board reports the motor stopped, or fails after the
//! configured maximum wait.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MotorConfig;
use crate::error::{AppResult, DaqError, TransportError};
use crate::limits::{clamp_to_limits, LimitWarning};
use crate::transport::Transport;

/// Rotation direction as encoded by the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `0`
    Clockwise,
    /// `1`
    Counterclockwise,
}

impl Direction {
    /// Direction that moves by `n_steps`: negative counts turn
    /// counterclockwise.
    pub fn for_steps(n_steps: i64) -> Self {
        if n_steps < 0 {
            Direction::Counterclockwise
        } else {
            Direction::Clockwise
        }
    }

    fn code(self) -> u8 {
        match self {
            Direction::Clockwise => 0,
            Direction::Counterclockwise => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Clockwise => f.write_str("clockwise"),
            Direction::Counterclockwise => f.write_str("counterclockwise"),
        }
    }
}

/// Stepper motor commands over the board's transport.
pub struct Motor<'a> {
    transport: &'a mut Transport,
    config: &'a MotorConfig,
}

impl<'a> Motor<'a> {
    /// Motor view over `transport`.
    pub fn new(transport: &'a mut Transport, config: &'a MotorConfig) -> Self {
        Self { transport, config }
    }

    fn query_flag(&mut self, command: &str) -> Result<bool, TransportError> {
        let value: u8 = self.transport.query_parse(command)?;
        Ok(value != 0)
    }

    /// Step counter of the board.
    pub fn position(&mut self) -> Result<i64, TransportError> {
        self.transport.query_parse("MOTOR:POSITION?")
    }

    /// Overwrite the step counter without moving.
    pub fn set_position(&mut self, position: i64) -> Result<(), TransportError> {
        self.transport
            .write_line(&format!("MOTOR:POSITION {}", position))
    }

    /// Current rotation direction.
    pub fn direction(&mut self) -> Result<Direction, TransportError> {
        let response = self.transport.query("MOTOR:DIRECTION?")?;
        match response.trim() {
            "0" => Ok(Direction::Clockwise),
            "1" => Ok(Direction::Counterclockwise),
            _ => Err(TransportError::InvalidResponse {
                command: "MOTOR:DIRECTION?".to_string(),
                response,
            }),
        }
    }

    /// Set the rotation direction.
    pub fn set_direction(&mut self, direction: Direction) -> Result<(), TransportError> {
        self.transport
            .write_line(&format!("MOTOR:DIRECTION {}", direction.code()))
    }

    /// True while a rotation is in progress.
    pub fn is_rotating(&mut self) -> Result<bool, TransportError> {
        self.query_flag("MOTOR:ROTATE?")
    }

    /// True when the driver is energized.
    pub fn is_enabled(&mut self) -> Result<bool, TransportError> {
        self.query_flag("MOTOR:ENABLED?")
    }

    /// Energize or release the driver.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<(), TransportError> {
        let command = if enabled { "MOTOR:ENABLE" } else { "MOTOR:DISABLE" };
        self.transport.write_line(command)
    }

    /// Step period.
    pub fn period(&mut self) -> Result<i64, TransportError> {
        self.transport.query_parse("MOTOR:PERIOD?")
    }

    /// Set the step period, clamped to the configured bounds.
    ///
    /// Returns the compliance warning when the value had to be clamped.
    pub fn set_period(&mut self, period: i64) -> Result<Option<LimitWarning>, TransportError> {
        let (applied, warning) = clamp_to_limits(
            "motor period",
            period,
            self.config.min_period,
            self.config.max_period,
        );
        self.transport
            .write_line(&format!("MOTOR:PERIOD {}", applied))?;
        Ok(warning)
    }

    /// Rotate by `n_steps` (negative is counterclockwise) and block until the
    /// motor stops.
    pub fn rotate(&mut self, n_steps: i64) -> AppResult<()> {
        if !self.is_enabled()? {
            self.set_enabled(true)?;
            sleep(self.config.enable_settle());
        }
        let direction = Direction::for_steps(n_steps);
        self.set_direction(direction)?;
        self.transport
            .write_line(&format!("MOTOR:ROTATE {}", n_steps))?;
        debug!(n_steps, %direction, "Rotation started");
        self.wait_until_stopped()
    }

    /// Poll until the motor reports it is no longer rotating.
    ///
    /// # Errors
    /// `MotorTimeout` once `max_wait` has elapsed with the motor still
    /// turning.
    pub fn wait_until_stopped(&mut self) -> AppResult<()> {
        let poll = self.config.poll_interval();
        let max_wait = self.config.max_wait();
        let start = Instant::now();
        loop {
            sleep(poll);
            if !self.is_rotating()? {
                return Ok(());
            }
            if start.elapsed() >= max_wait {
                return Err(DaqError::MotorTimeout(max_wait));
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WavelengthSettings {
    wavelength: f64,
}

/// Tracks the wavelength selected by a motor-driven monochromator.
///
/// The board only knows step counts; the wavelength is dead-reckoned from
/// the moves made and persisted to a small JSON file between sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Monochromator {
    wavelength_nm: f64,
    microsteps_per_nm: f64,
    microsteps_correction: f64,
    settings_file: Option<PathBuf>,
}

impl Monochromator {
    /// Restore the last wavelength from the settings file, or fall back to
    /// `initial_wavelength_nm` when there is none.
    pub fn load(config: &MotorConfig) -> AppResult<Self> {
        let wavelength_nm = match &config.settings_file {
            Some(path) if path.is_file() => read_settings(path)?.wavelength,
            _ => config.initial_wavelength_nm,
        };
        debug!(wavelength_nm, "Monochromator wavelength restored");
        Ok(Self {
            wavelength_nm,
            microsteps_per_nm: config.microsteps_per_nm,
            microsteps_correction: config.microsteps_correction,
            settings_file: config.settings_file.clone(),
        })
    }

    /// Current wavelength in nanometres.
    pub fn wavelength(&self) -> f64 {
        self.wavelength_nm
    }

    /// Microsteps needed to move from the current wavelength to `target_nm`.
    pub fn steps_to(&self, target_nm: f64) -> i64 {
        let delta = target_nm - self.wavelength_nm;
        (delta * self.microsteps_per_nm * (1.0 + self.microsteps_correction * delta)).trunc() as i64
    }

    /// Drive `motor` to `target_nm` and record the new wavelength.
    ///
    /// Returns the number of microsteps rotated.
    pub fn set_wavelength(&mut self, motor: &mut Motor<'_>, target_nm: f64) -> AppResult<i64> {
        let steps = self.steps_to(target_nm);
        motor.rotate(steps)?;
        info!(
            from_nm = self.wavelength_nm,
            to_nm = target_nm,
            steps,
            "Wavelength changed"
        );
        self.wavelength_nm = target_nm;
        self.save()?;
        Ok(steps)
    }

    /// Write the current wavelength to the settings file, if one is
    /// configured.
    pub fn save(&self) -> AppResult<()> {
        let Some(path) = &self.settings_file else {
            return Ok(());
        };
        let json = serde_json::to_string(&WavelengthSettings {
            wavelength: self.wavelength_nm,
        })
        .map_err(|e| DaqError::Settings(e.to_string()))?;
        fs::write(path, json)
            .map_err(|e| DaqError::Settings(format!("{}: {}", path.display(), e)))
    }
}

fn read_settings(path: &Path) -> AppResult<WavelengthSettings> {
    let text = fs::read_to_string(path)
        .map_err(|e| DaqError::Settings(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&text)
        .map_err(|e| DaqError::Settings(format!("{}: {}", path.display(), e)))
}

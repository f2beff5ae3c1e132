// src/config.rs - Machine calibration and server configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::time::Duration;

use crate::hardware::Line;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub machine: MachineConfig,

    #[serde(default)]
    pub debounce: DebounceConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Machine geometry and calibration constants.
///
/// These are empirically tuned values for the reference machine. They
/// are carried as configuration and never derived at runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    /// Number of needles on the bed.
    #[serde(default = "default_needle_count")]
    pub needle_count: u32,

    /// Number of physical solenoids addressed by the shift register.
    #[serde(default = "default_solenoid_count")]
    pub solenoid_count: u32,

    /// Solenoid index shift applied while the belt phase signal is set.
    #[serde(default = "default_belt_phase_offset")]
    pub belt_phase_offset: u32,

    /// Distance in needles between the carriage magnets and the start
    /// of the actuation window.
    #[serde(default = "default_active_window_offset")]
    pub active_window_offset: i32,

    /// Width of the actuation window in needles.
    #[serde(default = "default_active_window_size")]
    pub active_window_size: i32,

    /// Raw pulse count latched when the left reference sensor fires.
    /// Multiple of 4 so needle-granularity positions center exactly.
    #[serde(default = "default_left_stop_pulses")]
    pub left_stop_pulses: i32,

    /// Raw pulse count latched when the right reference sensor fires.
    #[serde(default = "default_right_stop_pulses")]
    pub right_stop_pulses: i32,

    /// How far past the pattern edge the carriage must travel before a
    /// row is considered finished, in needles.
    #[serde(default = "default_row_advance_margin")]
    pub row_advance_margin: i32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            needle_count: default_needle_count(),
            solenoid_count: default_solenoid_count(),
            belt_phase_offset: default_belt_phase_offset(),
            active_window_offset: default_active_window_offset(),
            active_window_size: default_active_window_size(),
            left_stop_pulses: default_left_stop_pulses(),
            right_stop_pulses: default_right_stop_pulses(),
            row_advance_margin: default_row_advance_margin(),
        }
    }
}

/// Per-line debounce windows in milliseconds. Zero means the line is
/// trusted immediately (its bounce amplitude is below the sampling
/// resolution).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DebounceConfig {
    #[serde(default)]
    pub encoder_v1_ms: u64,
    #[serde(default)]
    pub encoder_v2_ms: u64,
    #[serde(default = "default_hall_debounce_ms")]
    pub left_hall_ms: u64,
    #[serde(default = "default_hall_debounce_ms")]
    pub right_hall_ms: u64,
    #[serde(default)]
    pub belt_phase_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            encoder_v1_ms: 0,
            encoder_v2_ms: 0,
            left_hall_ms: default_hall_debounce_ms(),
            right_hall_ms: default_hall_debounce_ms(),
            belt_phase_ms: 0,
        }
    }
}

impl DebounceConfig {
    pub fn window_for(&self, line: Line) -> Duration {
        let ms = match line {
            Line::EncoderV1 => self.encoder_v1_ms,
            Line::EncoderV2 => self.encoder_v2_ms,
            Line::LeftHall => self.left_hall_ms,
            Line::RightHall => self.right_hall_ms,
            Line::BeltPhase => self.belt_phase_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Largest binary payload a client may send with `setpattern`.
    #[serde(default = "default_max_bindata_bytes")]
    pub max_bindata_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_bindata_bytes: default_max_bindata_bytes(),
        }
    }
}

impl Config {
    /// Loads a TOML config file. No path yields the built-in machine
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.machine.needle_count == 0 {
            return Err(ConfigError::Invalid("needle_count must be nonzero".into()));
        }
        if self.machine.active_window_size < 1 {
            return Err(ConfigError::Invalid(
                "active_window_size must be at least 1".into(),
            ));
        }
        if self.machine.left_stop_pulses % 4 != 0 || self.machine.right_stop_pulses % 4 != 0 {
            return Err(ConfigError::Invalid(
                "stop pulse constants must be multiples of 4".into(),
            ));
        }
        Ok(())
    }
}

fn default_needle_count() -> u32 {
    200
}

fn default_solenoid_count() -> u32 {
    16
}

fn default_belt_phase_offset() -> u32 {
    8
}

fn default_active_window_offset() -> i32 {
    12
}

fn default_active_window_size() -> i32 {
    12
}

fn default_left_stop_pulses() -> i32 {
    0
}

fn default_right_stop_pulses() -> i32 {
    792
}

fn default_row_advance_margin() -> i32 {
    32
}

fn default_hall_debounce_ms() -> u64 {
    5
}

fn default_max_bindata_bytes() -> usize {
    1024 * 1024
}

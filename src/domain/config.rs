use crate::domain::error::{RigError, RigResult};
use serde::{Deserialize, Serialize};

/// Hardware ranges from the controller manuals. These are bit-exact contracts
/// with the firmware and are enforced before any byte goes out on the wire.
pub mod limits {
    /// Absolute/relative position range of the stepper controller (steps).
    pub const POSITION_MIN: u32 = 1;
    pub const POSITION_MAX: u32 = 16_777_215;
    /// Steps per full turn of the rotation axis.
    pub const ROTATION_STEPS: u32 = 2000;
    pub const ACCEL_MAX: u8 = 127;
    pub const BASE_SPEED_MIN: u32 = 50;
    pub const BASE_SPEED_MAX: u32 = 5000;
    pub const MAX_VELOCITY_MIN: u32 = 50;
    pub const MAX_VELOCITY_MAX: u32 = 20_000;
    pub const HOLD_TIME_MAX: u8 = 127;
    pub const CRYSTAL_FREQ_MIN: u32 = 8000;
    pub const CRYSTAL_FREQ_MAX: u32 = 4_000_000;
    /// Degausser coil amplitude range.
    pub const AMPLITUDE_MAX: u16 = 3000;
    /// Legal degausser ramp rate classes.
    pub const RAMP_RATES: [u8; 4] = [3, 5, 7, 9];
    pub const DELAY_MIN: u8 = 1;
    pub const DELAY_MAX: u8 = 9;
}

/// Top-level rig configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,
    /// Sample handler (stepper controller)
    pub handler: HandlerConfig,
    /// AF demagnetizer
    pub degausser: DegausserConfig,
    /// SQUID magnetometer
    pub magnetometer: MagnetometerConfig,
}

/// Global settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Default log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Deadline for a single command/response exchange in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Deadline for a full handler move in milliseconds
    #[serde(default = "default_move_timeout")]
    pub move_timeout_ms: u64,
}

/// Serial endpoint parameters. Immutable once the port is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialEndpoint {
    pub port: String,
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: ParityConfig,
    #[serde(default = "default_flow_control")]
    pub flow_control: FlowControlConfig,
}

/// Parity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    Odd,
    Even,
}

/// Flow control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlConfig {
    None,
    Hardware,
    Software,
}

/// Sample-handler motion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub endpoint: SerialEndpoint,
    /// Acceleration, 0-127
    #[serde(default = "default_accel")]
    pub accel: u8,
    /// Deceleration, 0-127
    #[serde(default = "default_accel")]
    pub decel: u8,
    /// Base speed in pulses/s, 50-5000
    #[serde(default = "default_base_speed")]
    pub base_speed: u32,
    /// Maximum velocity in pulses/s, 50-20000
    #[serde(default = "default_max_velocity")]
    pub max_velocity: u32,
    /// Hold time in ticks, 0-127 (0 = never release)
    #[serde(default)]
    pub hold_time: u8,
    /// Crystal frequency in Hz, 8000-4000000
    #[serde(default = "default_crystal_freq")]
    pub crystal_freq: u32,
    /// Named sample positions in steps
    #[serde(default)]
    pub positions: PositionsConfig,
}

/// Named handler positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsConfig {
    #[serde(default = "default_home_position")]
    pub home: u32,
    #[serde(default = "default_background_position")]
    pub background: u32,
    #[serde(default = "default_measurement_position")]
    pub measurement: u32,
}

/// Demagnetizer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegausserConfig {
    pub endpoint: SerialEndpoint,
    /// Ramp rate class, one of 3/5/7/9
    #[serde(default = "default_ramp")]
    pub ramp: u8,
    /// Hold time at peak field in seconds, 1-9
    #[serde(default = "default_delay")]
    pub delay_s: u8,
    /// Maximum allowed amplitude, capped at 3000
    #[serde(default = "default_max_field")]
    pub max_field: u16,
    /// Deadline for one ramp phase in milliseconds
    #[serde(default = "default_ramp_timeout")]
    pub ramp_timeout_ms: u64,
}

/// Magnetometer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnetometerConfig {
    pub endpoint: SerialEndpoint,
    /// Per-axis calibration constants applied to raw flux readings
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// Analog output scaling: volts per flux quantum
    #[serde(default = "default_volts_per_flux_quantum")]
    pub volts_per_flux_quantum: f64,
}

/// Per-axis calibration constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration")]
    pub x: f64,
    #[serde(default = "default_calibration")]
    pub y: f64,
    #[serde(default = "default_calibration")]
    pub z: f64,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_command_timeout() -> u64 {
    2000
}

fn default_move_timeout() -> u64 {
    120_000
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> ParityConfig {
    ParityConfig::None
}

fn default_flow_control() -> FlowControlConfig {
    FlowControlConfig::None
}

fn default_accel() -> u8 {
    20
}

fn default_base_speed() -> u32 {
    1000
}

fn default_max_velocity() -> u32 {
    8000
}

fn default_crystal_freq() -> u32 {
    1_000_000
}

fn default_home_position() -> u32 {
    1
}

fn default_background_position() -> u32 {
    2000
}

fn default_measurement_position() -> u32 {
    4000
}

fn default_ramp() -> u8 {
    5
}

fn default_delay() -> u8 {
    2
}

fn default_max_field() -> u16 {
    3000
}

fn default_ramp_timeout() -> u64 {
    30_000
}

fn default_volts_per_flux_quantum() -> f64 {
    2.0
}

fn default_calibration() -> f64 {
    1.0
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            command_timeout_ms: default_command_timeout(),
            move_timeout_ms: default_move_timeout(),
        }
    }
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            home: default_home_position(),
            background: default_background_position(),
            measurement: default_measurement_position(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            x: default_calibration(),
            y: default_calibration(),
            z: default_calibration(),
        }
    }
}

impl SerialEndpoint {
    pub fn validate(&self) -> RigResult<()> {
        if !matches!(self.data_bits, 5..=8) {
            return Err(RigError::InvalidParameter {
                message: format!("data bits {} outside 5-8", self.data_bits),
            });
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(RigError::InvalidParameter {
                message: format!("stop bits {} outside 1-2", self.stop_bits),
            });
        }
        Ok(())
    }
}

impl HandlerConfig {
    pub fn validate(&self) -> RigResult<()> {
        self.endpoint.validate()?;
        if self.accel > limits::ACCEL_MAX || self.decel > limits::ACCEL_MAX {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "accel/decel {}/{} outside 0-{}",
                    self.accel,
                    self.decel,
                    limits::ACCEL_MAX
                ),
            });
        }
        if !(limits::BASE_SPEED_MIN..=limits::BASE_SPEED_MAX).contains(&self.base_speed) {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "base speed {} outside {}-{}",
                    self.base_speed,
                    limits::BASE_SPEED_MIN,
                    limits::BASE_SPEED_MAX
                ),
            });
        }
        if !(limits::MAX_VELOCITY_MIN..=limits::MAX_VELOCITY_MAX).contains(&self.max_velocity) {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "max velocity {} outside {}-{}",
                    self.max_velocity,
                    limits::MAX_VELOCITY_MIN,
                    limits::MAX_VELOCITY_MAX
                ),
            });
        }
        if self.hold_time > limits::HOLD_TIME_MAX {
            return Err(RigError::InvalidParameter {
                message: format!("hold time {} outside 0-{}", self.hold_time, limits::HOLD_TIME_MAX),
            });
        }
        if !(limits::CRYSTAL_FREQ_MIN..=limits::CRYSTAL_FREQ_MAX).contains(&self.crystal_freq) {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "crystal frequency {} outside {}-{}",
                    self.crystal_freq,
                    limits::CRYSTAL_FREQ_MIN,
                    limits::CRYSTAL_FREQ_MAX
                ),
            });
        }
        for pos in [
            self.positions.home,
            self.positions.background,
            self.positions.measurement,
        ] {
            if !(limits::POSITION_MIN..=limits::POSITION_MAX).contains(&pos) {
                return Err(RigError::InvalidParameter {
                    message: format!(
                        "position {} outside {}-{}",
                        pos,
                        limits::POSITION_MIN,
                        limits::POSITION_MAX
                    ),
                });
            }
        }
        Ok(())
    }
}

impl DegausserConfig {
    pub fn validate(&self) -> RigResult<()> {
        self.endpoint.validate()?;
        if !limits::RAMP_RATES.contains(&self.ramp) {
            return Err(RigError::InvalidParameter {
                message: format!("ramp rate {} not one of {:?}", self.ramp, limits::RAMP_RATES),
            });
        }
        if !(limits::DELAY_MIN..=limits::DELAY_MAX).contains(&self.delay_s) {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "delay {} outside {}-{}",
                    self.delay_s,
                    limits::DELAY_MIN,
                    limits::DELAY_MAX
                ),
            });
        }
        if self.max_field > limits::AMPLITUDE_MAX {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "max field {} outside 0-{}",
                    self.max_field,
                    limits::AMPLITUDE_MAX
                ),
            });
        }
        Ok(())
    }
}

impl MagnetometerConfig {
    pub fn validate(&self) -> RigResult<()> {
        self.endpoint.validate()?;
        if self.volts_per_flux_quantum <= 0.0 {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "volts per flux quantum {} must be positive",
                    self.volts_per_flux_quantum
                ),
            });
        }
        Ok(())
    }
}

impl RigConfig {
    pub fn validate(&self) -> RigResult<()> {
        self.handler.validate()?;
        self.degausser.validate()?;
        self.magnetometer.validate()?;
        Ok(())
    }

    /// Default layout for a freshly initialized config file. Port names are
    /// placeholders the operator edits for the local machine.
    pub fn example() -> Self {
        Self {
            global: GlobalConfig::default(),
            handler: HandlerConfig {
                endpoint: SerialEndpoint {
                    port: "/dev/ttyS0".to_string(),
                    baud_rate: 1200,
                    data_bits: default_data_bits(),
                    stop_bits: default_stop_bits(),
                    parity: default_parity(),
                    flow_control: default_flow_control(),
                },
                accel: default_accel(),
                decel: default_accel(),
                base_speed: default_base_speed(),
                max_velocity: default_max_velocity(),
                hold_time: 0,
                crystal_freq: default_crystal_freq(),
                positions: PositionsConfig::default(),
            },
            degausser: DegausserConfig {
                endpoint: SerialEndpoint {
                    port: "/dev/ttyS1".to_string(),
                    baud_rate: 1200,
                    data_bits: default_data_bits(),
                    stop_bits: default_stop_bits(),
                    parity: default_parity(),
                    flow_control: default_flow_control(),
                },
                ramp: default_ramp(),
                delay_s: default_delay(),
                max_field: default_max_field(),
                ramp_timeout_ms: default_ramp_timeout(),
            },
            magnetometer: MagnetometerConfig {
                endpoint: SerialEndpoint {
                    port: "/dev/ttyS2".to_string(),
                    baud_rate: 1200,
                    data_bits: default_data_bits(),
                    stop_bits: default_stop_bits(),
                    parity: default_parity(),
                    flow_control: default_flow_control(),
                },
                calibration: CalibrationConfig::default(),
                volts_per_flux_quantum: default_volts_per_flux_quantum(),
            },
        }
    }
}

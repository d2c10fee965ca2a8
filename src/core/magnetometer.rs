//! SQUID magnetometer flux readout.
//!
//! Every command is prefixed with an axis letter (`X`, `Y`, `Z`, or `A` for
//! all axes): `{a}RS` pulse-resets the feedback loop, `{a}RC` clears the
//! flux counter, `{a}C{F|R|S|L}{opt}` configures filter/range/slew/loop,
//! `{a}LA`/`{a}LC` latch the analog and counter outputs, and `{a}DD`,
//! `{a}DC`, `{a}DS` read back the analog value, the counter and the
//! configuration status (`F{1-4}R{1-4}S{E|D}L{O|C}`).

use crate::core::protocol::{Frame, ProtocolClient, Transport, UnmatchedPolicy};
use crate::domain::config::MagnetometerConfig;
use crate::domain::error::{RigError, RigResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info};

/// Magnetometer axis selector; `All` addresses every axis at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
    All,
}

impl Axis {
    /// The three physical axes in readout order.
    pub const XYZ: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::All => 'A',
        }
    }

    fn expand(self) -> &'static [Axis] {
        match self {
            Axis::All => &Self::XYZ,
            Axis::X => &[Axis::X],
            Axis::Y => &[Axis::Y],
            Axis::Z => &[Axis::Z],
        }
    }
}

/// Configure subcommand selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureSub {
    Filter,
    Range,
    Slew,
    Loop,
}

impl ConfigureSub {
    pub fn letter(self) -> char {
        match self {
            ConfigureSub::Filter => 'F',
            ConfigureSub::Range => 'R',
            ConfigureSub::Slew => 'S',
            ConfigureSub::Loop => 'L',
        }
    }
}

/// Parsed per-axis configuration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisStatus {
    /// Analog filter setting, 1-4
    pub filter: u8,
    /// Range setting, 1-4
    pub range: u8,
    /// Slew limiter enabled
    pub slew_enabled: bool,
    /// Feedback loop closed
    pub loop_closed: bool,
}

impl AxisStatus {
    /// Parse `F{1-4}R{1-4}S{E|D}L{O|C}`.
    fn parse(text: &str) -> Option<Self> {
        let bytes = text.trim().as_bytes();
        if bytes.len() != 8 || bytes[0] != b'F' || bytes[2] != b'R' || bytes[4] != b'S' || bytes[6] != b'L' {
            return None;
        }
        let digit = |b: u8| -> Option<u8> {
            let v = b.checked_sub(b'0')?;
            (1..=4).contains(&v).then_some(v)
        };
        let filter = digit(bytes[1])?;
        let range = digit(bytes[3])?;
        let slew_enabled = match bytes[5] {
            b'E' => true,
            b'D' => false,
            _ => return None,
        };
        let loop_closed = match bytes[7] {
            b'C' => true,
            b'O' => false,
            _ => return None,
        };
        Some(Self {
            filter,
            range,
            slew_enabled,
            loop_closed,
        })
    }
}

/// One calibrated flux reading, in moment units after per-axis calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluxReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

pub struct MagnetometerClient {
    proto: ProtocolClient,
    config: Mutex<MagnetometerConfig>,
    last_status: Mutex<[Option<AxisStatus>; 3]>,
    /// Held across a whole multi-axis command burst; two concurrent readouts
    /// would interleave their reset/latch sequences.
    op: AsyncMutex<()>,
    command_timeout: Duration,
}

impl MagnetometerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        frames: mpsc::UnboundedReceiver<Frame>,
        config: MagnetometerConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            proto: ProtocolClient::new("magnetometer", transport, frames),
            config: Mutex::new(config),
            last_status: Mutex::new([None; 3]),
            op: AsyncMutex::new(()),
            command_timeout,
        }
    }

    /// Replace calibration constants and analog scaling. No wire traffic;
    /// the next `read_data` uses the new values.
    pub fn apply_settings(&self, config: &MagnetometerConfig) -> RigResult<()> {
        config.validate()?;
        *self.lock_config() = config.clone();
        info!(
            cal_x = config.calibration.x,
            cal_y = config.calibration.y,
            cal_z = config.calibration.z,
            "magnetometer calibration updated"
        );
        Ok(())
    }

    /// Pulse-reset the feedback loop on `axis`.
    pub async fn reset_loop(&self, axis: Axis) -> RigResult<()> {
        let _op = self.op.lock().await;
        self.send_per_axis(axis, "RS").await
    }

    /// Clear the flux counter on `axis`.
    pub async fn reset_counter(&self, axis: Axis) -> RigResult<()> {
        let _op = self.op.lock().await;
        self.send_per_axis(axis, "RC").await
    }

    /// Set one configuration option on `axis`.
    pub async fn configure(&self, axis: Axis, sub: ConfigureSub, option: char) -> RigResult<()> {
        if !option.is_ascii_alphanumeric() {
            return Err(RigError::InvalidParameter {
                message: format!("configure option '{}' is not alphanumeric ASCII", option),
            });
        }
        let _op = self.op.lock().await;
        self.send_per_axis(axis, &format!("C{}{}", sub.letter(), option))
            .await
    }

    pub async fn latch_analog(&self, axis: Axis) -> RigResult<()> {
        let _op = self.op.lock().await;
        self.send_per_axis(axis, "LA").await
    }

    pub async fn latch_counter(&self, axis: Axis) -> RigResult<()> {
        let _op = self.op.lock().await;
        self.send_per_axis(axis, "LC").await
    }

    /// Pulse-reset and close the feedback loop on each addressed axis.
    pub async fn open_loop(&self, axis: Axis) -> RigResult<()> {
        let _op = self.op.lock().await;
        self.open_loop_burst(axis).await
    }

    /// Zero the flux counters on each addressed axis.
    pub async fn clear_flux(&self, axis: Axis) -> RigResult<()> {
        self.reset_counter(axis).await
    }

    /// Read the latched counter value for one axis.
    pub async fn read_counter(&self, axis: Axis) -> RigResult<i64> {
        let command = format!("{}DC", axis.letter());
        let frame = self
            .proto
            .query(
                &command,
                |r| r.trim().parse::<i64>().is_ok(),
                self.command_timeout,
                UnmatchedPolicy::Discard,
            )
            .await?;
        frame.text.trim().parse().map_err(|_| RigError::Protocol {
            message: format!("unparseable counter value '{}'", frame.text),
        })
    }

    /// Read the latched analog value (volts) for one axis.
    pub async fn read_analog(&self, axis: Axis) -> RigResult<f64> {
        let command = format!("{}DD", axis.letter());
        let frame = self
            .proto
            .query(
                &command,
                |r| r.trim().parse::<f64>().is_ok(),
                self.command_timeout,
                UnmatchedPolicy::Discard,
            )
            .await?;
        frame.text.trim().parse().map_err(|_| RigError::Protocol {
            message: format!("unparseable analog value '{}'", frame.text),
        })
    }

    /// One full flux measurement: open loops, clear counters, latch both
    /// outputs on every axis, then read back and calibrate. The whole
    /// sequence runs every time; latched values from a previous reading are
    /// never reused.
    pub async fn read_data(&self) -> RigResult<FluxReading> {
        let _op = self.op.lock().await;
        self.open_loop_burst(Axis::All).await?;
        self.send_per_axis(Axis::All, "RC").await?;
        for axis in Axis::XYZ {
            self.send_per_axis(axis, "LA").await?;
            self.send_per_axis(axis, "LC").await?;
        }

        let (cal, volts_per_quantum) = {
            let config = self.lock_config();
            (
                [config.calibration.x, config.calibration.y, config.calibration.z],
                config.volts_per_flux_quantum,
            )
        };

        let mut values = [0.0f64; 3];
        for (i, axis) in Axis::XYZ.into_iter().enumerate() {
            let counter = self.read_counter(axis).await?;
            let analog = self.read_analog(axis).await?;
            // Whole flux quanta from the counter plus the fractional quantum
            // from the analog output, scaled by the axis calibration.
            values[i] = (counter as f64 + analog / volts_per_quantum) * cal[i];
            debug!(axis = %axis.letter(), counter, analog, value = values[i], "axis read");
        }

        Ok(FluxReading {
            x: values[0],
            y: values[1],
            z: values[2],
        })
    }

    /// Query the configuration status of one physical axis.
    pub async fn axis_status(&self, axis: Axis) -> RigResult<AxisStatus> {
        if axis == Axis::All {
            return Err(RigError::InvalidParameter {
                message: "status query needs a single axis".to_string(),
            });
        }
        let command = format!("{}DS", axis.letter());
        let frame = self
            .proto
            .query(
                &command,
                |r| AxisStatus::parse(r).is_some(),
                self.command_timeout,
                UnmatchedPolicy::Discard,
            )
            .await?;
        let status = AxisStatus::parse(&frame.text).ok_or_else(|| RigError::Protocol {
            message: format!("unparseable axis status '{}'", frame.text),
        })?;
        if let Some(slot) = Axis::XYZ.iter().position(|a| *a == axis) {
            self.lock_status()[slot] = Some(status);
        }
        Ok(status)
    }

    /// Filter settings ordered (x, y, z).
    pub async fn get_filters(&self) -> RigResult<[u8; 3]> {
        let statuses = self.all_statuses().await?;
        Ok(statuses.map(|s| s.filter))
    }

    /// Range settings ordered (x, y, z).
    pub async fn get_range(&self) -> RigResult<[u8; 3]> {
        let statuses = self.all_statuses().await?;
        Ok(statuses.map(|s| s.range))
    }

    /// Slew-limiter flags ordered (x, y, z).
    pub async fn get_slew(&self) -> RigResult<[bool; 3]> {
        let statuses = self.all_statuses().await?;
        Ok(statuses.map(|s| s.slew_enabled))
    }

    /// Loop-closed flags ordered (x, y, z).
    pub async fn get_loop(&self) -> RigResult<[bool; 3]> {
        let statuses = self.all_statuses().await?;
        Ok(statuses.map(|s| s.loop_closed))
    }

    pub async fn is_ok(&self) -> bool {
        self.proto.is_connected() && self.axis_status(Axis::X).await.is_ok()
    }

    async fn send_per_axis(&self, axis: Axis, suffix: &str) -> RigResult<()> {
        for a in axis.expand() {
            self.proto.send(&format!("{}{}", a.letter(), suffix)).await?;
        }
        Ok(())
    }

    async fn open_loop_burst(&self, axis: Axis) -> RigResult<()> {
        for a in axis.expand() {
            self.proto.send(&format!("{}RS", a.letter())).await?;
            self.proto
                .send(&format!("{}C{}C", a.letter(), ConfigureSub::Loop.letter()))
                .await?;
        }
        Ok(())
    }

    async fn all_statuses(&self) -> RigResult<[AxisStatus; 3]> {
        let mut out = [AxisStatus {
            filter: 0,
            range: 0,
            slew_enabled: false,
            loop_closed: false,
        }; 3];
        for (i, axis) in Axis::XYZ.into_iter().enumerate() {
            out[i] = self.axis_status(axis).await?;
        }
        Ok(out)
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, MagnetometerConfig> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, [Option<AxisStatus>; 3]> {
        self.last_status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

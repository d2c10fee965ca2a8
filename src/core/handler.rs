//! Sample-handler stepper-motor controller.
//!
//! Wire vocabulary (ASCII, single letter + numeric argument): `@0` go online,
//! `A`/`D` accel/decel, `B` base speed, `M` max velocity, `CH` hold time,
//! `CX` crystal frequency, `+`/`-` direction, `N` relative steps, `P`
//! absolute position, `G` start move, `F` report when idle, `V` register
//! read, `Z` set the absolute position register. The controller answers an
//! `F` with its final status code: `5` move complete, `7` hard-limit stop.

use crate::core::protocol::{ProtocolClient, Transport, UnmatchedPolicy};
use crate::domain::config::{limits, HandlerConfig};
use crate::domain::error::{RigError, RigResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::core::protocol::Frame;

/// Registers readable with `V`.
pub const REGISTERS: &[char] = &[
    'A', 'B', 'D', 'E', 'G', 'H', 'I', 'J', 'M', 'N', 'O', 'P', 'R', 'W', 'X',
];

/// Cached handler state, mutated only after a confirmed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Idle,
    Indexing,
    /// A move timed out; the carriage may still be in motion. Cleared by the
    /// next successful status query.
    Unknown,
}

/// Terminal condition of a completed move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Status `5`: the move finished at the commanded position.
    Complete,
    /// Status `7`: the carriage hit a hard limit; final position unknown.
    HardLimit,
}

#[derive(Debug, Clone, Copy)]
enum MoveTarget {
    Position(u32),
    Rotation { degrees: f64 },
}

#[derive(Debug)]
struct HandlerState {
    status: HandlerStatus,
    position: Option<u32>,
    rotation: Option<f64>,
    target: Option<MoveTarget>,
}

pub struct HandlerClient {
    proto: ProtocolClient,
    state: Mutex<HandlerState>,
    /// Held across a whole command burst (idle check through the final
    /// write), so two concurrent operations can never interleave on the wire.
    op: AsyncMutex<()>,
    command_timeout: Duration,
    move_timeout: Duration,
}

impl HandlerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        frames: mpsc::UnboundedReceiver<Frame>,
        command_timeout: Duration,
        move_timeout: Duration,
    ) -> Self {
        Self {
            proto: ProtocolClient::new("handler", transport, frames),
            state: Mutex::new(HandlerState {
                status: HandlerStatus::Idle,
                position: None,
                rotation: None,
                target: None,
            }),
            op: AsyncMutex::new(()),
            command_timeout,
            move_timeout,
        }
    }

    /// Put the controller in remote mode. Required once after power-up
    /// before any motion command is accepted.
    pub async fn go_online(&self) -> RigResult<()> {
        self.proto.send("@0").await
    }

    /// Bring the controller online and program the motion parameters.
    pub async fn apply_motion_settings(&self, config: &HandlerConfig) -> RigResult<()> {
        config.validate()?;
        let _op = self.op.lock().await;
        self.go_online().await?;
        self.proto.send(&format!("A{}", config.accel)).await?;
        self.proto.send(&format!("D{}", config.decel)).await?;
        self.proto.send(&format!("B{}", config.base_speed)).await?;
        self.proto.send(&format!("M{}", config.max_velocity)).await?;
        self.proto.send(&format!("CH{}", config.hold_time)).await?;
        self.proto.send(&format!("CX{}", config.crystal_freq)).await?;
        info!(
            accel = config.accel,
            base_speed = config.base_speed,
            max_velocity = config.max_velocity,
            "handler motion settings applied"
        );
        Ok(())
    }

    /// Start an absolute move. Does not wait for completion; pair with
    /// `join`. Fails fast while a move is in flight (the firmware answers
    /// status `3` to commands issued mid-move and loses the new target).
    pub async fn move_to_pos(&self, pos: u32) -> RigResult<()> {
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
        let _op = self.op.lock().await;
        self.check_idle()?;

        self.proto.send(&format!("P{}", pos)).await?;
        self.proto.send("G").await?;

        let mut state = self.lock_state();
        state.status = HandlerStatus::Indexing;
        state.target = Some(MoveTarget::Position(pos));
        debug!(pos, "handler move started");
        Ok(())
    }

    /// Start a rotation. The angle is normalized into [0, 360) and converted
    /// onto the controller's 0-2000 unit circle; `rotate_to(370.0)` issues
    /// the same bytes as `rotate_to(10.0)`.
    pub async fn rotate_to(&self, angle: f64) -> RigResult<()> {
        if !angle.is_finite() {
            return Err(RigError::InvalidParameter {
                message: format!("angle {} is not finite", angle),
            });
        }
        let _op = self.op.lock().await;
        self.check_idle()?;

        let degrees = angle.rem_euclid(360.0);
        let steps = Self::degrees_to_steps(degrees);
        self.proto.send(&format!("P{}", steps)).await?;
        self.proto.send("G").await?;

        let mut state = self.lock_state();
        state.status = HandlerStatus::Indexing;
        state.target = Some(MoveTarget::Rotation { degrees });
        debug!(angle, degrees, steps, "handler rotation started");
        Ok(())
    }

    /// Block until the in-flight move terminates. Status `5` is success;
    /// status `7` (hard-limit stop) is a distinct terminal condition, not a
    /// success with a different position. On timeout the carriage may still
    /// be moving and the cached status becomes `Unknown`.
    pub async fn join(&self) -> RigResult<MoveOutcome> {
        let result = self
            .proto
            .query(
                "F",
                |r| {
                    let r = r.trim();
                    r == "5" || r == "7"
                },
                self.move_timeout,
                UnmatchedPolicy::Retain,
            )
            .await;

        let frame = match result {
            Ok(frame) => frame,
            Err(e) => {
                let mut state = self.lock_state();
                state.status = HandlerStatus::Unknown;
                state.position = None;
                state.rotation = None;
                warn!("handler join failed; carriage possibly still moving: {}", e);
                return Err(e);
            }
        };

        let mut state = self.lock_state();
        state.status = HandlerStatus::Idle;
        let target = state.target.take();
        match frame.text.trim() {
            "5" => {
                match target {
                    Some(MoveTarget::Position(pos)) => state.position = Some(pos),
                    Some(MoveTarget::Rotation { degrees }) => state.rotation = Some(degrees),
                    None => {}
                }
                debug!("handler move complete");
                Ok(MoveOutcome::Complete)
            }
            _ => {
                // Hard-limit stop: the commanded target was not reached.
                state.position = None;
                state.rotation = None;
                warn!("handler stopped at hard limit");
                Ok(MoveOutcome::HardLimit)
            }
        }
    }

    /// Read one controller register (`V` command).
    pub async fn read_register(&self, register: char) -> RigResult<i64> {
        if !REGISTERS.contains(&register) {
            return Err(RigError::InvalidParameter {
                message: format!("unknown register '{}'", register),
            });
        }
        let frame = self
            .proto
            .query(
                &format!("V{}", register),
                |r| r.trim().parse::<i64>().is_ok(),
                self.command_timeout,
                UnmatchedPolicy::Retain,
            )
            .await?;
        frame.text.trim().parse().map_err(|_| RigError::Protocol {
            message: format!("unparseable register value '{}'", frame.text),
        })
    }

    /// Overwrite the controller's absolute position register (`Z` command)
    /// and the cached position.
    pub async fn set_position_register(&self, pos: u32) -> RigResult<()> {
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
        let _op = self.op.lock().await;
        self.check_idle()?;
        self.proto.send(&format!("Z{}", pos)).await?;
        self.lock_state().position = Some(pos);
        Ok(())
    }

    /// Re-read the position register and refresh the cache.
    pub async fn refresh_position(&self) -> RigResult<u32> {
        let value = self.read_register('P').await?;
        let pos = u32::try_from(value).map_err(|_| RigError::Protocol {
            message: format!("position register out of range: {}", value),
        })?;
        self.lock_state().position = Some(pos);
        Ok(pos)
    }

    pub fn get_status(&self) -> HandlerStatus {
        self.lock_state().status
    }

    pub fn get_position(&self) -> Option<u32> {
        self.lock_state().position
    }

    pub fn get_rotation(&self) -> Option<f64> {
        self.lock_state().rotation
    }

    /// Lightweight connectivity check: a register read that touches nothing
    /// in the cache except the status field.
    pub async fn is_ok(&self) -> bool {
        if !self.proto.is_connected() {
            return false;
        }
        match self.read_register('P').await {
            Ok(_) => {
                let mut state = self.lock_state();
                if state.status == HandlerStatus::Unknown {
                    state.status = HandlerStatus::Idle;
                }
                true
            }
            Err(_) => false,
        }
    }

    pub fn degrees_to_steps(degrees: f64) -> u32 {
        let norm = degrees.rem_euclid(360.0);
        let steps = (norm / 360.0 * f64::from(limits::ROTATION_STEPS)).round() as u32;
        steps % limits::ROTATION_STEPS
    }

    fn check_idle(&self) -> RigResult<()> {
        let state = self.lock_state();
        match state.status {
            HandlerStatus::Idle => Ok(()),
            HandlerStatus::Indexing => Err(RigError::Busy {
                message: "handler is indexing; commands are invalid while moving".to_string(),
            }),
            HandlerStatus::Unknown => Err(RigError::Busy {
                message: "handler state unknown after a failed move; query status first"
                    .to_string(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

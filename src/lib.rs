//! Magrig Library
//!
//! Instrument control protocol layer for a rock-magnetometer rig: serial
//! transports, typed device clients (sample handler, AF degausser, SQUID
//! magnetometer) and exclusive-ownership arbitration over the instrument set.

pub mod cli;
pub mod core;
pub mod domain;
pub mod infrastructure;

pub use crate::core::arbiter::DeviceArbiter;
pub use crate::core::degausser::{Coil, DegausserClient, RampStatus};
pub use crate::core::handler::{HandlerClient, HandlerStatus, MoveOutcome};
pub use crate::core::magnetometer::{Axis, AxisStatus, FluxReading, MagnetometerClient};
pub use crate::core::protocol::{Frame, MockTransport, ProtocolClient, Transport, UnmatchedPolicy};
pub use crate::domain::config::RigConfig;
pub use crate::domain::error::{RigError, RigResult};
pub use crate::infrastructure::serial::SerialTransport;

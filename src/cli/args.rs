use clap::{Parser, Subcommand, ValueEnum};

/// Command line arguments for the magrig operator console
#[derive(Parser, Debug)]
#[command(
    name = "magrig",
    version = env!("CARGO_PKG_VERSION"),
    about = "Rock-magnetometer rig operator console",
    long_about = "Operator console for a rock-magnetometer rig: sample handler moves, \
AF demagnetization cycles and SQUID flux readings over the instrument control layer."
)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List serial ports present on this machine
    Ports,
    /// Health-check all three devices
    Status,
    /// Move the sample handler to an absolute position and wait
    Move {
        /// Target position in steps (1-16777215)
        position: u32,
    },
    /// Rotate the sample to an angle and wait
    Rotate {
        /// Target angle in degrees (normalized into 0-360)
        angle: f64,
    },
    /// Run one demagnetization cycle
    Demag {
        /// Coil to energize
        #[arg(value_enum)]
        coil: CoilArg,
        /// Peak amplitude (0-3000)
        amplitude: u16,
    },
    /// Take one calibrated flux reading
    Read,
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write an example configuration to the global path
    Init,
}

/// Coil selection argument
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum CoilArg {
    X,
    Y,
    Z,
}

impl From<CoilArg> for crate::core::degausser::Coil {
    fn from(coil: CoilArg) -> Self {
        match coil {
            CoilArg::X => Self::X,
            CoilArg::Y => Self::Y,
            CoilArg::Z => Self::Z,
        }
    }
}

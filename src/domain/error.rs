use thiserror::Error;

/// Magrig unified error type
#[derive(Error, Debug)]
pub enum RigError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Protocol timeout waiting for response to '{command}'")]
    Timeout { command: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Device busy: {message}")]
    Busy { message: String },

    #[error("Ownership denied: instrument set is held by '{owner}'")]
    OwnershipDenied { owner: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl RigError {
    /// True for failures that invalidate the connection until the port is
    /// explicitly reopened.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RigError::Serial(_) | RigError::Io(_) | RigError::Connection { .. }
        )
    }
}

pub type RigResult<T> = Result<T, RigError>;

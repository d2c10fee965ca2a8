pub mod client;
pub mod mock;

pub use client::{ProtocolClient, UnmatchedPolicy};
pub use mock::MockTransport;

use crate::domain::error::RigResult;
use async_trait::async_trait;

/// One complete inbound ASCII frame, terminator stripped.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Name of the endpoint the frame arrived on (port path)
    pub endpoint: String,
    /// Frame text without the line terminator
    pub text: String,
    /// Arrival order on the endpoint
    pub seq: u64,
}

impl Frame {
    pub fn new(endpoint: impl Into<String>, text: impl Into<String>, seq: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            text: text.into(),
            seq,
        }
    }
}

/// Outbound side of one serial endpoint. Inbound frames arrive on the channel
/// handed out when the transport is opened; the transport appends the line
/// terminator to every write.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint name (port path) for logging and frame attribution
    fn endpoint(&self) -> &str;

    /// Write one command line. Fails with a connection error if the port has
    /// become unusable; never retried here.
    async fn write_line(&self, line: &str) -> RigResult<()>;

    /// Whether the endpoint is still believed usable. A failed write or a
    /// reader error latches this false until the port is reopened.
    fn is_connected(&self) -> bool;
}

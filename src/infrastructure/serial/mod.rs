pub mod transport;

pub use transport::{LineFramer, SerialTransport};

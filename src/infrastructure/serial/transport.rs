use crate::core::protocol::{Frame, Transport};
use crate::domain::config::{FlowControlConfig, ParityConfig, SerialEndpoint};
use crate::domain::error::{RigError, RigResult};
use async_trait::async_trait;
use serialport::SerialPort;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Splits a raw byte stream into line frames. A trailing partial frame is
/// retained and prefixed to the next chunk; the three controllers terminate
/// with CR, LF or both, so either byte ends a frame and empty frames are
/// dropped.
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).take(pos).collect();
            if line.is_empty() {
                continue;
            }
            match String::from_utf8(line) {
                Ok(text) => frames.push(text),
                Err(e) => {
                    // Malformed frame: drop it without disturbing the stream.
                    warn!("discarding non-ASCII frame: {:?}", e.as_bytes());
                }
            }
        }
        frames
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// One physical serial endpoint. A dedicated reader task frames the inbound
/// byte stream and delivers complete lines on the channel returned by
/// `open`; writes go through `write_line`, which appends the CR terminator.
/// No reconnection logic lives here: a failed read or write latches the
/// transport disconnected and the failure is reported upward.
pub struct SerialTransport {
    endpoint: String,
    port: Arc<Mutex<Box<dyn SerialPort + Send>>>,
    connected: Arc<AtomicBool>,
    _reader: tokio::task::JoinHandle<()>,
}

impl SerialTransport {
    pub fn open(endpoint: &SerialEndpoint) -> RigResult<(Arc<Self>, mpsc::UnboundedReceiver<Frame>)> {
        endpoint.validate()?;

        let builder = serialport::new(&endpoint.port, endpoint.baud_rate)
            .data_bits(match endpoint.data_bits {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                8 => serialport::DataBits::Eight,
                other => {
                    return Err(RigError::InvalidParameter {
                        message: format!("invalid data bits: {}", other),
                    })
                }
            })
            .stop_bits(match endpoint.stop_bits {
                1 => serialport::StopBits::One,
                2 => serialport::StopBits::Two,
                other => {
                    return Err(RigError::InvalidParameter {
                        message: format!("invalid stop bits: {}", other),
                    })
                }
            })
            .parity(match endpoint.parity {
                ParityConfig::None => serialport::Parity::None,
                ParityConfig::Even => serialport::Parity::Even,
                ParityConfig::Odd => serialport::Parity::Odd,
            })
            .flow_control(match endpoint.flow_control {
                FlowControlConfig::None => serialport::FlowControl::None,
                FlowControlConfig::Software => serialport::FlowControl::Software,
                FlowControlConfig::Hardware => serialport::FlowControl::Hardware,
            })
            .timeout(Duration::from_millis(100));

        let port = builder.open()?;
        info!(port = %endpoint.port, baud = endpoint.baud_rate, "serial port opened");

        let port: Arc<Mutex<Box<dyn SerialPort + Send>>> = Arc::new(Mutex::new(port));
        let connected = Arc::new(AtomicBool::new(true));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let reader = Self::spawn_reader(
            endpoint.port.clone(),
            Arc::clone(&port),
            Arc::clone(&connected),
            frame_tx,
        );

        let transport = Arc::new(Self {
            endpoint: endpoint.port.clone(),
            port,
            connected,
            _reader: reader,
        });
        Ok((transport, frame_rx))
    }

    fn spawn_reader(
        endpoint: String,
        port: Arc<Mutex<Box<dyn SerialPort + Send>>>,
        connected: Arc<AtomicBool>,
        frame_tx: mpsc::UnboundedSender<Frame>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 1024];
            let mut framer = LineFramer::new();
            let seq = AtomicU64::new(0);

            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;

                let mut port = port.lock().await;
                match port.read(&mut buffer) {
                    Ok(0) => continue,
                    Ok(n) => {
                        drop(port);
                        for text in framer.push(&buffer[..n]) {
                            debug!(port = %endpoint, frame = %text, "frame received");
                            let frame =
                                Frame::new(endpoint.clone(), text, seq.fetch_add(1, Ordering::Relaxed));
                            if frame_tx.send(frame).is_err() {
                                // Receiver dropped; the client is gone.
                                return;
                            }
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => {
                        error!(port = %endpoint, "serial read failed: {}", e);
                        connected.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn write_line(&self, line: &str) -> RigResult<()> {
        if !self.is_connected() {
            return Err(RigError::Connection {
                message: format!("{}: port is no longer usable", self.endpoint),
            });
        }
        let mut port = self.port.lock().await;
        fn push_line(port: &mut (dyn SerialPort + Send), line: &str) -> std::io::Result<()> {
            port.write_all(line.as_bytes())?;
            port.write_all(b"\r")?;
            port.flush()
        }
        if let Err(e) = push_line(port.as_mut(), line) {
            self.connected.store(false, Ordering::Relaxed);
            error!(port = %self.endpoint, "serial write failed: {}", e);
            return Err(RigError::Connection {
                message: format!("{}: write failed: {}", self.endpoint, e),
            });
        }
        debug!(port = %self.endpoint, line, "line written");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

//! Fake transport for tests. The device clients are constructed against
//! `Transport`, so the whole protocol layer runs against scripted serial
//! traffic with no hardware attached.

use crate::core::protocol::{Frame, Transport};
use crate::domain::error::{RigError, RigResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type Responder = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

pub struct MockTransport {
    endpoint: String,
    written: Mutex<Vec<String>>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    seq: AtomicU64,
    connected: AtomicBool,
    responder: Mutex<Option<Responder>>,
    write_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new(endpoint: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let mock = Arc::new(Self {
            endpoint: endpoint.to_string(),
            written: Mutex::new(Vec::new()),
            frame_tx,
            seq: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            responder: Mutex::new(None),
            write_delay: Mutex::new(None),
        });
        (mock, frame_rx)
    }

    /// Script replies: the responder sees every written command and returns
    /// the frames the fake device answers with.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        *self.responder.lock().expect("responder lock") = Some(Box::new(responder));
    }

    /// Deliver an unsolicited inbound frame.
    pub fn inject(&self, text: &str) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.frame_tx.send(Frame::new(self.endpoint.clone(), text, seq));
    }

    /// Every command written so far, in order, terminators stripped.
    pub fn written_lines(&self) -> Vec<String> {
        self.written.lock().expect("written lock").clone()
    }

    pub fn clear_written(&self) {
        self.written.lock().expect("written lock").clear();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Make every write take `delay`, the way a real port write blocks while
    /// the reader holds the port.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().expect("delay lock") = Some(delay);
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn write_line(&self, line: &str) -> RigResult<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(RigError::Connection {
                message: format!("{}: mock transport disconnected", self.endpoint),
            });
        }
        let delay = *self.write_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.written
            .lock()
            .expect("written lock")
            .push(line.to_string());

        let replies = {
            let responder = self.responder.lock().expect("responder lock");
            responder.as_ref().map(|r| r(line)).unwrap_or_default()
        };
        for reply in replies {
            self.inject(&reply);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_and_replies() {
        let (mock, mut rx) = MockTransport::new("/dev/fake");
        mock.set_responder(|cmd| {
            if cmd == "DSS" {
                vec!["Z".to_string()]
            } else {
                vec![]
            }
        });

        mock.write_line("DSS").await.unwrap();
        assert_eq!(mock.written_lines(), vec!["DSS".to_string()]);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.text, "Z");
        assert_eq!(frame.endpoint, "/dev/fake");
    }

    #[tokio::test]
    async fn test_mock_disconnect() {
        let (mock, _rx) = MockTransport::new("/dev/fake");
        mock.set_connected(false);
        assert!(!mock.is_connected());
        assert!(mock.write_line("G").await.is_err());
    }
}

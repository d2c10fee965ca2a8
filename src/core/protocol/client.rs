use crate::core::protocol::{Frame, Transport};
use crate::domain::error::{RigError, RigResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// What to do with frames that do not satisfy the current query's predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmatchedPolicy {
    /// Keep the frame for a later query (device emits useful unsolicited
    /// status, e.g. the handler's end-of-move code).
    Retain,
    /// Log and drop the frame (unsolicited noise).
    Discard,
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Frame>,
    retained: VecDeque<Frame>,
}

/// Shared command/response plumbing for one device endpoint.
///
/// The inbox mutex is the per-device command lock: it is held for the whole
/// duration of a query, so at most one request is outstanding per device and
/// a second caller blocks until the first resolves or times out. The firmware
/// on all three controllers cannot handle overlapping commands.
pub struct ProtocolClient {
    name: &'static str,
    transport: Arc<dyn Transport>,
    inbox: Mutex<Inbox>,
}

impl ProtocolClient {
    pub fn new(
        name: &'static str,
        transport: Arc<dyn Transport>,
        frames: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            name,
            transport,
            inbox: Mutex::new(Inbox {
                rx: frames,
                retained: VecDeque::new(),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Write one command without waiting for a response. Takes the command
    /// lock so fire-and-forget writes cannot interleave with a query's
    /// command on the wire.
    pub async fn send(&self, command: &str) -> RigResult<()> {
        let _inbox = self.inbox.lock().await;
        debug!(device = self.name, command, "send");
        self.transport.write_line(command).await
    }

    /// Write `command` and wait until a buffered or newly arriving frame
    /// satisfies `matches`, or `timeout` elapses. Non-matching frames are
    /// retained or discarded per `policy`; either way the inbox is left
    /// consistent for the next query.
    pub async fn query<F>(
        &self,
        command: &str,
        matches: F,
        timeout: Duration,
        policy: UnmatchedPolicy,
    ) -> RigResult<Frame>
    where
        F: Fn(&str) -> bool + Send,
    {
        let mut inbox = self.inbox.lock().await;

        // A frame satisfying this query may already be sitting in the buffer
        // (unsolicited status that arrived before the caller got here).
        if let Some(frame) = Self::take_retained(&mut inbox, &matches) {
            debug!(device = self.name, command, response = %frame.text, "matched retained frame");
            return Ok(frame);
        }

        debug!(device = self.name, command, "query");
        self.transport.write_line(command).await?;
        self.wait_locked(&mut inbox, command, matches, timeout, policy)
            .await
    }

    /// Wait for a matching frame without writing anything first. Used after a
    /// fire-and-forget command burst when the device reports completion
    /// asynchronously.
    pub async fn wait_for<F>(
        &self,
        description: &str,
        matches: F,
        timeout: Duration,
        policy: UnmatchedPolicy,
    ) -> RigResult<Frame>
    where
        F: Fn(&str) -> bool + Send,
    {
        let mut inbox = self.inbox.lock().await;
        if let Some(frame) = Self::take_retained(&mut inbox, &matches) {
            return Ok(frame);
        }
        self.wait_locked(&mut inbox, description, matches, timeout, policy)
            .await
    }

    fn take_retained<F>(inbox: &mut Inbox, matches: &F) -> Option<Frame>
    where
        F: Fn(&str) -> bool,
    {
        let idx = inbox.retained.iter().position(|f| matches(&f.text))?;
        inbox.retained.remove(idx)
    }

    async fn wait_locked<F>(
        &self,
        inbox: &mut Inbox,
        command: &str,
        matches: F,
        timeout: Duration,
        policy: UnmatchedPolicy,
    ) -> RigResult<Frame>
    where
        F: Fn(&str) -> bool + Send,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, inbox.rx.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(RigError::Connection {
                        message: format!("{}: endpoint closed", self.name),
                    });
                }
                Err(_) => {
                    debug!(device = self.name, command, ?timeout, "query timed out");
                    return Err(RigError::Timeout {
                        command: command.to_string(),
                    });
                }
            };

            if matches(&frame.text) {
                trace!(device = self.name, response = %frame.text, "matched");
                return Ok(frame);
            }

            match policy {
                UnmatchedPolicy::Retain => {
                    trace!(device = self.name, frame = %frame.text, "retaining unmatched frame");
                    inbox.retained.push_back(frame);
                }
                UnmatchedPolicy::Discard => {
                    warn!(device = self.name, frame = %frame.text, "discarding unexpected frame");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::MockTransport;

    fn client_with_mock() -> (ProtocolClient, Arc<MockTransport>) {
        let (mock, rx) = MockTransport::new("/dev/test");
        let client = ProtocolClient::new("test", Arc::clone(&mock) as Arc<dyn Transport>, rx);
        (client, mock)
    }

    #[tokio::test]
    async fn test_query_matches_scripted_response() {
        let (client, mock) = client_with_mock();
        mock.set_responder(|cmd| match cmd {
            "VP" => vec!["1234".to_string()],
            _ => vec![],
        });

        let frame = client
            .query(
                "VP",
                |r| r.parse::<i64>().is_ok(),
                Duration::from_millis(200),
                UnmatchedPolicy::Discard,
            )
            .await
            .unwrap();
        assert_eq!(frame.text, "1234");
        assert_eq!(mock.written_lines(), vec!["VP".to_string()]);
    }

    #[tokio::test]
    async fn test_query_timeout_leaves_inbox_usable() {
        let (client, mock) = client_with_mock();

        let err = client
            .query(
                "DSS",
                |r| r == "Z",
                Duration::from_millis(50),
                UnmatchedPolicy::Discard,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Timeout { .. }));

        // A later frame still reaches the next query.
        mock.inject("Z");
        let frame = client
            .wait_for("DSS", |r| r == "Z", Duration::from_millis(200), UnmatchedPolicy::Discard)
            .await
            .unwrap();
        assert_eq!(frame.text, "Z");
    }

    #[tokio::test]
    async fn test_retained_frame_satisfies_later_query() {
        let (client, mock) = client_with_mock();
        mock.inject("5");
        mock.set_responder(|cmd| match cmd {
            "VP" => vec!["77".to_string()],
            _ => vec![],
        });

        // The "5" frame does not match this query and is retained.
        let frame = client
            .query(
                "VP",
                |r| r.parse::<i64>().is_ok() && r != "5",
                Duration::from_millis(200),
                UnmatchedPolicy::Retain,
            )
            .await
            .unwrap();
        assert_eq!(frame.text, "77");

        // The retained "5" answers the next wait without touching the wire.
        let frame = client
            .wait_for("F", |r| r == "5", Duration::from_millis(50), UnmatchedPolicy::Retain)
            .await
            .unwrap();
        assert_eq!(frame.text, "5");
    }

    #[tokio::test]
    async fn test_concurrent_queries_serialize() {
        let (client, mock) = client_with_mock();
        mock.set_responder(|cmd| match cmd {
            "A1" => vec!["R1".to_string()],
            "A2" => vec!["R2".to_string()],
            _ => vec![],
        });
        let client = Arc::new(client);

        let c1 = Arc::clone(&client);
        let t1 = tokio::spawn(async move {
            c1.query("A1", |r| r == "R1", Duration::from_millis(500), UnmatchedPolicy::Retain)
                .await
        });
        let c2 = Arc::clone(&client);
        let t2 = tokio::spawn(async move {
            c2.query("A2", |r| r == "R2", Duration::from_millis(500), UnmatchedPolicy::Retain)
                .await
        });

        // Both complete with their own responses; the mutex prevents the
        // responses from cross-matching mid-flight.
        assert_eq!(t1.await.unwrap().unwrap().text, "R1");
        assert_eq!(t2.await.unwrap().unwrap().text, "R2");
        let written = mock.written_lines();
        assert_eq!(written.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_transport_fails_write() {
        let (client, mock) = client_with_mock();
        mock.set_connected(false);
        let err = client.send("G").await.unwrap_err();
        assert!(err.is_connection_error());
    }
}

//! AF demagnetizer (degausser).
//!
//! The controlling single-board computer is slow and must never see
//! overlapping commands, so every set command (`DCC` coil, `DCA` amplitude,
//! `DCR` ramp rate, `DCD` delay) is acknowledged with `DONE` (`?` on
//! rejection) before the next one goes out, and the ramp cycle is driven by
//! polling `DSS`, which answers `Z` (field at zero), `T` (tracking the
//! commanded amplitude) or `?` (unknown).

use crate::core::protocol::{Frame, ProtocolClient, Transport, UnmatchedPolicy};
use crate::domain::config::{limits, DegausserConfig};
use crate::domain::error::{RigError, RigResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Demagnetizer coil selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coil {
    X,
    Y,
    Z,
}

impl Coil {
    pub fn letter(self) -> char {
        match self {
            Coil::X => 'X',
            Coil::Y => 'Y',
            Coil::Z => 'Z',
        }
    }
}

/// Last observed ramp status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampStatus {
    /// Field at zero
    Zero,
    /// Field tracking the commanded amplitude
    Tracking,
    /// Device reported `?`; the coil state is undefined
    Unknown,
}

impl RampStatus {
    fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "Z" => Some(RampStatus::Zero),
            "T" => Some(RampStatus::Tracking),
            "?" => Some(RampStatus::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct DegausserState {
    ramp_status: RampStatus,
    coil: Option<Coil>,
    amplitude: Option<u16>,
}

pub struct DegausserClient {
    proto: ProtocolClient,
    config: Mutex<DegausserConfig>,
    state: Mutex<DegausserState>,
    /// Held for a whole cycle or settings pass; concurrent cycles would
    /// interleave coil selects on the wire.
    op: AsyncMutex<()>,
    command_timeout: Duration,
}

impl DegausserClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        frames: mpsc::UnboundedReceiver<Frame>,
        config: DegausserConfig,
        command_timeout: Duration,
    ) -> Self {
        Self {
            proto: ProtocolClient::new("degausser", transport, frames),
            config: Mutex::new(config),
            state: Mutex::new(DegausserState {
                ramp_status: RampStatus::Zero,
                coil: None,
                amplitude: None,
            }),
            op: AsyncMutex::new(()),
            command_timeout,
        }
    }

    /// Program ramp rate and delay on the device. Validated before any byte
    /// is written.
    pub async fn apply_settings(&self, config: &DegausserConfig) -> RigResult<()> {
        config.validate()?;
        let _op = self.op.lock().await;
        self.set(&format!("DCR{}", config.ramp)).await?;
        self.set(&format!("DCD{}", config.delay_s)).await?;
        *self.lock_config() = config.clone();
        info!(ramp = config.ramp, delay_s = config.delay_s, "degausser settings applied");
        Ok(())
    }

    /// Run one full demagnetization cycle on `coil`:
    /// select coil -> set amplitude -> ramp up -> hold -> ramp down.
    /// Every phase transition is gated on an observed status change; any
    /// timeout or `?` aborts with the coil state left undefined and
    /// reported, never auto-recovered.
    pub async fn demagnetize(&self, coil: Coil, amplitude: u16) -> RigResult<()> {
        let (ramp, delay_s, max_field, ramp_timeout) = {
            let config = self.lock_config();
            (
                config.ramp,
                config.delay_s,
                config.max_field,
                Duration::from_millis(config.ramp_timeout_ms),
            )
        };
        if !limits::RAMP_RATES.contains(&ramp) {
            return Err(RigError::InvalidParameter {
                message: format!("ramp rate {} not one of {:?}", ramp, limits::RAMP_RATES),
            });
        }
        if !(limits::DELAY_MIN..=limits::DELAY_MAX).contains(&delay_s) {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "delay {} outside {}-{}",
                    delay_s,
                    limits::DELAY_MIN,
                    limits::DELAY_MAX
                ),
            });
        }
        if amplitude > limits::AMPLITUDE_MAX || amplitude > max_field {
            return Err(RigError::InvalidParameter {
                message: format!(
                    "amplitude {} outside 0-{} (configured ceiling {})",
                    amplitude,
                    limits::AMPLITUDE_MAX,
                    max_field
                ),
            });
        }

        let _op = self.op.lock().await;
        info!(coil = %coil.letter(), amplitude, ramp, delay_s, "demagnetize cycle starting");
        let result = self
            .run_cycle(coil, amplitude, delay_s, ramp_timeout)
            .await;
        if let Err(e) = &result {
            // Mid-sequence failure: the field may be anywhere between zero
            // and the commanded amplitude.
            let mut state = self.lock_state();
            state.ramp_status = RampStatus::Unknown;
            warn!(coil = %coil.letter(), "demagnetize cycle aborted, coil state undefined: {}", e);
        }
        result
    }

    pub async fn demagnetize_z(&self, amplitude: u16) -> RigResult<()> {
        self.demagnetize(Coil::Z, amplitude).await
    }

    pub async fn demagnetize_y(&self, amplitude: u16) -> RigResult<()> {
        self.demagnetize(Coil::Y, amplitude).await
    }

    /// Poll the ramp status once and refresh the cache.
    pub async fn get_ramp_status(&self) -> RigResult<RampStatus> {
        let frame = self
            .proto
            .query(
                "DSS",
                |r| RampStatus::parse(r).is_some(),
                self.command_timeout,
                UnmatchedPolicy::Discard,
            )
            .await?;
        let status = RampStatus::parse(&frame.text).ok_or_else(|| RigError::Protocol {
            message: format!("unparseable ramp status '{}'", frame.text),
        })?;
        self.lock_state().ramp_status = status;
        Ok(status)
    }

    pub fn last_ramp_status(&self) -> RampStatus {
        self.lock_state().ramp_status
    }

    pub fn selected_coil(&self) -> Option<Coil> {
        self.lock_state().coil
    }

    pub async fn is_ok(&self) -> bool {
        self.proto.is_connected() && self.get_ramp_status().await.is_ok()
    }

    async fn run_cycle(
        &self,
        coil: Coil,
        amplitude: u16,
        delay_s: u8,
        ramp_timeout: Duration,
    ) -> RigResult<()> {
        self.set(&format!("DCC{}", coil.letter())).await?;
        {
            let mut state = self.lock_state();
            state.coil = Some(coil);
        }
        self.set(&format!("DCA{}", amplitude)).await?;
        self.lock_state().amplitude = Some(amplitude);

        // Ramp up: done once the status leaves Zero for Tracking.
        self.proto.send("DERU").await?;
        debug!("ramp up started");
        self.poll_until(RampStatus::Tracking, ramp_timeout).await?;

        debug!(delay_s, "holding at peak field");
        tokio::time::sleep(Duration::from_secs(u64::from(delay_s))).await;

        // Ramp down: done once the field is back at zero.
        self.proto.send("DERD").await?;
        debug!("ramp down started");
        self.poll_until(RampStatus::Zero, ramp_timeout).await?;

        info!(coil = %coil.letter(), amplitude, "demagnetize cycle complete");
        Ok(())
    }

    /// Acknowledged set command: the device answers `DONE` or `?`.
    async fn set(&self, command: &str) -> RigResult<()> {
        let frame = self
            .proto
            .query(
                command,
                |r| {
                    let r = r.trim();
                    r == "DONE" || r == "?"
                },
                self.command_timeout,
                UnmatchedPolicy::Discard,
            )
            .await?;
        if frame.text.trim() == "?" {
            return Err(RigError::Protocol {
                message: format!("device rejected '{}'", command),
            });
        }
        Ok(())
    }

    async fn poll_until(&self, want: RampStatus, overall: Duration) -> RigResult<()> {
        let deadline = Instant::now() + overall;
        loop {
            let status = self.get_ramp_status().await?;
            if status == want {
                return Ok(());
            }
            if status == RampStatus::Unknown {
                return Err(RigError::Protocol {
                    message: "degausser reported unknown status mid-ramp".to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(RigError::Timeout {
                    command: "DSS".to_string(),
                });
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DegausserState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, DegausserConfig> {
        self.config.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::MockTransport;
    use crate::domain::config::RigConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> DegausserConfig {
        let mut config = RigConfig::example().degausser;
        config.delay_s = 1;
        config.ramp_timeout_ms = 2000;
        config
    }

    fn test_client(config: DegausserConfig) -> (DegausserClient, Arc<MockTransport>) {
        let (mock, rx) = MockTransport::new("/dev/degausser");
        let client = DegausserClient::new(
            Arc::clone(&mock) as Arc<dyn Transport>,
            rx,
            config,
            Duration::from_millis(200),
        );
        (client, mock)
    }

    /// Scripted firmware: acknowledges sets, walks the status through the
    /// ramp cycle as DERU/DERD arrive.
    fn script_full_cycle(mock: &Arc<MockTransport>) {
        let phase = Arc::new(AtomicUsize::new(0)); // 0 zero, 1 tracking
        mock.set_responder(move |cmd| match cmd {
            c if c.starts_with("DC") => vec!["DONE".to_string()],
            "DERU" => {
                phase.store(1, Ordering::SeqCst);
                vec![]
            }
            "DERD" => {
                phase.store(0, Ordering::SeqCst);
                vec![]
            }
            "DSS" => {
                if phase.load(Ordering::SeqCst) == 1 {
                    vec!["T".to_string()]
                } else {
                    vec!["Z".to_string()]
                }
            }
            _ => vec![],
        });
    }

    #[tokio::test]
    async fn test_invalid_ramp_writes_nothing() {
        let mut config = test_config();
        config.ramp = 4;
        let (client, mock) = test_client(config);
        let err = client.demagnetize_z(100).await.unwrap_err();
        assert!(matches!(err, RigError::InvalidParameter { .. }));
        assert!(mock.written_lines().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_delay_writes_nothing() {
        let mut config = test_config();
        config.delay_s = 0;
        let (client, mock) = test_client(config);
        assert!(client.demagnetize_z(100).await.is_err());
        assert!(mock.written_lines().is_empty());
    }

    #[tokio::test]
    async fn test_amplitude_over_ceiling_rejected() {
        let mut config = test_config();
        config.max_field = 1500;
        let (client, mock) = test_client(config);
        assert!(client.demagnetize_z(2000).await.is_err());
        assert!(client.demagnetize_z(3001).await.is_err());
        assert!(mock.written_lines().is_empty());
    }

    #[tokio::test]
    async fn test_full_cycle_sequences_commands() {
        let (client, mock) = test_client(test_config());
        script_full_cycle(&mock);

        client.demagnetize_z(2500).await.unwrap();

        let written = mock.written_lines();
        assert_eq!(written[0], "DCCZ");
        assert_eq!(written[1], "DCA2500");
        assert_eq!(written[2], "DERU");
        // At least one status poll between ramp up and ramp down.
        let up = written.iter().position(|l| l == "DERU").unwrap();
        let down = written.iter().position(|l| l == "DERD").unwrap();
        assert!(written[up..down].iter().any(|l| l == "DSS"));
        assert_eq!(client.last_ramp_status(), RampStatus::Zero);
        assert_eq!(client.selected_coil(), Some(Coil::Z));
    }

    #[tokio::test]
    async fn test_concurrent_cycles_do_not_interleave() {
        let (client, mock) = test_client(test_config());
        script_full_cycle(&mock);
        mock.set_write_delay(Duration::from_millis(2));
        let client = Arc::new(client);

        let x = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.demagnetize(Coil::X, 500).await })
        };
        let y = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.demagnetize_y(500).await })
        };
        x.await.unwrap().unwrap();
        y.await.unwrap().unwrap();

        // The second coil select only goes out after the first cycle has
        // ramped back down.
        let written = mock.written_lines();
        let selects: Vec<usize> = written
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("DCC"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(selects.len(), 2);
        let first_ramp_down = written.iter().position(|l| l == "DERD").unwrap();
        assert!(selects[1] > first_ramp_down, "wire: {:?}", written);
    }

    #[tokio::test]
    async fn test_y_cycle_selects_y_coil() {
        let (client, mock) = test_client(test_config());
        script_full_cycle(&mock);
        client.demagnetize_y(500).await.unwrap();
        assert_eq!(mock.written_lines()[0], "DCCY");
    }

    #[tokio::test]
    async fn test_rejected_set_aborts_cycle() {
        let (client, mock) = test_client(test_config());
        mock.set_responder(|cmd| {
            if cmd.starts_with("DC") {
                vec!["?".to_string()]
            } else {
                vec![]
            }
        });

        let err = client.demagnetize_z(100).await.unwrap_err();
        assert!(matches!(err, RigError::Protocol { .. }));
        // Nothing past the rejected coil select.
        assert_eq!(mock.written_lines(), vec!["DCCZ".to_string()]);
        assert_eq!(client.last_ramp_status(), RampStatus::Unknown);
    }

    #[tokio::test]
    async fn test_unknown_status_mid_ramp_aborts() {
        let (client, mock) = test_client(test_config());
        mock.set_responder(|cmd| match cmd {
            c if c.starts_with("DC") => vec!["DONE".to_string()],
            "DSS" => vec!["?".to_string()],
            _ => vec![],
        });

        let err = client.demagnetize_z(100).await.unwrap_err();
        assert!(matches!(err, RigError::Protocol { .. }));
        assert_eq!(client.last_ramp_status(), RampStatus::Unknown);
    }

    #[tokio::test]
    async fn test_apply_settings_programs_device() {
        let (client, mock) = test_client(test_config());
        mock.set_responder(|cmd| {
            if cmd.starts_with("DC") {
                vec!["DONE".to_string()]
            } else {
                vec![]
            }
        });

        let mut config = test_config();
        config.ramp = 9;
        config.delay_s = 3;
        client.apply_settings(&config).await.unwrap();
        assert_eq!(
            mock.written_lines(),
            vec!["DCR9".to_string(), "DCD3".to_string()]
        );
    }
}

//! Exclusive ownership and settings reconciliation for the instrument set.
//!
//! One `DeviceArbiter` owns the three device clients. It is constructed
//! explicitly and passed down to callers; construction is atomic, so a
//! half-opened instrument set is never observable. Ownership is a single
//! compare-and-set under a short-held lock, separate from the per-client
//! command locks.

use crate::core::degausser::DegausserClient;
use crate::core::handler::HandlerClient;
use crate::core::magnetometer::MagnetometerClient;
use crate::core::protocol::{Frame, Transport};
use crate::domain::config::RigConfig;
use crate::domain::error::{RigError, RigResult};
use crate::infrastructure::serial::SerialTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Window in which repeated `update_settings` calls collapse into one pass.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);
/// Backoff while the owner is mid-measurement.
const RETRY_INITIAL: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct OwnerSlot {
    id: Option<String>,
    measuring: bool,
}

pub struct DeviceArbiter {
    handler: Arc<HandlerClient>,
    degausser: Arc<DegausserClient>,
    magnetometer: Arc<MagnetometerClient>,
    owner: Arc<Mutex<OwnerSlot>>,
    settings_tx: mpsc::UnboundedSender<RigConfig>,
}

impl DeviceArbiter {
    /// Open all three serial endpoints and build the clients. Any failure
    /// aborts the whole construction; nothing is published half-built.
    pub fn open(config: &RigConfig) -> RigResult<Self> {
        config.validate()?;
        let (handler_t, handler_rx) = SerialTransport::open(&config.handler.endpoint)?;
        let (degausser_t, degausser_rx) = SerialTransport::open(&config.degausser.endpoint)?;
        let (magnetometer_t, magnetometer_rx) =
            SerialTransport::open(&config.magnetometer.endpoint)?;

        Ok(Self::with_transports(
            config,
            (handler_t, handler_rx),
            (degausser_t, degausser_rx),
            (magnetometer_t, magnetometer_rx),
        ))
    }

    /// Build against injected transports (fakes in tests, real ports in
    /// `open`).
    pub fn with_transports(
        config: &RigConfig,
        handler: (Arc<dyn Transport>, mpsc::UnboundedReceiver<Frame>),
        degausser: (Arc<dyn Transport>, mpsc::UnboundedReceiver<Frame>),
        magnetometer: (Arc<dyn Transport>, mpsc::UnboundedReceiver<Frame>),
    ) -> Self {
        let command_timeout = Duration::from_millis(config.global.command_timeout_ms);
        let move_timeout = Duration::from_millis(config.global.move_timeout_ms);

        let handler = Arc::new(HandlerClient::new(
            handler.0,
            handler.1,
            command_timeout,
            move_timeout,
        ));
        let degausser = Arc::new(DegausserClient::new(
            degausser.0,
            degausser.1,
            config.degausser.clone(),
            command_timeout,
        ));
        let magnetometer = Arc::new(MagnetometerClient::new(
            magnetometer.0,
            magnetometer.1,
            config.magnetometer.clone(),
            command_timeout,
        ));

        let owner = Arc::new(Mutex::new(OwnerSlot::default()));
        let (settings_tx, settings_rx) = mpsc::unbounded_channel();
        Self::spawn_reconciler(
            Arc::clone(&handler),
            Arc::clone(&degausser),
            Arc::clone(&magnetometer),
            Arc::clone(&owner),
            settings_rx,
        );

        info!("device arbiter ready");
        Self {
            handler,
            degausser,
            magnetometer,
            owner,
            settings_tx,
        }
    }

    pub fn handler(&self) -> &Arc<HandlerClient> {
        &self.handler
    }

    pub fn degausser(&self) -> &Arc<DegausserClient> {
        &self.degausser
    }

    pub fn magnetometer(&self) -> &Arc<MagnetometerClient> {
        &self.magnetometer
    }

    /// Take exclusive ownership of the instrument set for `id`, replacing
    /// any previous holder. Denied while the current holder has an active
    /// measurement; on denial nothing changes.
    pub async fn set_owner(&self, id: &str) -> RigResult<()> {
        let mut slot = self.owner.lock().await;
        if let Some(current) = &slot.id {
            if current != id && slot.measuring {
                return Err(RigError::OwnershipDenied {
                    owner: current.clone(),
                });
            }
        }
        if slot.id.as_deref() != Some(id) {
            info!(owner = id, previous = ?slot.id, "instrument ownership transferred");
            slot.id = Some(id.to_string());
            slot.measuring = false;
        }
        Ok(())
    }

    /// Release ownership. Only the current holder may release, and only
    /// while idle (the same invariant that gates replacement).
    pub async fn release_owner(&self, id: &str) -> RigResult<()> {
        let mut slot = self.owner.lock().await;
        match &slot.id {
            Some(current) if current == id => {
                if slot.measuring {
                    return Err(RigError::Busy {
                        message: format!("'{}' has an active measurement", id),
                    });
                }
                info!(owner = id, "instrument ownership released");
                slot.id = None;
                Ok(())
            }
            Some(current) => Err(RigError::OwnershipDenied {
                owner: current.clone(),
            }),
            None => Ok(()),
        }
    }

    pub async fn get_owner(&self) -> Option<String> {
        self.owner.lock().await.id.clone()
    }

    /// Flip the current holder's measurement state. Only the holder itself
    /// may do this.
    pub async fn set_measuring(&self, id: &str, measuring: bool) -> RigResult<()> {
        let mut slot = self.owner.lock().await;
        match &slot.id {
            Some(current) if current == id => {
                slot.measuring = measuring;
                debug!(owner = id, measuring, "measurement state changed");
                Ok(())
            }
            Some(current) => Err(RigError::OwnershipDenied {
                owner: current.clone(),
            }),
            None => Err(RigError::OwnershipDenied {
                owner: "<none>".to_string(),
            }),
        }
    }

    pub async fn is_measuring(&self) -> bool {
        self.owner.lock().await.measuring
    }

    /// Aggregate health check across all three devices.
    pub async fn is_ok(&self) -> bool {
        self.handler.is_ok().await && self.degausser.is_ok().await && self.magnetometer.is_ok().await
    }

    /// Schedule a background settings reconciliation. Calls landing within
    /// the debounce window collapse into a single pass (latest config wins);
    /// the pass itself waits, with exponential backoff, until the owner has
    /// no active measurement before touching the devices.
    pub fn update_settings(&self, config: RigConfig) -> RigResult<()> {
        config.validate()?;
        self.settings_tx.send(config).map_err(|_| RigError::Connection {
            message: "settings reconciler is gone".to_string(),
        })
    }

    fn spawn_reconciler(
        handler: Arc<HandlerClient>,
        degausser: Arc<DegausserClient>,
        magnetometer: Arc<MagnetometerClient>,
        owner: Arc<Mutex<OwnerSlot>>,
        mut rx: mpsc::UnboundedReceiver<RigConfig>,
    ) {
        tokio::spawn(async move {
            while let Some(mut config) = rx.recv().await {
                // Debounce: absorb every request arriving inside the window.
                loop {
                    match tokio::time::timeout(DEBOUNCE_WINDOW, rx.recv()).await {
                        Ok(Some(newer)) => config = newer,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                // Never reconfigure mid-measurement; back off until idle.
                let mut backoff = RETRY_INITIAL;
                loop {
                    let measuring = owner.lock().await.measuring;
                    if !measuring {
                        break;
                    }
                    debug!(?backoff, "owner mid-measurement, deferring settings pass");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_MAX);
                    while let Ok(newer) = rx.try_recv() {
                        config = newer;
                    }
                }

                debug!("applying settings pass");
                if let Err(e) = handler.apply_motion_settings(&config.handler).await {
                    warn!("handler settings pass failed: {}", e);
                }
                if let Err(e) = degausser.apply_settings(&config.degausser).await {
                    warn!("degausser settings pass failed: {}", e);
                }
                if let Err(e) = magnetometer.apply_settings(&config.magnetometer) {
                    warn!("magnetometer settings pass failed: {}", e);
                }
            }
        });
    }
}

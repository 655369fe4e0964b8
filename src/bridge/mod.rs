//! Per-device session handling.
//!
//! A [`DeviceBridge`] owns the CoAP session to one device host and drives it
//! through a connect / poll / sleep cycle:
//!
//! ```text
//! Disconnected ──connect──▶ Idle ──tick──▶ Polling ──status──▶ Sleeping ─┐
//!      ▲                                      │                          │
//!      └──────── watchdog / validation ───────┘◀────── cycle or poke ────┘
//! ```
//!
//! Every successful status poll replaces the typed device state and is
//! published differentially; the inter-cycle sleep is derived from the
//! device-reported max-age and can be cut short when a command goes out, so
//! the next poll confirms the new device state immediately. A request
//! watchdog bounds every status poll and flips the device to OFFLINE when it
//! expires. The [`BridgeGroup`] supervises all bridges and routes inbound
//! `set` commands to the owning one.

use crate::coap::{CoapClient, CoapConnector, CoapError};
use crate::device::DeviceState;
use crate::mqtt::CommandRouter;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Initial poll interval, until the device reports a max-age.
const INITIAL_CYCLE: Duration = Duration::from_secs(30);
/// Lower bound for the poll interval regardless of the reported max-age.
const MIN_CYCLE: Duration = Duration::from_secs(10);
/// Slack subtracted from the reported max-age so a poll lands before expiry.
const CYCLE_SLACK: u64 = 10;
/// Backoff after a failed connection attempt due to a network error.
const CONNECT_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown device model {model} for host {host}")]
    UnknownModel { host: String, model: String },
}

/// Publishing capability the bridges need from the MQTT side.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish_state(&self, host: &str, state: &DeviceState);
    async fn publish_online(&self, host: &str);
    async fn publish_offline(&self, host: &str);
}

pub struct DeviceBridge {
    host: String,
    state: Mutex<DeviceState>,
    connector: Arc<dyn CoapConnector>,
    /// Session handle; the mutex serializes connect/disconnect between the
    /// observe task and the command path.
    client: Mutex<Option<Arc<dyn CoapClient>>>,
    /// Mirror of the liveness value most recently published for this host.
    was_online: AtomicBool,
    /// Cuts the inter-cycle sleep short after an outgoing command.
    poke: Notify,
    cancel: CancellationToken,
    /// Zero means an unbounded connect.
    connection_timeout: Duration,
    status_timeout: Duration,
}

impl DeviceBridge {
    pub fn new(
        host: String,
        state: DeviceState,
        connector: Arc<dyn CoapConnector>,
        connection_timeout: Duration,
        status_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            host,
            state: Mutex::new(state),
            connector,
            client: Mutex::new(None),
            // Starts true so the initial OFFLINE publish goes through
            was_online: AtomicBool::new(true),
            poke: Notify::new(),
            cancel,
            connection_timeout,
            status_timeout,
        }
    }

    /// Drives the session until shutdown. Publishes the initial OFFLINE, then
    /// loops: ensure a session, poll the status, sleep for the cycle time.
    pub async fn observe(&self, publisher: Arc<dyn StatePublisher>) {
        info!("Observing device {}", self.host);
        self.signal_offline(publisher.as_ref()).await;
        let mut cycle = INITIAL_CYCLE;
        while !self.cancel.is_cancelled() {
            if !self.ensure_connected(publisher.as_ref()).await {
                break;
            }
            match self.poll_status(publisher.as_ref()).await {
                // Failed polls skip the sleep so the connect path runs again
                Some(next_cycle) => cycle = next_cycle,
                None => continue,
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(cycle) => {}
                _ = self.poke.notified() => {
                    debug!("Poll cycle for {} interrupted, refreshing now", self.host);
                }
            }
        }
        self.disconnect().await;
        info!("Stopped observing device {}", self.host);
    }

    /// Applies one inbound attribute update and pushes the resulting commands
    /// to the device. Never propagates: a bad command must not kill the
    /// bridge or the subscriber loop that delivered it.
    pub async fn send_update(&self, attribute: &str, value: &str) {
        debug!(
            "Got update for {} -> {} to {}",
            attribute, value, self.host
        );
        let commands = {
            let mut state = self.state.lock().await;
            match state.write(attribute, value) {
                Ok(()) => state.drain_commands(),
                Err(e) => {
                    warn!("Update failed for {}: {}", self.host, e);
                    return;
                }
            }
        };
        if commands.is_empty() {
            warn!("Update failed, no commands to send for {}", self.host);
            return;
        }

        let Some(client) = self.connected_client().await else {
            warn!(
                "Dropping {} command(s) for {}: device is not reachable",
                commands.len(),
                self.host
            );
            return;
        };
        for command in &commands {
            debug!("Sending command {:?} to {}", command, self.host);
            if let Err(e) = client.set_control_values(command).await {
                warn!(
                    "Skipping command [{:?}] to device {}: {}",
                    command, self.host, e
                );
                break;
            }
        }
        // Shortcut the sleeping cycle so the next poll reflects the change
        self.poke.notify_one();
    }

    /// Stops the observe loop and tears the session down. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.poke.notify_one();
        self.disconnect().await;
    }

    /// Loops over connection attempts until a session exists or the bridge is
    /// cancelled. Failed attempts publish OFFLINE (gated).
    async fn ensure_connected(&self, publisher: &dyn StatePublisher) -> bool {
        while !self.cancel.is_cancelled() {
            if self.client.lock().await.is_some() {
                return true;
            }
            if self.connect().await {
                return true;
            }
            self.signal_offline(publisher).await;
        }
        false
    }

    /// One connection attempt under the connection mutex. A timeout retries
    /// immediately, a network error backs off first.
    async fn connect(&self) -> bool {
        let mut guard = self.client.lock().await;
        if guard.is_some() {
            debug!("Client already connected");
            return true;
        }

        info!("Starting new CoAP connection to {}", self.host);
        let attempt = self.connector.connect(&self.host);
        let result = if self.connection_timeout.is_zero() {
            attempt.await
        } else {
            match timeout(self.connection_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(CoapError::Timeout),
            }
        };
        match result {
            Ok(client) => {
                info!("Established new CoAP connection to {}", self.host);
                *guard = Some(client);
                true
            }
            Err(CoapError::Timeout) => {
                error!(
                    "Timeout while trying to establish connection to {}",
                    self.host
                );
                false
            }
            Err(e) => {
                error!(
                    "Error while trying to establish connection to {}: {}",
                    self.host, e
                );
                drop(guard);
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = sleep(CONNECT_BACKOFF) => {}
                }
                false
            }
        }
    }

    async fn disconnect(&self) {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.take() {
            client.shutdown().await;
        }
    }

    /// Runs one status poll, bounded by the request watchdog. Returns the
    /// next cycle time on success, `None` when the poll failed and the
    /// connect path should run again.
    async fn poll_status(&self, publisher: &dyn StatePublisher) -> Option<Duration> {
        let client = self.client.lock().await.clone()?;
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            result = timeout(self.status_timeout, client.get_status()) => result,
        };
        match result {
            Err(_) => {
                warn!(
                    "No status from {} in the last {} seconds: setting to offline",
                    self.host,
                    self.status_timeout.as_secs()
                );
                self.signal_offline(publisher).await;
                self.disconnect().await;
                None
            }
            Ok(Err(CoapError::Shutdown)) => {
                // Keep the session; the outer loop retries on it
                debug!("Status request for {} abandoned, client shut down", self.host);
                None
            }
            Ok(Err(e @ CoapError::Validation(_))) => {
                warn!(
                    "Skipping current status update of device {}: {}",
                    self.host, e
                );
                self.disconnect().await;
                self.signal_offline(publisher).await;
                None
            }
            Ok(Err(e)) => {
                warn!("Could not fetch status of device {}: {}", self.host, e);
                self.disconnect().await;
                self.signal_offline(publisher).await;
                None
            }
            Ok(Ok((status, max_age))) => {
                {
                    let mut state = self.state.lock().await;
                    state.replace_raw(status);
                }
                self.signal_online(publisher).await;
                {
                    let state = self.state.lock().await;
                    publisher.publish_state(&self.host, &state).await;
                }
                Some(MIN_CYCLE.max(Duration::from_secs(max_age.saturating_sub(CYCLE_SLACK))))
            }
        }
    }

    /// Returns the current session, attempting a single connect when absent.
    async fn connected_client(&self) -> Option<Arc<dyn CoapClient>> {
        if let Some(client) = self.client.lock().await.clone() {
            return Some(client);
        }
        self.connect().await;
        self.client.lock().await.clone()
    }

    /// The `was_online` mirror is flipped before publishing, so a redundant
    /// transition never publishes and a failed publish is not retried.
    async fn signal_online(&self, publisher: &dyn StatePublisher) {
        if self.was_online.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Device {} is now ONLINE", self.host);
        publisher.publish_online(&self.host).await;
    }

    async fn signal_offline(&self, publisher: &dyn StatePublisher) {
        if !self.was_online.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Device {} is now OFFLINE", self.host);
        publisher.publish_offline(&self.host).await;
    }
}

/// Supervises one [`DeviceBridge`] per configured device.
pub struct BridgeGroup {
    bridges: HashMap<String, Arc<DeviceBridge>>,
    cancel: CancellationToken,
}

impl BridgeGroup {
    /// Builds the bridges for the configured `(host, model)` pairs. Unknown
    /// device models refuse to start.
    pub fn new(
        config: &crate::config::CoapConfig,
        connector: Arc<dyn CoapConnector>,
    ) -> Result<Self, BridgeError> {
        let cancel = CancellationToken::new();
        let mut bridges = HashMap::new();
        for (host, model) in &config.devices {
            let state = crate::device::create(model).ok_or_else(|| BridgeError::UnknownModel {
                host: host.clone(),
                model: model.clone(),
            })?;
            debug!("Created {} bridge for {}", state.model_name(), host);
            let bridge = DeviceBridge::new(
                host.clone(),
                state,
                connector.clone(),
                Duration::from_secs(config.connection_timeout),
                Duration::from_secs(config.status_timeout),
                cancel.child_token(),
            );
            bridges.insert(host.clone(), Arc::new(bridge));
        }
        Ok(Self { bridges, cancel })
    }

    /// Runs every bridge observer under one task group. A bridge ending (or
    /// panicking) is logged and does not tear down its siblings; group
    /// cancellation stops them all.
    pub async fn observe(&self, publisher: Arc<dyn StatePublisher>) {
        info!("Started to observe {} device(s)", self.bridges.len());
        let mut observers = JoinSet::new();
        for bridge in self.bridges.values() {
            let bridge = bridge.clone();
            let publisher = publisher.clone();
            observers.spawn(async move { bridge.observe(publisher).await });
        }
        while let Some(result) = observers.join_next().await {
            if let Err(e) = result {
                error!("Bridge observer task failed: {}", e);
            }
        }
    }

    /// Cancels and disconnects every bridge, concurrently.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut tasks = JoinSet::new();
        for bridge in self.bridges.values() {
            let bridge = bridge.clone();
            tasks.spawn(async move { bridge.shutdown().await });
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[async_trait]
impl CommandRouter for BridgeGroup {
    async fn send_update(&self, host: &str, attribute: &str, value: &str) {
        match self.bridges.get(host) {
            Some(bridge) => bridge.send_update(attribute, value).await,
            None => warn!("Dropping update for unknown device {}", host),
        }
    }
}

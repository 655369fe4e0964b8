//! CoAP client seam.
//!
//! The bridge only depends on these traits; the UDP transport in
//! [`transport`] is the production implementation, tests substitute scripted
//! clients.

pub mod transport;

use crate::device::RawStatus;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Failure modes a CoAP session can report.
#[derive(Debug, Clone, Error)]
pub enum CoapError {
    /// No response within the retransmission schedule.
    #[error("request timed out")]
    Timeout,
    /// Transport-level failure (socket error, peer reset, unreachable host).
    #[error("network error: {0}")]
    Network(String),
    /// The peer answered with something that cannot be trusted: an error
    /// response, a malformed payload or an undecodable value.
    #[error("invalid device response: {0}")]
    Validation(String),
    /// The client was shut down while the operation was pending.
    #[error("client is shut down")]
    Shutdown,
}

/// One established session to a device.
#[async_trait]
pub trait CoapClient: Send + Sync {
    /// Fetches the raw status dictionary and the device-reported max-age in
    /// seconds.
    async fn get_status(&self) -> Result<(RawStatus, u64), CoapError>;

    /// Pushes one control command (a minimal raw sub-mapping) to the device.
    async fn set_control_values(&self, data: &RawStatus) -> Result<(), CoapError>;

    /// Tears the session down; pending and subsequent operations fail with
    /// [`CoapError::Shutdown`].
    async fn shutdown(&self);
}

/// Establishes sessions; one connector serves every bridge.
#[async_trait]
pub trait CoapConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn CoapClient>, CoapError>;
}

//! Gateway backend
//!
//! Bridges the simulated radio domain and a topic based publish/subscribe
//! broker:
//! - uplinks are published to `gateway/<gatewayID>/rx`
//! - downlinks arrive on `gateway/+/tx` and are handed out through an
//!   [`InboundQueue`]
//! - connection and subscription are retried with a fixed delay
//! - [`Gateway::close`] drains in-flight deliveries before closing the queue

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Broker backed gateway implementation
pub mod gateway;

/// In-flight handler barrier
pub mod in_flight;

/// MQTT broker client
pub mod mqtt;

/// Retry policy
pub mod retry;

/// Broker abstraction
pub mod transport;

pub use gateway::{BackendOptions, GatewayBackend};
pub use in_flight::{InFlight, InFlightGuard};
pub use mqtt::MqttBroker;
pub use retry::RetryPolicy;
pub use transport::{
    Broker, InboundMessage, LinkEvent, LinkEventHandler, MessageHandler, QoS, TransportError,
};

use crate::radio::{DownlinkFrame, UplinkFrame};

/// Downlink topic, wildcard over the gateway id
pub const DOWNLINK_TOPIC: &str = "gateway/+/tx";

/// Uplink topic for the given gateway
pub fn uplink_topic(gateway_id: &crate::config::EUI64) -> String {
    format!("gateway/{gateway_id}/rx")
}

/// Gateway backend errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Broker unreachable
    #[error("backend/gateway: connection error: {0}")]
    Connection(String),

    /// Subscription rejected
    #[error("backend/gateway: subscribe error on {topic}: {reason}")]
    Subscribe {
        /// Topic
        topic: String,
        /// Broker supplied reason
        reason: String,
    },

    /// Unsubscribe rejected during close
    #[error("backend/gateway: unsubscribe error on {topic}: {reason}")]
    Unsubscribe {
        /// Topic
        topic: String,
        /// Broker supplied reason
        reason: String,
    },

    /// Publish failed or was not acknowledged
    #[error("backend/gateway: publish rx packet failed: {0}")]
    Publish(String),

    /// Outbound frame could not be encoded
    #[error("backend/gateway: rx packet marshal error: {0}")]
    Encode(String),

    /// Inbound envelope or frame could not be decoded
    #[error("backend/gateway: tx packet decode error: {0}")]
    Decode(String),
}

/// Receiving side of the downlink delivery queue
///
/// Cloneable handle; all clones share one underlying queue, so each frame is
/// delivered to exactly one consumer.
#[derive(Debug, Clone)]
pub struct InboundQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DownlinkFrame>>>,
}

impl InboundQueue {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<DownlinkFrame>) -> Self {
        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Wait for the next downlink; `None` once the backend is closed and the
    /// queue is drained
    pub async fn recv(&self) -> Option<DownlinkFrame> {
        self.rx.lock().await.recv().await
    }

    /// Next downlink if one is already queued
    pub fn try_recv(&self) -> Option<DownlinkFrame> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// Gateway as seen by the simulated device
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Publish an uplink, returning once the broker acknowledged it
    async fn send_uplink(&self, frame: &UplinkFrame) -> Result<(), BackendError>;

    /// Handle to the downlink delivery queue
    fn inbound(&self) -> InboundQueue;

    /// Unsubscribe, drain in-flight deliveries and close the queue
    async fn close(&self) -> Result<(), BackendError>;
}

#[async_trait]
impl<G: Gateway + ?Sized> Gateway for Arc<G> {
    async fn send_uplink(&self, frame: &UplinkFrame) -> Result<(), BackendError> {
        (**self).send_uplink(frame).await
    }

    fn inbound(&self) -> InboundQueue {
        (**self).inbound()
    }

    async fn close(&self) -> Result<(), BackendError> {
        (**self).close().await
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Broker delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce,
    /// Acknowledged delivery
    AtLeastOnce,
    /// Four-way handshake delivery
    ExactlyOnce,
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Callback invoked by the broker for every message on a subscription.
///
/// Invocations may overlap.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connected or reconnected
    Connected {
        /// Broker kept the previous session
        session_present: bool,
    },
    /// Connection lost
    Disconnected {
        /// Reason reported by the client
        reason: String,
    },
    /// Automatic reconnect in progress
    Reconnecting {
        /// Attempt number
        attempt: u32,
    },
    /// Automatic reconnect gave up an attempt
    ReconnectFailed {
        /// Failure reported by the client
        error: String,
    },
}

/// Callback for connection lifecycle notifications
pub type LinkEventHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

/// Failure reported by a broker client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    /// Wrap any displayable client error
    pub fn new(err: impl std::fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Publish/subscribe broker client
///
/// Abstracts the broker connection the same way the radio trait abstracts
/// transceiver hardware: the gateway backend only talks to this trait.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open the connection
    async fn connect(&self) -> Result<(), TransportError>;

    /// Register a connection lifecycle callback
    async fn on_link_event(&self, handler: LinkEventHandler) -> Result<(), TransportError>;

    /// Subscribe to `topic`, delivering every message to `handler`
    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<(), TransportError>;

    /// Remove the subscription on `topic`
    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Publish `payload` on `topic`, waiting for the acknowledgement `qos` implies
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), TransportError>;
}

//! Transport boundary.
//!
//! The session drives a thin publish/subscribe client through this trait
//! and receives inbound publishes on an mpsc channel handed out at attach
//! time. Delivery guarantees are the broker's business: publishes go out
//! fire-and-forget at-most-once, subscriptions request exactly-once where
//! the transport supports it.

use async_trait::async_trait;

/// MQTT-style delivery quality levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// An inbound publish delivered to this device.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Errors from the publish/subscribe transport. Never fatal to the
/// session: retryable failures trigger a reconnect-and-resubscribe cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connect failed: {reason}")]
    Connect { reason: String },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("publish failed on {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe failed on {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("unsubscribe failed on {topic}: {reason}")]
    Unsubscribe { topic: String, reason: String },
}

impl TransportError {
    /// Returns `true` for transient failures worth a reconnect attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::Connect { .. } | Self::ConnectionLost { .. }
        )
    }
}

/// Thin publish/subscribe client the session depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;
}

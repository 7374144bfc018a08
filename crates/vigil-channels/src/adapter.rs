use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use vigil_core::VigilError;

/// A message from the operator as the transport reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport-assigned id; the de-duplication key.
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Items delivered on a live stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(InboundMessage),
    /// The stream hit an error and will deliver nothing further.
    Error(TransportError),
}

/// Acknowledgement of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(message_id: Option<String>) -> Self {
        Self {
            message_id,
            delivered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Network blips, 5xx, dropped sockets. Worth retrying.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Credentials rejected. Retrying cannot help.
    #[error("transport authentication failed: {0}")]
    Auth(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
}

impl From<TransportError> for VigilError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transient(msg) => VigilError::TransientTransport(msg),
            TransportError::Auth(msg) => VigilError::UnrecoverableAuth(msg),
        }
    }
}

/// Raw capability of one messaging channel.
///
/// Implementations do no retrying of their own; [`crate::ResilientTransport`]
/// owns retry, fallback, and de-duplication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Channel name used in session keys, e.g. "relay".
    fn name(&self) -> &str;

    /// Open the live stream. The receiver closing counts as a stream error.
    async fn connect(&self) -> Result<mpsc::Receiver<StreamEvent>, TransportError>;

    async fn send(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt, TransportError>;

    /// Messages after `cursor` (a message id), in the transport's order.
    /// `None` means from the beginning of retained history.
    async fn poll_history_since(&self, cursor: Option<&str>) -> Result<Vec<InboundMessage>, TransportError>;

    async fn set_typing(&self, conversation_id: &str, on: bool) -> Result<(), TransportError>;
}

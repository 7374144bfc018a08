use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one logical conversation, `"channel:conversation-id"`.
pub type SessionKey = String;

/// Unique identifier for a scheduled job.
pub type JobId = Uuid;

/// Channel name used for operator input typed into the daemon's own console.
pub const LOCAL_CHANNEL: &str = "local";

/// Conversation id of the console session.
pub const LOCAL_CONVERSATION: &str = "console";

/// Build the session key for a conversation on a channel.
pub fn session_key(channel: &str, conversation_id: &str) -> SessionKey {
    format!("{channel}:{conversation_id}")
}

/// Where a reply should be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub channel: String,
    pub conversation_id: String,
}

impl ReplyTarget {
    pub fn new(channel: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// The console session of the local daemon.
    pub fn local() -> Self {
        Self::new(LOCAL_CHANNEL, LOCAL_CONVERSATION)
    }

    pub fn session_key(&self) -> SessionKey {
        session_key(&self.channel, &self.conversation_id)
    }

    pub fn is_local(&self) -> bool {
        self.channel == LOCAL_CHANNEL
    }
}

/// The sole authorized controller of identity, config, and permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    /// Sender id as the transport reports it.
    pub operator_id: String,
    pub imprinted_at: DateTime<Utc>,
}

impl OperatorIdentity {
    pub fn new(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: operator_id.into(),
            imprinted_at: Utc::now(),
        }
    }

    /// Local console input always comes from the operator.
    pub fn authorizes(&self, channel: &str, sender: &str) -> bool {
        channel == LOCAL_CHANNEL || self.operator_id == sender
    }
}

use serde::{Deserialize, Serialize};

use causerie_shared::types::{ConversationId, UserId};

use crate::models::{CallRow, MessageRow};

/// Typed envelope for everything the change feed can deliver.
///
/// The feed payloads are validated into this enum at the boundary; the state
/// machines behind it never see raw backend payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    MessageInserted(MessageRow),
    MessageUpdated(MessageRow),
    CallInserted(CallRow),
    CallUpdated(CallRow),
    /// Full snapshot of who is online; replaces any previous state.
    PresenceSync { online: Vec<UserId> },
    /// Fire-and-forget typing broadcast; at-most-once, never persisted.
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        username: String,
    },
}

impl FeedEvent {
    /// The conversation this event belongs to, when it has one.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::MessageInserted(row) | Self::MessageUpdated(row) => Some(row.conversation_id),
            Self::CallInserted(row) | Self::CallUpdated(row) => Some(row.conversation_id),
            Self::Typing {
                conversation_id, ..
            } => Some(*conversation_id),
            Self::PresenceSync { .. } => None,
        }
    }
}

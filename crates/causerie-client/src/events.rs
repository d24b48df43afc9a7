use serde::Serialize;
use tokio::sync::mpsc;

use causerie_media::IncomingCall;
use causerie_shared::types::{CallStatus, ConversationId, MessageId, UserId};

/// Events handed to the embedding UI layer over a channel.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    /// A message landed (confirmed or from the peer).
    NewMessage {
        conversation_id: ConversationId,
        sender_id: UserId,
        message_id: MessageId,
    },
    /// An existing message changed (read receipt, moderation).
    MessagesChanged { conversation_id: ConversationId },
    /// The conversation list (order, previews, unread counts) changed.
    ConversationsChanged,
    PresenceChanged { online_count: usize },
    TypingChanged { conversation_id: ConversationId },
    IncomingCall(IncomingCall),
    CallStateChanged { status: CallStatus },
}

pub(crate) fn emit(tx: &mpsc::UnboundedSender<SessionEvent>, event: SessionEvent) {
    if tx.send(event).is_err() {
        tracing::error!("Failed to emit session event: receiver dropped");
    }
}

//! Row models exchanged with the remote store.
//!
//! Every struct derives `Serialize` and `Deserialize` because the change feed
//! is JSON-shaped; timestamps travel as RFC 3339 via chrono.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use causerie_shared::types::{
    CallId, CallStatus, CallType, CandidateRole, ConversationId, MessageId, MessageKind, UserId,
};

/// Canonical lookup key for a two-party conversation: the sorted identity
/// pair joined by a separator.  Both participants compute the same key, which
/// is what makes `find_or_create` idempotent under concurrent invocation.
pub fn canonical_pair_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// One conversation row.  Never hard-deleted; participants can only lose
/// their membership row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRow {
    /// Unique conversation identifier.
    pub id: ConversationId,
    /// Sorted pair key for two-party conversations; `None` for groups.
    pub canonical_key: Option<String>,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
    /// Creation time of the newest accepted message.  Monotonic
    /// non-decreasing; advanced only by the store on message insert.
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn new_pair(a: UserId, b: UserId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ConversationId::new(),
            canonical_key: Some(canonical_pair_key(a, b)),
            pinned: false,
            muted: false,
            archived: false,
            last_message_at: None,
            created_at,
        }
    }
}

/// Membership row linking a user to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRow {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

/// Public profile of a participant, owned by the auth collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRow {
    pub id: UserId,
    pub username: String,
    pub avatar_url: Option<String>,
    /// While this timestamp is in the future the user may not send messages.
    pub muted_until: Option<DateTime<Utc>>,
}

impl ProfileRow {
    pub fn new(id: UserId, username: &str) -> Self {
        Self {
            id,
            username: username.to_string(),
            avatar_url: None,
            muted_until: None,
        }
    }

    pub fn is_muted_at(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.map(|until| until > now).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single message row.  Immutable once delivered except for `read_at` and
/// the moderation soft-delete flag.  The `pending`/`failed` lifecycle is
/// client-local and never crosses this boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRow {
    /// Caller-generated, globally unique.  The optimistic entry and the
    /// feed-confirmed row carry the same id, which is what reconciliation
    /// merges on.
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    /// base64(nonce || ciphertext), XChaCha20-Poly1305.
    pub ciphertext: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    /// Client-assigned at creation; authoritative for display ordering.
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_by_admin: bool,
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// Shared call-session row mutated by both peers.  Only additive
/// (append-to-list) and monotonic (status transition, write-once
/// offer/answer) mutations are permitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallRow {
    pub id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub call_type: CallType,
    pub status: CallStatus,
    /// Session description from the caller, write-once.
    pub offer: Option<String>,
    /// Session description from the callee, write-once.
    pub answer: Option<String>,
    /// Append-only, deduplicated by literal value.
    pub caller_candidates: Vec<String>,
    pub callee_candidates: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl CallRow {
    pub fn candidates(&self, role: CandidateRole) -> &[String] {
        match role {
            CandidateRole::Caller => &self.caller_candidates,
            CandidateRole::Callee => &self.callee_candidates,
        }
    }

    /// The role `user` plays in this call, if they are part of it at all.
    pub fn role_of(&self, user: UserId) -> Option<CandidateRole> {
        if user == self.caller_id {
            Some(CandidateRole::Caller)
        } else if user == self.callee_id {
            Some(CandidateRole::Callee)
        } else {
            None
        }
    }

    pub fn peer_of(&self, user: UserId) -> UserId {
        if user == self.caller_id {
            self.callee_id
        } else {
            self.caller_id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(canonical_pair_key(a, b), canonical_pair_key(b, a));
    }

    #[test]
    fn test_canonical_key_distinct_pairs() {
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        assert_ne!(canonical_pair_key(a, b), canonical_pair_key(a, c));
    }

    #[test]
    fn test_muted_until_in_past_is_not_muted() {
        let mut profile = ProfileRow::new(UserId::new(), "ana");
        let now = Utc::now();

        assert!(!profile.is_muted_at(now));

        profile.muted_until = Some(now - chrono::Duration::minutes(5));
        assert!(!profile.is_muted_at(now));

        profile.muted_until = Some(now + chrono::Duration::minutes(5));
        assert!(profile.is_muted_at(now));
    }

    #[test]
    fn test_call_roles() {
        let caller = UserId::new();
        let callee = UserId::new();
        let row = CallRow {
            id: CallId::new(),
            conversation_id: ConversationId::new(),
            caller_id: caller,
            callee_id: callee,
            call_type: CallType::Video,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            caller_candidates: vec![],
            callee_candidates: vec![],
            created_at: Utc::now(),
        };

        assert_eq!(row.role_of(caller), Some(CandidateRole::Caller));
        assert_eq!(row.role_of(callee), Some(CandidateRole::Callee));
        assert_eq!(row.role_of(UserId::new()), None);
        assert_eq!(row.peer_of(caller), callee);
    }
}

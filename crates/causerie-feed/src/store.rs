use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use causerie_shared::types::{
    CallId, CallStatus, CandidateRole, ConversationId, MessageId, UserId,
};

use crate::models::{CallRow, ConversationRow, MessageRow, ParticipantRow, ProfileRow};
use crate::subscription::FeedSubscription;

/// Errors produced by the feed boundary.
#[derive(Error, Debug)]
pub enum FeedError {
    /// Transient backend failure (network, storage).  Recovered locally by
    /// the caller: optimistic entries flip to `failed`, pagination keeps its
    /// cursor for a later retry.
    #[error("Feed backend error: {0}")]
    Backend(String),

    /// An insert hit a uniqueness constraint.  For conversations the caller
    /// falls back to re-reading the existing row; for messages this confirms
    /// a write that already happened.
    #[error("Row already exists")]
    Duplicate,

    /// A non-terminal call already exists for the conversation.
    #[error("A call is already active for this conversation")]
    ActiveCallExists,

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// The subscription or feed handle was already closed.
    #[error("Feed closed")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FeedError>;

/// Narrow contract over the remote change-feed + row store.
///
/// Implementations must provide the three atomic primitives the sync core
/// leans on instead of read-then-write sequences: insert-if-absent keyed on
/// the canonical conversation key, conditional (compare-and-swap) call
/// transitions, and per-role deduplicating candidate appends.
#[async_trait]
pub trait FeedStore: Send + Sync {
    // -- conversations ------------------------------------------------------

    /// Look up the two-party conversation for `(a, b)` by canonical key,
    /// creating it (with both membership rows) when absent.  Atomic: two
    /// concurrent invocations from both participants converge on one row.
    async fn find_or_create_conversation(&self, a: UserId, b: UserId) -> Result<ConversationRow>;

    /// All conversations `user` is currently a member of, with participants.
    async fn conversations_for(
        &self,
        user: UserId,
    ) -> Result<Vec<(ConversationRow, Vec<ParticipantRow>)>>;

    /// Remove a membership row.  The conversation stays visible to everyone
    /// else; it is never hard-deleted.
    async fn remove_participant(&self, conversation: ConversationId, user: UserId) -> Result<()>;

    async fn set_conversation_flags(
        &self,
        conversation: ConversationId,
        pinned: bool,
        muted: bool,
        archived: bool,
    ) -> Result<()>;

    // -- profiles -----------------------------------------------------------

    async fn get_profile(&self, user: UserId) -> Result<ProfileRow>;

    async fn upsert_profile(&self, profile: ProfileRow) -> Result<()>;

    // -- messages -----------------------------------------------------------

    /// Durable message write.  Unique on `id`; advances the conversation's
    /// `last_message_at` monotonically.
    async fn insert_message(&self, row: MessageRow) -> Result<()>;

    /// Newest-first page of messages strictly older than `before`
    /// (`None` = newest page).
    async fn messages_page(
        &self,
        conversation: ConversationId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageRow>>;

    /// Set `read_at = at` on every message in the conversation not authored
    /// by `reader` and not yet read.  Idempotent; returns the number of rows
    /// touched.
    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize>;

    async fn unread_count(&self, conversation: ConversationId, user: UserId) -> Result<usize>;

    /// Moderation soft-delete; the row survives, clients render a placeholder.
    async fn soft_delete_message(&self, id: MessageId) -> Result<()>;

    // -- calls --------------------------------------------------------------

    /// Insert a new ringing call.  Fails with [`FeedError::ActiveCallExists`]
    /// while the conversation already has a non-terminal call.
    async fn create_call(&self, row: CallRow) -> Result<()>;

    async fn get_call(&self, id: CallId) -> Result<CallRow>;

    /// Conditional status transition: applied only while the current status
    /// is in `allowed_from`.  Returns the updated row, or `None` when the
    /// precondition no longer holds (the transition already happened on the
    /// other side).
    async fn transition_call(
        &self,
        id: CallId,
        allowed_from: &[CallStatus],
        to: CallStatus,
    ) -> Result<Option<CallRow>>;

    /// Write-once answer; `None` when an answer is already set.
    async fn set_call_answer(&self, id: CallId, answer: String) -> Result<Option<CallRow>>;

    /// Atomically append a candidate to one role's list, deduplicating by
    /// literal value.  Returns whether the candidate was actually appended.
    /// No-op (`false`) on terminal calls.
    async fn append_ice_candidate(
        &self,
        id: CallId,
        role: CandidateRole,
        candidate: String,
    ) -> Result<bool>;

    // -- subscriptions ------------------------------------------------------

    /// Insert/update events for one conversation's messages.
    async fn subscribe_messages(&self, conversation: ConversationId) -> Result<FeedSubscription>;

    /// Insert/update events for messages in *any* conversation `user`
    /// belongs to.  Drives the conversation index while no conversation is
    /// open.
    async fn subscribe_inbox(&self, user: UserId) -> Result<FeedSubscription>;

    /// Call rows naming `user` as caller or callee.
    async fn subscribe_calls(&self, user: UserId) -> Result<FeedSubscription>;

    /// Join the presence channel as `user`.  Subscribing announces the user
    /// online; dropping the handle announces them offline.  Every membership
    /// change is delivered as a full [`FeedEvent::PresenceSync`] snapshot.
    async fn subscribe_presence(&self, user: UserId) -> Result<FeedSubscription>;

    /// Ephemeral typing broadcasts for one conversation.
    async fn subscribe_typing(&self, conversation: ConversationId) -> Result<FeedSubscription>;

    /// Fire-and-forget typing notification; at-most-once, never persisted.
    async fn broadcast_typing(
        &self,
        conversation: ConversationId,
        user: UserId,
        username: String,
    ) -> Result<()>;
}

/// Blob upload collaborator.  The core only ever treats the returned URL as
/// an opaque string on a message row.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String>;
}

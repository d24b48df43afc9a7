//! Session-local state shared across the facade's operations.

use std::time::Instant;

use causerie_feed::{FeedSubscription, ProfileRow};
use causerie_shared::crypto::SymmetricKey;
use causerie_shared::types::ConversationId;
use causerie_sync::{PresenceTracker, TypingState};

/// The conversation currently on screen, together with the realtime handles
/// scoped to it.  Dropping this closes both subscriptions.
pub struct ActiveConversation {
    pub id: ConversationId,
    /// The other participant's profile.
    pub peer: ProfileRow,
    /// Derived once on open; never stored anywhere else.
    pub key: SymmetricKey,
    pub chat_sub: FeedSubscription,
    pub typing_sub: FeedSubscription,
}

/// Central session state.
///
/// Holds the local profile, the open conversation (if any), and the
/// ephemeral presence/typing trackers.
pub struct SessionState {
    /// The local user's profile as issued by the auth collaborator.
    pub profile: ProfileRow,

    /// The open conversation; `None` while the user is on the overview.
    pub active: Option<ActiveConversation>,

    /// Who is online right now; rebuilt on every presence sync.
    pub presence: PresenceTracker,

    /// Per-conversation typing indicators with a short TTL.
    pub typing: TypingState,

    /// Last outgoing typing broadcast, for throttling.
    pub last_typing_broadcast: Option<Instant>,
}

impl SessionState {
    pub fn new(profile: ProfileRow) -> Self {
        Self {
            profile,
            active: None,
            presence: PresenceTracker::new(),
            typing: TypingState::new(),
            last_typing_broadcast: None,
        }
    }
}

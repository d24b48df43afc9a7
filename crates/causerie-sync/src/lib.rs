//! # causerie-sync
//!
//! Client-resident reconciliation state: the per-conversation message log
//! (optimistic writes, backward pagination, realtime merge), the
//! conversation index, and the ephemeral presence/typing trackers.
//!
//! Everything here is derived from the change feed and can be rebuilt from
//! it; nothing is persisted locally.

pub mod index;
pub mod messages;
pub mod presence;
pub mod typing;

mod error;

pub use error::{Result, SyncError};
pub use index::{ConversationIndex, ConversationSummary};
pub use messages::{LoadState, MessageEntry, MessageStore};
pub use presence::PresenceTracker;
pub use typing::TypingState;

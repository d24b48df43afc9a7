//! # causerie-shared
//!
//! Identity newtypes, constants and the conversation-key crypto boundary
//! shared by every Causerie crate.
//!
//! Conversation keys are never stored or transmitted: both sides derive the
//! same 32-byte key from public identifiers (see [`crypto`]).

pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use crypto::SymmetricKey;
pub use error::CryptoError;
pub use types::{CallId, CallStatus, CallType, CandidateRole, ConversationId, MessageId, MessageKind, UserId};

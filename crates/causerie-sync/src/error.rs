use thiserror::Error;

/// Errors produced by the sync layer.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Feed boundary error.
    #[error("Feed error: {0}")]
    Feed(#[from] causerie_feed::FeedError),

    /// Crypto boundary error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] causerie_shared::CryptoError),

    /// The local user's mute window has not elapsed yet.
    #[error("Sender is muted")]
    SenderMuted,

    /// An operation that needs an open conversation was called without one.
    #[error("No active conversation")]
    NoActiveConversation,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

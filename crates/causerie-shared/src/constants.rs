/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum plaintext message size in bytes (256 KiB)
pub const MAX_MESSAGE_SIZE: usize = 262_144;

/// Number of messages fetched per pagination page
pub const MESSAGE_PAGE_SIZE: usize = 30;

/// How long a typing indicator stays visible without a fresh broadcast
pub const TYPING_TTL_MS: u64 = 1_400;

/// Minimum interval between two outgoing typing broadcasts
pub const TYPING_BROADCAST_INTERVAL_MS: u64 = 1_000;

/// Realtime topic carrying presence join/leave for all users
pub const PRESENCE_TOPIC: &str = "online";

/// Key derivation context (BLAKE3)
pub const KDF_CONTEXT_CONVERSATION_KEY: &str = "causerie-conversation-key-v1";

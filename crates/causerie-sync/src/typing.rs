//! Typing indicators.
//!
//! One "currently typing" participant per conversation with a short TTL;
//! entries evaporate on read once the TTL elapses.  Purely client-local.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use causerie_shared::constants::TYPING_TTL_MS;
use causerie_shared::types::{ConversationId, UserId};

#[derive(Debug, Clone)]
struct Typist {
    user: UserId,
    username: String,
    seen_at: Instant,
}

#[derive(Debug)]
pub struct TypingState {
    ttl: Duration,
    typists: HashMap<ConversationId, Typist>,
}

impl TypingState {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_millis(TYPING_TTL_MS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            typists: HashMap::new(),
        }
    }

    /// Record a typing broadcast.  A fresh broadcast restarts the TTL.
    pub fn observe(&mut self, conversation: ConversationId, user: UserId, username: String) {
        self.typists.insert(
            conversation,
            Typist {
                user,
                username,
                seen_at: Instant::now(),
            },
        );
    }

    /// Who is typing in this conversation right now, if anyone.
    pub fn typist(&mut self, conversation: ConversationId) -> Option<(UserId, String)> {
        match self.typists.get(&conversation) {
            Some(typist) if typist.seen_at.elapsed() <= self.ttl => {
                Some((typist.user, typist.username.clone()))
            }
            Some(_) => {
                self.typists.remove(&conversation);
                None
            }
            None => None,
        }
    }

    /// Forget the indicator, e.g. when the conversation closes.
    pub fn clear(&mut self, conversation: ConversationId) {
        self.typists.remove(&conversation);
    }
}

impl Default for TypingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typist_visible_within_ttl() {
        let mut typing = TypingState::with_ttl(Duration::from_secs(60));
        let conv = ConversationId::new();
        let user = UserId::new();

        typing.observe(conv, user, "bob".into());
        assert_eq!(typing.typist(conv), Some((user, "bob".to_string())));
        assert_eq!(typing.typist(ConversationId::new()), None);
    }

    #[test]
    fn test_typist_expires_after_ttl() {
        let mut typing = TypingState::with_ttl(Duration::ZERO);
        let conv = ConversationId::new();

        typing.observe(conv, UserId::new(), "bob".into());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(typing.typist(conv), None);
        // Expired entry is gone, not just hidden.
        assert_eq!(typing.typist(conv), None);
    }

    #[test]
    fn test_newest_broadcast_wins() {
        let mut typing = TypingState::with_ttl(Duration::from_secs(60));
        let conv = ConversationId::new();
        let first = UserId::new();
        let second = UserId::new();

        typing.observe(conv, first, "ana".into());
        typing.observe(conv, second, "bob".into());
        assert_eq!(typing.typist(conv), Some((second, "bob".to_string())));
    }

    #[test]
    fn test_clear_removes_indicator() {
        let mut typing = TypingState::with_ttl(Duration::from_secs(60));
        let conv = ConversationId::new();

        typing.observe(conv, UserId::new(), "ana".into());
        typing.clear(conv);
        assert_eq!(typing.typist(conv), None);
    }
}

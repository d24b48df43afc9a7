//! Online-peer tracking.
//!
//! The presence channel delivers full snapshots; local state is rebuilt
//! wholesale on every sync and never persisted.

use std::collections::HashSet;

use tracing::debug;

use causerie_shared::types::UserId;

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashSet<UserId>,
}

impl PresenceTracker {
    /// Create a new, empty presence tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the online set with a fresh snapshot from the feed.
    pub fn on_sync(&mut self, online: impl IntoIterator<Item = UserId>) {
        self.online = online.into_iter().collect();
        debug!(count = self.online.len(), "presence resynced");
    }

    /// Drop all state, e.g. when the presence subscription closes.
    pub fn clear(&mut self) {
        self.online.clear();
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.online.contains(&user)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Snapshot of everyone currently online.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.iter().copied().collect();
        users.sort();
        users
    }
}

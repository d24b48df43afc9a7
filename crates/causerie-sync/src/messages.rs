//! Per-conversation message log.
//!
//! The log is the merge of locally-created optimistic entries with
//! feed-confirmed rows, converging on exactly one entry per message id.
//! Display order is always `(created_at, id)` ascending; reconciliation only
//! flips status flags in place, it never reorders what is already shown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use causerie_feed::{FeedError, FeedStore, MessageRow};
use causerie_shared::crypto::{open_text, seal_text, SymmetricKey};
use causerie_shared::types::{ConversationId, MessageId, MessageKind, UserId};

use crate::error::Result;

/// Rendered in place of a payload that cannot be decrypted.
pub const DECRYPT_PLACEHOLDER: &str = "[déchiffrement impossible]";

/// Rendered in place of a moderation-deleted payload.
pub const DELETED_PLACEHOLDER: &str = "[message supprimé]";

/// A display-ready message: decrypted content plus the local delivery
/// lifecycle (`pending` → confirmed, or `pending` → `failed`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub pending: bool,
    pub failed: bool,
    pub deleted_by_admin: bool,
}

impl MessageEntry {
    fn from_row(row: &MessageRow, key: &SymmetricKey) -> Self {
        let content = if row.deleted_by_admin {
            DELETED_PLACEHOLDER.to_string()
        } else {
            open_text(key, &row.ciphertext).unwrap_or_else(|_| {
                debug!(message = %row.id, "undecryptable payload, rendering placeholder");
                DECRYPT_PLACEHOLDER.to_string()
            })
        };

        Self {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            content,
            kind: row.kind,
            media_url: row.media_url.clone(),
            created_at: row.created_at,
            read_at: row.read_at,
            pending: false,
            failed: false,
            deleted_by_admin: row.deleted_by_admin,
        }
    }
}

/// History-loading state for one conversation.  `Loaded { has_more: false }`
/// is terminal for history; live inserts still arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Empty,
    Loading,
    Loaded {
        has_more: bool,
    },
    LoadingMore,
}

#[derive(Debug, Default)]
struct MessageLog {
    entries: Vec<MessageEntry>,
    state: LoadState,
    /// Creation time of the oldest materialized message; the exclusive upper
    /// bound of the next history fetch.  Monotonically non-increasing.
    oldest_loaded_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoreState {
    active: Option<ConversationId>,
    /// Bumped on every activation; an in-flight fetch whose snapshot no
    /// longer matches discards its result on arrival.
    generation: u64,
    logs: HashMap<ConversationId, MessageLog>,
}

pub struct MessageStore {
    feed: Arc<dyn FeedStore>,
    self_id: UserId,
    page_size: usize,
    state: Mutex<StoreState>,
}

impl MessageStore {
    pub fn new(feed: Arc<dyn FeedStore>, self_id: UserId, page_size: usize) -> Self {
        Self {
            feed,
            self_id,
            page_size,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Make `conversation` the active one.  Any page fetch still in flight
    /// for the previous activation is ignored when it resolves.
    pub fn activate(&self, conversation: ConversationId) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.active = Some(conversation);
        state.logs.entry(conversation).or_default();
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.state.lock().unwrap().active
    }

    /// Fetch the newest page and replace the in-memory log.
    pub async fn load_initial(
        &self,
        conversation: ConversationId,
        key: &SymmetricKey,
    ) -> Result<()> {
        let (generation, previous) = {
            let mut state = self.state.lock().unwrap();
            let log = state.logs.entry(conversation).or_default();
            if matches!(log.state, LoadState::Loading | LoadState::LoadingMore) {
                return Ok(());
            }
            let previous = log.state;
            log.state = LoadState::Loading;
            (state.generation, previous)
        };

        let result = self
            .feed
            .messages_page(conversation, None, self.page_size)
            .await;

        let mut state = self.state.lock().unwrap();
        let stale = state.generation != generation;
        let log = state.logs.entry(conversation).or_default();

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                log.state = previous;
                return Err(e.into());
            }
        };

        if stale {
            debug!(conversation = %conversation, "discarding stale initial page");
            log.state = previous;
            return Ok(());
        }

        let has_more = page.len() == self.page_size;
        log.entries = page.iter().rev().map(|row| MessageEntry::from_row(row, key)).collect();
        log.oldest_loaded_at = log.entries.first().map(|e| e.created_at);
        log.state = LoadState::Loaded { has_more };
        Ok(())
    }

    /// Fetch the page strictly older than the current cursor and prepend it.
    ///
    /// No-op while another load is in flight or once history is exhausted.
    /// Returns whether a page was applied.
    pub async fn load_older(
        &self,
        conversation: ConversationId,
        key: &SymmetricKey,
    ) -> Result<bool> {
        let (cursor, generation) = {
            let mut state = self.state.lock().unwrap();
            let generation = state.generation;
            let Some(log) = state.logs.get_mut(&conversation) else {
                return Ok(false);
            };
            match log.state {
                LoadState::Loaded { has_more: true } => {}
                _ => return Ok(false),
            }
            let Some(cursor) = log.oldest_loaded_at else {
                return Ok(false);
            };
            log.state = LoadState::LoadingMore;
            (cursor, generation)
        };

        let result = self
            .feed
            .messages_page(conversation, Some(cursor), self.page_size)
            .await;

        let mut state = self.state.lock().unwrap();
        let stale = state.generation != generation || state.active != Some(conversation);
        let log = state.logs.entry(conversation).or_default();

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                // has_more unchanged; a later scroll can retry.
                log.state = LoadState::Loaded { has_more: true };
                return Err(e.into());
            }
        };

        if stale {
            debug!(conversation = %conversation, "discarding stale history page");
            log.state = LoadState::Loaded { has_more: true };
            return Ok(false);
        }

        let has_more = page.len() == self.page_size;
        let older: Vec<MessageEntry> = page
            .iter()
            .rev()
            .map(|row| MessageEntry::from_row(row, key))
            .collect();
        if let Some(first) = older.first() {
            log.oldest_loaded_at = Some(first.created_at);
        }
        log.entries.splice(0..0, older);
        log.state = LoadState::Loaded { has_more };
        Ok(true)
    }

    /// Optimistic send: the entry appears immediately as `pending`, then the
    /// durable write happens.  A transient write failure flips the entry to
    /// `failed` in place; it is never dropped and never retried
    /// automatically (see [`MessageStore::retry`]).
    pub async fn send(
        &self,
        conversation: ConversationId,
        key: &SymmetricKey,
        plaintext: &str,
        kind: MessageKind,
        media_url: Option<String>,
    ) -> Result<MessageId> {
        let ciphertext = seal_text(key, plaintext)?;
        let row = MessageRow {
            id: MessageId::new(),
            conversation_id: conversation,
            sender_id: self.self_id,
            ciphertext,
            kind,
            media_url: media_url.clone(),
            created_at: Utc::now(),
            read_at: None,
            deleted_by_admin: false,
        };

        {
            let mut state = self.state.lock().unwrap();
            let log = state.logs.entry(conversation).or_default();
            let entry = MessageEntry {
                id: row.id,
                conversation_id: conversation,
                sender_id: self.self_id,
                content: plaintext.to_string(),
                kind,
                media_url,
                created_at: row.created_at,
                read_at: None,
                pending: true,
                failed: false,
                deleted_by_admin: false,
            };
            insert_sorted(&mut log.entries, entry);
        }

        let id = row.id;
        match self.feed.insert_message(row).await {
            // Confirmation arrives as a feed echo and reconciles by id.
            Ok(()) => {}
            // The write was already durable (e.g. a retried duplicate).
            Err(FeedError::Duplicate) => self.settle(conversation, id, false),
            Err(e) => {
                warn!(message = %id, error = %e, "message write failed, flagging entry");
                self.settle(conversation, id, true);
            }
        }
        Ok(id)
    }

    /// User-visible retry affordance for a `failed` entry.  Returns whether
    /// the entry is back on the wire (or turned out to be durable already).
    pub async fn retry(
        &self,
        conversation: ConversationId,
        key: &SymmetricKey,
        message_id: MessageId,
    ) -> Result<bool> {
        let (content, kind, media_url, created_at) = {
            let mut state = self.state.lock().unwrap();
            let Some(log) = state.logs.get_mut(&conversation) else {
                return Ok(false);
            };
            let Some(entry) = log.entries.iter_mut().find(|e| e.id == message_id) else {
                return Ok(false);
            };
            if !entry.failed {
                return Ok(false);
            }
            entry.failed = false;
            entry.pending = true;
            (
                entry.content.clone(),
                entry.kind,
                entry.media_url.clone(),
                entry.created_at,
            )
        };

        let row = MessageRow {
            id: message_id,
            conversation_id: conversation,
            sender_id: self.self_id,
            ciphertext: seal_text(key, &content)?,
            kind,
            media_url,
            created_at,
            read_at: None,
            deleted_by_admin: false,
        };

        match self.feed.insert_message(row).await {
            Ok(()) => Ok(true),
            Err(FeedError::Duplicate) => {
                self.settle(conversation, message_id, false);
                Ok(true)
            }
            Err(e) => {
                warn!(message = %message_id, error = %e, "retry failed");
                self.settle(conversation, message_id, true);
                Ok(false)
            }
        }
    }

    /// Idempotent realtime merge.  An entry that already exists (optimistic
    /// path or duplicate feed delivery) only has its lifecycle flags cleared
    /// in place; a new row is inserted in `(created_at, id)` order.  Returns
    /// whether local state actually changed, so a duplicate delivery is
    /// recognizable as a no-op.
    pub fn on_remote_insert(&self, row: &MessageRow, key: &SymmetricKey) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(log) = state.logs.get_mut(&row.conversation_id) else {
            return false;
        };

        if let Some(entry) = log.entries.iter_mut().find(|e| e.id == row.id) {
            let confirmed = entry.pending || entry.failed;
            entry.pending = false;
            entry.failed = false;
            confirmed
        } else {
            insert_sorted(&mut log.entries, MessageEntry::from_row(row, key));
            true
        }
    }

    /// Apply `read_at` / moderation updates onto the local entry.  Returns
    /// whether anything changed.
    pub fn on_remote_update(&self, row: &MessageRow) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(log) = state.logs.get_mut(&row.conversation_id) else {
            return false;
        };
        let Some(entry) = log.entries.iter_mut().find(|e| e.id == row.id) else {
            return false;
        };

        let mut changed = false;
        if entry.read_at != row.read_at {
            entry.read_at = row.read_at;
            changed = true;
        }
        if row.deleted_by_admin && !entry.deleted_by_admin {
            entry.deleted_by_admin = true;
            entry.content = DELETED_PLACEHOLDER.to_string();
            changed = true;
        }
        changed
    }

    /// Mark every message not authored by us as read, durably and locally.
    /// The only place `read_at` is set from this side; safe to call
    /// repeatedly.
    pub async fn mark_read(&self, conversation: ConversationId) -> Result<usize> {
        let now = Utc::now();
        let touched = self.feed.mark_read(conversation, self.self_id, now).await?;

        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.logs.get_mut(&conversation) {
            for entry in log.entries.iter_mut() {
                if entry.sender_id != self.self_id && entry.read_at.is_none() {
                    entry.read_at = Some(now);
                }
            }
        }
        Ok(touched)
    }

    pub fn entries(&self, conversation: ConversationId) -> Vec<MessageEntry> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&conversation)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    pub fn load_state(&self, conversation: ConversationId) -> LoadState {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&conversation)
            .map(|log| log.state)
            .unwrap_or_default()
    }

    pub fn oldest_loaded_at(&self, conversation: ConversationId) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&conversation)
            .and_then(|log| log.oldest_loaded_at)
    }

    fn settle(&self, conversation: ConversationId, id: MessageId, failed: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(log) = state.logs.get_mut(&conversation) {
            if let Some(entry) = log.entries.iter_mut().find(|e| e.id == id) {
                entry.pending = false;
                entry.failed = failed;
            }
        }
    }
}

fn insert_sorted(entries: &mut Vec<MessageEntry>, entry: MessageEntry) {
    let at = entries
        .partition_point(|e| (e.created_at, e.id) <= (entry.created_at, entry.id));
    entries.insert(at, entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_feed::InMemoryFeed;
    use causerie_shared::crypto::derive_conversation_key;
    use chrono::Duration;

    struct Fixture {
        feed: InMemoryFeed,
        store: Arc<MessageStore>,
        me: UserId,
        peer: UserId,
        conversation: ConversationId,
        key: SymmetricKey,
    }

    async fn fixture() -> Fixture {
        let feed = InMemoryFeed::new();
        let me = UserId::new();
        let peer = UserId::new();
        let conversation = feed
            .find_or_create_conversation(me, peer)
            .await
            .unwrap()
            .id;
        let key = derive_conversation_key(conversation, &[me, peer]);
        let store = Arc::new(MessageStore::new(Arc::new(feed.clone()), me, 30));
        store.activate(conversation);
        Fixture {
            feed,
            store,
            me,
            peer,
            conversation,
            key,
        }
    }

    async fn seed_from_peer(f: &Fixture, n: i64) {
        let base = Utc::now() - Duration::hours(1);
        for i in 0..n {
            let row = MessageRow {
                id: MessageId::new(),
                conversation_id: f.conversation,
                sender_id: f.peer,
                ciphertext: seal_text(&f.key, &format!("msg {i}")).unwrap(),
                kind: MessageKind::Text,
                media_url: None,
                created_at: base + Duration::seconds(i),
                read_at: None,
                deleted_by_admin: false,
            };
            f.feed.insert_message(row).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_optimistic_send_reconciles_without_duplicate() {
        let f = fixture().await;
        let id = f
            .store
            .send(f.conversation, &f.key, "hello", MessageKind::Text, None)
            .await
            .unwrap();

        let entries = f.store.entries(f.conversation);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].pending);

        // The confirming feed echo reconciles by id, not by content.
        let row = f.feed.messages_page(f.conversation, None, 1).await.unwrap();
        f.store.on_remote_insert(&row[0], &f.key);

        let entries = f.store.entries(f.conversation);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert!(!entries[0].pending);
        assert!(!entries[0].failed);
        assert_eq!(entries[0].content, "hello");
    }

    #[tokio::test]
    async fn test_failed_send_keeps_entry_flagged() {
        let f = fixture().await;
        f.feed.fail_next_insert();

        f.store
            .send(f.conversation, &f.key, "hors ligne", MessageKind::Text, None)
            .await
            .unwrap();

        let entries = f.store.entries(f.conversation);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].failed);
        assert!(!entries[0].pending);
        assert_eq!(f.feed.message_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_after_failure_confirms_once() {
        let f = fixture().await;
        f.feed.fail_next_insert();
        let id = f
            .store
            .send(f.conversation, &f.key, "hello", MessageKind::Text, None)
            .await
            .unwrap();

        assert!(f.store.retry(f.conversation, &f.key, id).await.unwrap());
        assert_eq!(f.feed.message_count(), 1);

        // Feed echo confirms; the entry must end up confirmed, not failed.
        let row = f.feed.messages_page(f.conversation, None, 1).await.unwrap();
        f.store.on_remote_insert(&row[0], &f.key);

        let entries = f.store.entries(f.conversation);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].pending && !entries[0].failed);

        // Retrying a non-failed entry is a no-op.
        assert!(!f.store.retry(f.conversation, &f.key, id).await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_merge_is_idempotent_and_ordered() {
        let f = fixture().await;
        let base = Utc::now();

        let mut rows = Vec::new();
        for i in [2i64, 0, 1] {
            rows.push(MessageRow {
                id: MessageId::new(),
                conversation_id: f.conversation,
                sender_id: f.peer,
                ciphertext: seal_text(&f.key, &format!("m{i}")).unwrap(),
                kind: MessageKind::Text,
                media_url: None,
                created_at: base + Duration::seconds(i),
                read_at: None,
                deleted_by_admin: false,
            });
        }

        for row in &rows {
            f.store.on_remote_insert(row, &f.key);
        }
        // Duplicate deliveries change nothing.
        for row in &rows {
            f.store.on_remote_insert(row, &f.key);
        }

        let entries = f.store.entries(f.conversation);
        assert_eq!(entries.len(), 3);
        assert!(entries.windows(2).all(|w| (w[0].created_at, w[0].id) < (w[1].created_at, w[1].id)));
        assert_eq!(entries[0].content, "m0");
        assert_eq!(entries[2].content, "m2");
    }

    #[tokio::test]
    async fn test_pagination_walks_history_backwards() {
        let f = fixture().await;
        seed_from_peer(&f, 75).await;

        f.store.load_initial(f.conversation, &f.key).await.unwrap();
        assert_eq!(f.store.entries(f.conversation).len(), 30);
        assert_eq!(
            f.store.load_state(f.conversation),
            LoadState::Loaded { has_more: true }
        );

        let first_cursor = f.store.oldest_loaded_at(f.conversation).unwrap();
        assert!(f.store.load_older(f.conversation, &f.key).await.unwrap());
        let second_cursor = f.store.oldest_loaded_at(f.conversation).unwrap();
        assert!(second_cursor < first_cursor);
        assert_eq!(f.store.entries(f.conversation).len(), 60);

        // Final short page exhausts history.
        assert!(f.store.load_older(f.conversation, &f.key).await.unwrap());
        assert_eq!(f.store.entries(f.conversation).len(), 75);
        assert_eq!(
            f.store.load_state(f.conversation),
            LoadState::Loaded { has_more: false }
        );

        // Exhausted history makes further loads no-ops.
        assert!(!f.store.load_older(f.conversation, &f.key).await.unwrap());
        assert_eq!(f.store.entries(f.conversation).len(), 75);

        let entries = f.store.entries(f.conversation);
        assert!(entries.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn test_exact_page_boundary_sets_has_more_false_on_empty_fetch() {
        let f = fixture().await;
        seed_from_peer(&f, 30).await;

        f.store.load_initial(f.conversation, &f.key).await.unwrap();
        // A full first page cannot tell whether history continues.
        assert_eq!(
            f.store.load_state(f.conversation),
            LoadState::Loaded { has_more: true }
        );

        assert!(f.store.load_older(f.conversation, &f.key).await.unwrap());
        assert_eq!(
            f.store.load_state(f.conversation),
            LoadState::Loaded { has_more: false }
        );
        assert_eq!(f.store.entries(f.conversation).len(), 30);
    }

    #[tokio::test]
    async fn test_stale_history_page_is_discarded_on_arrival() {
        let f = fixture().await;
        seed_from_peer(&f, 40).await;
        f.store.load_initial(f.conversation, &f.key).await.unwrap();
        assert_eq!(f.store.entries(f.conversation).len(), 30);

        let gate = f.feed.hold_next_page();
        let store = Arc::clone(&f.store);
        let (conversation, key) = (f.conversation, f.key);
        let inflight =
            tokio::spawn(async move { store.load_older(conversation, &key).await });

        // Let the fetch reach the gate, then switch conversations under it.
        tokio::task::yield_now().await;
        let other = f
            .feed
            .find_or_create_conversation(f.me, UserId::new())
            .await
            .unwrap()
            .id;
        f.store.activate(other);
        let _ = gate.send(());

        assert!(!inflight.await.unwrap().unwrap());
        // The stale page never landed; cursor and count are untouched.
        assert_eq!(f.store.entries(f.conversation).len(), 30);
        assert_eq!(
            f.store.load_state(f.conversation),
            LoadState::Loaded { has_more: true }
        );
    }

    #[tokio::test]
    async fn test_transient_page_failure_keeps_cursor_for_retry() {
        let f = fixture().await;
        seed_from_peer(&f, 40).await;
        f.store.load_initial(f.conversation, &f.key).await.unwrap();
        let cursor = f.store.oldest_loaded_at(f.conversation).unwrap();

        f.feed.fail_next_page();
        assert!(f.store.load_older(f.conversation, &f.key).await.is_err());

        // has_more and the cursor survive the failure; scrolling retries.
        assert_eq!(f.store.oldest_loaded_at(f.conversation), Some(cursor));
        assert_eq!(
            f.store.load_state(f.conversation),
            LoadState::Loaded { has_more: true }
        );
        assert!(f.store.load_older(f.conversation, &f.key).await.unwrap());
        assert_eq!(f.store.entries(f.conversation).len(), 40);
    }

    #[tokio::test]
    async fn test_mark_read_flips_only_peer_messages() {
        let f = fixture().await;
        seed_from_peer(&f, 3).await;
        f.store
            .send(f.conversation, &f.key, "mine", MessageKind::Text, None)
            .await
            .unwrap();
        f.store.load_initial(f.conversation, &f.key).await.unwrap();

        let touched = f.store.mark_read(f.conversation).await.unwrap();
        assert_eq!(touched, 3);

        for entry in f.store.entries(f.conversation) {
            if entry.sender_id == f.me {
                assert!(entry.read_at.is_none());
            } else {
                assert!(entry.read_at.is_some());
            }
        }

        // Idempotent.
        assert_eq!(f.store.mark_read(f.conversation).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecryptable_row_renders_placeholder() {
        let f = fixture().await;
        let row = MessageRow {
            id: MessageId::new(),
            conversation_id: f.conversation,
            sender_id: f.peer,
            ciphertext: "pas du tout du base64 valide".to_string(),
            kind: MessageKind::Text,
            media_url: None,
            created_at: Utc::now(),
            read_at: None,
            deleted_by_admin: false,
        };

        f.store.on_remote_insert(&row, &f.key);
        let entries = f.store.entries(f.conversation);
        assert_eq!(entries[0].content, DECRYPT_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_moderation_delete_replaces_content() {
        let f = fixture().await;
        seed_from_peer(&f, 1).await;
        f.store.load_initial(f.conversation, &f.key).await.unwrap();

        let mut row = f.feed.messages_page(f.conversation, None, 1).await.unwrap()[0].clone();
        row.deleted_by_admin = true;
        f.store.on_remote_update(&row);

        let entries = f.store.entries(f.conversation);
        assert!(entries[0].deleted_by_admin);
        assert_eq!(entries[0].content, DELETED_PLACEHOLDER);
    }
}

//! In-memory feed used by the test suites.
//!
//! Implements the same uniqueness, compare-and-swap and append semantics the
//! contract demands from a real backend, fans events out to subscribers over
//! tokio channels, and offers failure injection so callers can exercise
//! their transient-error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use causerie_shared::constants::PRESENCE_TOPIC;
use causerie_shared::types::{
    CallId, CallStatus, CandidateRole, ConversationId, MessageId, UserId,
};

use crate::event::FeedEvent;
use crate::models::{
    canonical_pair_key, CallRow, ConversationRow, MessageRow, ParticipantRow, ProfileRow,
};
use crate::store::{BlobStore, FeedError, FeedStore, Result};
use crate::subscription::FeedSubscription;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SubTopic {
    Messages(ConversationId),
    Inbox(UserId),
    Calls(UserId),
    Presence(UserId),
    Typing(ConversationId),
}

struct Subscriber {
    topic: SubTopic,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct FeedInner {
    conversations: Vec<ConversationRow>,
    participants: Vec<ParticipantRow>,
    profiles: HashMap<UserId, ProfileRow>,
    messages: Vec<MessageRow>,
    calls: Vec<CallRow>,
    subs: HashMap<u64, Subscriber>,
    next_sub_id: u64,
    fail_next_insert: bool,
    fail_next_page: bool,
    page_gate: Option<oneshot::Receiver<()>>,
}

impl FeedInner {
    fn participants_of(&self, conversation: ConversationId) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.conversation_id == conversation)
            .map(|p| p.user_id)
            .collect()
    }

    fn publish_message(&self, event: FeedEvent, conversation: ConversationId) {
        let members = self.participants_of(conversation);
        for sub in self.subs.values() {
            let wanted = match sub.topic {
                SubTopic::Messages(conv) => conv == conversation,
                SubTopic::Inbox(user) => members.contains(&user),
                _ => false,
            };
            if wanted {
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    fn publish_call(&self, event: FeedEvent, row: &CallRow) {
        for sub in self.subs.values() {
            if let SubTopic::Calls(user) = sub.topic {
                if user == row.caller_id || user == row.callee_id {
                    let _ = sub.tx.send(event.clone());
                }
            }
        }
    }

    fn online_snapshot(&self) -> Vec<UserId> {
        let mut online: Vec<UserId> = self
            .subs
            .values()
            .filter_map(|sub| match sub.topic {
                SubTopic::Presence(user) => Some(user),
                _ => None,
            })
            .collect();
        online.sort();
        online.dedup();
        online
    }

    fn broadcast_presence(&self) {
        let online = self.online_snapshot();
        for sub in self.subs.values() {
            if matches!(sub.topic, SubTopic::Presence(_)) {
                let _ = sub.tx.send(FeedEvent::PresenceSync {
                    online: online.clone(),
                });
            }
        }
    }

    fn register(&mut self, topic: SubTopic) -> (u64, mpsc::UnboundedReceiver<FeedEvent>) {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.insert(id, Subscriber { topic, tx });
        (id, rx)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryFeed {
    inner: Arc<Mutex<FeedInner>>,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cause the next `insert_message` to fail with a transient error.
    pub fn fail_next_insert(&self) {
        self.inner.lock().unwrap().fail_next_insert = true;
    }

    /// Cause the next `messages_page` to fail with a transient error.
    pub fn fail_next_page(&self) {
        self.inner.lock().unwrap().fail_next_page = true;
    }

    /// Hold the next `messages_page` call until the returned sender fires
    /// (or is dropped).  Lets tests interleave a conversation switch with an
    /// in-flight page fetch.
    pub fn hold_next_page(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().page_gate = Some(rx);
        tx
    }

    /// Number of live subscriptions; dangling listeners are a bug.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subs.len()
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.lock().unwrap().conversations.len()
    }

    fn subscription(&self, topic: SubTopic, name: String) -> FeedSubscription {
        let (id, rx) = {
            let mut inner = self.inner.lock().unwrap();
            let pair = inner.register(topic.clone());
            if matches!(topic, SubTopic::Presence(_)) {
                inner.broadcast_presence();
            }
            pair
        };

        let arc = Arc::clone(&self.inner);
        FeedSubscription::new(name, rx, move || {
            let mut inner = arc.lock().unwrap();
            if let Some(sub) = inner.subs.remove(&id) {
                if matches!(sub.topic, SubTopic::Presence(_)) {
                    inner.broadcast_presence();
                }
            }
        })
    }
}

#[async_trait]
impl FeedStore for InMemoryFeed {
    async fn find_or_create_conversation(&self, a: UserId, b: UserId) -> Result<ConversationRow> {
        let key = canonical_pair_key(a, b);
        let mut inner = self.inner.lock().unwrap();

        if let Some(row) = inner
            .conversations
            .iter()
            .find(|c| c.canonical_key.as_deref() == Some(key.as_str()))
            .cloned()
        {
            // Membership may have been dropped by one side; first contact
            // restores it.
            for user in [a, b] {
                let present = inner
                    .participants
                    .iter()
                    .any(|p| p.conversation_id == row.id && p.user_id == user);
                if !present {
                    inner.participants.push(ParticipantRow {
                        conversation_id: row.id,
                        user_id: user,
                    });
                }
            }
            return Ok(row);
        }

        let row = ConversationRow::new_pair(a, b, Utc::now());
        debug!(conversation = %row.id, "creating conversation");
        inner.conversations.push(row.clone());
        for user in [a, b] {
            inner.participants.push(ParticipantRow {
                conversation_id: row.id,
                user_id: user,
            });
        }
        Ok(row)
    }

    async fn conversations_for(
        &self,
        user: UserId,
    ) -> Result<Vec<(ConversationRow, Vec<ParticipantRow>)>> {
        let inner = self.inner.lock().unwrap();
        let rows = inner
            .conversations
            .iter()
            .filter(|c| {
                inner
                    .participants
                    .iter()
                    .any(|p| p.conversation_id == c.id && p.user_id == user)
            })
            .map(|c| {
                let members = inner
                    .participants
                    .iter()
                    .filter(|p| p.conversation_id == c.id)
                    .cloned()
                    .collect();
                (c.clone(), members)
            })
            .collect();
        Ok(rows)
    }

    async fn remove_participant(&self, conversation: ConversationId, user: UserId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .participants
            .retain(|p| !(p.conversation_id == conversation && p.user_id == user));
        Ok(())
    }

    async fn set_conversation_flags(
        &self,
        conversation: ConversationId,
        pinned: bool,
        muted: bool,
        archived: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation)
            .ok_or(FeedError::NotFound)?;
        row.pinned = pinned;
        row.muted = muted;
        row.archived = archived;
        Ok(())
    }

    async fn get_profile(&self, user: UserId) -> Result<ProfileRow> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .get(&user)
            .cloned()
            .ok_or(FeedError::NotFound)
    }

    async fn upsert_profile(&self, profile: ProfileRow) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .profiles
            .insert(profile.id, profile);
        Ok(())
    }

    async fn insert_message(&self, row: MessageRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if inner.fail_next_insert {
            inner.fail_next_insert = false;
            return Err(FeedError::Backend("injected write failure".into()));
        }

        if inner.messages.iter().any(|m| m.id == row.id) {
            return Err(FeedError::Duplicate);
        }

        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == row.conversation_id)
            .ok_or(FeedError::NotFound)?;

        // last_message_at only ever moves forward.
        conversation.last_message_at = Some(match conversation.last_message_at {
            Some(existing) => existing.max(row.created_at),
            None => row.created_at,
        });

        inner.messages.push(row.clone());
        inner.publish_message(FeedEvent::MessageInserted(row.clone()), row.conversation_id);
        Ok(())
    }

    async fn messages_page(
        &self,
        conversation: ConversationId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<MessageRow>> {
        let gate = self.inner.lock().unwrap().page_gate.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_page {
            inner.fail_next_page = false;
            return Err(FeedError::Backend("injected read failure".into()));
        }

        let mut page: Vec<MessageRow> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation)
            .filter(|m| before.map(|cursor| m.created_at < cursor).unwrap_or(true))
            .cloned()
            .collect();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        page.truncate(limit);
        Ok(page)
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut touched = Vec::new();
        for message in inner.messages.iter_mut() {
            if message.conversation_id == conversation
                && message.sender_id != reader
                && message.read_at.is_none()
            {
                message.read_at = Some(at);
                touched.push(message.clone());
            }
        }
        for row in &touched {
            inner.publish_message(FeedEvent::MessageUpdated(row.clone()), conversation);
        }
        Ok(touched.len())
    }

    async fn unread_count(&self, conversation: ConversationId, user: UserId) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.conversation_id == conversation && m.sender_id != user && m.read_at.is_none()
            })
            .count())
    }

    async fn soft_delete_message(&self, id: MessageId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(FeedError::NotFound)?;
        row.deleted_by_admin = true;
        let row = row.clone();
        inner.publish_message(FeedEvent::MessageUpdated(row.clone()), row.conversation_id);
        Ok(())
    }

    async fn create_call(&self, row: CallRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let active = inner
            .calls
            .iter()
            .any(|c| c.conversation_id == row.conversation_id && !c.status.is_terminal());
        if active {
            return Err(FeedError::ActiveCallExists);
        }

        debug!(call = %row.id, conversation = %row.conversation_id, "creating call");
        inner.calls.push(row.clone());
        inner.publish_call(FeedEvent::CallInserted(row.clone()), &row);
        Ok(())
    }

    async fn get_call(&self, id: CallId) -> Result<CallRow> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or(FeedError::NotFound)
    }

    async fn transition_call(
        &self,
        id: CallId,
        allowed_from: &[CallStatus],
        to: CallStatus,
    ) -> Result<Option<CallRow>> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .calls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(FeedError::NotFound)?;

        if !allowed_from.contains(&row.status) {
            return Ok(None);
        }

        row.status = to;
        let row = row.clone();
        inner.publish_call(FeedEvent::CallUpdated(row.clone()), &row);
        Ok(Some(row))
    }

    async fn set_call_answer(&self, id: CallId, answer: String) -> Result<Option<CallRow>> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .calls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(FeedError::NotFound)?;

        if row.answer.is_some() {
            return Ok(None);
        }

        row.answer = Some(answer);
        let row = row.clone();
        inner.publish_call(FeedEvent::CallUpdated(row.clone()), &row);
        Ok(Some(row))
    }

    async fn append_ice_candidate(
        &self,
        id: CallId,
        role: CandidateRole,
        candidate: String,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .calls
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(FeedError::NotFound)?;

        if row.status.is_terminal() {
            return Ok(false);
        }

        let list = match role {
            CandidateRole::Caller => &mut row.caller_candidates,
            CandidateRole::Callee => &mut row.callee_candidates,
        };
        if list.iter().any(|c| c == &candidate) {
            return Ok(false);
        }
        list.push(candidate);

        let row = row.clone();
        inner.publish_call(FeedEvent::CallUpdated(row.clone()), &row);
        Ok(true)
    }

    async fn subscribe_messages(&self, conversation: ConversationId) -> Result<FeedSubscription> {
        Ok(self.subscription(SubTopic::Messages(conversation), conversation.chat_topic()))
    }

    async fn subscribe_inbox(&self, user: UserId) -> Result<FeedSubscription> {
        Ok(self.subscription(SubTopic::Inbox(user), format!("inbox:{user}")))
    }

    async fn subscribe_calls(&self, user: UserId) -> Result<FeedSubscription> {
        Ok(self.subscription(SubTopic::Calls(user), format!("calls:{user}")))
    }

    async fn subscribe_presence(&self, user: UserId) -> Result<FeedSubscription> {
        Ok(self.subscription(SubTopic::Presence(user), PRESENCE_TOPIC.to_string()))
    }

    async fn subscribe_typing(&self, conversation: ConversationId) -> Result<FeedSubscription> {
        Ok(self.subscription(SubTopic::Typing(conversation), conversation.typing_topic()))
    }

    async fn broadcast_typing(
        &self,
        conversation: ConversationId,
        user: UserId,
        username: String,
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        for sub in inner.subs.values() {
            if sub.topic == SubTopic::Typing(conversation) {
                let _ = sub.tx.send(FeedEvent::Typing {
                    conversation_id: conversation,
                    user_id: user,
                    username: username.clone(),
                });
            }
        }
        Ok(())
    }
}

/// In-memory blob store returning `mem://` URLs.
#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, path: &str, bytes: Vec<u8>) -> Result<String> {
        let url = format!("mem://{path}");
        self.blobs.lock().unwrap().insert(path.to_string(), bytes);
        Ok(url)
    }
}

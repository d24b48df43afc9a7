//! Session facade.
//!
//! One [`ChatSession`] per logged-in user: it owns the feed subscriptions,
//! routes every incoming [`FeedEvent`] into the sync/call state machines,
//! and exposes the operations the UI layer invokes.  Events flow back to the
//! UI over an unbounded channel.

use std::time::{Duration, Instant};

use std::sync::{Arc, Mutex};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use causerie_feed::{
    BlobStore, FeedError, FeedEvent, FeedStore, FeedSubscription, ProfileRow,
};
use causerie_media::{CallError, CallSignaling, MediaTransport};
use causerie_shared::constants::{MESSAGE_PAGE_SIZE, TYPING_BROADCAST_INTERVAL_MS};
use causerie_shared::crypto::{derive_conversation_key, SymmetricKey};
use causerie_shared::types::{
    CallId, CallStatus, CallType, ConversationId, MessageId, MessageKind, UserId,
};
use causerie_sync::{
    ConversationIndex, ConversationSummary, MessageEntry, MessageStore, SyncError,
};

use crate::events::{emit, SessionEvent};
use crate::state::{ActiveConversation, SessionState};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] causerie_shared::CryptoError),
}

#[derive(Default)]
struct SessionSubs {
    inbox: Option<FeedSubscription>,
    presence: Option<FeedSubscription>,
    calls: Option<FeedSubscription>,
}

pub struct ChatSession {
    feed: Arc<dyn FeedStore>,
    blobs: Arc<dyn BlobStore>,
    messages: MessageStore,
    index: ConversationIndex,
    calls: CallSignaling,
    state: Mutex<SessionState>,
    subs: Mutex<SessionSubs>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChatSession {
    /// Build a session for `profile`.  The returned receiver carries the
    /// [`SessionEvent`] stream for the UI.
    pub fn new(
        profile: ProfileRow,
        feed: Arc<dyn FeedStore>,
        blobs: Arc<dyn BlobStore>,
        media: Arc<dyn MediaTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            messages: MessageStore::new(Arc::clone(&feed), profile.id, MESSAGE_PAGE_SIZE),
            index: ConversationIndex::new(Arc::clone(&feed), profile.id),
            calls: CallSignaling::new(Arc::clone(&feed), media, profile.id),
            feed,
            blobs,
            state: Mutex::new(SessionState::new(profile)),
            subs: Mutex::new(SessionSubs::default()),
            events_tx,
        };
        (session, events_rx)
    }

    pub fn self_id(&self) -> UserId {
        self.state.lock().unwrap().profile.id
    }

    /// Go online: publish the profile, open the session-scoped
    /// subscriptions (inbox, presence, calls) and build the conversation
    /// index.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let profile = { self.state.lock().unwrap().profile.clone() };
        self.feed.upsert_profile(profile.clone()).await?;

        let inbox = self.feed.subscribe_inbox(profile.id).await?;
        let presence = self.feed.subscribe_presence(profile.id).await?;
        let calls = self.feed.subscribe_calls(profile.id).await?;
        {
            let mut subs = self.subs.lock().unwrap();
            subs.inbox = Some(inbox);
            subs.presence = Some(presence);
            subs.calls = Some(calls);
        }

        self.index.refresh().await?;
        emit(&self.events_tx, SessionEvent::ConversationsChanged);
        info!(user = %profile.id.short(), "session connected");
        Ok(())
    }

    /// Go offline: release every subscription deterministically.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.close_conversation();
        let subs = {
            let mut guard = self.subs.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if let Some(sub) = subs.inbox {
            sub.close();
        }
        if let Some(sub) = subs.presence {
            sub.close();
        }
        if let Some(sub) = subs.calls {
            sub.close();
        }
        self.calls.end_call().await?;
        info!("session disconnected");
        Ok(())
    }

    /// Open (or create) the conversation with `peer` and make it active.
    ///
    /// The previous conversation's subscriptions are closed before the new
    /// ones are opened, so exactly one conversation is ever live.
    pub async fn open_conversation(&self, peer: UserId) -> Result<ConversationId, SessionError> {
        self.close_conversation();

        let row = self.index.find_or_create(peer).await?;
        let peer_profile = self.feed.get_profile(peer).await?;
        let self_id = self.self_id();
        let key = derive_conversation_key(row.id, &[self_id, peer]);

        let chat_sub = self.feed.subscribe_messages(row.id).await?;
        let typing_sub = self.feed.subscribe_typing(row.id).await?;

        self.messages.activate(row.id);
        self.messages
            .load_initial(row.id, &key)
            .await?;
        self.messages
            .mark_read(row.id)
            .await?;
        self.index.mark_opened(row.id);

        {
            let mut state = self.state.lock().unwrap();
            state.active = Some(ActiveConversation {
                id: row.id,
                peer: peer_profile,
                key,
                chat_sub,
                typing_sub,
            });
        }

        emit(&self.events_tx, SessionEvent::ConversationsChanged);
        info!(conversation = %row.id, peer = %peer.short(), "conversation opened");
        Ok(row.id)
    }

    /// Leave the active conversation, releasing its subscriptions.
    pub fn close_conversation(&self) {
        let previous = { self.state.lock().unwrap().active.take() };
        if let Some(previous) = previous {
            {
                let mut state = self.state.lock().unwrap();
                state.typing.clear(previous.id);
            }
            previous.chat_sub.close();
            previous.typing_sub.close();
        }
    }

    /// Optimistic text send into the active conversation.
    ///
    /// Rejected while the local user is muted; a transient write failure
    /// leaves the entry visible as `failed` with a retry affordance.
    pub async fn send_text(&self, text: &str) -> Result<MessageId, SessionError> {
        self.ensure_not_muted()?;
        let (conversation, key) = self.active_context()?;

        let id = self
            .messages
            .send(conversation, &key, text, MessageKind::Text, None)
            .await?;
        emit(
            &self.events_tx,
            SessionEvent::NewMessage {
                conversation_id: conversation,
                sender_id: self.self_id(),
                message_id: id,
            },
        );
        Ok(id)
    }

    /// Upload an attachment and send the message carrying its URL.
    pub async fn send_attachment(
        &self,
        kind: MessageKind,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<MessageId, SessionError> {
        self.ensure_not_muted()?;
        let (conversation, key) = self.active_context()?;

        let path = format!("{}/{}-{}", conversation, Uuid::new_v4(), filename);
        let url = self.blobs.upload(&path, bytes).await?;

        let id = self
            .messages
            .send(conversation, &key, filename, kind, Some(url))
            .await?;
        emit(
            &self.events_tx,
            SessionEvent::NewMessage {
                conversation_id: conversation,
                sender_id: self.self_id(),
                message_id: id,
            },
        );
        Ok(id)
    }

    /// Retry a `failed` entry in the active conversation.
    pub async fn retry_message(&self, message_id: MessageId) -> Result<bool, SessionError> {
        let (conversation, key) = self.active_context()?;
        let sent = self
            .messages
            .retry(conversation, &key, message_id)
            .await?;
        if sent {
            emit(
                &self.events_tx,
                SessionEvent::MessagesChanged {
                    conversation_id: conversation,
                },
            );
        }
        Ok(sent)
    }

    /// Fetch one more page of history for the active conversation.
    pub async fn load_older(&self) -> Result<bool, SessionError> {
        let (conversation, key) = self.active_context()?;
        let fetched = self
            .messages
            .load_older(conversation, &key)
            .await?;
        if fetched {
            emit(
                &self.events_tx,
                SessionEvent::MessagesChanged {
                    conversation_id: conversation,
                },
            );
        }
        Ok(fetched)
    }

    /// Pin, mute or archive a conversation.
    pub async fn set_conversation_flags(
        &self,
        conversation: ConversationId,
        pinned: bool,
        muted: bool,
        archived: bool,
    ) -> Result<(), SessionError> {
        self.index
            .set_flags(conversation, pinned, muted, archived)
            .await?;
        emit(&self.events_tx, SessionEvent::ConversationsChanged);
        Ok(())
    }

    /// Drop our membership row.  The conversation disappears for us but
    /// stays intact for everyone else.
    pub async fn leave_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<(), SessionError> {
        if self.active_conversation() == Some(conversation) {
            self.close_conversation();
        }
        self.feed
            .remove_participant(conversation, self.self_id())
            .await?;
        self.index.refresh().await?;
        emit(&self.events_tx, SessionEvent::ConversationsChanged);
        Ok(())
    }

    /// Broadcast a typing notification, throttled to one per interval.
    pub async fn notify_typing(&self) -> Result<(), SessionError> {
        let (conversation, _) = self.active_context()?;
        let interval = Duration::from_millis(TYPING_BROADCAST_INTERVAL_MS);
        let (user, username) = {
            let mut state = self.state.lock().unwrap();
            let fresh = state
                .last_typing_broadcast
                .map(|at| at.elapsed() < interval)
                .unwrap_or(false);
            if fresh {
                return Ok(());
            }
            state.last_typing_broadcast = Some(Instant::now());
            (state.profile.id, state.profile.username.clone())
        };

        self.feed
            .broadcast_typing(conversation, user, username)
            .await?;
        Ok(())
    }

    /// Drain every pending feed event and fold it into the state machines.
    /// Returns how many events were processed.
    pub async fn poll(&self) -> Result<usize, SessionError> {
        let mut events = Vec::new();
        {
            let mut guard = self.subs.lock().unwrap();
            let subs = &mut *guard;
            for sub in [&mut subs.inbox, &mut subs.presence, &mut subs.calls]
                .into_iter()
                .flatten()
            {
                while let Some(event) = sub.try_recv() {
                    events.push(event);
                }
            }
        }
        {
            let mut state = self.state.lock().unwrap();
            if let Some(active) = state.active.as_mut() {
                while let Some(event) = active.chat_sub.try_recv() {
                    events.push(event);
                }
                while let Some(event) = active.typing_sub.try_recv() {
                    events.push(event);
                }
            }
        }

        let count = events.len();
        for event in events {
            self.handle_event(event).await?;
        }
        Ok(count)
    }

    /// Single dispatch point from the feed into the state machines.
    pub async fn handle_event(&self, event: FeedEvent) -> Result<(), SessionError> {
        match event {
            FeedEvent::MessageInserted(row) => {
                let active = self.active_snapshot();
                let merged = match active {
                    Some((id, key)) if id == row.conversation_id => {
                        self.messages.on_remote_insert(&row, &key)
                    }
                    _ => true, // not materialized here; the index still is
                };

                let known = self.index.apply_incoming(&row, active.map(|(id, _)| id));
                if !known {
                    // First contact from the other side; rebuild the index.
                    self.index.refresh().await?;
                    emit(&self.events_tx, SessionEvent::ConversationsChanged);
                }

                if merged {
                    emit(
                        &self.events_tx,
                        SessionEvent::NewMessage {
                            conversation_id: row.conversation_id,
                            sender_id: row.sender_id,
                            message_id: row.id,
                        },
                    );
                }
            }
            FeedEvent::MessageUpdated(row) => {
                if self.messages.on_remote_update(&row) {
                    emit(
                        &self.events_tx,
                        SessionEvent::MessagesChanged {
                            conversation_id: row.conversation_id,
                        },
                    );
                }
            }
            FeedEvent::CallInserted(row) => {
                if let Some(incoming) = self.calls.on_call_inserted(&row) {
                    emit(&self.events_tx, SessionEvent::IncomingCall(incoming));
                }
            }
            FeedEvent::CallUpdated(row) => {
                if let Some(status) = self.calls.on_call_updated(&row).await? {
                    emit(&self.events_tx, SessionEvent::CallStateChanged { status });
                }
            }
            FeedEvent::PresenceSync { online } => {
                let count = {
                    let mut state = self.state.lock().unwrap();
                    state.presence.on_sync(online);
                    state.presence.online_count()
                };
                emit(
                    &self.events_tx,
                    SessionEvent::PresenceChanged {
                        online_count: count,
                    },
                );
            }
            FeedEvent::Typing {
                conversation_id,
                user_id,
                username,
            } => {
                let relevant = {
                    let mut state = self.state.lock().unwrap();
                    let is_self = state.profile.id == user_id;
                    let is_active = state
                        .active
                        .as_ref()
                        .map(|a| a.id == conversation_id)
                        .unwrap_or(false);
                    if !is_self && is_active {
                        state.typing.observe(conversation_id, user_id, username);
                        true
                    } else {
                        false
                    }
                };
                if relevant {
                    emit(
                        &self.events_tx,
                        SessionEvent::TypingChanged {
                            conversation_id,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    // -- calls --------------------------------------------------------------

    /// Ring the active conversation's peer.
    pub async fn start_call(&self, call_type: CallType) -> Result<CallId, SessionError> {
        let (conversation, peer) = {
            let state = self.state.lock().unwrap();
            let active = state
                .active
                .as_ref()
                .ok_or(SyncError::NoActiveConversation)?;
            (active.id, active.peer.id)
        };
        let id = self.calls.start_call(conversation, peer, call_type).await?;
        emit(
            &self.events_tx,
            SessionEvent::CallStateChanged {
                status: CallStatus::Ringing,
            },
        );
        Ok(id)
    }

    pub async fn accept_call(&self) -> Result<bool, SessionError> {
        let accepted = self.calls.accept_call().await?;
        if accepted {
            emit(
                &self.events_tx,
                SessionEvent::CallStateChanged {
                    status: CallStatus::Accepted,
                },
            );
        }
        Ok(accepted)
    }

    pub async fn reject_call(&self) -> Result<bool, SessionError> {
        Ok(self.calls.reject_call().await?)
    }

    pub async fn end_call(&self) -> Result<(), SessionError> {
        self.calls.end_call().await?;
        emit(
            &self.events_tx,
            SessionEvent::CallStateChanged {
                status: CallStatus::Ended,
            },
        );
        Ok(())
    }

    pub async fn push_ice_candidate(&self, candidate: &str) -> Result<bool, SessionError> {
        Ok(self.calls.push_local_candidate(candidate).await?)
    }

    pub fn toggle_mute(&self) -> Result<bool, SessionError> {
        Ok(self.calls.toggle_mute()?)
    }

    pub fn toggle_video(&self) -> Result<bool, SessionError> {
        Ok(self.calls.toggle_video()?)
    }

    // -- read views ---------------------------------------------------------

    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.index.summaries()
    }

    pub fn entries(&self, conversation: ConversationId) -> Vec<MessageEntry> {
        self.messages.entries(conversation)
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.state.lock().unwrap().active.as_ref().map(|a| a.id)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.state.lock().unwrap().presence.is_online(user)
    }

    /// Who is typing in the active conversation, if anyone.
    pub fn typing_peer(&self) -> Option<(UserId, String)> {
        let mut state = self.state.lock().unwrap();
        let conversation = state.active.as_ref()?.id;
        state.typing.typist(conversation)
    }

    pub fn is_in_call(&self) -> bool {
        self.calls.is_in_call()
    }

    // -- helpers ------------------------------------------------------------

    fn active_snapshot(&self) -> Option<(ConversationId, SymmetricKey)> {
        self.state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|a| (a.id, a.key))
    }

    fn active_context(&self) -> Result<(ConversationId, SymmetricKey), SyncError> {
        self.active_snapshot()
            .ok_or(SyncError::NoActiveConversation)
    }

    fn ensure_not_muted(&self) -> Result<(), SyncError> {
        let state = self.state.lock().unwrap();
        if state.profile.is_muted_at(Utc::now()) {
            return Err(SyncError::SenderMuted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_feed::{InMemoryBlobStore, InMemoryFeed};
    use causerie_media::MockMediaTransport;

    struct Client {
        session: ChatSession,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        media: MockMediaTransport,
        id: UserId,
    }

    impl Client {
        fn drain(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn client(feed: &InMemoryFeed, blobs: &InMemoryBlobStore, username: &str) -> Client {
        let id = UserId::new();
        let media = MockMediaTransport::new();
        let (session, events) = ChatSession::new(
            ProfileRow::new(id, username),
            Arc::new(feed.clone()),
            Arc::new(blobs.clone()),
            Arc::new(media.clone()),
        );
        Client {
            session,
            events,
            media,
            id,
        }
    }

    async fn connected_pair(feed: &InMemoryFeed, blobs: &InMemoryBlobStore) -> (Client, Client) {
        let ana = client(feed, blobs, "ana");
        let bob = client(feed, blobs, "bob");
        ana.session.connect().await.unwrap();
        bob.session.connect().await.unwrap();
        (ana, bob)
    }

    #[tokio::test]
    async fn test_message_reaches_peer_exactly_once() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, mut bob) = connected_pair(&feed, &blobs).await;

        let conversation = ana.session.open_conversation(bob.id).await.unwrap();
        bob.session.open_conversation(ana.id).await.unwrap();
        assert_eq!(bob.session.active_conversation(), Some(conversation));

        ana.session.send_text("hello").await.unwrap();
        ana.session.poll().await.unwrap();
        bob.session.poll().await.unwrap();

        // Sender side: the optimistic entry reconciled with the feed echo.
        let ana_entries = ana.session.entries(conversation);
        assert_eq!(ana_entries.len(), 1);
        assert!(!ana_entries[0].pending && !ana_entries[0].failed);

        // Receiver side: exactly one decrypted entry, keyed by Ana's id.
        let bob_entries = bob.session.entries(conversation);
        assert_eq!(bob_entries.len(), 1);
        assert_eq!(bob_entries[0].content, "hello");
        assert_eq!(bob_entries[0].id, ana_entries[0].id);

        assert!(bob
            .drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::NewMessage { .. })));
    }

    #[tokio::test]
    async fn test_background_conversation_counts_unread() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, bob) = connected_pair(&feed, &blobs).await;

        ana.session.open_conversation(bob.id).await.unwrap();
        ana.session.send_text("tu es là ?").await.unwrap();

        // Bob never opened the conversation; the inbox event still lands.
        bob.session.poll().await.unwrap();

        let summaries = bob.session.conversations();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].unread, 1);
        assert_eq!(summaries[0].preview.as_deref(), Some("tu es là ?"));
        assert_eq!(summaries[0].other_user.username, "ana");

        // Opening it clears the counter and marks messages read.
        let conversation = bob.session.open_conversation(ana.id).await.unwrap();
        assert_eq!(bob.session.conversations()[0].unread, 0);
        assert!(bob
            .session
            .entries(conversation)
            .iter()
            .all(|m| m.read_at.is_some()));
    }

    #[tokio::test]
    async fn test_switching_conversations_swaps_subscriptions() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, bob) = connected_pair(&feed, &blobs).await;
        let carla = client(&feed, &blobs, "carla");
        carla.session.connect().await.unwrap();

        // Three session-scoped subscriptions per connected session.
        assert_eq!(feed.subscriber_count(), 9);

        ana.session.open_conversation(bob.id).await.unwrap();
        assert_eq!(feed.subscriber_count(), 11);

        // Switching closes the old pair before opening the new one.
        ana.session.open_conversation(carla.id).await.unwrap();
        assert_eq!(feed.subscriber_count(), 11);

        ana.session.close_conversation();
        assert_eq!(feed.subscriber_count(), 9);

        ana.session.disconnect().await.unwrap();
        assert_eq!(feed.subscriber_count(), 6);
    }

    #[tokio::test]
    async fn test_muted_sender_is_rejected() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();

        let id = UserId::new();
        let mut profile = ProfileRow::new(id, "muette");
        profile.muted_until = Some(Utc::now() + chrono::Duration::hours(1));
        let media = MockMediaTransport::new();
        let (session, _events) = ChatSession::new(
            profile,
            Arc::new(feed.clone()),
            Arc::new(blobs.clone()),
            Arc::new(media.clone()),
        );
        session.connect().await.unwrap();

        let bob = client(&feed, &blobs, "bob");
        bob.session.connect().await.unwrap();
        session.open_conversation(bob.id).await.unwrap();

        let result = session.send_text("interdit").await;
        assert!(matches!(
            result,
            Err(SessionError::Sync(SyncError::SenderMuted))
        ));
        assert_eq!(feed.message_count(), 0);
    }

    #[tokio::test]
    async fn test_send_without_open_conversation_is_rejected() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, _bob) = connected_pair(&feed, &blobs).await;

        assert!(matches!(
            ana.session.send_text("dans le vide").await,
            Err(SessionError::Sync(SyncError::NoActiveConversation))
        ));
    }

    #[tokio::test]
    async fn test_attachment_gets_blob_url() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, bob) = connected_pair(&feed, &blobs).await;

        let conversation = ana.session.open_conversation(bob.id).await.unwrap();
        ana.session
            .send_attachment(MessageKind::Image, "chat.png", vec![0xFF; 64])
            .await
            .unwrap();

        assert_eq!(blobs.blob_count(), 1);
        let entries = ana.session.entries(conversation);
        assert_eq!(entries[0].kind, MessageKind::Image);
        assert!(entries[0].media_url.as_deref().unwrap().starts_with("mem://"));
        assert_eq!(entries[0].content, "chat.png");
    }

    #[tokio::test]
    async fn test_presence_flows_between_sessions() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, bob) = connected_pair(&feed, &blobs).await;

        ana.session.poll().await.unwrap();
        assert!(ana.session.is_online(bob.id));
        assert!(ana.session.is_online(ana.id));

        bob.session.disconnect().await.unwrap();
        ana.session.poll().await.unwrap();
        assert!(!ana.session.is_online(bob.id));
    }

    #[tokio::test]
    async fn test_typing_indicator_roundtrip_with_throttle() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, mut bob) = connected_pair(&feed, &blobs).await;

        ana.session.open_conversation(bob.id).await.unwrap();
        bob.session.open_conversation(ana.id).await.unwrap();

        ana.session.notify_typing().await.unwrap();
        // Throttled: a second keystroke inside the window broadcasts nothing.
        ana.session.notify_typing().await.unwrap();

        bob.session.poll().await.unwrap();
        let typing_events = bob
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::TypingChanged { .. }))
            .count();
        assert_eq!(typing_events, 1);
        assert_eq!(
            bob.session.typing_peer(),
            Some((ana.id, "ana".to_string()))
        );

        // Our own broadcasts never show as "typing" to ourselves.
        ana.session.poll().await.unwrap();
        assert_eq!(ana.session.typing_peer(), None);
    }

    #[tokio::test]
    async fn test_call_lifecycle_through_sessions() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (mut ana, mut bob) = connected_pair(&feed, &blobs).await;

        ana.session.open_conversation(bob.id).await.unwrap();
        ana.session.start_call(CallType::Video).await.unwrap();

        bob.session.poll().await.unwrap();
        let incoming = bob.drain().into_iter().find_map(|e| match e {
            SessionEvent::IncomingCall(incoming) => Some(incoming),
            _ => None,
        });
        let incoming = incoming.expect("bob should see the incoming call");
        assert_eq!(incoming.caller_id, ana.id);

        assert!(bob.session.accept_call().await.unwrap());
        assert!(bob.session.is_in_call());

        // Ana folds in the acceptance and the answer.
        ana.session.poll().await.unwrap();
        assert!(ana
            .drain()
            .iter()
            .any(|e| matches!(
                e,
                SessionEvent::CallStateChanged {
                    status: CallStatus::Accepted
                }
            )));
        assert!(ana
            .media
            .ops()
            .iter()
            .any(|op| op.starts_with("set_remote:answer-sdp")));

        // Candidates trickle both ways.
        assert!(ana.session.push_ice_candidate("cand-ana").await.unwrap());
        assert!(bob.session.push_ice_candidate("cand-bob").await.unwrap());
        ana.session.poll().await.unwrap();
        bob.session.poll().await.unwrap();
        assert!(ana
            .media
            .applied_candidates()
            .contains(&"cand-bob".to_string()));
        assert!(bob
            .media
            .applied_candidates()
            .contains(&"cand-ana".to_string()));

        // Either side can hang up; both tear down.
        ana.session.end_call().await.unwrap();
        assert!(!ana.session.is_in_call());
        bob.session.poll().await.unwrap();
        assert!(!bob.session.is_in_call());
        assert!(bob.media.closed());
    }

    #[tokio::test]
    async fn test_leaving_a_conversation_hides_it_locally_only() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, bob) = connected_pair(&feed, &blobs).await;

        let conversation = ana.session.open_conversation(bob.id).await.unwrap();
        ana.session.send_text("avant de partir").await.unwrap();
        bob.session.poll().await.unwrap();

        ana.session.leave_conversation(conversation).await.unwrap();
        assert_eq!(ana.session.active_conversation(), None);
        assert!(ana.session.conversations().is_empty());

        // Bob keeps the conversation and its history.
        assert_eq!(bob.session.conversations().len(), 1);
        assert_eq!(feed.conversation_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_surfaces_retry_affordance() {
        let feed = InMemoryFeed::new();
        let blobs = InMemoryBlobStore::new();
        let (ana, bob) = connected_pair(&feed, &blobs).await;

        let conversation = ana.session.open_conversation(bob.id).await.unwrap();

        feed.fail_next_insert();
        let id = ana.session.send_text("hors ligne").await.unwrap();

        let entries = ana.session.entries(conversation);
        assert!(entries[0].failed);

        // The retry affordance brings it back to pending, then confirmed.
        assert!(ana.session.retry_message(id).await.unwrap());
        ana.session.poll().await.unwrap();
        let entries = ana.session.entries(conversation);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].pending && !entries[0].failed);
    }
}

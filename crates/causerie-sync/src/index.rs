//! Conversation summaries.
//!
//! One row per two-party conversation: the other participant, a decrypted
//! preview of the newest message, the unread counter, and the pin/mute/
//! archive flags.  Incoming messages update the affected summary in place
//! instead of re-deriving the whole list from the store.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use causerie_feed::{ConversationRow, FeedStore, MessageRow, ProfileRow};
use causerie_shared::crypto::{derive_conversation_key, open_text};
use causerie_shared::types::{ConversationId, UserId};

use crate::error::Result;
use crate::messages::{DECRYPT_PLACEHOLDER, DELETED_PLACEHOLDER};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub other_user: ProfileRow,
    pub preview: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread: usize,
    pub pinned: bool,
    pub muted: bool,
    pub archived: bool,
}

pub struct ConversationIndex {
    feed: Arc<dyn FeedStore>,
    self_id: UserId,
    summaries: Mutex<Vec<ConversationSummary>>,
}

impl ConversationIndex {
    pub fn new(feed: Arc<dyn FeedStore>, self_id: UserId) -> Self {
        Self {
            feed,
            self_id,
            summaries: Mutex::new(Vec::new()),
        }
    }

    /// Resolve (or create) the conversation with `peer` through the store's
    /// atomic insert-if-absent, and make sure a summary row exists for it.
    /// Idempotent from both sides.
    pub async fn find_or_create(&self, peer: UserId) -> Result<ConversationRow> {
        let row = self
            .feed
            .find_or_create_conversation(self.self_id, peer)
            .await?;

        let known = {
            let summaries = self.summaries.lock().unwrap();
            summaries.iter().any(|s| s.conversation_id == row.id)
        };
        if !known {
            let profile = self.feed.get_profile(peer).await?;
            let mut summaries = self.summaries.lock().unwrap();
            summaries.push(summary_of(&row, profile, None, 0));
            sort_summaries(&mut summaries);
        }
        Ok(row)
    }

    /// Rebuild every summary from the store.  Used at session start and as
    /// the fallback when an event references a conversation we do not know
    /// yet.
    pub async fn refresh(&self) -> Result<()> {
        let rows = self.feed.conversations_for(self.self_id).await?;

        let mut fresh = Vec::with_capacity(rows.len());
        for (row, members) in rows {
            let others: Vec<UserId> = members
                .iter()
                .map(|m| m.user_id)
                .filter(|id| *id != self.self_id)
                .collect();
            // Summaries are pairwise; group conversations have no "other
            // participant" slot to show.
            let [other] = others.as_slice() else {
                debug!(conversation = %row.id, "skipping non-pair conversation in index");
                continue;
            };

            let profile = self.feed.get_profile(*other).await?;
            let unread = self.feed.unread_count(row.id, self.self_id).await?;
            let newest = self.feed.messages_page(row.id, None, 1).await?;
            let preview = newest
                .first()
                .map(|m| self.render_preview(m, *other));

            fresh.push(summary_of(&row, profile, preview, unread));
        }

        sort_summaries(&mut fresh);
        *self.summaries.lock().unwrap() = fresh;
        Ok(())
    }

    /// Incremental update for a newly-inserted message.  Bumps preview,
    /// timestamp and (when the conversation is not the open one and the
    /// message is not ours) the unread counter, then re-sorts.  Returns
    /// `false` when the conversation is unknown here, in which case the
    /// caller should fall back to [`ConversationIndex::refresh`].
    pub fn apply_incoming(&self, row: &MessageRow, active: Option<ConversationId>) -> bool {
        let mut summaries = self.summaries.lock().unwrap();
        let Some(summary) = summaries
            .iter_mut()
            .find(|s| s.conversation_id == row.conversation_id)
        else {
            return false;
        };

        summary.preview = Some(render_preview_with(
            row,
            summary.conversation_id,
            self.self_id,
            summary.other_user.id,
        ));
        summary.last_activity = Some(match summary.last_activity {
            Some(existing) => existing.max(row.created_at),
            None => row.created_at,
        });
        if row.sender_id != self.self_id
            && active != Some(row.conversation_id)
            && row.read_at.is_none()
        {
            summary.unread += 1;
        }

        sort_summaries(&mut summaries);
        true
    }

    /// Opening a conversation clears its unread counter.
    pub fn mark_opened(&self, conversation: ConversationId) {
        let mut summaries = self.summaries.lock().unwrap();
        if let Some(summary) = summaries
            .iter_mut()
            .find(|s| s.conversation_id == conversation)
        {
            summary.unread = 0;
        }
    }

    pub async fn set_flags(
        &self,
        conversation: ConversationId,
        pinned: bool,
        muted: bool,
        archived: bool,
    ) -> Result<()> {
        self.feed
            .set_conversation_flags(conversation, pinned, muted, archived)
            .await?;

        let mut summaries = self.summaries.lock().unwrap();
        if let Some(summary) = summaries
            .iter_mut()
            .find(|s| s.conversation_id == conversation)
        {
            summary.pinned = pinned;
            summary.muted = muted;
            summary.archived = archived;
        }
        sort_summaries(&mut summaries);
        Ok(())
    }

    /// Current summaries, pinned first, then most recent activity.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.summaries.lock().unwrap().clone()
    }

    pub fn unread_total(&self) -> usize {
        self.summaries.lock().unwrap().iter().map(|s| s.unread).sum()
    }

    fn render_preview(&self, row: &MessageRow, other: UserId) -> String {
        render_preview_with(row, row.conversation_id, self.self_id, other)
    }
}

fn render_preview_with(
    row: &MessageRow,
    conversation: ConversationId,
    me: UserId,
    other: UserId,
) -> String {
    if row.deleted_by_admin {
        return DELETED_PLACEHOLDER.to_string();
    }
    let key = derive_conversation_key(conversation, &[me, other]);
    open_text(&key, &row.ciphertext).unwrap_or_else(|_| DECRYPT_PLACEHOLDER.to_string())
}

fn summary_of(
    row: &ConversationRow,
    other_user: ProfileRow,
    preview: Option<String>,
    unread: usize,
) -> ConversationSummary {
    ConversationSummary {
        conversation_id: row.id,
        other_user,
        preview,
        last_activity: row.last_message_at,
        unread,
        pinned: row.pinned,
        muted: row.muted,
        archived: row.archived,
    }
}

fn sort_summaries(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.last_activity.cmp(&a.last_activity))
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
}

//! Per-call signaling state machine.
//!
//! Both peers mutate one shared call row through the feed's conditional
//! primitives, so every transition is compare-and-swap and every candidate
//! append is atomic.  A transition that already happened on the other side
//! resolves as a silent no-op here, never an error.
//!
//! Candidate handling follows the usual trickle discipline: a remote
//! candidate is only handed to the media transport once the remote
//! description (the peer's offer or answer) is installed; anything arriving
//! earlier is buffered, not dropped.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use causerie_feed::{CallRow, FeedError, FeedStore};
use causerie_shared::types::{CallId, CallStatus, CallType, CandidateRole, ConversationId, UserId};

use crate::transport::{MediaError, MediaTransport};

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Feed error: {0}")]
    Feed(FeedError),

    #[error("Already in a call")]
    Busy,

    #[error("No active call")]
    NoActiveCall,

    #[error("Media transport error: {0}")]
    Media(#[from] MediaError),
}

impl From<FeedError> for CallError {
    fn from(e: FeedError) -> Self {
        match e {
            // The conversation-level uniqueness guard reads as "busy" here.
            FeedError::ActiveCallExists => CallError::Busy,
            other => CallError::Feed(other),
        }
    }
}

/// Surfaced to the UI when a ringing call names us as callee.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub conversation_id: ConversationId,
    pub caller_id: UserId,
    pub call_type: CallType,
    pub offer: String,
}

#[derive(Debug)]
struct ActiveCall {
    id: CallId,
    conversation_id: ConversationId,
    peer: UserId,
    role: CandidateRole,
    status: CallStatus,
    /// Whether the peer's description is installed; gates candidate apply.
    remote_set: bool,
    buffered_remote: Vec<String>,
    seen_remote: Vec<String>,
    seen_local: Vec<String>,
    is_muted: bool,
    is_video_enabled: bool,
}

impl ActiveCall {
    fn new(
        id: CallId,
        conversation_id: ConversationId,
        peer: UserId,
        role: CandidateRole,
        status: CallStatus,
    ) -> Self {
        Self {
            id,
            conversation_id,
            peer,
            role,
            status,
            remote_set: false,
            buffered_remote: Vec::new(),
            seen_remote: Vec::new(),
            seen_local: Vec::new(),
            is_muted: false,
            is_video_enabled: true,
        }
    }
}

#[derive(Default)]
struct CallState {
    active: Option<ActiveCall>,
    incoming: Option<IncomingCall>,
}

pub struct CallSignaling {
    feed: Arc<dyn FeedStore>,
    media: Arc<dyn MediaTransport>,
    local_user: UserId,
    state: Mutex<CallState>,
}

impl CallSignaling {
    pub fn new(
        feed: Arc<dyn FeedStore>,
        media: Arc<dyn MediaTransport>,
        local_user: UserId,
    ) -> Self {
        Self {
            feed,
            media,
            local_user,
            state: Mutex::new(CallState::default()),
        }
    }

    /// Caller side: create a ringing call carrying our offer.
    ///
    /// Rejected with [`CallError::Busy`] while we are already in a call or
    /// the conversation has another non-terminal call.
    pub async fn start_call(
        &self,
        conversation: ConversationId,
        callee: UserId,
        call_type: CallType,
    ) -> Result<CallId, CallError> {
        {
            let state = self.state.lock().unwrap();
            if state.active.is_some() {
                return Err(CallError::Busy);
            }
        }

        let offer = self.media.create_offer().await?;
        let row = CallRow {
            id: CallId::new(),
            conversation_id: conversation,
            caller_id: self.local_user,
            callee_id: callee,
            call_type,
            status: CallStatus::Ringing,
            offer: Some(offer),
            answer: None,
            caller_candidates: Vec::new(),
            callee_candidates: Vec::new(),
            created_at: Utc::now(),
        };
        let id = row.id;
        self.feed.create_call(row).await?;

        let mut state = self.state.lock().unwrap();
        state.active = Some(ActiveCall::new(
            id,
            conversation,
            callee,
            CandidateRole::Caller,
            CallStatus::Ringing,
        ));
        info!(call = %id, callee = %callee.short(), "call started");
        Ok(id)
    }

    /// Callee side: a freshly-inserted ringing row naming us as callee
    /// surfaces as an incoming call.  Everything else is ignored.
    pub fn on_call_inserted(&self, row: &CallRow) -> Option<IncomingCall> {
        if row.status != CallStatus::Ringing
            || row.callee_id != self.local_user
            || row.caller_id == self.local_user
        {
            return None;
        }
        let Some(offer) = row.offer.clone() else {
            warn!(call = %row.id, "ringing call without an offer, ignoring");
            return None;
        };

        let incoming = IncomingCall {
            call_id: row.id,
            conversation_id: row.conversation_id,
            caller_id: row.caller_id,
            call_type: row.call_type,
            offer,
        };
        debug!(call = %row.id, from = %row.caller_id.short(), "incoming call");
        self.state.lock().unwrap().incoming = Some(incoming.clone());
        Some(incoming)
    }

    /// Accept the pending incoming call.  Returns `false` as a silent no-op
    /// when there is nothing to accept or the call already left `Ringing`
    /// on the other side.
    pub async fn accept_call(&self) -> Result<bool, CallError> {
        let incoming = {
            let state = self.state.lock().unwrap();
            let Some(incoming) = state.incoming.clone() else {
                // Nothing pending (or already resolved): silent no-op.
                return Ok(false);
            };
            if state.active.is_some() {
                return Err(CallError::Busy);
            }
            incoming
        };

        let updated = self
            .feed
            .transition_call(incoming.call_id, &[CallStatus::Ringing], CallStatus::Accepted)
            .await?;
        let Some(row) = updated else {
            // Resolved elsewhere while we were deciding.
            self.state.lock().unwrap().incoming = None;
            return Ok(false);
        };

        let answer = self.media.create_answer(&incoming.offer).await?;
        // Write-once: if an answer is somehow already present, it wins.
        let _ = self.feed.set_call_answer(row.id, answer).await?;
        self.media.set_remote_description(&incoming.offer).await?;

        // Candidates the caller trickled while we were ringing.
        let early: Vec<String> = row.caller_candidates.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.incoming = None;
            let mut call = ActiveCall::new(
                row.id,
                row.conversation_id,
                row.caller_id,
                CandidateRole::Callee,
                CallStatus::Accepted,
            );
            call.remote_set = true;
            call.seen_remote = early.clone();
            state.active = Some(call);
        }
        for candidate in &early {
            self.media.add_ice_candidate(candidate).await?;
        }

        info!(call = %incoming.call_id, "call accepted");
        Ok(true)
    }

    /// Decline the pending incoming call.  Silent no-op when there is none
    /// or the session already left `Ringing`.
    pub async fn reject_call(&self) -> Result<bool, CallError> {
        let incoming = {
            let mut state = self.state.lock().unwrap();
            match state.incoming.take() {
                Some(incoming) => incoming,
                None => return Ok(false),
            }
        };

        let updated = self
            .feed
            .transition_call(incoming.call_id, &[CallStatus::Ringing], CallStatus::Rejected)
            .await?;
        if updated.is_some() {
            info!(call = %incoming.call_id, "call rejected");
        }
        Ok(updated.is_some())
    }

    /// Hang up.  Valid from `Ringing` (caller cancels) and `Accepted`
    /// (either side); local media is torn down regardless of what the feed
    /// says.  With no active call this declines a pending incoming one, and
    /// otherwise it is a no-op.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let current = { self.state.lock().unwrap().active.take() };

        let Some(call) = current else {
            let incoming = { self.state.lock().unwrap().incoming.take() };
            if let Some(incoming) = incoming {
                let _ = self
                    .feed
                    .transition_call(incoming.call_id, &[CallStatus::Ringing], CallStatus::Rejected)
                    .await?;
            }
            return Ok(());
        };

        let result = self
            .feed
            .transition_call(
                call.id,
                &[CallStatus::Ringing, CallStatus::Accepted],
                CallStatus::Ended,
            )
            .await;
        // Cleanup is unconditional; the row may already be terminal.
        self.media.close().await;
        info!(call = %call.id, "call ended");
        result?;
        Ok(())
    }

    /// Publish a locally-gathered candidate under our role's list.
    /// Deduplicated by literal value on both ends.
    pub async fn push_local_candidate(&self, candidate: &str) -> Result<bool, CallError> {
        let (id, role) = {
            let mut state = self.state.lock().unwrap();
            let Some(call) = state.active.as_mut() else {
                return Err(CallError::NoActiveCall);
            };
            if call.seen_local.iter().any(|c| c == candidate) {
                return Ok(false);
            }
            call.seen_local.push(candidate.to_string());
            (call.id, call.role)
        };

        let added = self
            .feed
            .append_ice_candidate(id, role, candidate.to_string())
            .await?;
        Ok(added)
    }

    /// Fold a call-row update into the local machine.  Returns the new
    /// status when it changed from our point of view.
    pub async fn on_call_updated(&self, row: &CallRow) -> Result<Option<CallStatus>, CallError> {
        // A pending incoming call that resolved elsewhere stops ringing.
        {
            let mut state = self.state.lock().unwrap();
            if let Some(incoming) = &state.incoming {
                if incoming.call_id == row.id && row.status != CallStatus::Ringing {
                    let ours = state.active.as_ref().map(|c| c.id) == Some(row.id);
                    if !ours {
                        state.incoming = None;
                        if row.status.is_terminal() {
                            return Ok(Some(row.status));
                        }
                    }
                }
            }
        }

        let mut remote_sdp: Option<String> = None;
        let mut to_apply: Vec<String> = Vec::new();
        let mut changed: Option<CallStatus> = None;
        let mut teardown = false;
        {
            let mut state = self.state.lock().unwrap();
            let Some(call) = state.active.as_mut() else {
                return Ok(None);
            };
            if call.id != row.id {
                return Ok(None);
            }

            if row.status != call.status {
                call.status = row.status;
                changed = Some(row.status);
            }

            if row.status.is_terminal() {
                teardown = true;
            } else {
                if call.role == CandidateRole::Caller && !call.remote_set {
                    if let Some(answer) = &row.answer {
                        call.remote_set = true;
                        remote_sdp = Some(answer.clone());
                        // Buffered candidates apply right after the answer.
                        to_apply.append(&mut call.buffered_remote);
                    }
                }

                for candidate in row.candidates(call.role.opposite()) {
                    if call.seen_remote.iter().any(|c| c == candidate) {
                        continue;
                    }
                    call.seen_remote.push(candidate.clone());
                    if call.remote_set {
                        to_apply.push(candidate.clone());
                    } else {
                        call.buffered_remote.push(candidate.clone());
                    }
                }
            }

            if teardown {
                state.active = None;
            }
        }

        if teardown {
            self.media.close().await;
            return Ok(changed);
        }
        if let Some(sdp) = remote_sdp {
            self.media.set_remote_description(&sdp).await?;
        }
        for candidate in &to_apply {
            self.media.add_ice_candidate(candidate).await?;
        }
        Ok(changed)
    }

    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut state = self.state.lock().unwrap();
        let call = state.active.as_mut().ok_or(CallError::NoActiveCall)?;
        call.is_muted = !call.is_muted;
        info!(muted = call.is_muted, "mute toggled");
        Ok(call.is_muted)
    }

    pub fn toggle_video(&self) -> Result<bool, CallError> {
        let mut state = self.state.lock().unwrap();
        let call = state.active.as_mut().ok_or(CallError::NoActiveCall)?;
        call.is_video_enabled = !call.is_video_enabled;
        info!(video = call.is_video_enabled, "video toggled");
        Ok(call.is_video_enabled)
    }

    pub fn is_in_call(&self) -> bool {
        self.state.lock().unwrap().active.is_some()
    }

    /// `(call id, status, our role)` of the active call, if any.
    pub fn current(&self) -> Option<(CallId, CallStatus, CandidateRole)> {
        self.state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|c| (c.id, c.status, c.role))
    }

    pub fn peer(&self) -> Option<UserId> {
        self.state.lock().unwrap().active.as_ref().map(|c| c.peer)
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.state
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map(|c| c.conversation_id)
    }
}

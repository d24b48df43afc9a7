//! Media transport collaborator.
//!
//! The signaling machine only orchestrates the offer/answer/candidate
//! exchange; session descriptions and candidates are opaque strings and the
//! negotiated media stream never crosses this boundary.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Media transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Start local capture and produce the local session description.
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Produce an answer for a received offer.
    async fn create_answer(&self, offer: &str) -> Result<String, MediaError>;

    /// Install the peer's session description.  Candidates may only be
    /// applied after this has happened.
    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError>;

    /// Tear down capture and the media path.  Idempotent.
    async fn close(&self);
}

/// Recording mock used by the signaling tests: every call is appended to an
/// operation log so ordering constraints can be asserted.
#[derive(Clone, Default)]
pub struct MockMediaTransport {
    inner: Arc<Mutex<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    ops: Vec<String>,
    sdp_counter: usize,
}

impl MockMediaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything that happened, in order.
    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    pub fn closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .any(|op| op == "close")
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter_map(|op| op.strip_prefix("add_candidate:").map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl MediaTransport for MockMediaTransport {
    async fn create_offer(&self) -> Result<String, MediaError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sdp_counter += 1;
        let sdp = format!("offer-sdp-{}", inner.sdp_counter);
        inner.ops.push("create_offer".to_string());
        Ok(sdp)
    }

    async fn create_answer(&self, offer: &str) -> Result<String, MediaError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sdp_counter += 1;
        let sdp = format!("answer-sdp-{}", inner.sdp_counter);
        inner.ops.push(format!("create_answer:{offer}"));
        Ok(sdp)
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .push(format!("set_remote:{sdp}"));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .push(format!("add_candidate:{candidate}"));
        Ok(())
    }

    async fn close(&self) {
        self.inner.lock().unwrap().ops.push("close".to_string());
    }
}

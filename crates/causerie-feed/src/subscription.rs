//! Explicitly-scoped subscription handles.
//!
//! Every realtime stream is owned by whichever component opened it and is
//! released deterministically: either through [`FeedSubscription::close`] or
//! on drop.  There is no shared long-lived channel object to leak.

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::FeedEvent;

type CancelFn = Box<dyn FnOnce() + Send>;

pub struct FeedSubscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<FeedEvent>,
    cancel: Option<CancelFn>,
}

impl FeedSubscription {
    pub fn new(
        topic: impl Into<String>,
        rx: mpsc::UnboundedReceiver<FeedEvent>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next event.  `None` once the feed side has gone away.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    /// Drain without waiting; used by pollers.
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe now.  Equivalent to dropping the handle, but reads better
    /// at call sites that must release the old stream before opening a new
    /// one.
    pub fn close(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!(topic = %self.topic, "closing feed subscription");
            cancel();
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("topic", &self.topic)
            .finish()
    }
}

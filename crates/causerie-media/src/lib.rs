// Call signaling over the shared change feed: offer/answer exchange and
// ICE candidate relay between exactly two peers.

pub mod signaling;
pub mod transport;

pub use signaling::{CallError, CallSignaling, IncomingCall};
pub use transport::{MediaError, MediaTransport, MockMediaTransport};

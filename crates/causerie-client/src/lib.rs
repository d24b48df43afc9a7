pub mod events;
pub mod session;
pub mod state;

use tracing_subscriber::{fmt, EnvFilter};

pub use events::SessionEvent;
pub use session::{ChatSession, SessionError};
pub use state::SessionState;

/// Install the global tracing subscriber.  `RUST_LOG` wins when set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("causerie_client=debug,causerie_sync=debug,causerie_feed=info,causerie_media=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

//! Deterministic session teardown
//!
//! When refresh is impossible (or a call arrives with no stored credential)
//! the session ends: the credential slot is cleared and the host application
//! receives a single `LoginRequired` event to route the user back to
//! authentication. Termination is a guarded one-shot, so a batch of
//! concurrently failing calls produces exactly one observable teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tracker_auth::CredentialStore;

/// Signal crossing into the host application's presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is gone; route the user to re-authentication.
    LoginRequired,
}

/// One-shot session teardown.
///
/// `terminate()` is idempotent: only the first caller after (re-)arming
/// clears the store and emits the event. A successful login re-arms it.
pub struct SessionTerminator {
    store: Arc<CredentialStore>,
    events: mpsc::UnboundedSender<SessionEvent>,
    fired: AtomicBool,
}

impl SessionTerminator {
    /// Create a terminator and the event receiver the host listens on.
    pub fn new(store: Arc<CredentialStore>) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                store,
                events,
                fired: AtomicBool::new(false),
            },
            receiver,
        )
    }

    /// Clear the credential slot and signal the host, at most once.
    pub async fn terminate(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("session already terminated");
            return;
        }

        metrics::counter!("client_session_terminations_total").increment(1);
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "failed to clear credential slot during teardown");
        }
        info!("session terminated, signalling re-authentication");
        // Send only fails if the host dropped its receiver; nothing to do then.
        let _ = self.events.send(SessionEvent::LoginRequired);
    }

    /// Re-enable termination after a successful login.
    pub fn rearm(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }
}

//! Single-flight refresh coordination
//!
//! The refresh token is single-use: if N concurrently failing calls each ran
//! their own exchange, the first would consume it and the other N-1 would be
//! rejected, tearing the session down under ordinary concurrent load. The
//! coordinator therefore keeps at most one exchange in transit. The first
//! caller to observe `Idle` becomes the leader and runs the exchange; every
//! caller that arrives while it is `InFlight` subscribes as a follower and
//! receives the leader's outcome. After a failed exchange the state is
//! `Unavailable` and stays that way until the next login.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use tracker_auth::{Credential, CredentialStore, token};

use crate::session::SessionTerminator;

/// Outcome of one refresh exchange, fanned out to all waiters.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The exchange produced a new pair; retry with this credential.
    Refreshed(Credential),
    /// No new credential can be obtained until the next login.
    Unavailable,
}

/// Process-wide refresh state. Transitions happen under the mutex only.
enum RefreshState {
    Idle,
    /// One exchange in transit; the sender fans its outcome out to followers.
    InFlight(broadcast::Sender<RefreshOutcome>),
    /// Terminal until the next login.
    Unavailable,
}

/// Single-flight refresh coordinator.
///
/// The state mutex is a std `Mutex` held only for transitions, never across
/// an await. The leader's exchange runs outside the lock; followers block on
/// the broadcast channel instead of polling.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    store: Arc<CredentialStore>,
    terminator: Arc<SessionTerminator>,
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

/// Restores `Idle` if the leader is dropped before it settles, so blocked
/// followers re-contend instead of hanging on a dead channel.
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock_state(&self.coordinator.state);
        *state = RefreshState::Idle;
    }
}

fn lock_state(mutex: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    // The state enum holds no invariants a panicked transition could break.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        terminator: Arc<SessionTerminator>,
        http: reqwest::Client,
        base_url: String,
        timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::Idle),
            store,
            terminator,
            http,
            base_url,
            timeout,
        }
    }

    /// Obtain a fresh credential, sharing one exchange among all callers.
    ///
    /// Exactly one caller at a time observes `Idle` and leads the exchange;
    /// the rest follow its outcome. While `Unavailable`, returns immediately
    /// with no network call.
    pub async fn obtain_fresh_credential(&self) -> RefreshOutcome {
        enum Role {
            Leader(broadcast::Sender<RefreshOutcome>),
            Follower(broadcast::Receiver<RefreshOutcome>),
        }

        loop {
            let role = {
                let mut state = lock_state(&self.state);
                match &*state {
                    RefreshState::Idle => {
                        let (sender, _) = broadcast::channel(1);
                        *state = RefreshState::InFlight(sender.clone());
                        Role::Leader(sender)
                    }
                    RefreshState::InFlight(sender) => Role::Follower(sender.subscribe()),
                    RefreshState::Unavailable => {
                        debug!("refresh unavailable, failing without exchange");
                        return RefreshOutcome::Unavailable;
                    }
                }
            };

            match role {
                Role::Leader(sender) => return self.lead(sender).await,
                Role::Follower(mut receiver) => {
                    debug!("waiting on in-flight refresh exchange");
                    metrics::counter!("client_refresh_followers_total").increment(1);
                    match receiver.recv().await {
                        Ok(outcome) => return outcome,
                        // The leader was cancelled before settling; contend again.
                        Err(broadcast::error::RecvError::Closed)
                        | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    /// Return the state to `Idle` after a successful login.
    pub fn reset(&self) {
        let mut state = lock_state(&self.state);
        *state = RefreshState::Idle;
    }

    /// Run the exchange as leader and fan the outcome out.
    async fn lead(&self, sender: broadcast::Sender<RefreshOutcome>) -> RefreshOutcome {
        let mut guard = SettleGuard {
            coordinator: self,
            armed: true,
        };

        info!("leading refresh exchange");

        let refresh = match self.store.get().await {
            Some(credential) => credential.refresh,
            None => {
                warn!("credential slot emptied before refresh could run");
                return self.settle_unavailable(&mut guard, sender).await;
            }
        };

        metrics::counter!("client_refresh_exchanges_total").increment(1);
        let exchange = token::refresh_token(&self.http, &self.base_url, &refresh);
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => {
                let credential = Credential {
                    access: response.access_token,
                    refresh: response.refresh_token,
                };
                // The leader is the only writer during refresh.
                if let Err(e) = self.store.set(credential.clone()).await {
                    warn!(error = %e, "failed to persist refreshed credential");
                }
                info!("refresh exchange succeeded");
                let outcome = RefreshOutcome::Refreshed(credential);
                {
                    let mut state = lock_state(&self.state);
                    *state = RefreshState::Idle;
                    // Every follower subscribed while state was InFlight,
                    // so all of them see this exact outcome.
                    let _ = sender.send(outcome.clone());
                }
                guard.armed = false;
                outcome
            }
            Ok(Err(e)) => {
                warn!(error = %e, "refresh exchange failed");
                self.settle_unavailable(&mut guard, sender).await
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "refresh exchange timed out"
                );
                self.settle_unavailable(&mut guard, sender).await
            }
        }
    }

    async fn settle_unavailable(
        &self,
        guard: &mut SettleGuard<'_>,
        sender: broadcast::Sender<RefreshOutcome>,
    ) -> RefreshOutcome {
        {
            let mut state = lock_state(&self.state);
            *state = RefreshState::Unavailable;
            let _ = sender.send(RefreshOutcome::Unavailable);
        }
        guard.armed = false;
        self.terminator.terminate().await;
        RefreshOutcome::Unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn seeded_store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        let store = CredentialStore::load(dir.path().join("credential.json"))
            .await
            .unwrap();
        store
            .set(Credential {
                access: "at_old".into(),
                refresh: "rt_old".into(),
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    fn coordinator(
        store: Arc<CredentialStore>,
        base_url: String,
        timeout: Duration,
    ) -> (
        Arc<RefreshCoordinator>,
        tokio::sync::mpsc::UnboundedReceiver<crate::session::SessionEvent>,
    ) {
        let (terminator, events) = SessionTerminator::new(store.clone());
        let coordinator = RefreshCoordinator::new(
            store,
            Arc::new(terminator),
            reqwest::Client::new(),
            base_url,
            timeout,
        );
        (Arc::new(coordinator), events)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(tracker_auth::REFRESH_PATH))
            .and(header("authorization", "Bearer rt_old"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at_new",
                "refresh_token": "rt_new",
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (coordinator, _events) =
            coordinator(store.clone(), server.uri(), Duration::from_secs(5));

        let mut handles = vec![];
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.obtain_fresh_credential().await
            }));
        }

        for h in handles {
            match h.await.unwrap() {
                RefreshOutcome::Refreshed(credential) => {
                    assert_eq!(credential.access, "at_new");
                    assert_eq!(credential.refresh, "rt_new");
                }
                RefreshOutcome::Unavailable => panic!("refresh should have succeeded"),
            }
        }

        // Leader alone wrote the store, both tokens from the same issue
        let stored = store.get().await.unwrap();
        assert_eq!(stored.access, "at_new");
        assert_eq!(stored.refresh, "rt_new");
    }

    #[tokio::test]
    async fn rejected_exchange_settles_unavailable_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(tracker_auth::REFRESH_PATH))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let (coordinator, mut events) =
            coordinator(store.clone(), server.uri(), Duration::from_secs(5));

        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Unavailable));

        // Store cleared, host signalled once
        assert!(store.is_empty().await);
        assert_eq!(
            events.recv().await,
            Some(crate::session::SessionEvent::LoginRequired)
        );

        // Terminal state: no further exchange attempted (expect(1) above)
        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Unavailable));
    }

    #[tokio::test]
    async fn reset_reenables_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(tracker_auth::REFRESH_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (coordinator, _events) =
            coordinator(store.clone(), server.uri(), Duration::from_secs(5));

        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Unavailable));

        // Simulate a new login: slot repopulated, state back to Idle
        store
            .set(Credential {
                access: "at_relogin".into(),
                refresh: "rt_relogin".into(),
            })
            .await
            .unwrap();
        coordinator.reset();

        // The next caller leads again instead of short-circuiting
        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Unavailable));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_slot_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            CredentialStore::load(dir.path().join("credential.json"))
                .await
                .unwrap(),
        );

        let server = MockServer::start().await;
        let (coordinator, mut events) =
            coordinator(store, server.uri(), Duration::from_secs(5));

        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Unavailable));
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(
            events.recv().await,
            Some(crate::session::SessionEvent::LoginRequired)
        );
    }

    #[tokio::test]
    async fn cancelled_leader_does_not_wedge_followers() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(tracker_auth::REFRESH_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "at_new",
                        "refresh_token": "rt_new",
                        "token_type": "bearer"
                    }))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let (coordinator, _events) =
            coordinator(store, server.uri(), Duration::from_secs(5));

        // Abort the leader mid-exchange
        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        leader.abort();
        let _ = leader.await;

        // A later caller re-contends and completes normally
        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
    }

    #[tokio::test]
    async fn cancelled_follower_leaves_leader_and_other_followers_intact() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(tracker_auth::REFRESH_PATH))
            .and(header("authorization", "Bearer rt_old"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "at_new",
                        "refresh_token": "rt_new",
                        "token_type": "bearer"
                    }))
                    .set_delay(Duration::from_millis(400)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (coordinator, _events) =
            coordinator(store.clone(), server.uri(), Duration::from_secs(5));

        // First caller takes leadership before anyone else contends
        let leader = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.obtain_fresh_credential().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut followers = vec![];
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            followers.push(tokio::spawn(async move {
                coordinator.obtain_fresh_credential().await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Cancel one follower mid-wait; nobody else notices
        let cancelled = followers.pop().unwrap();
        cancelled.abort();
        let _ = cancelled.await;

        for h in std::iter::once(leader).chain(followers) {
            match h.await.unwrap() {
                RefreshOutcome::Refreshed(credential) => {
                    assert_eq!(credential.access, "at_new");
                    assert_eq!(credential.refresh, "rt_new");
                }
                RefreshOutcome::Unavailable => panic!("refresh should have succeeded"),
            }
        }
    }

    #[tokio::test]
    async fn hung_exchange_settles_unavailable_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(&dir).await;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(tracker_auth::REFRESH_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "at_late",
                        "refresh_token": "rt_late",
                        "token_type": "bearer"
                    }))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let (coordinator, mut events) =
            coordinator(store.clone(), server.uri(), Duration::from_millis(100));

        let outcome = coordinator.obtain_fresh_credential().await;
        assert!(matches!(outcome, RefreshOutcome::Unavailable));

        // Timed-out exchange tears the session down like any other failure
        assert!(store.is_empty().await);
        assert_eq!(
            events.recv().await,
            Some(crate::session::SessionEvent::LoginRequired)
        );
    }
}

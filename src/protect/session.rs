//! Single-flight session management.
//!
//! At most one login exchange runs at a time. Callers that arrive while a
//! login is in flight await the same shared future and receive its result,
//! success or failure.

use super::{ControllerClient, Credentials, Session};
use crate::error::{BridgeError, Result};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

type LoginFuture = Shared<BoxFuture<'static, std::result::Result<Session, String>>>;

/// Observable lifecycle of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

#[derive(Default)]
struct Slot {
    session: Option<Session>,
    inflight: Option<LoginFuture>,
}

struct Inner {
    client: Arc<dyn ControllerClient>,
    credentials: Credentials,
    slot: Mutex<Slot>,
}

/// Owner of the one live controller session.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(client: Arc<dyn ControllerClient>, credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                credentials,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        let slot = self.inner.slot.lock();
        if slot.inflight.is_some() {
            SessionState::Authenticating
        } else if slot.session.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// Current session without triggering a login.
    pub fn current(&self) -> Option<Session> {
        self.inner.slot.lock().session.clone()
    }

    /// Return the live session, logging in first if there is none.
    pub async fn ensure_session(&self) -> Result<Session> {
        let login = {
            let mut slot = self.inner.slot.lock();
            if let Some(session) = &slot.session {
                return Ok(session.clone());
            }
            self.login_future(&mut slot)
        };
        login.await.map_err(BridgeError::AuthFailed)
    }

    /// Log in again even if the current session still looks valid.
    ///
    /// Joins a login that is already in flight. On failure the previous
    /// session stays installed; it is dropped once the controller rejects it.
    pub async fn force_refresh(&self) -> Result<Session> {
        let login = {
            let mut slot = self.inner.slot.lock();
            self.login_future(&mut slot)
        };
        login.await.map_err(BridgeError::AuthFailed)
    }

    /// Drop `session` after the controller rejected it.
    ///
    /// A newer session installed in the meantime is kept.
    pub fn invalidate(&self, session: &Session) {
        let mut slot = self.inner.slot.lock();
        if slot.session.as_ref() == Some(session) {
            slot.session = None;
            info!("[Auth] Session rejected by controller, will log in again");
        }
    }

    fn login_future(&self, slot: &mut Slot) -> LoginFuture {
        if let Some(inflight) = &slot.inflight {
            return inflight.clone();
        }

        let inner = self.inner.clone();
        let login = async move {
            info!("[Auth] Logging in to {}", inner.credentials.base_url);
            let result = inner.client.login(&inner.credentials).await;

            let mut slot = inner.slot.lock();
            slot.inflight = None;
            match result {
                Ok(session) => {
                    slot.session = Some(session.clone());
                    info!("[Auth] Session established");
                    Ok(session)
                }
                Err(e) => {
                    warn!("[Auth] Login failed: {}", e);
                    Err(e.to_string())
                }
            }
        }
        .boxed()
        .shared();

        slot.inflight = Some(login.clone());
        login
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::{DeviceCommand, Event, EventWindow, Snapshot};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingClient {
        logins: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ControllerClient for CountingClient {
        async fn login(&self, _credentials: &Credentials) -> Result<Session> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::AuthFailed("bad credentials".to_string()));
            }
            Ok(Session {
                token: format!("token-{}", n),
                access_key: None,
                issued_at: Utc::now(),
            })
        }

        async fn fetch_bootstrap(&self, _session: &Session) -> Result<Snapshot> {
            unimplemented!()
        }

        async fn fetch_events(
            &self,
            _session: &Session,
            _types: &[&str],
            _window: EventWindow,
        ) -> Result<Vec<Event>> {
            unimplemented!()
        }

        async fn fetch_frame(&self, _session: &Session, _device_id: &str) -> Result<Vec<u8>> {
            unimplemented!()
        }

        async fn send_command(
            &self,
            _session: &Session,
            _device_id: &str,
            _command: &DeviceCommand,
        ) -> Result<()> {
            unimplemented!()
        }
    }

    fn manager(client: Arc<CountingClient>) -> SessionManager {
        SessionManager::new(
            client,
            Credentials {
                base_url: "https://nvr.local".to_string(),
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_login() {
        let client = Arc::new(CountingClient::default());
        let sessions = manager(client.clone());
        assert_eq!(sessions.state(), SessionState::Unauthenticated);

        let (a, b) = tokio::join!(sessions.ensure_session(), sessions.ensure_session());
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(sessions.state(), SessionState::Authenticated);

        // cached afterwards
        sessions.ensure_session().await.unwrap();
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_is_authenticating_during_login() {
        let client = Arc::new(CountingClient::default());
        let sessions = manager(client.clone());

        let pending = tokio::spawn({
            let sessions = sessions.clone();
            async move { sessions.ensure_session().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sessions.state(), SessionState::Authenticating);

        pending.await.unwrap().unwrap();
        assert_eq!(sessions.state(), SessionState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_is_shared_and_retryable() {
        let client = Arc::new(CountingClient::default());
        client.fail.store(true, Ordering::SeqCst);
        let sessions = manager(client.clone());

        let (a, b) = tokio::join!(sessions.ensure_session(), sessions.ensure_session());
        assert!(matches!(a, Err(BridgeError::AuthFailed(_))));
        assert!(matches!(b, Err(BridgeError::AuthFailed(_))));
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.state(), SessionState::Unauthenticated);

        client.fail.store(false, Ordering::SeqCst);
        let session = sessions.ensure_session().await.unwrap();
        assert_eq!(session.token, "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refresh_replaces_session() {
        let client = Arc::new(CountingClient::default());
        let sessions = manager(client.clone());

        let first = sessions.ensure_session().await.unwrap();
        let second = sessions.force_refresh().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(sessions.current(), Some(second));
        assert_eq!(client.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_force_refresh_keeps_previous_session() {
        let client = Arc::new(CountingClient::default());
        let sessions = manager(client.clone());

        let first = sessions.ensure_session().await.unwrap();
        client.fail.store(true, Ordering::SeqCst);
        assert!(sessions.force_refresh().await.is_err());
        assert_eq!(sessions.current(), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_only_drops_matching_session() {
        let client = Arc::new(CountingClient::default());
        let sessions = manager(client.clone());

        let stale = sessions.ensure_session().await.unwrap();
        let fresh = sessions.force_refresh().await.unwrap();

        sessions.invalidate(&stale);
        assert_eq!(sessions.current(), Some(fresh.clone()));

        sessions.invalidate(&fresh);
        assert_eq!(sessions.state(), SessionState::Unauthenticated);
    }
}

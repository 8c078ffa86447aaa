use super::{ControllerClient, DeviceCommand, Event, EventWindow, SessionManager, Snapshot};
use crate::error::{BridgeError, Result};
use std::future::Future;
use std::sync::Arc;

/// Controller calls made on behalf of the live session.
///
/// A call answered with [`BridgeError::SessionExpired`] invalidates the
/// session it used, so the next call logs in again.
#[derive(Clone)]
pub struct ProtectApi {
    client: Arc<dyn ControllerClient>,
    sessions: SessionManager,
}

impl ProtectApi {
    pub fn new(client: Arc<dyn ControllerClient>, sessions: SessionManager) -> Self {
        Self { client, sessions }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    async fn with_session<'a, T, F, Fut>(&'a self, call: F) -> Result<T>
    where
        F: FnOnce(&'a dyn ControllerClient, super::Session) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let session = self.sessions.ensure_session().await?;
        let result = call(self.client.as_ref(), session.clone()).await;
        if let Err(BridgeError::SessionExpired) = &result {
            self.sessions.invalidate(&session);
        }
        result
    }

    pub async fn bootstrap(&self) -> Result<Snapshot> {
        self.with_session(|client, session| async move { client.fetch_bootstrap(&session).await })
            .await
    }

    pub async fn events(&self, types: &[&str], window: EventWindow) -> Result<Vec<Event>> {
        self.with_session(|client, session| async move {
            client.fetch_events(&session, types, window).await
        })
        .await
    }

    pub async fn frame(&self, device_id: &str) -> Result<Vec<u8>> {
        self.with_session(|client, session| async move {
            client.fetch_frame(&session, device_id).await
        })
        .await
    }

    pub async fn command(&self, device_id: &str, command: &DeviceCommand) -> Result<()> {
        self.with_session(|client, session| async move {
            client.send_command(&session, device_id, command).await
        })
        .await
    }
}

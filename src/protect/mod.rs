//! UniFi Protect controller access.
//!
//! [`ControllerClient`] is the stateless request surface; [`SessionManager`]
//! owns the one live [`Session`]; [`ProtectApi`] glues the two together so
//! callers never handle credentials directly.

mod api;
mod client;
pub mod model;
mod session;

pub use api::ProtectApi;
pub use client::ProtectClient;
pub use model::{Device, DeviceKind, Event, MotionSignal, Readings, Snapshot};
pub use session::{SessionManager, SessionState};

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Account used for the login exchange.
#[derive(Clone)]
pub struct Credentials {
    pub base_url: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Authenticated session material returned by a login exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token sent on every API call.
    pub token: String,
    /// Key accepted by the snapshot endpoint in place of the bearer header.
    pub access_key: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("issued_at", &self.issued_at)
            .field("has_access_key", &self.access_key.is_some())
            .finish_non_exhaustive()
    }
}

/// Time range for an event query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Commands that can be forwarded to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Text shown on a doorbell's display.
    DisplayMessage(String),
}

impl DeviceCommand {
    /// JSON body of the PATCH request carrying this command.
    pub fn to_patch(&self) -> serde_json::Value {
        match self {
            DeviceCommand::DisplayMessage(text) => serde_json::json!({
                "lcdMessage": {
                    "type": "CUSTOM_MESSAGE",
                    "text": text,
                }
            }),
        }
    }
}

/// Request functions against the controller.
///
/// Implementations hold no session state; every call receives the session
/// to use. An expired or rejected session must be reported as
/// [`BridgeError::SessionExpired`](crate::error::BridgeError::SessionExpired).
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Session>;

    async fn fetch_bootstrap(&self, session: &Session) -> Result<Snapshot>;

    async fn fetch_events(
        &self,
        session: &Session,
        types: &[&str],
        window: EventWindow,
    ) -> Result<Vec<Event>>;

    async fn fetch_frame(&self, session: &Session, device_id: &str) -> Result<Vec<u8>>;

    async fn send_command(
        &self,
        session: &Session,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<()>;
}

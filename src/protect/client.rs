//! HTTP implementation of [`ControllerClient`] for UniFi Protect.

use super::{ControllerClient, Credentials, DeviceCommand, Event, EventWindow, Session, Snapshot};
use crate::config::ProtectConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use reqwest::{Response, StatusCode};
use serde::Deserialize;

const API_AUTH: &str = "/api/auth";
const API_ACCESS_KEY: &str = "/api/auth/access-key";
const API_BOOTSTRAP: &str = "/api/bootstrap";
const API_EVENTS: &str = "/api/events";
const API_CAMERAS: &str = "/api/cameras";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessKeyResponse {
    access_key: String,
}

/// Controller client over `reqwest`.
pub struct ProtectClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProtectClient {
    pub fn new(config: &ProtectConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| BridgeError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(session: &Session) -> String {
        format!("Bearer {}", session.token)
    }
}

/// Map an authenticated call's response status onto the error taxonomy.
fn check_status(response: Response, what: &str) -> Result<Response> {
    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BridgeError::SessionExpired),
        status if status.is_success() => Ok(response),
        status => Err(BridgeError::FetchFailed(format!("{} returned {}", what, status))),
    }
}

fn fetch_error(what: &str) -> impl FnOnce(reqwest::Error) -> BridgeError + '_ {
    move |e| BridgeError::FetchFailed(format!("{}: {}", what, e))
}

#[async_trait]
impl ControllerClient for ProtectClient {
    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let auth_error = |e: reqwest::Error| BridgeError::AuthFailed(e.to_string());

        let response = self
            .http
            .post(format!("{}{}", credentials.base_url, API_AUTH))
            .form(&[
                ("grant_type", "password"),
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(auth_error)?;

        if !response.status().is_success() {
            return Err(BridgeError::AuthFailed(format!(
                "login returned {}",
                response.status()
            )));
        }

        let token = response
            .headers()
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_start_matches("Bearer ").to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| BridgeError::AuthFailed("no access token in login response".into()))?;

        let key_response = self
            .http
            .post(format!("{}{}", credentials.base_url, API_ACCESS_KEY))
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await
            .map_err(auth_error)?;

        if !key_response.status().is_success() {
            return Err(BridgeError::AuthFailed(format!(
                "access key request returned {}",
                key_response.status()
            )));
        }

        let key: AccessKeyResponse = key_response.json().await.map_err(auth_error)?;

        Ok(Session {
            token,
            access_key: Some(key.access_key),
            issued_at: Utc::now(),
        })
    }

    async fn fetch_bootstrap(&self, session: &Session) -> Result<Snapshot> {
        let response = self
            .http
            .get(self.url(API_BOOTSTRAP))
            .header(reqwest::header::AUTHORIZATION, Self::bearer(session))
            .send()
            .await
            .map_err(fetch_error("bootstrap"))?;

        let body: serde_json::Value = check_status(response, "bootstrap")?
            .json()
            .await
            .map_err(fetch_error("bootstrap body"))?;

        Snapshot::from_bootstrap(body)
            .map_err(|e| BridgeError::FetchFailed(format!("bootstrap parse: {}", e)))
    }

    async fn fetch_events(
        &self,
        session: &Session,
        types: &[&str],
        window: EventWindow,
    ) -> Result<Vec<Event>> {
        let mut query: Vec<(&str, String)> = vec![
            ("start", window.start.timestamp_millis().to_string()),
            ("end", window.end.timestamp_millis().to_string()),
        ];
        query.extend(types.iter().map(|t| ("types", t.to_string())));

        let response = self
            .http
            .get(self.url(API_EVENTS))
            .header(reqwest::header::AUTHORIZATION, Self::bearer(session))
            .query(&query)
            .send()
            .await
            .map_err(fetch_error("events"))?;

        check_status(response, "events")?
            .json()
            .await
            .map_err(fetch_error("events body"))
    }

    async fn fetch_frame(&self, session: &Session, device_id: &str) -> Result<Vec<u8>> {
        let mut request = self
            .http
            .get(self.url(&format!("{}/{}/snapshot", API_CAMERAS, device_id)))
            .query(&[("force", "true")]);
        request = match &session.access_key {
            Some(key) => request.query(&[("accessKey", key.as_str())]),
            None => request.header(reqwest::header::AUTHORIZATION, Self::bearer(session)),
        };

        let response = request.send().await.map_err(fetch_error("snapshot"))?;
        let bytes = check_status(response, "snapshot")?
            .bytes()
            .await
            .map_err(fetch_error("snapshot body"))?;

        debug!("[Protect] Fetched {} byte frame for {}", bytes.len(), device_id);
        Ok(bytes.to_vec())
    }

    async fn send_command(
        &self,
        session: &Session,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<()> {
        let patch = command.to_patch();
        debug!("[Protect] PATCH camera {}: {}", device_id, patch);

        let response = self
            .http
            .patch(self.url(&format!("{}/{}", API_CAMERAS, device_id)))
            .header(reqwest::header::AUTHORIZATION, Self::bearer(session))
            .json(&patch)
            .send()
            .await
            .map_err(|e| BridgeError::CommandFailed(e.to_string()))?;

        match check_status(response, "camera patch") {
            Ok(_) => Ok(()),
            Err(BridgeError::FetchFailed(message)) => Err(BridgeError::CommandFailed(message)),
            Err(e) => Err(e),
        }
    }
}

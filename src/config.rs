//! Command line and environment configuration.
//!
//! Every option can be given as a long flag or as an environment variable.
//! [`Cli`] is the raw parsed form; [`Config`] is the validated form the rest
//! of the bridge consumes.

use crate::error::{BridgeError, Result};
use clap::{ArgAction, Parser};
use clap::builder::BoolishValueParser;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Load `KEY=value` pairs from a dotenv file into the process environment.
///
/// Values may contain spaces without quoting; surrounding quotes are
/// stripped. Variables that are already set are left alone. Returns the
/// number of variables that were applied.
pub fn load_dotenv(path: impl AsRef<Path>) -> usize {
    let Ok(content) = fs::read_to_string(path.as_ref()) else {
        return 0;
    };

    let mut applied = 0;
    for (key, value) in parse_dotenv(&content) {
        if std::env::var(key).is_err() {
            // SAFETY: called from main before the async runtime spawns any threads
            unsafe { std::env::set_var(key, value) };
            applied += 1;
        }
    }
    applied
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim().trim_start_matches("export ").trim();
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            (!key.is_empty()).then_some((key, value))
        })
        .collect()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "protect-mqtt-bridge")]
#[command(about = "Publish UniFi Protect device state and object detections to MQTT")]
pub struct Cli {
    /// Protect controller URL (bare hosts are treated as https)
    #[arg(long, env = "PROTECT_URL")]
    pub protect_url: Option<String>,

    /// Controller account name
    #[arg(long, env = "USERNAME")]
    pub username: Option<String>,

    /// Controller account password
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Prefix for every published topic
    #[arg(long, env = "TOPIC_PREFIX")]
    pub topic_prefix: Option<String>,

    /// Seconds between state polls
    #[arg(long, env = "POLL_FREQUENCY", default_value_t = 1)]
    pub poll_frequency: u64,

    /// Seconds between proactive session refreshes
    #[arg(long, env = "AUTH_POLL_FREQUENCY", default_value_t = 3600)]
    pub auth_poll_frequency: u64,

    /// Publish every message with the retain flag
    #[arg(long, env = "MQTT_RETAIN", default_value = "true", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub mqtt_retain: bool,

    /// Run object detection on frames of cameras with active motion
    #[arg(long, env = "ANALYSIS_ENABLED", default_value = "false", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub analysis_enabled: bool,

    /// Minimum detection score that counts as an object
    #[arg(long, env = "ANALYSIS_THRESHOLD", default_value_t = 0.7)]
    pub analysis_threshold: f32,

    /// Maximum detections requested per frame
    #[arg(long, env = "ANALYSIS_MAX_RESULTS", default_value_t = 40)]
    pub analysis_max_results: usize,

    /// Object detection endpoint (frame bytes in, JSON detections out)
    #[arg(long, env = "DETECTOR_URL")]
    pub detector_url: Option<String>,

    /// Publish smart detections from the controller's event feed
    #[arg(long, env = "EVENTS_ENABLED", default_value = "false", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub events_enabled: bool,

    /// Seconds added to the poll interval when deciding whether an event is fresh
    #[arg(long, env = "EVENT_GRACE", default_value_t = 5)]
    pub event_grace: u64,

    /// Per-request timeout in seconds for controller and detector calls
    #[arg(long, env = "REQUEST_TIMEOUT", default_value_t = 10)]
    pub request_timeout: u64,

    /// Accept self-signed controller certificates
    #[arg(long, env = "ACCEPT_INVALID_CERTS", default_value = "true", value_parser = BoolishValueParser::new(), action = ArgAction::Set)]
    pub accept_invalid_certs: bool,

    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST", default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// MQTT client id (random when unset)
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub protect: ProtectConfig,
    pub mqtt: MqttConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct ProtectConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
    pub accept_invalid_certs: bool,
    pub auth_refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub retain: bool,
}

/// Settings for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub events_enabled: bool,
    pub event_grace: Duration,
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub enabled: bool,
    pub detector_url: Option<String>,
    pub confidence_threshold: f32,
    pub max_results: usize,
    /// How long a tick waits for the analyses it started.
    pub timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            events_enabled: false,
            event_grace: Duration::from_secs(5),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            detector_url: None,
            confidence_threshold: 0.7,
            max_results: 40,
            timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Window in which an event start counts as fresh.
    pub fn event_threshold(&self) -> Duration {
        self.poll_interval + self.event_grace
    }

    /// Recency window for `lastRing` / `lastMotion` timestamps.
    pub fn recency_window(&self) -> Duration {
        self.poll_interval * 2
    }
}

impl TryFrom<Cli> for Config {
    type Error = BridgeError;

    fn try_from(cli: Cli) -> Result<Self> {
        let topic_prefix = required(cli.topic_prefix, "TOPIC_PREFIX")?;
        let protect_url = required(cli.protect_url, "PROTECT_URL")?;
        let username = required(cli.username, "USERNAME")?;
        let password = required(cli.password, "PASSWORD")?;

        if cli.poll_frequency == 0 {
            return Err(BridgeError::InvalidConfig(
                "POLL_FREQUENCY must be at least 1 second".to_string(),
            ));
        }
        if cli.auth_poll_frequency == 0 {
            return Err(BridgeError::InvalidConfig(
                "AUTH_POLL_FREQUENCY must be at least 1 second".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&cli.analysis_threshold) {
            return Err(BridgeError::InvalidConfig(format!(
                "ANALYSIS_THRESHOLD must be within 0..=1, got {}",
                cli.analysis_threshold
            )));
        }

        let detector_url = cli.detector_url.filter(|url| !url.trim().is_empty());
        if cli.analysis_enabled && detector_url.is_none() {
            return Err(BridgeError::StartupConfigMissing("DETECTOR_URL"));
        }

        let request_timeout = Duration::from_secs(cli.request_timeout.max(1));
        let client_id = cli
            .mqtt_client_id
            .unwrap_or_else(|| format!("protect-mqtt-bridge-{}", uuid::Uuid::new_v4().simple()));

        Ok(Self {
            protect: ProtectConfig {
                base_url: normalize_base_url(&protect_url)?,
                username,
                password,
                request_timeout,
                accept_invalid_certs: cli.accept_invalid_certs,
                auth_refresh_interval: Duration::from_secs(cli.auth_poll_frequency),
            },
            mqtt: MqttConfig {
                broker_host: cli.mqtt_host,
                broker_port: cli.mqtt_port,
                client_id,
                username: cli.mqtt_username,
                password: cli.mqtt_password,
                topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
                retain: cli.mqtt_retain,
            },
            engine: EngineConfig {
                poll_interval: Duration::from_secs(cli.poll_frequency),
                events_enabled: cli.events_enabled,
                event_grace: Duration::from_secs(cli.event_grace),
                analysis: AnalysisConfig {
                    enabled: cli.analysis_enabled,
                    detector_url,
                    confidence_threshold: cli.analysis_threshold,
                    max_results: cli.analysis_max_results.max(1),
                    timeout: request_timeout,
                },
            },
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or(BridgeError::StartupConfigMissing(name))
}

/// Turn `PROTECT_URL` into a scheme-qualified base URL without a trailing slash.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(BridgeError::StartupConfigMissing("PROTECT_URL"));
    }
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        Ok(trimmed.to_string())
    } else if trimmed.contains("://") {
        Err(BridgeError::InvalidConfig(format!(
            "unsupported scheme in PROTECT_URL: {}",
            trimmed
        )))
    } else {
        Ok(format!("https://{}", trimmed))
    }
}

//! One-shot controller probe.
//!
//! Usage:
//!   cargo run --bin protect-probe
//!
//! Logs in with the bridge's configuration, lists the devices the
//! controller reports together with their derived facts, and runs a single
//! reconciliation pass that logs the messages it would publish instead of
//! sending them to a broker.

use chrono::Utc;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use protect_mqtt_bridge::config::{Cli, Config, load_dotenv};
use protect_mqtt_bridge::engine::ReconciliationEngine;
use protect_mqtt_bridge::mqtt::{LogPublisher, Topics};
use protect_mqtt_bridge::protect::{Credentials, ProtectApi, ProtectClient, SessionManager};

#[tokio::main]
async fn main() {
    load_dotenv(".env");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cli = Cli::parse();
    // The probe never publishes, so a prefix is only needed for display.
    cli.topic_prefix.get_or_insert_with(|| "protect".to_string());
    // Frames are not analysed here.
    cli.analysis_enabled = false;

    let config = match Config::try_from(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Probing {}", config.protect.base_url);

    let client = match ProtectClient::new(&config.protect) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    let sessions = SessionManager::new(
        client.clone(),
        Credentials {
            base_url: config.protect.base_url.clone(),
            username: config.protect.username.clone(),
            password: config.protect.password.clone(),
        },
    );
    let api = ProtectApi::new(client, sessions);

    if let Err(e) = api.sessions().ensure_session().await {
        error!("Login failed: {}", e);
        std::process::exit(1);
    }
    info!("Logged in");

    let snapshot = match api.bootstrap().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Bootstrap fetch failed: {}", e);
            std::process::exit(1);
        }
    };

    let now = Utc::now();
    let window = config.engine.recency_window();
    info!("{} device(s):", snapshot.devices.len());
    for device in &snapshot.devices {
        info!(
            "  {} [{}] id={} state={} motion={} ringing={} kind={:?}",
            device.name,
            device.topic_name(),
            device.id,
            device.state,
            device.is_motion_active(now, window),
            device.is_ringing(now, window),
            device.kind
        );
    }

    info!("Messages for one reconciliation pass:");
    let topics = Topics::new(config.mqtt.topic_prefix.clone(), config.mqtt.retain);
    let mut engine =
        ReconciliationEngine::new(config.engine.clone(), api, Arc::new(LogPublisher), topics);
    if let Err(e) = engine.tick(now).await {
        error!("Reconciliation pass failed: {}", e);
        std::process::exit(1);
    }
}

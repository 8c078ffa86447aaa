use clap::Parser;
use log::{error, info};
use protect_mqtt_bridge::bridge::ProtectBridge;
use protect_mqtt_bridge::config::{Cli, Config, load_dotenv};
use tokio::signal;
use tokio_util::sync::CancellationToken;

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    // Environment variables take precedence over .env entries
    let loaded = load_dotenv(".env");
    init_logger();
    info!("Starting Protect MQTT bridge");
    if loaded > 0 {
        info!("Loaded {} variable(s) from .env", loaded);
    }

    let config = match Config::try_from(Cli::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}, not starting", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded:");
    info!("  Controller: {}", config.protect.base_url);
    info!("  Topic prefix: {}", config.mqtt.topic_prefix);
    info!("  Poll interval: {:?}", config.engine.poll_interval);
    info!("  Auth refresh: {:?}", config.protect.auth_refresh_interval);
    info!("  Retain: {}", config.mqtt.retain);
    info!("  Analysis: {}", config.engine.analysis.enabled);
    info!("  Events: {}", config.engine.events_enabled);

    let shutdown = CancellationToken::new();
    let bridge = ProtectBridge::new(config).start(shutdown.clone());

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();

    match bridge.await {
        Ok(Ok(())) => info!("Protect MQTT bridge stopped"),
        Ok(Err(e)) => {
            error!("Bridge failed: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Bridge task panicked: {}", e);
            std::process::exit(1);
        }
    }
}

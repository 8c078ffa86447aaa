//! Bridge orchestrator.
//!
//! Wires the controller client, session refresh, reconciliation engine and
//! MQTT connection together and runs them until shutdown, keeping the
//! plumbing out of main.rs.

use crate::config::Config;
use crate::detector::HttpDetector;
use crate::engine::{CommandRouter, DeviceDirectory, ReconciliationEngine, Routed, TokioScheduler};
use crate::error::Result;
use crate::mqtt::{MqttClient, MqttMessage, MqttPublisher, Topics};
use crate::protect::{Credentials, ProtectApi, ProtectClient, SessionManager};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long startup waits for the first broker connection before carrying on.
const CONNECT_WAIT: Duration = Duration::from_secs(10);

pub struct ProtectBridge {
    config: Config,
}

impl ProtectBridge {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Spawn the bridge. The returned task finishes after `shutdown` is
    /// cancelled and all loops have stopped.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let config = self.config;

        let client = Arc::new(ProtectClient::new(&config.protect)?);
        let sessions = SessionManager::new(
            client.clone(),
            Credentials {
                base_url: config.protect.base_url.clone(),
                username: config.protect.username.clone(),
                password: config.protect.password.clone(),
            },
        );
        let api = ProtectApi::new(client, sessions);

        let topics = Topics::new(config.mqtt.topic_prefix.clone(), config.mqtt.retain);
        info!(
            "[MQTT] Connecting to {}:{}",
            config.mqtt.broker_host, config.mqtt.broker_port
        );
        let mqtt_client = MqttClient::new(&config.mqtt).with_subscription(topics.command_filter());
        let publisher = Arc::new(MqttPublisher::new(mqtt_client.client()));

        let (msg_tx, msg_rx) = mpsc::channel::<MqttMessage>(64);
        let (connected_tx, connected_rx) = oneshot::channel();
        let mqtt_loop = tokio::spawn(mqtt_client.run(msg_tx, Some(connected_tx)));

        match tokio::time::timeout(CONNECT_WAIT, connected_rx).await {
            Ok(Ok(())) => info!("[MQTT] Connection established"),
            Ok(Err(_)) => warn!("[MQTT] Connection signal channel dropped"),
            Err(_) => warn!(
                "[MQTT] Not connected after {:?}; publishes are queued until the broker is reachable",
                CONNECT_WAIT
            ),
        }

        let directory = DeviceDirectory::new();
        let mut engine = ReconciliationEngine::new(
            config.engine.clone(),
            api.clone(),
            publisher.clone(),
            topics.clone(),
        )
        .with_scheduler(Arc::new(TokioScheduler::with_shutdown(
            publisher,
            shutdown.clone(),
        )))
        .with_directory(directory.clone());

        if config.engine.analysis.enabled {
            if let Some(url) = &config.engine.analysis.detector_url {
                info!("[Analysis] Using detector at {}", url);
                let detector = HttpDetector::new(url.clone(), config.engine.analysis.timeout)?;
                engine = engine.with_detector(Arc::new(detector));
            }
        }

        let router = CommandRouter::new(api.clone(), topics, directory);

        let poll_task = tokio::spawn(engine.run(shutdown.clone()));
        let auth_task = tokio::spawn(run_session_refresh(
            api.sessions().clone(),
            config.protect.auth_refresh_interval,
            shutdown.clone(),
        ));
        let command_task = tokio::spawn(run_command_loop(router, msg_rx, shutdown.clone()));

        info!("[Bridge] Running");
        shutdown.cancelled().await;
        info!("[Bridge] Shutting down");

        let _ = tokio::join!(poll_task, auth_task, command_task);
        mqtt_loop.abort();

        info!("[Bridge] Stopped");
        Ok(())
    }
}

/// Force a session refresh every `every` until `shutdown`.
///
/// A failed refresh is only logged; the next on-demand call or the next
/// period retries.
async fn run_session_refresh(
    sessions: SessionManager,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the first tick completes immediately; sessions are created on demand
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match sessions.force_refresh().await {
            Ok(_) => info!("[Auth] Proactive refresh succeeded"),
            Err(e) => warn!("[Auth] Proactive refresh failed, will retry on demand: {}", e),
        }
    }
}

async fn run_command_loop(
    router: CommandRouter,
    mut rx: mpsc::Receiver<MqttMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        match router.route(&msg).await {
            Ok(Routed::Forwarded { device_id }) => {
                info!("[Bridge] Command on {} forwarded to {}", msg.topic, device_id)
            }
            Ok(Routed::Dropped(_)) => {}
            Err(e) => warn!("[Bridge] Command on {} failed: {}", msg.topic, e),
        }
    }
}

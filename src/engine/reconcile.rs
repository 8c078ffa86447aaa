//! The poll/diff/publish cycle.

use super::commands::DeviceDirectory;
use super::gate::AnalysisGate;
use super::scheduler::{Scheduler, TokioScheduler};
use crate::config::EngineConfig;
use crate::detector::{DetectionResult, Detector, presence_changes};
use crate::error::{BridgeError, Result};
use crate::mqtt::{Fact, Message, Publisher, Topics};
use crate::protect::{Device, DeviceKind, EventWindow, ProtectApi, Snapshot};
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Event types that carry smart detections.
const SMART_DETECT_EVENT_TYPES: &[&str] = &["smartDetectZone"];

/// A device as seen on the previous tick, with the facts derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub device: Device,
    pub motion: bool,
    pub ringing: bool,
}

struct PendingAnalysis {
    device_id: String,
    handle: JoinHandle<Result<DetectionResult>>,
}

/// Turns controller snapshots into fact and presence messages.
///
/// Owned by the poll task; ticks never overlap, so the state maps need no
/// locking.
pub struct ReconciliationEngine {
    config: EngineConfig,
    api: ProtectApi,
    publisher: Arc<dyn Publisher>,
    scheduler: Arc<dyn Scheduler>,
    detector: Option<Arc<dyn Detector>>,
    topics: Topics,
    gate: AnalysisGate,
    directory: DeviceDirectory,
    previous: HashMap<String, Observed>,
    detections: HashMap<String, DetectionResult>,
    pending: Vec<PendingAnalysis>,
    seen_events: HashMap<String, DateTime<Utc>>,
}

impl ReconciliationEngine {
    pub fn new(
        config: EngineConfig,
        api: ProtectApi,
        publisher: Arc<dyn Publisher>,
        topics: Topics,
    ) -> Self {
        Self {
            scheduler: Arc::new(TokioScheduler::new(publisher.clone())),
            config,
            api,
            publisher,
            detector: None,
            topics,
            gate: AnalysisGate::new(),
            directory: DeviceDirectory::new(),
            previous: HashMap::new(),
            detections: HashMap::new(),
            pending: Vec::new(),
            seen_events: HashMap::new(),
        }
    }

    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_directory(mut self, directory: DeviceDirectory) -> Self {
        self.directory = directory;
        self
    }

    pub fn gate(&self) -> &AnalysisGate {
        &self.gate
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    pub fn previous(&self) -> &HashMap<String, Observed> {
        &self.previous
    }

    pub fn detections(&self) -> &HashMap<String, DetectionResult> {
        &self.detections
    }

    /// Share of the poll interval a tick may spend waiting for analyses.
    /// The rest is left for publishing and the event query so that ticks
    /// keep pace with the recency window.
    fn harvest_budget(&self) -> Duration {
        self.config.poll_interval / 2
    }

    fn analysis_active(&self) -> bool {
        self.config.analysis.enabled && self.detector.is_some()
    }

    /// Run one reconciliation cycle.
    ///
    /// A failed snapshot fetch returns the error without touching any
    /// stored state.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<()> {
        let started = Instant::now();
        let snapshot = self.api.bootstrap().await?;
        let window = self.config.recency_window();

        let mut current = HashMap::with_capacity(snapshot.devices.len());
        for device in &snapshot.devices {
            let observed = Observed {
                device: device.clone(),
                motion: device.is_motion_active(now, window),
                ringing: device.is_ringing(now, window),
            };

            self.log_transitions(&observed);
            self.publish_facts(&observed).await;

            if observed.motion {
                if self.analysis_active() && device.has_frames() {
                    self.start_analysis(device);
                }
            } else {
                self.clear_detections(&device.id, &device.topic_name()).await;
            }

            current.insert(device.id.clone(), observed);
        }

        self.apply_finished_analyses(&current, started + self.harvest_budget())
            .await;
        self.forget_vanished(&current).await;

        self.previous = current;
        self.directory.update(&snapshot);

        if self.config.events_enabled {
            self.process_events(&snapshot, now).await;
        }

        Ok(())
    }

    async fn publish_facts(&self, observed: &Observed) {
        let device = &observed.device;
        let name = device.topic_name();

        self.emit(self.topics.fact(&name, Fact::State, device.state.as_str()))
            .await;
        if device.supports_motion() {
            self.emit(self.topics.flag(&name, Fact::Motion, observed.motion))
                .await;
        }
        if device.supports_ring() {
            self.emit(self.topics.flag(&name, Fact::Ringing, observed.ringing))
                .await;
        }

        if let DeviceKind::Sensor {
            supports_temperature,
            supports_humidity,
            supports_light,
            supports_contact,
            ..
        } = device.kind
        {
            let readings = &device.readings;
            let numeric = [
                (Fact::Temperature, supports_temperature, readings.temperature),
                (Fact::Humidity, supports_humidity, readings.humidity),
                (Fact::Light, supports_light, readings.light),
            ];
            for (fact, supported, value) in numeric {
                if let (true, Some(value)) = (supported, value) {
                    self.emit(self.topics.fact(&name, fact, value.to_string()))
                        .await;
                }
            }
            if let (true, Some(open)) = (supports_contact, readings.contact_open) {
                self.emit(self.topics.flag(&name, Fact::Contact, open)).await;
            }
        }
    }

    fn start_analysis(&mut self, device: &Device) {
        let Some(detector) = self.detector.clone() else {
            return;
        };
        let Some(permit) = self.gate.try_acquire(&device.id) else {
            debug!("[Analysis] Skipping {}: previous analysis still running", device.name);
            return;
        };

        let api = self.api.clone();
        let timeout = self.config.analysis.timeout;
        let threshold = self.config.analysis.confidence_threshold;
        let max_results = self.config.analysis.max_results;
        let device_id = device.id.clone();

        debug!("[Analysis] Starting analysis for {}", device.name);
        let handle = tokio::spawn(async move {
            let _permit = permit;

            let analysis = async {
                let frame = api.frame(&device_id).await?;
                let detections = detector.detect(&frame, max_results).await?;
                Ok::<_, BridgeError>(DetectionResult::from_detections(&detections, threshold))
            };
            match tokio::time::timeout(timeout, analysis).await {
                Ok(result) => result,
                Err(_) => Err(BridgeError::AnalysisFailed(format!(
                    "no result within {:?}",
                    timeout
                ))),
            }
        });

        self.pending.push(PendingAnalysis {
            device_id: device.id.clone(),
            handle,
        });
    }

    /// Wait for in-flight analyses until `deadline` and apply the ones that
    /// finished. Unfinished ones stay pending and are harvested by a later
    /// tick; their own timeout bounds how long that can take.
    async fn apply_finished_analyses(
        &mut self,
        current: &HashMap<String, Observed>,
        deadline: Instant,
    ) {
        if self.pending.is_empty() {
            return;
        }

        let mut finished = Vec::new();
        let mut unfinished = Vec::new();

        for mut pending in std::mem::take(&mut self.pending) {
            match tokio::time::timeout_at(deadline, &mut pending.handle).await {
                Ok(Ok(result)) => finished.push((pending.device_id, result)),
                Ok(Err(e)) => warn!("[Analysis] Task for {} ended abnormally: {}", pending.device_id, e),
                Err(_) => unfinished.push(pending),
            }
        }
        self.pending = unfinished;

        for (device_id, result) in finished {
            let Some(observed) = current.get(&device_id).filter(|o| o.motion) else {
                debug!("[Analysis] Discarding result for {}: motion no longer active", device_id);
                continue;
            };
            let name = observed.device.topic_name();

            match result {
                Ok(result) => {
                    info!("[Analysis] {}: {:?}", observed.device.name, result);
                    for (class, present) in presence_changes(self.detections.get(&device_id), &result) {
                        self.emit(self.topics.object(&name, &class, present)).await;
                    }
                    if result.is_empty() {
                        self.detections.remove(&device_id);
                    } else {
                        self.detections.insert(device_id, result);
                    }
                }
                Err(e) => {
                    warn!("[Analysis] {} failed, keeping previous result: {}", observed.device.name, e);
                }
            }
        }
    }

    /// Publish absence for every stored class of a device and forget them.
    async fn clear_detections(&mut self, device_id: &str, name: &str) {
        let Some(stored) = self.detections.remove(device_id) else {
            return;
        };
        for class in stored.classes() {
            self.emit(self.topics.object(name, class, false)).await;
        }
    }

    async fn forget_vanished(&mut self, current: &HashMap<String, Observed>) {
        let vanished: Vec<Observed> = self
            .previous
            .iter()
            .filter(|(id, _)| !current.contains_key(*id))
            .map(|(_, observed)| observed.clone())
            .collect();

        for observed in vanished {
            info!("[Engine] {} is no longer reported by the controller", observed.device.name);
            self.clear_detections(&observed.device.id, &observed.device.topic_name())
                .await;
        }
    }

    fn log_transitions(&self, observed: &Observed) {
        let device = &observed.device;
        let Some(before) = self.previous.get(&device.id) else {
            info!("[Engine] Tracking {} ({:?})", device.name, device.kind);
            return;
        };

        if before.device.state != device.state {
            info!("[Engine] {} state: {} -> {}", device.name, before.device.state, device.state);
        }
        if before.motion != observed.motion {
            info!(
                "[Engine] {} motion {}",
                device.name,
                if observed.motion { "started" } else { "ended" }
            );
        }
        if !before.ringing && observed.ringing {
            info!("[Engine] {} rang", device.name);
        }
    }

    async fn process_events(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) {
        let threshold = self.config.event_threshold();
        let Ok(threshold_delta) = TimeDelta::from_std(threshold) else {
            return;
        };
        let window = EventWindow {
            start: now - threshold_delta,
            end: now,
        };

        let events = match self.api.events(SMART_DETECT_EVENT_TYPES, window).await {
            Ok(events) => events,
            Err(e) => {
                warn!("[Engine] Event fetch failed: {}", e);
                return;
            }
        };

        self.seen_events
            .retain(|_, start| now.signed_duration_since(*start) < threshold_delta);

        for event in events {
            if now.signed_duration_since(event.start) >= threshold_delta {
                continue;
            }
            if self.seen_events.contains_key(&event.id) {
                continue;
            }
            let Some(device) = event
                .device_id
                .as_deref()
                .and_then(|id| snapshot.find_by_id(id))
            else {
                debug!("[Engine] Event {} is not tied to a known camera", event.id);
                continue;
            };
            if !device.supports_smart_detect() {
                debug!("[Engine] Ignoring event {}: {} has no smart detection", event.id, device.name);
                continue;
            }

            let name = device.topic_name();
            for class in &event.smart_detect_types {
                info!("[Engine] {} smart detection: {}", device.name, class);
                self.emit(self.topics.object(&name, class, true)).await;
                self.scheduler
                    .schedule(threshold * 2, self.topics.object(&name, class, false));
            }
            self.seen_events.insert(event.id, event.start);
        }
    }

    async fn emit(&self, message: Message) {
        let topic = message.topic.clone();
        if let Err(e) = self.publisher.publish(message).await {
            warn!("[MQTT] Publish to {} failed: {}", topic, e);
        }
    }

    /// Drive [`tick`](Self::tick) every poll interval until `shutdown`.
    ///
    /// Ticks run back to back on this task, so a slow tick delays the next
    /// one instead of overlapping it; missed intervals are skipped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let poll_interval = self.config.poll_interval;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("[Engine] Polling every {:?}", poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            if let Err(e) = self.tick(Utc::now()).await {
                warn!("[Engine] Tick failed, state left unchanged: {}", e);
            }
            let elapsed = started.elapsed();
            if elapsed > poll_interval {
                warn!(
                    "[Engine] Tick took {:?}, longer than the {:?} poll interval; skipping missed ticks",
                    elapsed, poll_interval
                );
            }
        }

        for pending in self.pending.drain(..) {
            pending.handle.abort();
        }
        info!("[Engine] Stopped");
    }
}

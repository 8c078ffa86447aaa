//! In-memory fakes shared by unit tests.

use crate::detector::{Detection, Detector};
use crate::engine::Scheduler;
use crate::error::{BridgeError, Result};
use crate::mqtt::{Message, Publisher};
use crate::protect::{
    ControllerClient, Credentials, Device, DeviceCommand, DeviceKind, Event, EventWindow,
    MotionSignal, ProtectApi, Readings, Session, SessionManager, Snapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Controller whose responses are set by the test.
#[derive(Default)]
pub struct FakeController {
    /// `None` makes the bootstrap fetch fail.
    pub snapshot: Mutex<Option<Snapshot>>,
    pub events: Mutex<Vec<Event>>,
    pub commands: Mutex<Vec<(String, DeviceCommand)>>,
    pub frame_delay: Mutex<Duration>,
    /// Answer the next API call with an expired-session error.
    pub expire_next: AtomicBool,
    pub reject_commands: AtomicBool,
    pub fail_logins: AtomicBool,
    pub logins: AtomicUsize,
    pub frames: AtomicUsize,
}

impl FakeController {
    pub fn with_devices(devices: Vec<Device>) -> Arc<Self> {
        let controller = Self::default();
        *controller.snapshot.lock() = Some(Snapshot { devices });
        Arc::new(controller)
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.snapshot.lock() = Some(Snapshot { devices });
    }

    pub fn fail_bootstrap(&self) {
        *self.snapshot.lock() = None;
    }

    fn check_session(&self) -> Result<()> {
        if self.expire_next.swap(false, Ordering::SeqCst) {
            return Err(BridgeError::SessionExpired);
        }
        Ok(())
    }
}

#[async_trait]
impl ControllerClient for FakeController {
    async fn login(&self, _credentials: &Credentials) -> Result<Session> {
        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_logins.load(Ordering::SeqCst) {
            return Err(BridgeError::AuthFailed("invalid credentials".to_string()));
        }
        Ok(Session {
            token: format!("token-{}", n),
            access_key: Some(format!("key-{}", n)),
            issued_at: Utc::now(),
        })
    }

    async fn fetch_bootstrap(&self, _session: &Session) -> Result<Snapshot> {
        self.check_session()?;
        self.snapshot
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::FetchFailed("controller unreachable".to_string()))
    }

    async fn fetch_events(
        &self,
        _session: &Session,
        _types: &[&str],
        _window: EventWindow,
    ) -> Result<Vec<Event>> {
        self.check_session()?;
        Ok(self.events.lock().clone())
    }

    async fn fetch_frame(&self, _session: &Session, _device_id: &str) -> Result<Vec<u8>> {
        self.check_session()?;
        self.frames.fetch_add(1, Ordering::SeqCst);
        let delay = *self.frame_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(vec![0xff, 0xd8, 0xff])
    }

    async fn send_command(
        &self,
        _session: &Session,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<()> {
        self.check_session()?;
        if self.reject_commands.load(Ordering::SeqCst) {
            return Err(BridgeError::CommandFailed("HTTP 400".to_string()));
        }
        self.commands
            .lock()
            .push((device_id.to_string(), command.clone()));
        Ok(())
    }
}

pub fn api(controller: Arc<FakeController>) -> ProtectApi {
    let sessions = SessionManager::new(
        controller.clone(),
        Credentials {
            base_url: "https://nvr.local".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
        },
    );
    ProtectApi::new(controller, sessions)
}

/// Detector returning whatever the test configured; `None` fails.
pub struct FakeDetector {
    pub output: Mutex<Option<Vec<Detection>>>,
    pub delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl FakeDetector {
    pub fn returning(classes: &[(&str, f32)]) -> Arc<Self> {
        let detector = Self {
            output: Mutex::new(None),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        };
        detector.set(classes);
        Arc::new(detector)
    }

    pub fn set(&self, classes: &[(&str, f32)]) {
        *self.output.lock() = Some(
            classes
                .iter()
                .map(|(class, score)| Detection {
                    class: class.to_string(),
                    score: *score,
                })
                .collect(),
        );
    }

    pub fn fail(&self) {
        *self.output.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(&self, _frame: &[u8], _max_results: usize) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.output
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::AnalysisFailed("model crashed".to_string()))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Message>>,
}

impl RecordingPublisher {
    /// Drain everything published so far.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        self.messages.lock().push(message);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingScheduler {
    pub scheduled: Mutex<Vec<(Duration, Message)>>,
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration, message: Message) {
        self.scheduled.lock().push((delay, message));
    }
}

pub fn camera(id: &str, name: &str, motion: bool) -> Device {
    Device {
        id: id.to_string(),
        name: name.to_string(),
        state: "CONNECTED".to_string(),
        kind: DeviceKind::Camera {
            supports_ring: false,
            supports_smart_detect: true,
        },
        last_ring: None,
        motion: MotionSignal::Flag(motion),
        readings: Readings::default(),
    }
}

pub fn doorbell(id: &str, name: &str, last_ring: Option<DateTime<Utc>>) -> Device {
    Device {
        kind: DeviceKind::Camera {
            supports_ring: true,
            supports_smart_detect: false,
        },
        last_ring,
        ..camera(id, name, false)
    }
}

/// `(topic, payload)` pairs for compact assertions.
pub fn pairs(messages: &[Message]) -> Vec<(String, String)> {
    messages
        .iter()
        .map(|m| (m.topic.clone(), m.payload.clone()))
        .collect()
}

/// Only the `objects/...` messages.
pub fn objects(messages: &[Message]) -> Vec<(String, String)> {
    pairs(messages)
        .into_iter()
        .filter(|(topic, _)| topic.contains("/objects/"))
        .collect()
}

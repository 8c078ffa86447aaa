//! Controller records and the device model derived from them.
//!
//! Bootstrap JSON is parsed record by record: a malformed camera or sensor
//! is skipped with a warning instead of failing the whole snapshot.

use chrono::{DateTime, TimeDelta, Utc};
use log::warn;
use serde::Deserialize;
use std::time::Duration;

/// What a device is and which facts it can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Camera {
        supports_ring: bool,
        supports_smart_detect: bool,
    },
    Sensor {
        supports_motion: bool,
        supports_temperature: bool,
        supports_humidity: bool,
        supports_light: bool,
        supports_contact: bool,
    },
    Other,
}

/// Where a device's motion state comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionSignal {
    /// The controller reports motion directly.
    Flag(bool),
    /// Older records: smart detection flag or a recent `lastMotion`.
    Derived {
        smart_detected: bool,
        last_motion: Option<DateTime<Utc>>,
    },
}

/// Numeric and boolean readings of environmental sensors.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<f64>,
    pub contact_open: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Coarse controller state, e.g. `CONNECTED`.
    pub state: String,
    pub kind: DeviceKind,
    pub last_ring: Option<DateTime<Utc>>,
    pub motion: MotionSignal,
    pub readings: Readings,
}

impl Device {
    /// Name used as the device segment of topics.
    pub fn topic_name(&self) -> String {
        normalize_name(&self.name)
    }

    pub fn supports_ring(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Camera {
                supports_ring: true,
                ..
            }
        )
    }

    /// Cameras always report motion; sensors only when fitted with a
    /// motion detector.
    pub fn supports_motion(&self) -> bool {
        match self.kind {
            DeviceKind::Camera { .. } => true,
            DeviceKind::Sensor {
                supports_motion, ..
            } => supports_motion,
            DeviceKind::Other => false,
        }
    }

    pub fn supports_smart_detect(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Camera {
                supports_smart_detect: true,
                ..
            }
        )
    }

    /// Only cameras have frames to analyse.
    pub fn has_frames(&self) -> bool {
        matches!(self.kind, DeviceKind::Camera { .. })
    }

    pub fn is_ringing(&self, now: DateTime<Utc>, window: Duration) -> bool {
        within(self.last_ring, now, window)
    }

    pub fn is_motion_active(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.motion {
            MotionSignal::Flag(active) => active,
            MotionSignal::Derived {
                smart_detected,
                last_motion,
            } => smart_detected || within(last_motion, now, window),
        }
    }
}

/// True when `at` lies strictly less than `window` before `now`.
fn within(at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(at) = at else {
        return false;
    };
    let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
    now.signed_duration_since(at) < window
}

/// Lower-case the name and replace whitespace with underscores.
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// All devices from one bootstrap response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub devices: Vec<Device>,
}

impl Snapshot {
    pub fn from_bootstrap(value: serde_json::Value) -> serde_json::Result<Self> {
        let bootstrap: BootstrapRecord = serde_json::from_value(value)?;

        let cameras = bootstrap
            .cameras
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| parse_record::<CameraRecord>(raw, "camera"))
            .map(Device::from);
        let sensors = bootstrap
            .sensors
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| parse_record::<SensorRecord>(raw, "sensor"))
            .map(Device::from);

        Ok(Self {
            devices: cameras.chain(sensors).collect(),
        })
    }

    pub fn find_by_id(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

fn parse_record<T: for<'de> Deserialize<'de>>(raw: serde_json::Value, what: &str) -> Option<T> {
    match serde_json::from_value(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("[Protect] Skipping malformed {} record: {}", what, e);
            None
        }
    }
}

/// A discrete record from the controller's event feed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, rename = "camera")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub smart_detect_types: Vec<String>,
}

/// `null` and missing device lists both read as empty.
#[derive(Debug, Deserialize)]
struct BootstrapRecord {
    #[serde(default)]
    cameras: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    sensors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureFlags {
    #[serde(default)]
    is_doorbell: bool,
    #[serde(default)]
    has_smart_detect: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CameraRecord {
    id: String,
    name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    feature_flags: FeatureFlags,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_ring: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_motion: Option<DateTime<Utc>>,
    #[serde(default)]
    is_motion_detected: Option<bool>,
    #[serde(default)]
    is_smart_detected: Option<bool>,
}

impl From<CameraRecord> for Device {
    fn from(record: CameraRecord) -> Self {
        let motion = match record.is_motion_detected {
            Some(flag) => MotionSignal::Flag(flag),
            None => MotionSignal::Derived {
                smart_detected: record.is_smart_detected.unwrap_or(false),
                last_motion: record.last_motion,
            },
        };
        Self {
            id: record.id,
            name: record.name,
            state: record.state.unwrap_or_else(|| "UNKNOWN".to_string()),
            kind: DeviceKind::Camera {
                supports_ring: record.feature_flags.is_doorbell,
                supports_smart_detect: record.feature_flags.has_smart_detect,
            },
            last_ring: record.last_ring,
            motion,
            readings: Readings::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatValue {
    #[serde(default)]
    value: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct SensorStats {
    #[serde(default)]
    temperature: Option<StatValue>,
    #[serde(default)]
    humidity: Option<StatValue>,
    #[serde(default)]
    light: Option<StatValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorRecord {
    id: String,
    name: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    is_motion_detected: Option<bool>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    motion_detected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_opened: Option<bool>,
    #[serde(default)]
    stats: SensorStats,
}

impl From<SensorRecord> for Device {
    fn from(record: SensorRecord) -> Self {
        // A stat the sensor reports at all is a capability, even while its
        // current value is null.
        let stats = record.stats;
        let kind = DeviceKind::Sensor {
            supports_motion: record.is_motion_detected.is_some()
                || record.motion_detected_at.is_some(),
            supports_temperature: stats.temperature.is_some(),
            supports_humidity: stats.humidity.is_some(),
            supports_light: stats.light.is_some(),
            supports_contact: record.is_opened.is_some(),
        };
        let readings = Readings {
            temperature: stats.temperature.and_then(|s| s.value),
            humidity: stats.humidity.and_then(|s| s.value),
            light: stats.light.and_then(|s| s.value),
            contact_open: record.is_opened,
        };
        let motion = match record.is_motion_detected {
            Some(flag) => MotionSignal::Flag(flag),
            None => MotionSignal::Derived {
                smart_detected: false,
                last_motion: record.motion_detected_at,
            },
        };
        Self {
            id: record.id,
            name: record.name,
            state: record.state.unwrap_or_else(|| "UNKNOWN".to_string()),
            kind,
            last_ring: None,
            motion,
            readings,
        }
    }
}

//! Routing of inbound `.../set` messages to the controller.

use crate::error::{BridgeError, Result};
use crate::mqtt::{MqttMessage, Topics};
use crate::protect::{DeviceCommand, ProtectApi, Snapshot};
use log::{info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use strum::EnumString;

/// Settable facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum CommandFact {
    /// Doorbell display text.
    Message,
}

/// Topic name to device id mapping from the most recent snapshot.
///
/// Written by the engine after every successful tick, read by the command
/// router.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    ids: Arc<RwLock<Option<HashMap<String, String>>>>,
}

/// Result of a directory lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    NoSnapshot,
    Unknown,
    Found(String),
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the mapping with the devices of `snapshot`.
    ///
    /// When two devices share a topic name the first one listed keeps it.
    pub fn update(&self, snapshot: &Snapshot) {
        let mut ids: HashMap<String, String> = HashMap::with_capacity(snapshot.devices.len());
        for device in &snapshot.devices {
            match ids.entry(device.topic_name()) {
                Entry::Occupied(existing) => warn!(
                    "[Engine] {} ({}) shares topic name {} with {}; commands go to {}",
                    device.name,
                    device.id,
                    existing.key(),
                    existing.get(),
                    existing.get()
                ),
                Entry::Vacant(slot) => {
                    slot.insert(device.id.clone());
                }
            }
        }
        *self.ids.write() = Some(ids);
    }

    pub fn lookup(&self, name: &str) -> Lookup {
        match self.ids.read().as_ref() {
            None => Lookup::NoSnapshot,
            Some(ids) => ids
                .get(name)
                .map(|id| Lookup::Found(id.clone()))
                .unwrap_or(Lookup::Unknown),
        }
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Forwarded { device_id: String },
    Dropped(&'static str),
}

/// Forwards command messages without touching reconciliation state.
#[derive(Clone)]
pub struct CommandRouter {
    api: ProtectApi,
    topics: Topics,
    directory: DeviceDirectory,
}

impl CommandRouter {
    pub fn new(api: ProtectApi, topics: Topics, directory: DeviceDirectory) -> Self {
        Self {
            api,
            topics,
            directory,
        }
    }

    /// Resolve and forward one message. Unroutable messages are dropped,
    /// never queued.
    pub async fn route(&self, message: &MqttMessage) -> Result<Routed> {
        let Some((device, fact)) = self.topics.parse_command(&message.topic) else {
            return Ok(self.drop_message(message, "not a command topic"));
        };
        let Ok(fact) = fact.parse::<CommandFact>() else {
            return Ok(self.drop_message(message, "unsupported command"));
        };

        let device_id = match self.directory.lookup(device) {
            Lookup::Found(id) => id,
            Lookup::NoSnapshot => return Ok(self.drop_message(message, "no snapshot yet")),
            Lookup::Unknown => return Ok(self.drop_message(message, "unknown device")),
        };

        let command = match fact {
            CommandFact::Message => DeviceCommand::DisplayMessage(message.payload.trim().to_string()),
        };

        info!("[Engine] Forwarding {:?} to {} ({})", command, device, device_id);
        self.api
            .command(&device_id, &command)
            .await
            .map_err(|e| match e {
                BridgeError::CommandFailed(_) | BridgeError::AuthFailed(_) => e,
                other => BridgeError::CommandFailed(other.to_string()),
            })?;

        Ok(Routed::Forwarded { device_id })
    }

    fn drop_message(&self, message: &MqttMessage, reason: &'static str) -> Routed {
        warn!("[Engine] Dropping command on {}: {}", message.topic, reason);
        Routed::Dropped(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protect::Snapshot;
    use crate::testing::{FakeController, api, camera};
    use std::sync::Arc;

    fn router(controller: Arc<FakeController>) -> (CommandRouter, DeviceDirectory) {
        let directory = DeviceDirectory::new();
        let router = CommandRouter::new(
            api(controller),
            Topics::new("protect", true),
            directory.clone(),
        );
        (router, directory)
    }

    fn set(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn test_dropped_before_first_snapshot() {
        let controller = FakeController::with_devices(vec![]);
        let (router, _) = router(controller.clone());

        let routed = router
            .route(&set("protect/front_door/message/set", "Hello"))
            .await
            .unwrap();
        assert_eq!(routed, Routed::Dropped("no snapshot yet"));
        assert!(controller.commands.lock().is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_to_resolved_device() {
        let controller = FakeController::with_devices(vec![]);
        let (router, directory) = router(controller.clone());
        directory.update(&Snapshot {
            devices: vec![camera("cam1", "Front Door", false)],
        });

        let routed = router
            .route(&set("protect/front_door/message/set", " Back in 5 "))
            .await
            .unwrap();
        assert_eq!(
            routed,
            Routed::Forwarded {
                device_id: "cam1".to_string()
            }
        );
        assert_eq!(
            controller.commands.lock().as_slice(),
            &[(
                "cam1".to_string(),
                DeviceCommand::DisplayMessage("Back in 5".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_unroutable_messages_are_dropped() {
        let controller = FakeController::with_devices(vec![]);
        let (router, directory) = router(controller.clone());
        directory.update(&Snapshot {
            devices: vec![camera("cam1", "Front Door", false)],
        });

        let cases = [
            ("protect/garage/message/set", "unknown device"),
            ("protect/front_door/motion/set", "unsupported command"),
            ("protect/front_door/message", "not a command topic"),
        ];
        for (topic, reason) in cases {
            assert_eq!(
                router.route(&set(topic, "x")).await.unwrap(),
                Routed::Dropped(reason)
            );
        }
        assert!(controller.commands.lock().is_empty());
    }

    #[test]
    fn test_colliding_names_keep_first_device() {
        let directory = DeviceDirectory::new();
        directory.update(&Snapshot {
            devices: vec![
                camera("cam1", "Front Door", false),
                camera("cam2", "front  door", false),
                camera("cam3", "Garage", false),
            ],
        });
        assert_eq!(directory.lookup("front_door"), Lookup::Found("cam1".to_string()));
        assert_eq!(directory.lookup("garage"), Lookup::Found("cam3".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_command_reports_failure() {
        let controller = FakeController::with_devices(vec![]);
        controller
            .reject_commands
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let (router, directory) = router(controller.clone());
        directory.update(&Snapshot {
            devices: vec![camera("cam1", "Front Door", false)],
        });

        let result = router
            .route(&set("protect/front_door/message/set", "Hello"))
            .await;
        assert!(matches!(result, Err(BridgeError::CommandFailed(_))));
    }
}

//! Topic layout.
//!
//! - `<prefix>/<device>/<fact>` for device facts
//! - `<prefix>/<device>/objects/<class>` for detected objects
//! - `<prefix>/<device>/<fact>/set` for inbound commands

use super::Message;
use strum::{AsRefStr, Display, EnumString};

/// Facts published for every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Fact {
    State,
    Motion,
    Ringing,
    Temperature,
    Humidity,
    Light,
    Contact,
}

const OBJECTS: &str = "objects";
const SET: &str = "set";

/// Builds outbound messages and recognises command topics.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    retain: bool,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, retain: bool) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            retain,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn fact(&self, device: &str, fact: Fact, payload: impl Into<String>) -> Message {
        self.message(format!("{}/{}/{}", self.prefix, device, fact), payload.into())
    }

    pub fn flag(&self, device: &str, fact: Fact, value: bool) -> Message {
        self.fact(device, fact, flag_payload(value))
    }

    pub fn object(&self, device: &str, class: &str, present: bool) -> Message {
        self.message(
            format!("{}/{}/{}/{}", self.prefix, device, OBJECTS, class),
            flag_payload(present).to_string(),
        )
    }

    /// Wildcard filter matching every command topic.
    pub fn command_filter(&self) -> String {
        format!("{}/+/+/{}", self.prefix, SET)
    }

    /// Split a command topic into `(device, fact)`.
    pub fn parse_command<'t>(&self, topic: &'t str) -> Option<(&'t str, &'t str)> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let mut parts = rest.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(fact), Some(SET), None) if !device.is_empty() && !fact.is_empty() => {
                Some((device, fact))
            }
            _ => None,
        }
    }

    fn message(&self, topic: String, payload: String) -> Message {
        Message {
            topic,
            payload,
            retain: self.retain,
        }
    }
}

fn flag_payload(value: bool) -> &'static str {
    if value { "1" } else { "0" }
}

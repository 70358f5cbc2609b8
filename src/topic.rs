//! Per-device MQTT topic overrides.
//!
//! Devices publish to `openant/<DeviceClass>/<id>` unless an override given as
//! `<typeCode>:<deviceId>:<topic>` maps them elsewhere.

use crate::device::{DeviceIdentity, DeviceKey};
use std::collections::HashMap;

/// Override lookup keyed by (type code, device id).
pub type TopicMap = HashMap<DeviceKey, String>;

/// A parsed topic override.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTopic {
    pub key: DeviceKey,
    pub topic: String,
}

/// Parse a topic override from `"type:id:topic"`.
///
/// The topic itself may contain further colons.
///
/// # Example
/// ```
/// use antplus_bridge::topic::parse_device_topic;
///
/// let t = parse_device_topic("120:54368:fixed/topic/name").unwrap();
/// assert_eq!(t.key.type_code, 120);
/// assert_eq!(t.key.device_id, 54368);
/// assert_eq!(t.topic, "fixed/topic/name");
/// ```
pub fn parse_device_topic(src: &str) -> Result<DeviceTopic, String> {
    let invalid = || {
        format!(
            "invalid value: {src}. Format must be type:id:topic, e.g. 120:54368:fixed/topic/name"
        )
    };

    let mut parts = src.splitn(3, ':');
    let type_code = parts.next().and_then(|s| s.trim().parse().ok());
    let device_id = parts.next().and_then(|s| s.trim().parse().ok());
    let topic = parts.next().filter(|t| !t.is_empty());

    match (type_code, device_id, topic) {
        (Some(type_code), Some(device_id), Some(topic)) => Ok(DeviceTopic {
            key: DeviceKey {
                type_code,
                device_id,
            },
            topic: topic.to_string(),
        }),
        _ => Err(invalid()),
    }
}

pub fn to_map(topics: &[DeviceTopic]) -> TopicMap {
    topics.iter().map(|t| (t.key, t.topic.clone())).collect()
}

pub fn default_topic(identity: &DeviceIdentity) -> String {
    format!(
        "openant/{}/{}",
        identity.device_type.class_name(),
        identity.device_id
    )
}

/// Topic for a device: its override if one exists, else the default topic.
pub fn resolve_topic(identity: &DeviceIdentity, topics: &TopicMap) -> String {
    topics
        .get(&identity.key())
        .cloned()
        .unwrap_or_else(|| default_topic(identity))
}

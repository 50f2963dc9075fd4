//! Home Assistant MQTT discovery documents and topic layout.

use crate::config::{DeviceConfig, MqttConfig};
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub identifiers: Vec<String>,
}

/// Sensor registration payload, published retained once per channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SensorDiscovery {
    pub name: String,
    pub state_topic: String,
    pub state_class: &'static str,
    pub unique_id: String,
    pub device_class: &'static str,
    pub unit_of_meas: &'static str,
    pub last_reset: &'static str,
    pub device: DeviceInfo,
}

/// Where readings and discovery documents go.
#[derive(Debug, Clone)]
pub struct Topics {
    discovery_prefix: String,
    state_prefix: String,
    device: DeviceConfig,
}

impl Topics {
    pub fn new(mqtt: &MqttConfig, device: &DeviceConfig) -> Self {
        Self {
            discovery_prefix: mqtt.discovery_prefix.trim_end_matches('/').to_string(),
            state_prefix: mqtt.state_prefix.trim_end_matches('/').to_string(),
            device: device.clone(),
        }
    }

    /// `power/meter/<channel>/current`
    pub fn state_topic(&self, channel: &str) -> String {
        format!("{}/{}/current", self.state_prefix, channel)
    }

    /// `homeassistant/sensor/<deviceId>/upower-<channel>/config`
    pub fn discovery_topic(&self, channel: &str) -> String {
        format!(
            "{}/sensor/{}/{}-{}/config",
            self.discovery_prefix, self.device.id, self.device.unique_id_prefix, channel
        )
    }

    pub fn sensor(&self, channel: &str) -> SensorDiscovery {
        SensorDiscovery {
            name: format!("{} {}", self.device.name, display_name(channel)),
            state_topic: self.state_topic(channel),
            state_class: "measurement",
            unique_id: format!("{}_{}", self.device.unique_id_prefix, channel),
            device_class: "power",
            unit_of_meas: "W",
            last_reset: "1970-01-01T00:00:00+00:00",
            device: DeviceInfo {
                name: self.device.name.clone(),
                model: self.device.model.clone(),
                manufacturer: self.device.manufacturer.clone(),
                identifiers: self.device.identifiers.clone(),
            },
        }
    }
}

/// "total" -> "Total", "hot_water" -> "Hot water"
fn display_name(channel: &str) -> String {
    let mut chars = channel.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first.to_uppercase(), chars.as_str().replace('_', " ")),
        None => String::new(),
    }
}

/// Per-cycle payload: plain decimal watts.
pub fn format_watts(watts: f64) -> String {
    format!("{}", watts)
}

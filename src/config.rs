use crate::counter::CounterId;
use crate::error::{AppError, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::{fs, path::Path};

/// Display rows available for readings; the fifth row is the status line.
pub const MAX_READING_ROWS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub bus: BusConfig,
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_derived")]
    pub derived: Vec<DerivedConfig>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Generated per process when absent.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_discovery_prefix() -> String {
    "homeassistant".into()
}
fn default_state_prefix() -> String {
    "power/meter".into()
}

/// Identity advertised in every discovery document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub identifiers: Vec<String>,
    pub unique_id_prefix: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "uPower".into(),
            name: "uPower".into(),
            model: "ESP 8266 with RTC and OLED".into(),
            manufacturer: "Buffedelic AB".into(),
            identifiers: vec!["UPOW1".into()],
            unique_id_prefix: "upower".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_w1_root")]
    pub w1_root: String,
    /// 1-Wire family code of the counter chips (DS2423 is 0x1d).
    #[serde(default = "default_family")]
    pub family: String,
}

fn default_w1_root() -> String {
    "/sys/bus/w1/devices".into()
}
fn default_family() -> String {
    "1d".into()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            w1_root: default_w1_root(),
            family: default_family(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Bus address of the counter chip, e.g. "1d-00000cec6c94".
    pub address: String,
    pub counter: CounterId,
    /// Pulses per watt-hour equivalent.
    #[serde(default = "default_divisor")]
    pub divisor: f64,
    pub label: Option<String>,
}

fn default_divisor() -> f64 {
    1.0
}

/// A channel computed from sampled ones: `from - subtract[0] - subtract[1] ...`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedConfig {
    pub name: String,
    pub from: String,
    pub subtract: Vec<String>,
    pub label: Option<String>,
}

fn default_derived() -> Vec<DerivedConfig> {
    vec![DerivedConfig {
        name: "household".into(),
        from: "total".into(),
        subtract: vec!["heater".into(), "ftx".into()],
        label: Some("House:".into()),
    }]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub stale_threshold_ms: u64,
    pub stale_budget: u32,
    pub resync_after_ms: u64,
    pub pace_ticks: u32,
    pub pace_tick_ms: u64,
    pub setup_pause_ms: u64,
    pub publish_pause_ms: u64,
    pub fault_notice_ms: u64,
    pub restart_countdown: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: 62_000,
            stale_budget: 5,
            resync_after_ms: 86_400_000,
            pace_ticks: 30,
            pace_tick_ms: 900,
            setup_pause_ms: 2_000,
            publish_pause_ms: 500,
            fault_notice_ms: 3_000,
            restart_countdown: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub probe_timeout_ms: u64,
    pub retry_interval_ms: u64,
    /// Retry forever when unset.
    pub max_attempts: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2_000,
            retry_interval_ms: 2_000,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusConfig {
    /// File the rendered text panel is written to after every update.
    pub path: Option<String>,
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// Afterwards, if MQTT_HOST env is set, override `mqtt.host`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(AppError::Config(
                "config must include at least one channel".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        for ch in &self.channels {
            if !names.insert(ch.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate channel name: {}",
                    ch.name
                )));
            }
            if !ch.divisor.is_finite() || ch.divisor <= 0.0 {
                return Err(AppError::Config(format!(
                    "channel {} has invalid divisor {}",
                    ch.name, ch.divisor
                )));
            }
        }

        for d in &self.derived {
            if !names.insert(d.name.as_str()) {
                return Err(AppError::Config(format!(
                    "derived channel {} clashes with another channel",
                    d.name
                )));
            }
            for input in std::iter::once(&d.from).chain(d.subtract.iter()) {
                if !self.channels.iter().any(|c| &c.name == input) {
                    return Err(AppError::Config(format!(
                        "derived channel {} references unknown channel {}",
                        d.name, input
                    )));
                }
            }
        }

        if self.channels.len() + self.derived.len() > MAX_READING_ROWS {
            return Err(AppError::Config(format!(
                "at most {} channels (sampled + derived) fit on the display",
                MAX_READING_ROWS
            )));
        }

        if self.timing.stale_budget == 0 {
            return Err(AppError::Config(
                "timing.stale_budget must be at least 1".to_string(),
            ));
        }

        if self.mqtt.host.is_empty() {
            return Err(AppError::Config("mqtt.host cannot be empty".to_string()));
        }

        Ok(())
    }
}

/// Expand $(VAR) and ${VAR} placeholders using environment variables.
/// "$$" becomes a literal "$".
fn expand_env_placeholders(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut it = input.chars().peekable();

    while let Some(c) = it.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match it.peek().copied() {
            Some('$') => {
                it.next();
                out.push('$');
            }
            Some(open @ ('(' | '{')) => {
                it.next();
                let close = if open == '(' { ')' } else { '}' };
                let var = read_until(&mut it, close).ok_or_else(|| {
                    AppError::Config(format!(
                        "unterminated env placeholder: missing '{}'",
                        close
                    ))
                })?;
                let val = std::env::var(&var).map_err(|_| {
                    AppError::Config(format!("missing environment variable: {}", var))
                })?;
                out.push_str(&val);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

/// Read characters until we hit `end`, consuming the closing delimiter.
fn read_until<I>(it: &mut std::iter::Peekable<I>, end: char) -> Option<String>
where
    I: Iterator<Item = char>,
{
    let mut buf = String::new();
    for ch in it.by_ref() {
        if ch == end {
            return Some(buf);
        }
        buf.push(ch);
    }
    None
}

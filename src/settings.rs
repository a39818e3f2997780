// src/settings.rs
//
// Bridge configuration. Read once at startup (TOML file and/or command line)
// and passed by value into the adapters and the bridge loop.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::io::BridgeError;

/// Default TLS port; selecting it implies TLS unless overridden.
pub const MQTT_TLS_PORT: u16 = 8883;

/// Longest Linux network interface name (IFNAMSIZ minus the NUL).
const MAX_INTERFACE_NAME: usize = 15;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub bus: BusConfig,
    pub broker: BrokerConfig,
    pub bridge: LoopConfig,
}

/// CAN adapter settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BusConfig {
    /// "socketcan" or "virtual"
    #[serde(default = "default_bus_type")]
    pub bus_type: String,
    /// Interface name, e.g. "can0"
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Bitrate in bits/second; only applied with `configure_interface`
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Set the bitrate with `ip link` before opening
    #[serde(default)]
    pub configure_interface: bool,
    /// Configure the interface for CAN FD
    #[serde(default)]
    pub enable_fd: bool,
    /// CAN FD data phase bitrate
    #[serde(default)]
    pub data_bitrate: Option<u32>,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Frames buffered between the reader and the bridge
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// MQTT broker settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Explicit TLS choice; None means TLS iff port is 8883
    #[serde(default)]
    pub tls: Option<bool>,
    /// Random UUID when unset
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Outgoing requests the client can queue; must hold a full drain cycle
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

/// Bridge loop settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LoopConfig {
    /// Base topic; frames go to {topic}/{id}
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Upper bound on each broker pump step
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
    #[serde(default = "default_max_frames_per_cycle")]
    pub max_frames_per_cycle: usize,
    /// Send decoded inbound MQTT messages onto the bus
    #[serde(default)]
    pub forward_inbound: bool,
    /// Seconds between stats log lines (0 = disabled)
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_bus_type() -> String {
    "socketcan".to_string()
}
fn default_channel() -> String {
    "can0".to_string()
}
fn default_bitrate() -> u32 {
    500_000
}
fn default_read_timeout_ms() -> u64 {
    50
}
fn default_queue_capacity() -> usize {
    4096
}
fn default_host() -> String {
    "api.savvycan.com".to_string()
}
fn default_port() -> u16 {
    MQTT_TLS_PORT
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    2_000
}
fn default_request_capacity() -> usize {
    8192
}
fn default_topic() -> String {
    "can".to_string()
}
fn default_pump_interval_ms() -> u64 {
    20
}
fn default_max_frames_per_cycle() -> usize {
    4096
}
fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_type: default_bus_type(),
            channel: default_channel(),
            bitrate: default_bitrate(),
            configure_interface: false,
            enable_fd: false,
            data_bitrate: None,
            read_timeout_ms: default_read_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            tls: None,
            client_id: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            pump_interval_ms: default_pump_interval_ms(),
            max_frames_per_cycle: default_max_frames_per_cycle(),
            forward_inbound: false,
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn tls_required(&self) -> bool {
        self.tls.unwrap_or(self.port == MQTT_TLS_PORT)
    }

    /// Username/password pair, or None for an anonymous connection.
    pub fn credentials(&self) -> Option<(String, String)> {
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => Some((
                user.to_string(),
                self.password.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }

    pub fn resolved_client_id(&self) -> String {
        match &self.client_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        }
    }

    /// `mqtt://host:port` or `mqtts://host:port`, for logs and errors.
    pub fn endpoint(&self) -> String {
        let scheme = if self.tls_required() { "mqtts" } else { "mqtt" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Same rules as the kernel's `dev_valid_name`.
fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && name != "."
        && name != ".."
        && !name.chars().any(|c| c == '/' || c == ':' || c.is_whitespace())
}

impl BridgeConfig {
    /// Parse a TOML configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
            .map_err(|e| BridgeError::config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let fail = |msg: &str| Err(BridgeError::config(msg));

        if self.bus.channel.trim().is_empty() {
            return fail("bus channel must not be empty");
        }
        if !is_valid_interface_name(&self.bus.channel) {
            return Err(BridgeError::config(format!(
                "bus channel '{}' is not a valid interface name",
                self.bus.channel
            )));
        }
        if self.bus.bitrate == 0 {
            return fail("bus bitrate must be positive");
        }
        if self.bus.read_timeout_ms == 0 {
            return fail("bus read timeout must be positive");
        }
        if self.bus.queue_capacity == 0 {
            return fail("bus queue capacity must be positive");
        }

        if self.broker.host.trim().is_empty() {
            return fail("broker host must not be empty");
        }
        if self.broker.port == 0 {
            return fail("broker port must be positive");
        }
        if self.broker.keep_alive_secs < 5 {
            return fail("keep-alive must be at least 5 seconds");
        }
        if self.broker.request_capacity == 0 {
            return fail("broker request capacity must be positive");
        }
        if self.broker.password.is_some() && self.broker.credentials().is_none() {
            return fail("password given without a username");
        }

        let topic = &self.bridge.topic;
        if topic.is_empty() {
            return fail("topic must not be empty");
        }
        if topic.contains('+') || topic.contains('#') {
            return fail("topic must not contain MQTT wildcards");
        }
        if topic.ends_with('/') {
            return fail("topic must not end with '/'");
        }
        if self.bridge.pump_interval_ms == 0 {
            return fail("pump interval must be positive");
        }
        if self.bridge.max_frames_per_cycle == 0 {
            return fail("max frames per cycle must be positive");
        }
        // Publishes of one drain are queued in the client before it can send them
        if self.bridge.max_frames_per_cycle > self.broker.request_capacity {
            return Err(BridgeError::config(format!(
                "max frames per cycle ({}) exceeds broker request capacity ({})",
                self.bridge.max_frames_per_cycle, self.broker.request_capacity
            )));
        }

        Ok(())
    }
}

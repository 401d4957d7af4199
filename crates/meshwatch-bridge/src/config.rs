//! TOML-based configuration for the bridge.
//!
//! The five connection options live at the top level; everything else is in
//! optional sections:
//!
//! ```toml
//! broker_host = "localhost"
//! broker_port = 1883
//! serial_port = "/dev/ttyUSB0"
//! reconnect_min_delay = 2
//! reconnect_max_delay = 60
//!
//! [broker]
//! topic_prefix = "meshtastic"
//!
//! [monitor]
//! health_interval = 60
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use meshwatch_link::SerialLinkConfig;

use crate::broker::mqtt::MqttSettings;
use crate::error::BridgeError;
use crate::monitor::ReconnectPolicy;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    #[serde(default = "default_serial_port")]
    pub serial_port: String,
    /// Seconds before the first reconnection attempt after a failure.
    #[serde(default = "default_reconnect_min_delay")]
    pub reconnect_min_delay: f64,
    /// Upper bound on the reconnection delay, in seconds.
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: f64,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub status: StatusSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_reconnect_min_delay() -> f64 {
    2.0
}

fn default_reconnect_max_delay() -> f64 {
    60.0
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            broker_port: default_broker_port(),
            serial_port: default_serial_port(),
            reconnect_min_delay: default_reconnect_min_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
            broker: BrokerSection::default(),
            device: DeviceSection::default(),
            monitor: MonitorSection::default(),
            status: StatusSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

/// The `[broker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    /// Defaults to `meshwatch-<pid>`.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT keep-alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    /// Seconds to wait for CONNACK.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default)]
    pub qos: u8,
}

fn default_keep_alive() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_topic_prefix() -> String {
    "meshtastic".to_string()
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            client_id: None,
            username: None,
            password: None,
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            topic_prefix: default_topic_prefix(),
            qos: 0,
        }
    }
}

/// The `[device]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Seconds the radio gets to finish its configuration dump.
    #[serde(default = "default_config_timeout")]
    pub config_timeout: u64,
    /// Seconds between heartbeats. 0 disables.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_config_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    300
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            config_timeout: default_config_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
        }
    }
}

/// The `[monitor]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    /// Seconds between health checks of each connection.
    #[serde(default = "default_health_interval")]
    pub health_interval: u64,
    /// Seconds without a device event before the device is considered
    /// unhealthy. 0 disables.
    #[serde(default = "default_stale_after")]
    pub stale_after: u64,
    /// Seconds a connection must stay up before backoff returns to the minimum.
    #[serde(default = "default_backoff_reset_after")]
    pub backoff_reset_after: u64,
}

fn default_health_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    300
}

fn default_backoff_reset_after() -> u64 {
    300
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            health_interval: default_health_interval(),
            stale_after: default_stale_after(),
            backoff_reset_after: default_backoff_reset_after(),
        }
    }
}

/// The `[status]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusSection {
    /// Seconds between periodic status reports. 0 disables.
    #[serde(default = "default_status_interval")]
    pub interval: u64,
}

fn default_status_interval() -> u64 {
    60
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            interval: default_status_interval(),
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Upper bound for every delay, interval, and timeout in the file.
pub const MAX_PERIOD_SECS: u64 = 7 * 24 * 60 * 60;

/// Seconds as a `Duration`, clamped to `0..=MAX_PERIOD_SECS`.
fn clamped_secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.clamp(0.0, MAX_PERIOD_SECS as f64)).unwrap_or(Duration::ZERO)
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub serial_port: Option<String>,
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("failed to read config file: {e}")))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, BridgeError> {
        toml::from_str(s).map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))
    }

    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(host) = overrides.broker_host {
            self.broker_host = host;
        }
        if let Some(port) = overrides.broker_port {
            self.broker_port = port;
        }
        if let Some(path) = overrides.serial_port {
            self.serial_port = path;
        }
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let fail = |msg: String| Err(BridgeError::Config(msg));

        if self.serial_port.trim().is_empty() {
            return fail("serial_port must not be empty".into());
        }
        if self.broker_host.trim().is_empty() {
            return fail("broker_host must not be empty".into());
        }
        if self.broker_port == 0 {
            return fail("broker_port must be between 1 and 65535".into());
        }
        for (name, value) in [
            ("reconnect_min_delay", self.reconnect_min_delay),
            ("reconnect_max_delay", self.reconnect_max_delay),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return fail(format!("{name} must be a positive number of seconds, got {value}"));
            }
            if value > MAX_PERIOD_SECS as f64 {
                return fail(format!("{name} must be at most {MAX_PERIOD_SECS} seconds, got {value}"));
            }
        }
        if self.reconnect_max_delay < self.reconnect_min_delay {
            return fail(format!(
                "reconnect_max_delay ({}) is below reconnect_min_delay ({})",
                self.reconnect_max_delay, self.reconnect_min_delay
            ));
        }
        if self.broker.qos > 2 {
            return fail(format!("broker.qos must be 0, 1, or 2, got {}", self.broker.qos));
        }
        if self.broker.keep_alive < 5 {
            return fail("broker.keep_alive must be at least 5 seconds".into());
        }
        if self.broker.keep_alive > u64::from(u16::MAX) {
            return fail(format!("broker.keep_alive must be at most {} seconds", u16::MAX));
        }
        for (name, value) in [
            ("broker.connect_timeout", self.broker.connect_timeout),
            ("device.config_timeout", self.device.config_timeout),
            ("device.heartbeat_interval", self.device.heartbeat_interval),
            ("monitor.health_interval", self.monitor.health_interval),
            ("monitor.stale_after", self.monitor.stale_after),
            ("monitor.backoff_reset_after", self.monitor.backoff_reset_after),
            ("status.interval", self.status.interval),
        ] {
            if value > MAX_PERIOD_SECS {
                return fail(format!("{name} must be at most {MAX_PERIOD_SECS} seconds, got {value}"));
            }
        }
        if self.broker.connect_timeout == 0 {
            return fail("broker.connect_timeout must be positive".into());
        }
        let prefix = self.broker.topic_prefix.trim_matches('/');
        if prefix.is_empty() || prefix.contains(['+', '#']) {
            return fail(format!(
                "broker.topic_prefix {:?} must be non-empty and free of wildcards",
                self.broker.topic_prefix
            ));
        }
        if let Some(id) = &self.broker.client_id
            && id.trim().is_empty()
        {
            return fail("broker.client_id must not be blank".into());
        }
        if self.device.baud_rate == 0 {
            return fail("device.baud_rate must be positive".into());
        }
        if self.device.config_timeout == 0 {
            return fail("device.config_timeout must be positive".into());
        }
        if self.monitor.health_interval == 0 {
            return fail("monitor.health_interval must be positive".into());
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: clamped_secs(self.reconnect_min_delay),
            max_delay: clamped_secs(self.reconnect_max_delay),
            health_interval: Duration::from_secs(self.monitor.health_interval),
            reset_after: Duration::from_secs(self.monitor.backoff_reset_after),
        }
    }

    pub fn serial_link_config(&self) -> SerialLinkConfig {
        SerialLinkConfig {
            baud_rate: self.device.baud_rate,
            config_timeout: Duration::from_secs(self.device.config_timeout),
            heartbeat_interval: Duration::from_secs(self.device.heartbeat_interval),
            ..SerialLinkConfig::new(self.serial_port.clone())
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(|| format!("meshwatch-{}", std::process::id()));
        MqttSettings {
            host: self.broker_host.clone(),
            port: self.broker_port,
            client_id,
            username: self.broker.username.clone(),
            password: self.broker.password.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout),
            qos: self.broker.qos,
            last_will: None,
        }
    }

    /// `None` when periodic status is disabled.
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status.interval > 0).then(|| Duration::from_secs(self.status.interval))
    }

    /// `None` when staleness detection is disabled.
    pub fn stale_after(&self) -> Option<Duration> {
        (self.monitor.stale_after > 0).then(|| Duration::from_secs(self.monitor.stale_after))
    }
}

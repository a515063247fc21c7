//! Reconnect configuration.
//!
//! Read once from flat `key=value` settings (see [`ReconnectConfig::from_properties`])
//! or assembled in code with [`ReconnectConfigBuilder`].

use std::collections::HashMap;
use std::time::Duration;

use super::constants::{
    DEFAULT_MAX_DELAYED_ACKS, DEFAULT_RECONNECT_TIMEOUT, DEFAULT_SEND_QUEUE_CAPACITY,
    DEFAULT_SEND_WINDOW,
};
use super::error::ConfigError;

/// Immutable reconnect settings for one kind of link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    reconnect_enabled: bool,
    reconnect_timeout: Duration,
    send_queue_capacity: usize,
    max_delayed_acks: u32,
    send_window: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_enabled: false,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_delayed_acks: DEFAULT_MAX_DELAYED_ACKS,
            send_window: DEFAULT_SEND_WINDOW,
        }
    }
}

impl ReconnectConfig {
    /// Start building a config from defaults.
    pub fn builder() -> ReconnectConfigBuilder {
        ReconnectConfigBuilder::new()
    }

    /// Read settings under `prefix` from a flat property map.
    ///
    /// Recognized keys: `<prefix>.enabled`, `<prefix>.timeout.millis`,
    /// `<prefix>.sendqueue.cap`, `<prefix>.maxDelayedAcks`, `<prefix>.sendWindow`.
    /// Missing keys keep their defaults.
    pub fn from_properties(
        prefix: &str,
        props: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ReconnectConfigBuilder::new();

        if let Some(enabled) = lookup(props, prefix, "enabled") {
            builder = builder.enabled(parse_bool(&key(prefix, "enabled"), enabled)?);
        }
        if let Some(millis) = lookup(props, prefix, "timeout.millis") {
            let millis: u64 = parse_num(&key(prefix, "timeout.millis"), millis)?;
            builder = builder.timeout(Duration::from_millis(millis));
        }
        if let Some(cap) = lookup(props, prefix, "sendqueue.cap") {
            builder = builder.send_queue_capacity(parse_num(&key(prefix, "sendqueue.cap"), cap)?);
        }
        if let Some(acks) = lookup(props, prefix, "maxDelayedAcks") {
            builder = builder.max_delayed_acks(parse_num(&key(prefix, "maxDelayedAcks"), acks)?);
        }
        if let Some(window) = lookup(props, prefix, "sendWindow") {
            builder = builder.send_window(parse_num(&key(prefix, "sendWindow"), window)?);
        }

        builder.build_checked(prefix)
    }

    /// Whether dropped links may be resumed.
    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled
    }

    /// How long a dropped link may stay down before the stack is torn down.
    pub fn reconnect_timeout(&self) -> Duration {
        self.reconnect_timeout
    }

    /// Pending message capacity; 0 means unbounded.
    pub fn send_queue_capacity(&self) -> usize {
        self.send_queue_capacity
    }

    /// Messages received before an ack must be sent.
    pub fn max_delayed_acks(&self) -> u32 {
        self.max_delayed_acks
    }

    /// Maximum unacknowledged messages in flight.
    pub fn send_window(&self) -> usize {
        self.send_window
    }
}

/// Builder for [`ReconnectConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReconnectConfigBuilder {
    config: ReconnectConfig,
}

impl ReconnectConfigBuilder {
    /// Create a builder holding the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable reconnect.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.reconnect_enabled = enabled;
        self
    }

    /// Set the reconnect timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.reconnect_timeout = timeout;
        self
    }

    /// Set the send queue capacity (0 = unbounded).
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.send_queue_capacity = capacity;
        self
    }

    /// Set the delayed-ack threshold.
    pub fn max_delayed_acks(mut self, count: u32) -> Self {
        self.config.max_delayed_acks = count;
        self
    }

    /// Set the send window.
    pub fn send_window(mut self, window: usize) -> Self {
        self.config.send_window = window;
        self
    }

    /// Build, clamping zero counts to one.
    pub fn build(self) -> ReconnectConfig {
        let mut config = self.config;
        config.max_delayed_acks = config.max_delayed_acks.max(1);
        config.send_window = config.send_window.max(1);
        config
    }

    fn build_checked(self, prefix: &str) -> Result<ReconnectConfig, ConfigError> {
        if self.config.max_delayed_acks == 0 {
            return Err(ConfigError::OutOfRange {
                key: key(prefix, "maxDelayedAcks"),
                reason: "must be at least 1",
            });
        }
        if self.config.send_window == 0 {
            return Err(ConfigError::OutOfRange {
                key: key(prefix, "sendWindow"),
                reason: "must be at least 1",
            });
        }
        Ok(self.config)
    }
}

fn key(prefix: &str, suffix: &str) -> String {
    format!("{prefix}.{suffix}")
}

fn lookup<'a>(props: &'a HashMap<String, String>, prefix: &str, suffix: &str) -> Option<&'a str> {
    props.get(&key(prefix, suffix)).map(|v| v.trim())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

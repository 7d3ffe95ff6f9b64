//! Client transport configuration

use crate::errors::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Liveness probing for every channel of a connection
#[derive(Clone, Debug, PartialEq)]
pub struct HeartbeatConfig {
    /// How often the monitor checks channels; a probe is sent on any channel
    /// that has not written for this long
    pub interval: Duration,

    /// A channel with no inbound traffic for this long is closed
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            timeout: Duration::from_millis(60_000),
        }
    }
}

/// Backoff for (re)establishing a connection to a member
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Attempts per reconnection cycle before giving up on the member
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(30_000),
            multiplier: 2.0,
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after the given backoff has been used
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let scaled = Duration::from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0));
        scaled.min(self.max_backoff)
    }
}

/// Resend policy for retryable requests that lost their connection
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total sends per request, the first one included
    pub max_attempts: u32,
    /// Pause before each resend
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// What a request does when no connection can carry it
#[derive(Clone, Debug, PartialEq)]
pub enum UnavailablePolicy {
    /// Fail immediately with `ConnectionUnavailable`
    FailFast,
    /// Wait up to this long (bounded by the request deadline) for a connection
    Await(Duration),
}

#[derive(Clone, Debug, PartialEq)]
pub struct InvocationConfig {
    /// Deadline applied to requests that do not carry their own
    pub default_deadline: Duration,
    pub retry: RetryPolicy,
    pub unavailable: UnavailablePolicy,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            default_deadline: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            unavailable: UnavailablePolicy::FailFast,
        }
    }
}

/// Configuration for the client transport
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    /// Partition channels per connection (fixed for the life of a connection)
    pub partition_channel_count: usize,

    /// Open partition channels at all; when false only the generic channel is used
    pub partition_channels_enabled: bool,

    /// Upper bound for opening every channel of one connection
    pub connect_timeout: Duration,

    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
    pub invocation: InvocationConfig,

    /// Buffered lifecycle events per subscriber
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            partition_channel_count: 3,
            partition_channels_enabled: true,
            connect_timeout: Duration::from_secs(5),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            invocation: InvocationConfig::default(),
            event_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition_channels(mut self, count: usize) -> Self {
        self.partition_channel_count = count;
        self
    }

    pub fn without_partition_channels(mut self) -> Self {
        self.partition_channels_enabled = false;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat = HeartbeatConfig { interval, timeout };
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.invocation.retry = policy;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.invocation.default_deadline = deadline;
        self
    }

    pub fn with_unavailable_policy(mut self, policy: UnavailablePolicy) -> Self {
        self.invocation.unavailable = policy;
        self
    }

    /// Partition channels a connection to a member should open
    pub fn effective_partition_channels(&self, member_supports: bool) -> usize {
        if self.partition_channels_enabled && member_supports {
            self.partition_channel_count
        } else {
            0
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partition_channel_count == 0 {
            return Err(ConfigError::Invalid(
                "partition_channel_count must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat interval must be positive".to_string()));
        }
        if self.heartbeat.timeout <= self.heartbeat.interval {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout ({:?}) must exceed the interval ({:?})",
                self.heartbeat.timeout, self.heartbeat.interval
            )));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect timeout must be positive".to_string()));
        }
        if self.reconnect.max_attempts == 0 || self.invocation.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("attempt budgets must be at least 1".to_string()));
        }
        if self.invocation.default_deadline.is_zero() {
            return Err(ConfigError::Invalid("default deadline must be positive".to_string()));
        }
        Ok(())
    }

    /// Parse a JSON document; absent fields keep their defaults.
    ///
    /// ```json
    /// { "partition_channel_count": 4, "heartbeat_interval_ms": 1000,
    ///   "heartbeat_timeout_ms": 3000, "await_connection_ms": null }
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ClientConfigFile = serde_json::from_str(json)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// On-disk form of [`ClientConfig`], durations in milliseconds
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ClientConfigFile {
    partition_channel_count: Option<usize>,
    partition_channels_enabled: Option<bool>,
    connect_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    reconnect_initial_backoff_ms: Option<u64>,
    reconnect_max_backoff_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
    reconnect_max_attempts: Option<u32>,
    default_deadline_ms: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    /// `null` or absent keeps the default; `0` selects fail-fast
    await_connection_ms: Option<u64>,
    event_capacity: Option<usize>,
}

impl ClientConfigFile {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::default();
        let ms = Duration::from_millis;

        if let Some(v) = self.partition_channel_count {
            config.partition_channel_count = v;
        }
        if let Some(v) = self.partition_channels_enabled {
            config.partition_channels_enabled = v;
        }
        if let Some(v) = self.connect_timeout_ms {
            config.connect_timeout = ms(v);
        }
        if let Some(v) = self.heartbeat_interval_ms {
            config.heartbeat.interval = ms(v);
        }
        if let Some(v) = self.heartbeat_timeout_ms {
            config.heartbeat.timeout = ms(v);
        }
        if let Some(v) = self.reconnect_initial_backoff_ms {
            config.reconnect.initial_backoff = ms(v);
        }
        if let Some(v) = self.reconnect_max_backoff_ms {
            config.reconnect.max_backoff = ms(v);
        }
        if let Some(v) = self.reconnect_multiplier {
            config.reconnect.multiplier = v;
        }
        if let Some(v) = self.reconnect_max_attempts {
            config.reconnect.max_attempts = v;
        }
        if let Some(v) = self.default_deadline_ms {
            config.invocation.default_deadline = ms(v);
        }
        if let Some(v) = self.retry_max_attempts {
            config.invocation.retry.max_attempts = v;
        }
        if let Some(v) = self.retry_backoff_ms {
            config.invocation.retry.backoff = ms(v);
        }
        match self.await_connection_ms {
            Some(0) => config.invocation.unavailable = UnavailablePolicy::FailFast,
            Some(v) => config.invocation.unavailable = UnavailablePolicy::Await(ms(v)),
            None => {}
        }
        if let Some(v) = self.event_capacity {
            config.event_capacity = v;
        }
        config
    }
}

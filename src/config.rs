//! Configuration for the proxy queue and the racing transport.

use std::time::Duration;

/// Error-limit sentinel meaning a proxy may fail any number of times.
pub const UNLIMITED_ERRORS: i64 = -1;

/// Capacity of the command channel in front of the queue arbiter.
const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Configuration for a [`ProxyQueue`](crate::ProxyQueue).
#[derive(Debug, Clone)]
pub struct ProxyQueueConfig {
    /// Error budget recorded for every newly registered proxy.
    ///
    /// A proxy whose budget is strictly positive is considered registered and is
    /// not added again; with [`UNLIMITED_ERRORS`] re-registration always appends.
    pub error_limit: i64,
    /// Upper bound on how long `get` waits for a proxy. `None` waits until the
    /// queue is closed.
    pub get_timeout: Option<Duration>,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl ProxyQueueConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyQueueConfigBuilder {
        ProxyQueueConfigBuilder::new()
    }
}

impl Default for ProxyQueueConfig {
    fn default() -> Self {
        ProxyQueueConfigBuilder::new().build()
    }
}

/// Builder for `ProxyQueueConfig`.
pub struct ProxyQueueConfigBuilder {
    error_limit: Option<i64>,
    get_timeout: Option<Duration>,
    command_buffer: Option<usize>,
}

impl ProxyQueueConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            error_limit: None,
            get_timeout: None,
            command_buffer: None,
        }
    }

    /// Set the error budget given to newly registered proxies.
    pub fn error_limit(mut self, limit: i64) -> Self {
        self.error_limit = Some(limit);
        self
    }

    /// Bound the time `get` waits for a proxy.
    pub fn get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = Some(timeout);
        self
    }

    /// Set the capacity of the command channel.
    pub fn command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = Some(capacity);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyQueueConfig {
        ProxyQueueConfig {
            error_limit: self.error_limit.unwrap_or(UNLIMITED_ERRORS),
            get_timeout: self.get_timeout,
            command_buffer: self.command_buffer.unwrap_or(DEFAULT_COMMAND_BUFFER).max(1),
        }
    }
}

impl Default for ProxyQueueConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a [`Transport`](crate::Transport).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of concurrent attempts launched per request.
    pub fan_out: usize,
    /// Timeout for establishing the connection to a proxy.
    pub connect_timeout: Duration,
    /// Timeout for a whole attempt, from dialing to the response headers.
    pub request_timeout: Option<Duration>,
    /// Maximum attempts per second across the transport.
    pub max_requests_per_second: Option<f64>,
}

impl TransportConfig {
    /// Create a new configuration builder.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfigBuilder::new().build()
    }
}

/// Builder for `TransportConfig`.
pub struct TransportConfigBuilder {
    fan_out: Option<usize>,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_requests_per_second: Option<f64>,
}

impl TransportConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            fan_out: None,
            connect_timeout: None,
            request_timeout: None,
            max_requests_per_second: None,
        }
    }

    /// Set the number of concurrent attempts per request. Values below 1 become 1.
    pub fn fan_out(mut self, width: usize) -> Self {
        self.fan_out = Some(width);
        self
    }

    /// Set the timeout for dialing a proxy.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the timeout for a whole attempt.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Pace attempts to at most `rps` per second.
    pub fn max_requests_per_second(mut self, rps: f64) -> Self {
        self.max_requests_per_second = Some(rps);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        TransportConfig {
            fan_out: self.fan_out.unwrap_or(3).max(1),
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(10)),
            request_timeout: self.request_timeout,
            max_requests_per_second: self.max_requests_per_second,
        }
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

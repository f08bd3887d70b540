//! Relay engine configuration

use std::time::Duration;

/// Default read chunk size for upstream sockets
pub const DEFAULT_MAX_RECEIVE_SIZE: usize = 16384;

/// Bytes reserved out of the client MSS for headers when sizing segments
pub const DEFAULT_MSS_RESERVE: u16 = 60;

/// Segment payload bound used when the client MSS is absent or too small
pub const DEFAULT_FALLBACK_SEGMENT_SIZE: usize = 1024;

/// Configuration for the relay engine
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Per-cycle read buffer size; a read shorter than this marks the
    /// end of a burst and triggers PSH on the final synthesized segment
    pub max_receive_size: usize,
    /// Reserved header bytes subtracted from the client MSS
    pub mss_reserve: u16,
    /// Payload bound when `mss - mss_reserve` is not positive
    pub fallback_segment_size: usize,
    /// Idle time after which a flow is swept
    pub idle_timeout: Duration,
    /// Capacity of the readiness event buffer
    pub events_capacity: usize,
    /// Backoff after a failed poll before retrying
    pub poll_error_backoff: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_receive_size: DEFAULT_MAX_RECEIVE_SIZE,
            mss_reserve: DEFAULT_MSS_RESERVE,
            fallback_segment_size: DEFAULT_FALLBACK_SEGMENT_SIZE,
            idle_timeout: Duration::from_secs(120),
            events_capacity: 1024,
            poll_error_backoff: Duration::from_millis(100),
        }
    }
}

impl RelayConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Fluent builder for [`RelayConfig`]
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: RelayConfig,
}

impl ConfigBuilder {
    pub fn max_receive_size(mut self, size: usize) -> Self {
        self.config.max_receive_size = size;
        self
    }

    pub fn mss_reserve(mut self, reserve: u16) -> Self {
        self.config.mss_reserve = reserve;
        self
    }

    pub fn fallback_segment_size(mut self, size: usize) -> Self {
        self.config.fallback_segment_size = size;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn poll_error_backoff(mut self, backoff: Duration) -> Self {
        self.config.poll_error_backoff = backoff;
        self
    }

    pub fn build(self) -> RelayConfig {
        self.config
    }
}

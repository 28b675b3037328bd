//! Session and server configuration.

use docsync_core::{CoreError, CoreResult};
use docsync_protocol::ProtocolVersion;
use std::time::Duration;

/// Configuration for one replication session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Versions this server accepts. Older versions stay listed for peers
    /// that have not upgraded.
    pub supported_versions: Vec<ProtocolVersion>,
    /// Maximum change rows per batch.
    pub batch_size: usize,
    /// Maximum encoded bytes of change rows per batch.
    pub batch_max_bytes: usize,
    /// Maximum revision sends awaiting the peer's reply.
    pub max_in_flight_revs: usize,
    /// Maximum body bytes of revision sends awaiting the peer's reply.
    pub max_in_flight_bytes: usize,
    /// Maximum ancestors sent with a revision.
    pub history_limit: usize,
    /// Compress revision bodies.
    pub compress_revs: bool,
    /// zstd level for compressed bodies.
    pub compression_level: i32,
    /// Minimum time between server-side checkpoint writes.
    pub checkpoint_interval: Duration,
    /// How long to wait for the peer to answer a request.
    pub request_timeout: Duration,
    /// How long a continuous feed waits before re-checking for changes.
    pub heartbeat: Duration,
}

impl SessionConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            supported_versions: ProtocolVersion::ALL.to_vec(),
            batch_size: 200,
            batch_max_bytes: 256 * 1024,
            max_in_flight_revs: 50,
            max_in_flight_bytes: 8 * 1024 * 1024,
            history_limit: 20,
            compress_revs: true,
            compression_level: 3,
            checkpoint_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            heartbeat: Duration::from_secs(30),
        }
    }

    /// Sets the accepted protocol versions.
    pub fn with_versions(mut self, versions: &[ProtocolVersion]) -> Self {
        self.supported_versions = versions.to_vec();
        self
    }

    /// Sets the batch row limit.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the batch byte limit.
    pub fn with_batch_max_bytes(mut self, bytes: usize) -> Self {
        self.batch_max_bytes = bytes;
        self
    }

    /// Sets the in-flight revision window.
    pub fn with_max_in_flight_revs(mut self, revs: usize) -> Self {
        self.max_in_flight_revs = revs;
        self
    }

    /// Sets the in-flight byte window.
    pub fn with_max_in_flight_bytes(mut self, bytes: usize) -> Self {
        self.max_in_flight_bytes = bytes;
        self
    }

    /// Enables or disables revision compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress_revs = enabled;
        self
    }

    /// Sets the checkpoint write interval.
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the continuous-feed heartbeat.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Checks the configuration for unusable values.
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |msg: &str| Err(CoreError::InvalidConfig(msg.to_string()));
        if self.supported_versions.is_empty() {
            return invalid("at least one protocol version must be supported");
        }
        if self.batch_size == 0 || self.batch_max_bytes == 0 {
            return invalid("batch limits must be positive");
        }
        if self.max_in_flight_revs == 0 || self.max_in_flight_bytes == 0 {
            return invalid("in-flight windows must be positive");
        }
        if self.max_in_flight_bytes > u32::MAX as usize {
            return invalid("max_in_flight_bytes must fit in 32 bits");
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent sessions.
    pub max_sessions: usize,
    /// Settings applied to every session.
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_sessions: 1000,
            session: SessionConfig::default(),
        }
    }

    /// Sets the maximum concurrent sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the per-session configuration.
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

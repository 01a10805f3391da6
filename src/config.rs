use std::time::Duration;

/// Which HTTP protocol a connection should speak.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    /// Use ALPN to decide. Falls back to HTTP/1.1 if ALPN is unavailable.
    #[default]
    Auto,
    /// Force HTTP/1.1.
    Http1,
    /// Force HTTP/2 (prior knowledge when ALPN is unavailable).
    Http2,
}

/// Settings shared by every pool the client creates.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    protocol: Protocol,
    max_connections: usize,
    max_streams_per_connection: usize,
    connection_acquire_timeout: Duration,
    max_pending_acquires: usize,
    wire_logging: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Auto,
            max_connections: 50,
            max_streams_per_connection: 100,
            connection_acquire_timeout: Duration::from_secs(10),
            max_pending_acquires: 10_000,
            wire_logging: false,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Caps concurrent leases per destination. Under HTTP/2 a lease is a
    /// stream, so this also bounds concurrent streams across connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    /// Upper bound on concurrent streams per HTTP/2 connection. The peer's
    /// `SETTINGS_MAX_CONCURRENT_STREAMS` lowers it further.
    pub fn with_max_streams_per_connection(mut self, max: usize) -> Self {
        self.max_streams_per_connection = max.max(1);
        self
    }

    pub fn with_connection_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.connection_acquire_timeout = timeout;
        self
    }

    pub fn with_max_pending_acquires(mut self, max: usize) -> Self {
        self.max_pending_acquires = max;
        self
    }

    /// Traces every byte read from and written to the wire at TRACE level.
    pub fn with_wire_logging(mut self, enabled: bool) -> Self {
        self.wire_logging = enabled;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn max_streams_per_connection(&self) -> usize {
        self.max_streams_per_connection
    }

    pub fn connection_acquire_timeout(&self) -> Duration {
        self.connection_acquire_timeout
    }

    pub fn max_pending_acquires(&self) -> usize {
        self.max_pending_acquires
    }

    pub fn wire_logging(&self) -> bool {
        self.wire_logging
    }
}

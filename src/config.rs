//! Server configuration.
//!
//! Wiring this from a CLI or environment file is the application's job (see the
//! crate-level Non-goals); this module only defines the struct the core consumes.

use std::path::PathBuf;
use std::time::Duration;

/// Top level server configuration, consumed by [`crate::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,

    pub max_frame_bytes: usize,
    pub max_message_bytes: usize,
    pub write_buffer_bytes: usize,

    /// Fraction of `write_buffer_bytes` at which reads resume after backpressure.
    pub write_buffer_low_water: f32,

    pub cors: CorsConfig,
    pub queue: QueueConfig,

    /// Upper bound on new connections accepted per reactor tick.
    pub accept_batch: usize,
    /// Upper bound on bytes read/written per socket per reactor tick, so one
    /// busy connection cannot starve the others.
    pub io_quantum_bytes: usize,
    /// How long `shutdown` waits for write buffers to drain before giving up.
    pub shutdown_drain_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(10),
            max_frame_bytes: 2 * 1024 * 1024,
            max_message_bytes: 2 * 1024 * 1024,
            write_buffer_bytes: 1024 * 1024,
            write_buffer_low_water: 0.5,
            cors: CorsConfig::default(),
            queue: QueueConfig::default(),
            accept_batch: 256,
            io_quantum_bytes: 64 * 1024,
            shutdown_drain_deadline: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn with_bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    pub fn with_write_buffer_bytes(mut self, bytes: usize) -> Self {
        self.write_buffer_bytes = bytes;
        self
    }

    pub fn with_cors(mut self, cors: CorsConfig) -> Self {
        self.cors = cors;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// CORS behavior. Applied to every request that carries an `Origin` header.
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Allowed origins; `["*"]` allows any origin.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub max_age: Option<u64>,
    pub allow_credentials: bool,
}

impl CorsConfig {
    pub fn permissive() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".into(),
                "POST".into(),
                "PUT".into(),
                "PATCH".into(),
                "DELETE".into(),
                "OPTIONS".into(),
            ],
            allowed_headers: vec!["Content-Type".into(), "Authorization".into()],
            max_age: Some(86400),
            allow_credentials: false,
        }
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

/// Broadcast queue file configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub enabled: bool,
    pub file: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: PathBuf::from("sockeon-broadcast.jsonl"),
        }
    }
}

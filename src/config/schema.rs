//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! gateway. All types derive Serde traits for deserialization from config
//! files.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address, connection limits).
    pub listener: ListenerConfig,

    /// Flow program selection.
    pub flow: FlowConfig,

    /// Backend cluster definitions.
    #[serde(rename = "cluster")]
    pub clusters: Vec<ClusterConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,

    /// Total request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_body_size: 2 * 1024 * 1024,
            request_timeout_secs: 60,
        }
    }
}

/// Which compiled Flow program drives request handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Path to a compiled bytecode image. When unset, a built-in program
    /// that balances every request onto the first cluster is used.
    pub program: Option<std::path::PathBuf>,

    /// Entry handler name.
    pub handler: String,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            program: None,
            handler: "main".to_string(),
        }
    }
}

/// One backend cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Unique cluster name; Flow programs address clusters by it.
    pub name: String,

    /// Whether the cluster accepts requests at all.
    pub enabled: bool,

    /// Recovering members are disabled instead of auto-restored.
    pub sticky_offline: bool,

    /// Relay X-Sendfile response headers from backends.
    pub allow_x_sendfile: bool,

    /// Queue instead of rejecting when no member is available.
    pub enqueue_on_unavailable: bool,

    /// Maximum queued requests per bucket.
    pub queue_limit: usize,

    /// How long a request may wait in the queue.
    pub queue_timeout_ms: u64,

    /// Retry-After header value on rejections; 0 disables the header.
    pub retry_after_secs: u64,

    /// Dispatch attempts beyond the first before giving up.
    pub max_retry_count: usize,

    /// Backend connect timeout.
    pub connect_timeout_ms: u64,

    /// Backend response read timeout.
    pub read_timeout_ms: u64,

    /// Backend request write timeout.
    pub write_timeout_ms: u64,

    /// Member selection strategy: "least-load" or "round-robin".
    pub scheduler: String,

    /// Backend origins.
    #[serde(rename = "member")]
    pub members: Vec<MemberConfig>,

    /// Active health checking.
    pub health_check: HealthCheckConfig,

    /// Optional child token buckets (rate/ceil are fractions of the
    /// root).
    #[serde(rename = "bucket")]
    pub buckets: Vec<BucketConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            sticky_offline: false,
            allow_x_sendfile: true,
            enqueue_on_unavailable: true,
            queue_limit: 128,
            queue_timeout_ms: 30_000,
            retry_after_secs: 10,
            max_retry_count: 3,
            connect_timeout_ms: 4_000,
            read_timeout_ms: 30_000,
            write_timeout_ms: 8_000,
            scheduler: "least-load".to_string(),
            members: Vec::new(),
            health_check: HealthCheckConfig::default(),
            buckets: Vec::new(),
        }
    }
}

/// Backend origin configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemberConfig {
    /// Unique member identifier within the cluster.
    pub name: String,

    /// Socket address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Maximum concurrent requests; 0 means unbounded.
    pub capacity: usize,

    /// Whether the member may receive traffic.
    pub enabled: bool,

    /// Backend protocol tag.
    pub protocol: String,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            capacity: 1,
            enabled: true,
            protocol: "http".to_string(),
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Path probed on each member.
    pub uri: String,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Consecutive successes required to go online.
    pub success_threshold: u32,

    /// Response statuses counted as success.
    pub success_codes: Vec<u16>,

    /// User-Agent header carried by probes.
    pub user_agent: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            uri: "/health".to_string(),
            interval_ms: 4_000,
            success_threshold: 3,
            success_codes: vec![200],
            user_agent: "flowgate-health".to_string(),
        }
    }
}

/// One child token bucket of a cluster's shaper.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketConfig {
    pub name: String,

    /// Guaranteed share, fraction of the root (0, 1].
    pub rate: f64,

    /// Maximum share including borrowing, fraction of the root.
    pub ceil: f64,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

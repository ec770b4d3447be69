//! Configuration: schema, file loading, semantic validation.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BucketConfig, ClusterConfig, FlowConfig, GatewayConfig, HealthCheckConfig, ListenerConfig,
    MemberConfig, ObservabilityConfig,
};
pub use validation::{validate_config, ValidationError};

//! Configuration validation logic.

use std::collections::HashSet;

use crate::config::schema::GatewayConfig;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a GatewayConfig for semantic correctness.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Cluster names must be unique and non-empty
    let mut cluster_names = HashSet::new();
    for cluster in &config.clusters {
        if cluster.name.is_empty() {
            errors.push(ValidationError("cluster name must not be empty".to_string()));
        } else if !cluster_names.insert(cluster.name.as_str()) {
            errors.push(ValidationError(format!(
                "duplicate cluster name '{}'",
                cluster.name
            )));
        }
    }

    for cluster in &config.clusters {
        // 2. Member names unique within the cluster; addresses must parse
        let mut member_names = HashSet::new();
        for member in &cluster.members {
            if !member_names.insert(member.name.as_str()) {
                errors.push(ValidationError(format!(
                    "cluster '{}': duplicate member name '{}'",
                    cluster.name, member.name
                )));
            }
            if member.address.parse::<std::net::SocketAddr>().is_err() {
                errors.push(ValidationError(format!(
                    "cluster '{}': member '{}' has invalid address '{}'",
                    cluster.name, member.name, member.address
                )));
            }
        }

        // 3. Health thresholds
        if cluster.health_check.success_threshold == 0 {
            errors.push(ValidationError(format!(
                "cluster '{}': health_check.success_threshold must be > 0",
                cluster.name
            )));
        }
        if cluster.health_check.success_codes.is_empty() {
            errors.push(ValidationError(format!(
                "cluster '{}': health_check.success_codes must not be empty",
                cluster.name
            )));
        }

        // 4. Scheduler must be known
        if crate::cluster::scheduler::by_name(&cluster.scheduler).is_none() {
            errors.push(ValidationError(format!(
                "cluster '{}': unknown scheduler '{}'",
                cluster.name, cluster.scheduler
            )));
        }

        // 5. Bucket ratios
        let mut rate_sum = 0.0;
        let mut bucket_names = HashSet::new();
        for bucket in &cluster.buckets {
            if !(bucket.rate > 0.0 && bucket.rate <= 1.0) {
                errors.push(ValidationError(format!(
                    "cluster '{}': bucket '{}' rate must be in (0, 1]",
                    cluster.name, bucket.name
                )));
            }
            if bucket.ceil < bucket.rate || bucket.ceil > 1.0 {
                errors.push(ValidationError(format!(
                    "cluster '{}': bucket '{}' ceil must be in [rate, 1]",
                    cluster.name, bucket.name
                )));
            }
            if !bucket_names.insert(bucket.name.as_str()) {
                errors.push(ValidationError(format!(
                    "cluster '{}': duplicate bucket name '{}'",
                    cluster.name, bucket.name
                )));
            }
            rate_sum += bucket.rate;
        }
        if rate_sum > 1.0 + f64::EPSILON {
            errors.push(ValidationError(format!(
                "cluster '{}': bucket rates sum to {rate_sum:.3}, exceeding 1.0",
                cluster.name
            )));
        }

        if cluster.queue_timeout_ms == 0 && cluster.enqueue_on_unavailable {
            tracing::warn!(
                cluster = %cluster.name,
                "queue_timeout_ms is 0, queued requests will expire immediately"
            );
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

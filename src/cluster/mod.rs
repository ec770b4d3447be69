//! Reverse-proxy cluster subsystem.
//!
//! # Data Flow
//! ```text
//! request context ──▶ cluster.rs (admission, queueing, retry)
//!     ├─ shaper.rs    (hierarchical token buckets + queues)
//!     ├─ scheduler.rs (member selection: least-load / round-robin)
//!     ├─ member.rs    (per-backend load gate + dispatch)
//!     │     └─ transport::client (single HTTP exchange)
//!     └─ health.rs    (active probing drives online/offline)
//! ```
//!
//! # Design Decisions
//! - The shaper's root size always equals the live capacity of the
//!   cluster: enabled members that are online
//! - Response events flow through an injected listener; the cluster never
//!   hands a backend connection upstream
//! - Transport errors never cross task boundaries; the retry loop converts
//!   them into terminal 5xx outcomes

pub mod cluster;
pub mod health;
pub mod member;
pub mod request;
pub mod scheduler;
pub mod shaper;

pub use cluster::{Cluster, ClusterError};
pub use health::{HealthMonitor, HealthOptions, HealthState};
pub use member::ClusterMember;
pub use request::{ClusterRequest, ResponseListener};
pub use scheduler::{Scheduler, SchedulerStatus};
pub use shaper::{Bucket, TokenShaper, TokenShaperError};

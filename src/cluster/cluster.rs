//! The cluster: admission, queueing, dispatch and retry over a set of
//! backend members.
//!
//! # Data Flow
//! ```text
//! schedule(req, bucket)
//!     ├─ bucket.get(1) ──▶ scheduler ──▶ member.try_process ──▶ dispatch
//!     │                        │
//!     │                        └─ Unavailable/Overloaded ─▶ enqueue or 503
//!     └─ no tokens ─▶ enqueue (bounded, deadline) or 503
//!
//! dispatch failure ─▶ member offline ─▶ reschedule (≤ max_retry_count)
//! member recovery  ─▶ shaper grows  ─▶ dequeue one queued request
//! queue deadline   ─▶ 504 Gateway Timeout
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use axum::http::{StatusCode, Version};
use thiserror::Error;

use crate::cluster::health::{HealthMonitor, HealthOptions, HealthState};
use crate::cluster::member::ClusterMember;
use crate::cluster::request::ClusterRequest;
use crate::cluster::scheduler::{self, Scheduler, SchedulerStatus};
use crate::cluster::shaper::{Bucket, TokenShaper, TokenShaperError};
use crate::config::schema::ClusterConfig;
use crate::observability::metrics;
use crate::transport::TransportError;

/// Terminal request outcomes, surfaced as 5xx through the listener.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ClusterError {
    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("gateway timeout")]
    GatewayTimeout,

    #[error("backend unreachable")]
    BackendUnreachable,

    #[error("queue overflow")]
    QueueOverflow,

    #[error("retries exhausted")]
    RetriesExhausted,
}

impl ClusterError {
    fn as_label(self) -> &'static str {
        match self {
            ClusterError::ServiceUnavailable => "service-unavailable",
            ClusterError::GatewayTimeout => "gateway-timeout",
            ClusterError::BackendUnreachable => "backend-unreachable",
            ClusterError::QueueOverflow => "queue-overflow",
            ClusterError::RetriesExhausted => "retries-exhausted",
        }
    }
}

pub struct Cluster {
    name: String,
    enabled: AtomicBool,
    sticky_offline_mode: AtomicBool,
    allow_x_sendfile: AtomicBool,
    enqueue_on_unavailable: AtomicBool,
    queue_limit: usize,
    queue_timeout: Duration,
    retry_after: Duration,
    max_retry_count: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    members: RwLock<Vec<Arc<ClusterMember>>>,
    shaper: TokenShaper,
    scheduler: Box<dyn Scheduler>,
    health_options: HealthOptions,
    // counters
    dropped: AtomicU64,
    queued: AtomicU64,
    total: AtomicU64,
}

impl Cluster {
    /// Build a cluster from its configuration envelope. Members begin in
    /// the Undefined health state and join the shaper only once their
    /// monitors bring them online.
    pub fn from_config(config: &ClusterConfig) -> Arc<Self> {
        let scheduler = scheduler::by_name(&config.scheduler).unwrap_or_else(|| {
            tracing::warn!(
                cluster = %config.name,
                scheduler = %config.scheduler,
                "unknown scheduler, falling back to least-load"
            );
            Box::new(scheduler::LeastLoad)
        });

        // an absolute health-check uri pins the probed path and Host
        // header; a bare path probes each member under its own authority
        let (test_path, test_host) = match url::Url::parse(&config.health_check.uri) {
            Ok(url) if url.has_host() => {
                let host = match (url.host_str(), url.port()) {
                    (Some(host), Some(port)) => format!("{host}:{port}"),
                    (Some(host), None) => host.to_string(),
                    _ => String::new(),
                };
                (url.path().to_string(), host)
            }
            _ => (config.health_check.uri.clone(), String::new()),
        };

        let health_options = HealthOptions {
            test_path,
            test_host, // empty: filled per member
            user_agent: config.health_check.user_agent.clone(),
            interval: Duration::from_millis(config.health_check.interval_ms),
            success_threshold: config.health_check.success_threshold,
            success_codes: config.health_check.success_codes.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        };

        let cluster = Arc::new(Cluster {
            name: config.name.clone(),
            enabled: AtomicBool::new(config.enabled),
            sticky_offline_mode: AtomicBool::new(config.sticky_offline),
            allow_x_sendfile: AtomicBool::new(config.allow_x_sendfile),
            enqueue_on_unavailable: AtomicBool::new(config.enqueue_on_unavailable),
            queue_limit: config.queue_limit,
            queue_timeout: Duration::from_millis(config.queue_timeout_ms),
            retry_after: Duration::from_secs(config.retry_after_secs),
            max_retry_count: config.max_retry_count,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            members: RwLock::new(Vec::new()),
            shaper: TokenShaper::new(0),
            scheduler,
            health_options,
            dropped: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            total: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&cluster);
        cluster.shaper.set_timeout_handler(Arc::new(move |req| {
            if let Some(cluster) = weak.upgrade() {
                cluster.on_queue_timeout(req);
            }
        }));

        for bucket in &config.buckets {
            if let Err(error) = cluster.create_bucket(&bucket.name, bucket.rate, bucket.ceil) {
                tracing::warn!(
                    cluster = %config.name,
                    bucket = %bucket.name,
                    error = %error,
                    "skipping bucket"
                );
            }
        }

        for member in &config.members {
            match member.address.parse() {
                Ok(addr) => {
                    cluster.add_member(
                        &member.name,
                        addr,
                        member.capacity,
                        member.enabled,
                        &member.protocol,
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        cluster = %config.name,
                        member = %member.name,
                        address = %member.address,
                        "invalid member address"
                    );
                }
            }
        }

        cluster
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn sticky_offline_mode(&self) -> bool {
        self.sticky_offline_mode.load(Ordering::SeqCst)
    }

    pub fn allow_x_sendfile(&self) -> bool {
        self.allow_x_sendfile.load(Ordering::SeqCst)
    }

    pub fn enqueue_on_unavailable(&self) -> bool {
        self.enqueue_on_unavailable.load(Ordering::SeqCst)
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }

    pub fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    pub fn shaper(&self) -> &TokenShaper {
        &self.shaper
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> u64 {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn members(&self) -> Vec<Arc<ClusterMember>> {
        self.members.read().expect("member list lock poisoned").clone()
    }

    pub fn find_member(&self, name: &str) -> Option<Arc<ClusterMember>> {
        self.members().into_iter().find(|m| m.name() == name)
    }

    /// Register a backend and start its health monitor.
    pub fn add_member(
        self: &Arc<Self>,
        name: &str,
        addr: std::net::SocketAddr,
        capacity: usize,
        enabled: bool,
        protocol: &str,
    ) -> Arc<ClusterMember> {
        let mut options = self.health_options.clone();
        if options.test_host.is_empty() {
            options.test_host = addr.to_string();
        }
        let monitor = HealthMonitor::new(addr, options);

        let member = ClusterMember::new(
            name.to_string(),
            addr,
            capacity,
            enabled,
            protocol.to_string(),
            self.connect_timeout,
            self.read_timeout,
            self.write_timeout,
            monitor,
            Arc::downgrade(self),
        );

        let weak_cluster = Arc::downgrade(self);
        let weak_member = Arc::downgrade(&member);
        member
            .monitor()
            .set_state_change_callback(Box::new(move |old_state| {
                if let (Some(cluster), Some(member)) =
                    (weak_cluster.upgrade(), weak_member.upgrade())
                {
                    cluster.on_member_state_changed(&member, old_state);
                }
            }));

        self.members
            .write()
            .expect("member list lock poisoned")
            .push(Arc::clone(&member));

        member.monitor().start();
        member
    }

    /// Unregister a backend. Its monitor stops; in-flight requests on it
    /// run to completion.
    pub fn remove_member(&self, name: &str) {
        let mut members = self.members.write().expect("member list lock poisoned");
        if let Some(pos) = members.iter().position(|m| m.name() == name) {
            let member = members.remove(pos);
            member.monitor().stop();
            if member.is_enabled() && member.monitor().is_online() {
                self.shaper
                    .resize(self.shaper.size().saturating_sub(member.capacity()));
            }
        }
    }

    /// Toggle a member administratively. Never drops in-flight requests;
    /// only future assignment is affected.
    pub fn set_member_enabled(&self, member: &Arc<ClusterMember>, enabled: bool) {
        let was = member.swap_enabled(enabled);
        if was == enabled {
            return;
        }
        if member.monitor().is_online() {
            let size = self.shaper.size();
            let new_size = if enabled {
                size + member.capacity()
            } else {
                size.saturating_sub(member.capacity())
            };
            self.shaper.resize(new_size);
            metrics::record_shaper_size(&self.name, new_size);
        }
    }

    pub fn create_bucket(&self, name: &str, rate: f64, ceil: f64) -> Result<Bucket, TokenShaperError> {
        self.shaper.create_node(name, rate, ceil)
    }

    pub fn find_bucket(&self, name: &str) -> Option<Bucket> {
        self.shaper.find_node(name)
    }

    pub fn root_bucket(&self) -> Bucket {
        self.shaper.root()
    }

    /// Visit every bucket's counters (name, rate, ceil, used, queued);
    /// stop early when `f` returns false.
    pub fn each_bucket(&self, mut f: impl FnMut(&str, usize, usize, usize, usize) -> bool) {
        for (name, rate, ceil, used, queued) in self.shaper.snapshot() {
            if !f(&name, rate, ceil, used, queued) {
                break;
            }
        }
    }

    /// Admit a request via the root bucket.
    pub fn schedule(self: &Arc<Self>, req: Arc<ClusterRequest>) {
        let bucket = self.root_bucket();
        self.schedule_in(req, bucket);
    }

    /// Admit a request via a specific bucket.
    pub fn schedule_in(self: &Arc<Self>, req: Arc<ClusterRequest>, bucket: Bucket) {
        req.set_bucket(bucket.clone());
        self.total.fetch_add(1, Ordering::SeqCst);

        if !self.is_enabled() {
            self.finish_with_error(&req, ClusterError::ServiceUnavailable);
            return;
        }

        if bucket.get(1) {
            req.set_tokens(1);
            let status = self.scheduler.schedule(&req, &self.members());
            if status == SchedulerStatus::Success {
                return;
            }

            bucket.put(1);
            req.set_tokens(0);

            if status == SchedulerStatus::Unavailable && !self.enqueue_on_unavailable() {
                self.finish_with_error(&req, ClusterError::ServiceUnavailable);
            } else {
                self.try_enqueue(req);
            }
        } else if bucket.ceil() > 0 || self.enqueue_on_unavailable() {
            // tokens may come back; prefer waiting over rejecting
            self.try_enqueue(req);
        } else {
            self.finish_with_error(&req, ClusterError::ServiceUnavailable);
        }
    }

    /// Re-entry point after a failed dispatch attempt.
    pub(crate) fn reschedule(self: &Arc<Self>, req: Arc<ClusterRequest>) {
        if !self.verify_try_count(&req) {
            return;
        }
        let status = self.scheduler.schedule(&req, &self.members());
        if status != SchedulerStatus::Success {
            if req.take_tokens() == 1 {
                if let Some(bucket) = req.bucket() {
                    bucket.put(1);
                }
            }
            self.try_enqueue(req);
        }
    }

    /// `false` means the retry allowance is spent and the request has been
    /// finished with an error response.
    fn verify_try_count(self: &Arc<Self>, req: &Arc<ClusterRequest>) -> bool {
        if req.try_count() <= self.max_retry_count {
            return true;
        }
        tracing::info!(
            cluster = %self.name,
            tries = req.try_count(),
            "request failed too many times"
        );
        self.finish_with_error(req, ClusterError::RetriesExhausted);
        false
    }

    /// Park the request in its bucket's queue, respecting the limit.
    fn try_enqueue(&self, req: Arc<ClusterRequest>) -> bool {
        let Some(bucket) = req.bucket() else {
            self.finish_with_error(&req, ClusterError::ServiceUnavailable);
            return false;
        };

        // queued requests hold no tokens
        if req.take_tokens() == 1 {
            bucket.put(1);
        }

        if bucket.queued() < self.queue_limit {
            req.clear_member();
            bucket.enqueue(Arc::clone(&req), Instant::now() + self.queue_timeout);
            let pending = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(
                cluster = %self.name,
                bucket = %bucket.name(),
                pending,
                "cluster overloaded, request enqueued"
            );
            return true;
        }

        tracing::debug!(
            cluster = %self.name,
            limit = self.queue_limit,
            "queue limit reached"
        );
        self.finish_with_error(&req, ClusterError::QueueOverflow);
        false
    }

    /// Hand one queued request to a member that just gained capacity.
    pub(crate) fn dequeue_to(self: &Arc<Self>, member: &Arc<ClusterMember>) {
        let Some(req) = self.dequeue() else { return };

        let cluster = Arc::clone(self);
        let member = Arc::clone(member);
        tokio::spawn(async move {
            let Some(bucket) = req.bucket() else {
                cluster.finish_with_error(&req, ClusterError::ServiceUnavailable);
                return;
            };
            if !bucket.get(1) {
                // capacity evaporated between dequeue and here
                cluster.try_enqueue(req);
                return;
            }
            req.set_tokens(1);
            let status = member.try_process(&req);
            if status != SchedulerStatus::Success {
                bucket.put(1);
                req.set_tokens(0);
                tracing::debug!(
                    cluster = %cluster.name,
                    member = %member.name(),
                    ?status,
                    "dequeued request could not be dispatched"
                );
                cluster.reschedule(req);
            }
        });
    }

    fn dequeue(&self) -> Option<Arc<ClusterRequest>> {
        let req = self.shaper.dequeue()?;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        Some(req)
    }

    /// A dispatched request finished streaming its response.
    pub(crate) fn on_dispatch_complete(
        self: &Arc<Self>,
        req: &Arc<ClusterRequest>,
        member: &Arc<ClusterMember>,
    ) {
        if req.take_tokens() == 1 {
            if let Some(bucket) = req.bucket() {
                bucket.put(1);
            }
        }
        metrics::record_cluster_request(&self.name, "ok");
        // freed capacity drains the queue
        self.dequeue_to(member);
    }

    fn on_queue_timeout(self: &Arc<Self>, req: Arc<ClusterRequest>) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let waited = req.ctime().elapsed();
        tracing::info!(
            cluster = %self.name,
            method = %req.info().method,
            path = %req.info().path,
            ?waited,
            "queued request timed out"
        );
        self.finish_with_error(&req, ClusterError::GatewayTimeout);
    }

    /// Cancel a request still sitting in a queue. A no-op once dispatched.
    pub fn cancel(&self, req: &Arc<ClusterRequest>) {
        if req.take_queued() {
            if let Some(bucket) = req.bucket() {
                bucket.remove(req);
            }
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Emit the terminal error response through the listener pathway.
    fn finish_with_error(&self, req: &Arc<ClusterRequest>, error: ClusterError) {
        if req.take_tokens() == 1 {
            if let Some(bucket) = req.bucket() {
                bucket.put(1);
            }
        }

        let status = match error {
            ClusterError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::BackendUnreachable => StatusCode::BAD_GATEWAY,
            ClusterError::RetriesExhausted => match req.last_error() {
                Some(TransportError::ProtocolError(_)) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            },
            ClusterError::ServiceUnavailable | ClusterError::QueueOverflow => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        let bucket_name = req.bucket().map(|b| b.name());
        let retry_after = self.retry_after;
        req.with_listener(|listener| {
            listener.on_message_begin(
                Version::HTTP_11,
                status,
                status.canonical_reason().unwrap_or(""),
            );
            if let Some(bucket) = &bucket_name {
                listener.on_message_header("Cluster-Bucket", bucket);
            }
            if !retry_after.is_zero() {
                listener.on_message_header("Retry-After", &retry_after.as_secs().to_string());
            }
            listener.on_message_header_end();
            listener.on_message_end();
        });

        self.dropped.fetch_add(1, Ordering::SeqCst);
        metrics::record_cluster_request(&self.name, error.as_label());
    }

    fn on_member_state_changed(
        self: &Arc<Self>,
        member: &Arc<ClusterMember>,
        old_state: HealthState,
    ) {
        let state = member.monitor().state();
        tracing::info!(
            cluster = %self.name,
            member = %member.name(),
            from = %old_state,
            to = %state,
            "member health changed"
        );
        metrics::record_member_health(&self.name, member.name(), state == HealthState::Online);

        if member.monitor().is_online() {
            if !member.is_enabled() {
                return;
            }

            let new_size = self.shaper.size() + member.capacity();
            self.shaper.resize(new_size);
            metrics::record_shaper_size(&self.name, new_size);

            if !self.sticky_offline_mode() {
                self.dequeue_to(member);
            } else {
                tracing::info!(
                    cluster = %self.name,
                    member = %member.name(),
                    "member disabled due to sticky offline mode"
                );
                self.set_member_enabled(member, false);
            }
        } else if member.is_enabled() && old_state == HealthState::Online {
            let new_size = self.shaper.size().saturating_sub(member.capacity());
            self.shaper.resize(new_size);
            metrics::record_shaper_size(&self.name, new_size);
        }
    }

    /// Structured state dump: configuration, counters, members, buckets.
    pub fn state_json(&self) -> serde_json::Value {
        let members: Vec<_> = self
            .members()
            .iter()
            .map(|m| {
                serde_json::json!({
                    "name": m.name(),
                    "address": m.addr().to_string(),
                    "capacity": m.capacity(),
                    "load": m.load(),
                    "enabled": m.is_enabled(),
                    "protocol": m.protocol(),
                    "state": m.monitor().state().to_string(),
                })
            })
            .collect();
        let buckets: Vec<_> = self
            .shaper
            .snapshot()
            .into_iter()
            .map(|(name, rate, ceil, used, queued)| {
                serde_json::json!({
                    "name": name,
                    "rate": rate,
                    "ceil": ceil,
                    "used": used,
                    "queued": queued,
                })
            })
            .collect();
        serde_json::json!({
            "name": self.name,
            "enabled": self.is_enabled(),
            "scheduler": self.scheduler.name(),
            "queue-limit": self.queue_limit,
            "max-retry-count": self.max_retry_count,
            "dropped": self.dropped(),
            "queued": self.queued_count(),
            "total": self.total(),
            "shaper-size": self.shaper.size(),
            "members": members,
            "buckets": buckets,
        })
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("members", &self.members().len())
            .field("shaper_size", &self.shaper.size())
            .finish()
    }
}

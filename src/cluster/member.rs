//! A single backend origin of a cluster.
//!
//! The member gates admission (enabled, online, load-vs-capacity under its
//! mutex), owns its health monitor, and drives dispatch through the
//! single-exchange HTTP transport. Failure of any dispatch marks the
//! member offline and hands the request back to the cluster's retry loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::cluster::cluster::Cluster;
use crate::cluster::health::{HealthMonitor, HealthState};
use crate::cluster::request::ClusterRequest;
use crate::cluster::SchedulerStatus;
use crate::transport::{is_connection_header, Exchange, HttpTransport, TransportError};

pub struct ClusterMember {
    name: String,
    addr: SocketAddr,
    /// 0 means unbounded.
    capacity: usize,
    enabled: AtomicBool,
    protocol: String,
    load: AtomicUsize,
    /// Serializes the load-vs-capacity admission decision.
    admission: Mutex<()>,
    monitor: Arc<HealthMonitor>,
    transport: HttpTransport,
    cluster: Weak<Cluster>,
}

impl ClusterMember {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        addr: SocketAddr,
        capacity: usize,
        enabled: bool,
        protocol: String,
        connect_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
        monitor: Arc<HealthMonitor>,
        cluster: Weak<Cluster>,
    ) -> Arc<Self> {
        Arc::new(ClusterMember {
            name,
            addr,
            capacity,
            enabled: AtomicBool::new(enabled),
            protocol,
            load: AtomicUsize::new(0),
            admission: Mutex::new(()),
            monitor,
            transport: HttpTransport::new(connect_timeout, read_timeout, write_timeout),
            cluster,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag, returning the previous value. Shaper
    /// accounting is the cluster's business; in-flight requests are never
    /// touched.
    pub(crate) fn swap_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst)
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Try to take this request: admission check, load increment, and
    /// asynchronous dispatch. `Success` means the request now belongs to
    /// this member until the exchange resolves.
    pub fn try_process(self: &Arc<Self>, req: &Arc<ClusterRequest>) -> SchedulerStatus {
        if !self.is_enabled() {
            return SchedulerStatus::Unavailable;
        }
        if !self.monitor.is_online() {
            return SchedulerStatus::Unavailable;
        }

        {
            let _admission = self.admission.lock().expect("member admission mutex poisoned");
            if self.capacity > 0 && self.load.load(Ordering::SeqCst) >= self.capacity {
                return SchedulerStatus::Overloaded;
            }
            self.load.fetch_add(1, Ordering::SeqCst);
        }

        req.set_member(Arc::clone(self));
        let attempt = req.bump_try_count();
        tracing::debug!(
            member = %self.name,
            addr = %self.addr,
            attempt,
            "dispatching request to backend"
        );

        let member = Arc::clone(self);
        let req = Arc::clone(req);
        tokio::spawn(async move {
            let outcome = member
                .transport
                .send(member.addr, req.info(), req.body())
                .await;
            match outcome {
                Ok(exchange) => member.on_response(&req, exchange),
                Err(error) => member.on_failure(&req, error),
            }
        });

        SchedulerStatus::Success
    }

    fn on_failure(self: &Arc<Self>, req: &Arc<ClusterRequest>, error: TransportError) {
        self.load.fetch_sub(1, Ordering::SeqCst);
        tracing::warn!(
            member = %self.name,
            addr = %self.addr,
            error = %error,
            "backend dispatch failed"
        );

        self.monitor.set_state(HealthState::Offline);
        req.clear_member();
        req.set_last_error(error);

        if let Some(cluster) = self.cluster.upgrade() {
            cluster.reschedule(Arc::clone(req));
        }
    }

    fn on_response(self: &Arc<Self>, req: &Arc<ClusterRequest>, exchange: Exchange) {
        let allow_x_sendfile = self
            .cluster
            .upgrade()
            .map(|c| c.allow_x_sendfile())
            .unwrap_or(false);
        let bucket_name = req.bucket().map(|b| b.name());

        req.with_listener(|listener| {
            listener.on_message_begin(
                exchange.version(),
                exchange.status(),
                exchange.status().canonical_reason().unwrap_or(""),
            );
            for (name, value) in exchange.headers() {
                if is_connection_header(name) {
                    continue;
                }
                if !allow_x_sendfile && name.eq_ignore_ascii_case("x-sendfile") {
                    continue;
                }
                listener.on_message_header(name, value);
            }
            if let Some(bucket) = &bucket_name {
                listener.on_message_header("Cluster-Bucket", bucket);
            }
            listener.on_message_header_end();
            listener.on_message_content(exchange.body());
            listener.on_message_end();
        });

        self.load.fetch_sub(1, Ordering::SeqCst);

        if let Some(cluster) = self.cluster.upgrade() {
            cluster.on_dispatch_complete(req, self);
        }
    }
}

impl std::fmt::Debug for ClusterMember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMember")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("capacity", &self.capacity)
            .field("load", &self.load())
            .field("enabled", &self.is_enabled())
            .field("state", &self.monitor.state())
            .finish()
    }
}

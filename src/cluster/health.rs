//! Active health monitoring for cluster members.
//!
//! # States
//! - Undefined: initial, before the first probe verdict
//! - Offline: excluded from scheduling
//! - Online: eligible for traffic
//!
//! # State Transitions
//! ```text
//! any failure            → Offline (consecutive-success counter resets)
//! successes >= threshold → Online
//! ```
//!
//! Each monitor owns its HTTP transport and its probe task. Probes run at
//! `interval` with a little jitter so a fleet of monitors does not stampede
//! its backends. State changes fire a callback; the cluster uses it to
//! resize the shaper and drain queues.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::transport::{HttpTransport, RequestInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Undefined,
    Offline,
    Online,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Undefined => f.write_str("undefined"),
            HealthState::Offline => f.write_str("offline"),
            HealthState::Online => f.write_str("online"),
        }
    }
}

/// Invoked with the previous state after every transition.
pub type StateChangeCallback = Box<dyn Fn(HealthState) + Send + Sync>;

/// Probe settings, one per member.
#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// Path probed on the member, e.g. `/health`.
    pub test_path: String,
    /// Host header carried by probes.
    pub test_host: String,
    pub user_agent: String,
    pub interval: Duration,
    pub success_threshold: u32,
    pub success_codes: Vec<u16>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

pub struct HealthMonitor {
    target: SocketAddr,
    options: HealthOptions,
    transport: HttpTransport,
    state: Mutex<HealthState>,
    consecutive_successes: AtomicU32,
    total_failures: AtomicU64,
    on_state_change: Mutex<Option<StateChangeCallback>>,
    stopped: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(target: SocketAddr, options: HealthOptions) -> Arc<Self> {
        let transport = HttpTransport::new(
            options.connect_timeout,
            options.read_timeout,
            options.write_timeout,
        );
        Arc::new(HealthMonitor {
            target,
            options,
            transport,
            state: Mutex::new(HealthState::Undefined),
            consecutive_successes: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            on_state_change: Mutex::new(None),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn set_state_change_callback(&self, callback: StateChangeCallback) {
        *self
            .on_state_change
            .lock()
            .expect("state change callback mutex poisoned") = Some(callback);
    }

    pub fn state(&self) -> HealthState {
        *self.state.lock().expect("health state mutex poisoned")
    }

    pub fn is_online(&self) -> bool {
        self.state() == HealthState::Online
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Spawn the probe loop. The task holds only a weak reference, so
    /// dropping the last owner stops the loop on its own.
    pub fn start(self: &Arc<Self>) {
        let weak: Weak<HealthMonitor> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let interval = {
                    let Some(monitor) = weak.upgrade() else { break };
                    if monitor.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    monitor.probe().await;
                    monitor.options.interval
                };
                tokio::time::sleep(jittered(interval)).await;
            }
        });
        *self.task.lock().expect("health task mutex poisoned") = Some(handle);
    }

    /// Cancel the probe loop. Required before the monitor is dropped by a
    /// member that is being torn down mid-probe.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().expect("health task mutex poisoned").take() {
            handle.abort();
        }
    }

    async fn probe(&self) {
        let mut info = RequestInfo::get(&self.options.test_path);
        info.headers
            .push(("Host".to_string(), self.options.test_host.clone()));
        info.headers
            .push(("User-Agent".to_string(), self.options.user_agent.clone()));

        match self.transport.send(self.target, &info, Bytes::new()).await {
            Ok(exchange) => {
                let status = exchange.status().as_u16();
                if self.options.success_codes.contains(&status) {
                    self.log_success();
                } else {
                    tracing::debug!(
                        endpoint = %self.target,
                        status,
                        "health probe returned non-success status"
                    );
                    self.log_failure();
                }
            }
            Err(error) => {
                tracing::debug!(endpoint = %self.target, error = %error, "health probe failed");
                self.log_failure();
            }
        }
    }

    fn log_success(&self) {
        let successes = self.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
        if successes >= self.options.success_threshold {
            self.set_state(HealthState::Online);
        }
    }

    fn log_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        self.consecutive_successes.store(0, Ordering::SeqCst);
        self.set_state(HealthState::Offline);
    }

    /// Force a state. Used by the dispatch failure path, which treats any
    /// transport error as proof the member is gone.
    pub fn set_state(&self, new_state: HealthState) {
        debug_assert!(new_state != HealthState::Undefined);
        let old_state = {
            let mut state = self.state.lock().expect("health state mutex poisoned");
            if *state == new_state {
                return;
            }
            let old = *state;
            *state = new_state;
            old
        };

        tracing::debug!(endpoint = %self.target, from = %old_state, to = %new_state, "health state changed");

        let guard = self
            .on_state_change
            .lock()
            .expect("state change callback mutex poisoned");
        if let Some(callback) = guard.as_ref() {
            callback(old_state);
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Up to 10% over the base interval.
fn jittered(base: Duration) -> Duration {
    let jitter_range = base.as_millis() as u64 / 10;
    if jitter_range == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..jitter_range);
    base + Duration::from_millis(jitter)
}

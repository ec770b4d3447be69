//! Member selection strategies.
//!
//! A scheduler picks a member for an outgoing request and reports one of
//! three outcomes: the request was handed to a member, no member was
//! eligible, or every eligible member was at capacity. The default is
//! least-load; round-robin is available per cluster configuration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::member::ClusterMember;
use crate::cluster::request::ClusterRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    Success,
    Unavailable,
    Overloaded,
}

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attempt to place `req` on one of `members`.
    fn schedule(
        &self,
        req: &Arc<ClusterRequest>,
        members: &[Arc<ClusterMember>],
    ) -> SchedulerStatus;
}

pub fn by_name(name: &str) -> Option<Box<dyn Scheduler>> {
    match name {
        "least-load" => Some(Box::new(LeastLoad)),
        "round-robin" => Some(Box::new(RoundRobin::new())),
        _ => None,
    }
}

/// Selects the enabled+online member with the smallest load/capacity
/// ratio; members with unbounded capacity compare by raw load. Ties break
/// by member order, which keeps selection stable.
#[derive(Debug, Default)]
pub struct LeastLoad;

impl LeastLoad {
    fn ratio(member: &ClusterMember) -> f64 {
        let load = member.load() as f64;
        match member.capacity() {
            0 => load,
            capacity => load / capacity as f64,
        }
    }
}

impl Scheduler for LeastLoad {
    fn name(&self) -> &'static str {
        "least-load"
    }

    fn schedule(
        &self,
        req: &Arc<ClusterRequest>,
        members: &[Arc<ClusterMember>],
    ) -> SchedulerStatus {
        let mut candidates: Vec<&Arc<ClusterMember>> = members
            .iter()
            .filter(|m| m.is_enabled() && m.monitor().is_online())
            .collect();
        if candidates.is_empty() {
            return SchedulerStatus::Unavailable;
        }
        candidates.sort_by(|a, b| {
            Self::ratio(a)
                .partial_cmp(&Self::ratio(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut overloaded = false;
        for member in candidates {
            match member.try_process(req) {
                SchedulerStatus::Success => return SchedulerStatus::Success,
                SchedulerStatus::Overloaded => overloaded = true,
                SchedulerStatus::Unavailable => {}
            }
        }
        if overloaded {
            SchedulerStatus::Overloaded
        } else {
            SchedulerStatus::Unavailable
        }
    }
}

/// Rotates through members, skipping ineligible ones.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn schedule(
        &self,
        req: &Arc<ClusterRequest>,
        members: &[Arc<ClusterMember>],
    ) -> SchedulerStatus {
        if members.is_empty() {
            return SchedulerStatus::Unavailable;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % members.len();

        let mut overloaded = false;
        for offset in 0..members.len() {
            let member = &members[(start + offset) % members.len()];
            if !member.is_enabled() || !member.monitor().is_online() {
                continue;
            }
            match member.try_process(req) {
                SchedulerStatus::Success => return SchedulerStatus::Success,
                SchedulerStatus::Overloaded => overloaded = true,
                SchedulerStatus::Unavailable => {}
            }
        }
        if overloaded {
            SchedulerStatus::Overloaded
        } else {
            SchedulerStatus::Unavailable
        }
    }
}

//! The unit of work flowing through a cluster.
//!
//! A `ClusterRequest` is created once per proxied request and threaded
//! through admission, queueing, dispatch and retries. Response events are
//! pushed to an injected [`ResponseListener`]; the cluster never hands the
//! raw backend connection upstream.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::http::{StatusCode, Version};
use bytes::Bytes;

use crate::cluster::member::ClusterMember;
use crate::cluster::shaper::Bucket;
use crate::transport::{RequestInfo, TransportError};

/// Receives the response message for one request, event by event and in
/// order: begin, headers, header-end, content, end.
pub trait ResponseListener: Send {
    fn on_message_begin(&mut self, version: Version, status: StatusCode, reason: &str);
    fn on_message_header(&mut self, name: &str, value: &str);
    fn on_message_header_end(&mut self);
    fn on_message_content(&mut self, chunk: &[u8]);
    fn on_message_end(&mut self);
}

struct Assignment {
    bucket: Option<Bucket>,
    member: Option<Arc<ClusterMember>>,
    last_error: Option<TransportError>,
}

pub struct ClusterRequest {
    info: RequestInfo,
    body: Bytes,
    ctime: Instant,
    listener: Mutex<Box<dyn ResponseListener>>,
    assignment: Mutex<Assignment>,
    /// Held tokens: 0 or 1.
    tokens: AtomicUsize,
    /// Dispatch attempts so far.
    try_count: AtomicUsize,
    /// Set while the request sits in a bucket queue. The queue-timeout
    /// task and dequeue race on this flag; whoever flips it owns the
    /// request.
    queued: AtomicBool,
}

impl ClusterRequest {
    pub fn new(info: RequestInfo, body: Bytes, listener: Box<dyn ResponseListener>) -> Arc<Self> {
        Arc::new(ClusterRequest {
            info,
            body,
            ctime: Instant::now(),
            listener: Mutex::new(listener),
            assignment: Mutex::new(Assignment {
                bucket: None,
                member: None,
                last_error: None,
            }),
            tokens: AtomicUsize::new(0),
            try_count: AtomicUsize::new(0),
            queued: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &RequestInfo {
        &self.info
    }

    pub fn body(&self) -> Bytes {
        self.body.clone()
    }

    pub fn ctime(&self) -> Instant {
        self.ctime
    }

    /// Run `f` against the listener. Events for one request are serialized
    /// here, which keeps their ordering guarantee.
    pub fn with_listener(&self, f: impl FnOnce(&mut dyn ResponseListener)) {
        let mut listener = self
            .listener
            .lock()
            .expect("response listener mutex poisoned");
        f(listener.as_mut());
    }

    pub fn set_bucket(&self, bucket: Bucket) {
        self.lock_assignment().bucket = Some(bucket);
    }

    pub fn bucket(&self) -> Option<Bucket> {
        self.lock_assignment().bucket.clone()
    }

    pub fn set_member(&self, member: Arc<ClusterMember>) {
        self.lock_assignment().member = Some(member);
    }

    pub fn clear_member(&self) {
        self.lock_assignment().member = None;
    }

    pub fn member(&self) -> Option<Arc<ClusterMember>> {
        self.lock_assignment().member.clone()
    }

    pub fn set_last_error(&self, error: TransportError) {
        self.lock_assignment().last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<TransportError> {
        self.lock_assignment().last_error.clone()
    }

    pub fn tokens(&self) -> usize {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn set_tokens(&self, n: usize) {
        self.tokens.store(n, Ordering::SeqCst);
    }

    /// Drop token ownership, reporting how many were held.
    pub fn take_tokens(&self) -> usize {
        self.tokens.swap(0, Ordering::SeqCst)
    }

    pub fn try_count(&self) -> usize {
        self.try_count.load(Ordering::SeqCst)
    }

    pub fn bump_try_count(&self) -> usize {
        self.try_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn mark_queued(&self) {
        self.queued.store(true, Ordering::SeqCst);
    }

    /// Claim the request out of its queue. Exactly one caller wins.
    pub(crate) fn take_queued(&self) -> bool {
        self.queued
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    fn lock_assignment(&self) -> std::sync::MutexGuard<'_, Assignment> {
        self.assignment
            .lock()
            .expect("request assignment mutex poisoned")
    }
}

impl std::fmt::Debug for ClusterRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRequest")
            .field("method", &self.info.method)
            .field("path", &self.info.path)
            .field("tokens", &self.tokens())
            .field("try_count", &self.try_count())
            .field("queued", &self.is_queued())
            .finish()
    }
}

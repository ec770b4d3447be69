//! Hierarchical token-bucket admission control.
//!
//! The shaper is a tree of buckets. Each bucket reserves `rate` tokens and
//! may stretch to `ceil` by borrowing from its ancestors; the root's size
//! is absolute and tracks the cluster's live capacity. Buckets carry FIFO
//! queues of waiting requests with per-entry deadlines; the shaper owns the
//! deadline timers and reports expiries through an installed handler.
//!
//! The tree is an arena of nodes behind one mutex, so every admission
//! decision is totally ordered. Bucket handles are plain (arc, index)
//! pairs and are cheap to clone into requests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use thiserror::Error;

use crate::cluster::request::ClusterRequest;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TokenShaperError {
    /// Sibling rates would exceed the parent's reserve.
    #[error("rate limit overflow")]
    RateLimitOverflow,

    /// Ceil below rate or above the parent's ceiling.
    #[error("ceil limit overflow")]
    CeilLimitOverflow,

    /// A bucket with that name already exists.
    #[error("bucket name conflict")]
    NameConflict,
}

pub type TimeoutHandler = Arc<dyn Fn(Arc<ClusterRequest>) + Send + Sync>;

struct QueueEntry {
    req: Arc<ClusterRequest>,
    deadline: Instant,
}

struct Node {
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    rate_ratio: f64,
    ceil_ratio: f64,
    /// Absolute reserved tokens.
    rate: usize,
    /// Absolute maximum tokens, borrowing included.
    ceil: usize,
    /// Tokens currently held in this node's subtree.
    used: usize,
    queue: VecDeque<QueueEntry>,
}

struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Path from `index` up to and including the root.
    fn path_to_root(&self, index: usize) -> Vec<usize> {
        let mut path = vec![index];
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            path.push(parent);
            current = parent;
        }
        path
    }

    fn subtree(&self, index: usize) -> Vec<usize> {
        let mut out = Vec::new();
        let mut work = vec![index];
        while let Some(i) = work.pop() {
            out.push(i);
            work.extend(self.nodes[i].children.iter().copied());
        }
        out
    }

    fn recompute(&mut self, index: usize) {
        let (parent_rate, parent_ceil) = match self.nodes[index].parent {
            Some(p) => (self.nodes[p].rate, self.nodes[p].ceil),
            None => (self.nodes[index].rate, self.nodes[index].ceil),
        };
        if self.nodes[index].parent.is_some() {
            let node = &mut self.nodes[index];
            node.rate = (node.rate_ratio * parent_rate as f64).round() as usize;
            node.ceil = (node.ceil_ratio * parent_ceil as f64).round() as usize;
        }
        let children = self.nodes[index].children.clone();
        for child in children {
            self.recompute(child);
        }
    }
}

pub(crate) struct ShaperInner {
    tree: Mutex<Tree>,
    timeout_handler: Mutex<Option<TimeoutHandler>>,
}

impl ShaperInner {
    fn lock_tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().expect("shaper tree mutex poisoned")
    }

    fn remove_queued(&self, index: usize, req: &Arc<ClusterRequest>) {
        let mut tree = self.lock_tree();
        if let Some(node) = tree.nodes.get_mut(index) {
            if let Some(pos) = node.queue.iter().position(|e| Arc::ptr_eq(&e.req, req)) {
                node.queue.remove(pos);
            }
        }
    }
}

/// The shaper: owner of the bucket tree and its queue timers.
pub struct TokenShaper {
    inner: Arc<ShaperInner>,
}

impl TokenShaper {
    pub fn new(size: usize) -> Self {
        let root = Node {
            name: "root".to_string(),
            parent: None,
            children: Vec::new(),
            rate_ratio: 1.0,
            ceil_ratio: 1.0,
            rate: size,
            ceil: size,
            used: 0,
            queue: VecDeque::new(),
        };
        TokenShaper {
            inner: Arc::new(ShaperInner {
                tree: Mutex::new(Tree { nodes: vec![root] }),
                timeout_handler: Mutex::new(None),
            }),
        }
    }

    pub fn set_timeout_handler(&self, handler: TimeoutHandler) {
        *self
            .inner
            .timeout_handler
            .lock()
            .expect("timeout handler mutex poisoned") = Some(handler);
    }

    pub fn root(&self) -> Bucket {
        Bucket {
            inner: Arc::clone(&self.inner),
            index: 0,
        }
    }

    /// Create a child bucket of the root. `rate` and `ceil` are fractions
    /// of the root's respective totals.
    pub fn create_node(
        &self,
        name: &str,
        rate: f64,
        ceil: f64,
    ) -> Result<Bucket, TokenShaperError> {
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(TokenShaperError::RateLimitOverflow);
        }
        if ceil < rate || ceil > 1.0 {
            return Err(TokenShaperError::CeilLimitOverflow);
        }

        let mut tree = self.inner.lock_tree();
        if tree.nodes.iter().any(|n| n.name == name) {
            return Err(TokenShaperError::NameConflict);
        }
        let sibling_rates: f64 = tree.nodes[0]
            .children
            .iter()
            .map(|&c| tree.nodes[c].rate_ratio)
            .sum();
        if sibling_rates + rate > 1.0 + f64::EPSILON {
            return Err(TokenShaperError::RateLimitOverflow);
        }

        let (root_rate, root_ceil) = (tree.nodes[0].rate, tree.nodes[0].ceil);
        let index = tree.nodes.len();
        tree.nodes.push(Node {
            name: name.to_string(),
            parent: Some(0),
            children: Vec::new(),
            rate_ratio: rate,
            ceil_ratio: ceil,
            rate: (rate * root_rate as f64).round() as usize,
            ceil: (ceil * root_ceil as f64).round() as usize,
            used: 0,
            queue: VecDeque::new(),
        });
        tree.nodes[0].children.push(index);

        Ok(Bucket {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    pub fn find_node(&self, name: &str) -> Option<Bucket> {
        let tree = self.inner.lock_tree();
        let index = tree.nodes.iter().position(|n| n.name == name)?;
        Some(Bucket {
            inner: Arc::clone(&self.inner),
            index,
        })
    }

    /// Current root size (absolute token total).
    pub fn size(&self) -> usize {
        self.inner.lock_tree().nodes[0].rate
    }

    /// Reconfigure the root size and recompute absolute shares.
    pub fn resize(&self, size: usize) {
        let mut tree = self.inner.lock_tree();
        tree.nodes[0].rate = size;
        tree.nodes[0].ceil = size;
        tree.recompute(0);
    }

    /// Pop the oldest queued request anywhere in the tree.
    pub fn dequeue(&self) -> Option<Arc<ClusterRequest>> {
        self.root().dequeue()
    }

    /// Per-bucket counters for state dumps: (name, rate, ceil, used,
    /// queued).
    pub fn snapshot(&self) -> Vec<(String, usize, usize, usize, usize)> {
        let tree = self.inner.lock_tree();
        tree.nodes
            .iter()
            .map(|n| (n.name.clone(), n.rate, n.ceil, n.used, n.queue.len()))
            .collect()
    }
}

impl std::fmt::Debug for TokenShaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenShaper")
            .field("size", &self.size())
            .finish()
    }
}

/// Handle to one bucket of a shaper.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<ShaperInner>,
    index: usize,
}

impl Bucket {
    pub fn name(&self) -> String {
        self.inner.lock_tree().nodes[self.index].name.clone()
    }

    pub fn rate(&self) -> usize {
        self.inner.lock_tree().nodes[self.index].rate
    }

    pub fn ceil(&self) -> usize {
        self.inner.lock_tree().nodes[self.index].ceil
    }

    pub fn used(&self) -> usize {
        self.inner.lock_tree().nodes[self.index].used
    }

    pub fn queued(&self) -> usize {
        self.inner.lock_tree().nodes[self.index].queue.len()
    }

    /// Acquire `n` tokens: from this bucket's reserve, or borrowed through
    /// the ancestor chain up to each ceiling. All-or-nothing.
    pub fn get(&self, n: usize) -> bool {
        let mut tree = self.inner.lock_tree();
        let path = tree.path_to_root(self.index);
        for &i in &path {
            let node = &tree.nodes[i];
            if node.used + n > node.ceil {
                return false;
            }
        }
        for &i in &path {
            tree.nodes[i].used += n;
        }
        true
    }

    /// Return `n` tokens, unwinding the same chain.
    pub fn put(&self, n: usize) {
        let mut tree = self.inner.lock_tree();
        let path = tree.path_to_root(self.index);
        for &i in &path {
            let node = &mut tree.nodes[i];
            node.used = node.used.saturating_sub(n);
        }
    }

    /// Park a request in this bucket until `deadline`. On expiry the
    /// request is removed and handed to the shaper's timeout handler.
    pub fn enqueue(&self, req: Arc<ClusterRequest>, deadline: Instant) {
        req.mark_queued();
        {
            let mut tree = self.inner.lock_tree();
            tree.nodes[self.index].queue.push_back(QueueEntry {
                req: Arc::clone(&req),
                deadline,
            });
        }

        let weak: Weak<ShaperInner> = Arc::downgrade(&self.inner);
        let index = self.index;
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            if !req.take_queued() {
                // already dequeued
                return;
            }
            let Some(inner) = weak.upgrade() else { return };
            inner.remove_queued(index, &req);
            let handler = inner
                .timeout_handler
                .lock()
                .expect("timeout handler mutex poisoned")
                .clone();
            if let Some(handler) = handler {
                handler(req);
            }
        });
    }

    /// Drop a specific entry from this bucket's queue, if still present.
    pub fn remove(&self, req: &Arc<ClusterRequest>) {
        self.inner.remove_queued(self.index, req);
    }

    /// Pop the oldest live entry in this bucket's subtree.
    pub fn dequeue(&self) -> Option<Arc<ClusterRequest>> {
        loop {
            let popped = {
                let mut tree = self.inner.lock_tree();
                let candidates = tree.subtree(self.index);
                let oldest = candidates
                    .into_iter()
                    .filter_map(|i| {
                        tree.nodes[i]
                            .queue
                            .front()
                            .map(|entry| (i, entry.deadline))
                    })
                    .min_by_key(|&(_, deadline)| deadline);
                match oldest {
                    Some((i, _)) => tree.nodes[i].queue.pop_front().map(|e| e.req),
                    None => None,
                }
            };
            match popped {
                Some(req) => {
                    // losing the race against the timeout task just means
                    // trying the next entry
                    if req.take_queued() {
                        return Some(req);
                    }
                }
                None => return None,
            }
        }
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bucket({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{StatusCode, Version};
    use bytes::Bytes;
    use std::time::Duration;

    use crate::cluster::request::ResponseListener;
    use crate::transport::RequestInfo;

    struct NullListener;

    impl ResponseListener for NullListener {
        fn on_message_begin(&mut self, _: Version, _: StatusCode, _: &str) {}
        fn on_message_header(&mut self, _: &str, _: &str) {}
        fn on_message_header_end(&mut self) {}
        fn on_message_content(&mut self, _: &[u8]) {}
        fn on_message_end(&mut self) {}
    }

    fn request() -> Arc<ClusterRequest> {
        ClusterRequest::new(RequestInfo::get("/"), Bytes::new(), Box::new(NullListener))
    }

    #[test]
    fn root_get_put() {
        let shaper = TokenShaper::new(2);
        let root = shaper.root();
        assert!(root.get(1));
        assert!(root.get(1));
        assert!(!root.get(1));
        root.put(1);
        assert!(root.get(1));
    }

    #[test]
    fn zero_sized_root_admits_nothing() {
        let shaper = TokenShaper::new(0);
        assert!(!shaper.root().get(1));
    }

    #[test]
    fn child_borrows_up_to_ceil() {
        let shaper = TokenShaper::new(10);
        // half guaranteed, may stretch to the full root
        let bucket = shaper.create_node("api", 0.5, 1.0).unwrap();
        assert_eq!(bucket.rate(), 5);
        assert_eq!(bucket.ceil(), 10);
        for _ in 0..10 {
            assert!(bucket.get(1));
        }
        assert!(!bucket.get(1));
    }

    #[test]
    fn child_ceil_caps_borrowing() {
        let shaper = TokenShaper::new(10);
        let bucket = shaper.create_node("api", 0.2, 0.5).unwrap();
        for _ in 0..5 {
            assert!(bucket.get(1));
        }
        assert!(!bucket.get(1));
        // the rest of the root is still available
        assert!(shaper.root().get(5));
    }

    #[test]
    fn sibling_usage_consumes_root() {
        let shaper = TokenShaper::new(4);
        let a = shaper.create_node("a", 0.5, 1.0).unwrap();
        let b = shaper.create_node("b", 0.5, 1.0).unwrap();
        assert!(a.get(3));
        assert!(b.get(1));
        assert!(!b.get(1));
        a.put(3);
        assert!(b.get(1));
    }

    #[test]
    fn create_node_validates_ratios() {
        let shaper = TokenShaper::new(10);
        assert_eq!(
            shaper.create_node("x", 0.0, 0.5).unwrap_err(),
            TokenShaperError::RateLimitOverflow
        );
        assert_eq!(
            shaper.create_node("x", 0.5, 0.2).unwrap_err(),
            TokenShaperError::CeilLimitOverflow
        );
        shaper.create_node("a", 0.7, 1.0).unwrap();
        assert_eq!(
            shaper.create_node("b", 0.5, 1.0).unwrap_err(),
            TokenShaperError::RateLimitOverflow
        );
        shaper.create_node("b", 0.3, 1.0).unwrap();
        assert_eq!(
            shaper.create_node("b", 0.1, 1.0).unwrap_err(),
            TokenShaperError::NameConflict
        );
    }

    #[test]
    fn resize_recomputes_children() {
        let shaper = TokenShaper::new(10);
        let bucket = shaper.create_node("api", 0.5, 1.0).unwrap();
        shaper.resize(20);
        assert_eq!(shaper.size(), 20);
        assert_eq!(bucket.rate(), 10);
        assert_eq!(bucket.ceil(), 20);
    }

    #[tokio::test]
    async fn queue_timeout_fires_handler() {
        let shaper = TokenShaper::new(0);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        shaper.set_timeout_handler(Arc::new(move |req| {
            if let Some(tx) = tx.lock().expect("test tx").take() {
                let _ = tx.send(req.info().path.clone());
            }
        }));

        let root = shaper.root();
        root.enqueue(request(), Instant::now() + Duration::from_millis(20));
        let path = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("timeout handler not invoked")
            .expect("handler sender dropped");
        assert_eq!(path, "/");
        assert_eq!(root.queued(), 0);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_and_skips_expired() {
        let shaper = TokenShaper::new(0);
        let root = shaper.root();
        let first = request();
        let second = request();
        let far = Instant::now() + Duration::from_secs(60);
        root.enqueue(Arc::clone(&first), far);
        root.enqueue(Arc::clone(&second), far);

        let popped = root.dequeue().expect("queue should not be empty");
        assert!(Arc::ptr_eq(&popped, &first));
        let popped = root.dequeue().expect("queue should not be empty");
        assert!(Arc::ptr_eq(&popped, &second));
        assert!(root.dequeue().is_none());
    }
}

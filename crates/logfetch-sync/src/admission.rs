//! Bounded admission control for downloads.
//!
//! At most `capacity` leases are outstanding at any time. Requests beyond
//! capacity wait in FIFO order. A `Lease` gives its slot back when dropped, so
//! every exit path of a transfer releases admission without bookkeeping at the
//! call site. Forced release and `cancel_all` invalidate outstanding leases by
//! grant number; a stale lease dropped later is a no-op.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

pub struct AdmissionQueue<K: Eq + Hash + Clone> {
    capacity: usize,
    inner: Mutex<Inner<K>>,
}

struct Inner<K: Eq + Hash + Clone> {
    /// key -> grant number of the live lease
    leased: HashMap<K, u64>,
    waiting: VecDeque<Waiter<K>>,
    next_grant: u64,
}

struct Waiter<K: Eq + Hash + Clone> {
    key: K,
    tx: oneshot::Sender<Lease<K>>,
}

/// Admission slot held by one work item; released on drop.
pub struct Lease<K: Eq + Hash + Clone> {
    queue: Option<Arc<AdmissionQueue<K>>>,
    key: K,
    grant: u64,
}

impl<K: Eq + Hash + Clone> AdmissionQueue<K> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                leased: HashMap::new(),
                waiting: VecDeque::new(),
                next_grant: 0,
            }),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking: a lease if a slot is free and `key` holds none yet.
    pub fn try_lease(self: &Arc<Self>, key: K) -> Option<Lease<K>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.leased.contains_key(&key) || inner.leased.len() >= self.capacity {
            return None;
        }
        Some(self.grant(&mut inner, key))
    }

    /// Wait for a slot. Resolves to `None` if `key` already holds a lease, or
    /// if the request is cancelled (`release`, `cancel_all`, or a newer
    /// request for the same key) before a slot frees up.
    pub async fn lease_and_wait(self: &Arc<Self>, key: K) -> Option<Lease<K>> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            if inner.leased.contains_key(&key) {
                return None;
            }
            if inner.leased.len() < self.capacity && inner.waiting.is_empty() {
                return Some(self.grant(&mut inner, key));
            }
            let (tx, rx) = oneshot::channel();
            match inner.waiting.iter_mut().find(|w| w.key == key) {
                Some(existing) => existing.tx = tx,
                None => inner.waiting.push_back(Waiter { key, tx }),
            }
            rx
        };
        rx.await.ok()
    }

    /// Force-release whatever `key` holds or waits for. Idempotent; returns
    /// true if anything was released.
    pub fn release(self: &Arc<Self>, key: &K) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let held = inner.leased.remove(key).is_some();
        let before = inner.waiting.len();
        inner.waiting.retain(|w| &w.key != key);
        let dequeued = inner.waiting.len() != before;
        self.promote(&mut inner);
        held || dequeued
    }

    /// Drop every lease and every waiter.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let leased = inner.leased.len();
        let waiting = inner.waiting.len();
        inner.leased.clear();
        inner.waiting.clear();
        debug!(leased, waiting, "admission queue cancelled");
    }

    pub fn is_leased(&self, key: &K) -> bool {
        self.inner.lock().unwrap().leased.contains_key(key)
    }

    pub fn is_queued(&self, key: &K) -> bool {
        self.inner
            .lock()
            .unwrap()
            .waiting
            .iter()
            .any(|w| &w.key == key && !w.tx.is_closed())
    }

    pub fn leased_count(&self) -> usize {
        self.inner.lock().unwrap().leased.len()
    }

    /// Current lease holders, in no particular order
    pub fn holders(&self) -> Vec<K> {
        self.inner.lock().unwrap().leased.keys().cloned().collect()
    }

    /// Waiting keys in admission order
    pub fn waiting(&self) -> Vec<K> {
        self.inner
            .lock()
            .unwrap()
            .waiting
            .iter()
            .filter(|w| !w.tx.is_closed())
            .map(|w| w.key.clone())
            .collect()
    }

    fn grant(self: &Arc<Self>, inner: &mut Inner<K>, key: K) -> Lease<K> {
        let grant = inner.next_grant;
        inner.next_grant += 1;
        inner.leased.insert(key.clone(), grant);
        Lease {
            queue: Some(self.clone()),
            key,
            grant,
        }
    }

    fn promote(self: &Arc<Self>, inner: &mut Inner<K>) {
        while inner.leased.len() < self.capacity {
            let Some(waiter) = inner.waiting.pop_front() else {
                break;
            };
            if waiter.tx.is_closed() || inner.leased.contains_key(&waiter.key) {
                continue;
            }
            let lease = self.grant(inner, waiter.key);
            if let Err(mut lease) = waiter.tx.send(lease) {
                // receiver dropped between the check and the send
                inner.leased.remove(&lease.key);
                lease.queue = None;
            }
        }
    }

    fn release_grant(self: &Arc<Self>, key: &K, grant: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.leased.get(key) == Some(&grant) {
            inner.leased.remove(key);
            self.promote(&mut inner);
        }
    }
}

impl<K: Eq + Hash + Clone> Lease<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Give the slot back now.
    pub fn release(self) {}
}

impl<K: Eq + Hash + Clone> Drop for Lease<K> {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release_grant(&self.key, self.grant);
        }
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug> fmt::Debug for Lease<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("grant", &self.grant)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn try_lease_respects_capacity() {
        let q = AdmissionQueue::new(2);
        let a = q.try_lease("a").unwrap();
        assert!(q.try_lease("a").is_none(), "no double lease");
        let _b = q.try_lease("b").unwrap();
        assert!(q.try_lease("c").is_none());
        assert_eq!(q.leased_count(), 2);
        drop(a);
        assert!(q.try_lease("c").is_some());
    }

    #[test]
    fn release_is_idempotent() {
        let q = AdmissionQueue::new(1);
        let lease = q.try_lease("a").unwrap();
        assert!(q.release(&"a"));
        assert!(!q.release(&"a"));
        assert!(!q.release(&"never"));
        assert_eq!(q.leased_count(), 0);
        // stale lease dropped after a forced release must not free a new holder
        let _b = q.try_lease("b").unwrap();
        drop(lease);
        assert!(q.is_leased(&"b"));
    }

    #[tokio::test]
    async fn second_waiter_granted_only_after_first_releases() {
        let q = AdmissionQueue::new(1);
        let t1 = q.lease_and_wait("t1").await.expect("t1 granted immediately");

        let q2 = q.clone();
        let t2 = tokio::spawn(async move { q2.lease_and_wait("t2").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!t2.is_finished());
        assert!(q.is_queued(&"t2"));
        assert_eq!(q.holders(), vec!["t1"]);

        t1.release();
        let t2 = t2.await.unwrap().expect("t2 granted after release");
        assert_eq!(*t2.key(), "t2");
        assert!(q.is_leased(&"t2"));
        assert!(!q.is_queued(&"t2"));
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let q = AdmissionQueue::new(1);
        let a = q.try_lease("a").unwrap();
        let qb = q.clone();
        let b = tokio::spawn(async move { qb.lease_and_wait("b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let qc = q.clone();
        let c = tokio::spawn(async move { qc.lease_and_wait("c").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.waiting(), vec!["b", "c"]);

        drop(a);
        let b = b.await.unwrap().unwrap();
        assert!(!c.is_finished());
        drop(b);
        let c = c.await.unwrap().unwrap();
        assert_eq!(*c.key(), "c");
    }

    #[tokio::test]
    async fn cancel_all_resolves_waiters_to_none() {
        let q = AdmissionQueue::new(1);
        let held = q.try_lease("a").unwrap();
        let qb = q.clone();
        let b = tokio::spawn(async move { qb.lease_and_wait("b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.cancel_all();
        assert!(b.await.unwrap().is_none());
        assert_eq!(q.leased_count(), 0);

        let fresh = q.try_lease("a").unwrap();
        drop(held);
        assert!(q.is_leased(&"a"), "stale grant must not release the new lease");
        drop(fresh);
        assert_eq!(q.leased_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_is_skipped() {
        let q = AdmissionQueue::new(1);
        let a = q.try_lease("a").unwrap();
        let qb = q.clone();
        let b = tokio::spawn(async move { qb.lease_and_wait("b").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.abort();
        let _ = b.await;

        drop(a);
        assert_eq!(q.leased_count(), 0);
        assert!(q.waiting().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Try(u8),
        Release(u8),
        Drop(u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Try),
            (0u8..6).prop_map(Op::Release),
            (0u8..6).prop_map(Op::Drop),
        ]
    }

    proptest! {
        /// count(leased) never exceeds capacity, and no key holds two leases.
        #[test]
        fn leased_never_exceeds_capacity(cap in 1usize..4, ops in prop::collection::vec(arb_op(), 1..80)) {
            let q = AdmissionQueue::new(cap);
            let mut held: HashMap<u8, Lease<u8>> = HashMap::new();
            for op in ops {
                match op {
                    Op::Try(k) => {
                        if let Some(lease) = q.try_lease(k) {
                            prop_assert!(!held.contains_key(&k));
                            held.insert(k, lease);
                        }
                    }
                    Op::Release(k) => {
                        let before = q.leased_count();
                        let released = q.release(&k);
                        if !released {
                            prop_assert_eq!(q.leased_count(), before);
                        }
                        held.remove(&k);
                    }
                    Op::Drop(k) => {
                        held.remove(&k);
                    }
                }
                prop_assert!(q.leased_count() <= cap);
                prop_assert_eq!(q.leased_count(), held.len());
            }
        }
    }
}

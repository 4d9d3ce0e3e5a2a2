//! Synchronization Throttler (C3, spec.md §4.2): admission control for the
//! heavyweight "synchronize" RPC. One instance per socket slot; slots that
//! share a (region, bucket) also share a [`RegionActivity`] counter so the
//! hard cap holds across the whole region, not just one socket.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::SynchronizationThrottlerConfig;
use crate::errors::{CoreError, CoreResult};
use crate::ids::{AccountId, Bucket, Host, Region, SyncId};

/// Identifies what a synchronization slot belongs to, for coalescing
/// (spec.md §4.2: "if an entry in bySyncId exists with the same (accountId,
/// instanceIndex, host), remove it").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey {
    pub account_id: AccountId,
    pub instance_index: Bucket,
    pub host: Host,
}

/// Shared active-synchronization counter across every socket slot serving
/// the same (region, bucket), so the hard cap in §4.2's admissibility rule
/// ("sum of active counts across all slots for this (region, bucket)") can
/// be enforced without the slots knowing about each other directly.
#[derive(Default)]
pub struct RegionActivity {
    counters: DashMap<(Region, Bucket), AtomicUsize>,
}

impl RegionActivity {
    pub fn new() -> Self {
        Self::default()
    }

    fn total(&self, region: &Region, bucket: Bucket) -> usize {
        self.counters
            .get(&(region.clone(), bucket))
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn inc(&self, region: &Region, bucket: Bucket) {
        self.counters
            .entry((region.clone(), bucket))
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::AcqRel);
    }

    fn dec(&self, region: &Region, bucket: Bucket) {
        if let Some(c) = self.counters.get(&(region.clone(), bucket)) {
            c.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
                .ok();
        }
    }
}

#[derive(Debug)]
enum Resolution {
    Synchronize,
    Cancel,
    Timeout,
}

struct QueueEntry {
    sync_id: SyncId,
    enqueued_at: Instant,
    resolver: oneshot::Sender<Resolution>,
}

struct Inner {
    subscribed_accounts: usize,
    active: HashMap<SyncId, Instant>,
    by_sync_id: HashMap<SyncId, SyncKey>,
    queue: VecDeque<QueueEntry>,
}

/// Per-socket-slot admission control for `synchronize` RPCs (spec.md §4.2).
/// State lives behind a [`Mutex`] so the throttler can be shared across the
/// tasks handling concurrent synchronization requests for the same slot.
pub struct SynchronizationThrottler {
    config: SynchronizationThrottlerConfig,
    region: Region,
    bucket: Bucket,
    region_activity: Arc<RegionActivity>,
    inner: Mutex<Inner>,
}

impl SynchronizationThrottler {
    pub fn new(
        config: SynchronizationThrottlerConfig,
        region: Region,
        bucket: Bucket,
        region_activity: Arc<RegionActivity>,
    ) -> Self {
        Self {
            config,
            region,
            bucket,
            region_activity,
            inner: Mutex::new(Inner {
                subscribed_accounts: 0,
                active: HashMap::new(),
                by_sync_id: HashMap::new(),
                queue: VecDeque::new(),
            }),
        }
    }

    /// Updated whenever the slot's subscribed-account count for this bucket
    /// changes; feeds the effective-cap formula below.
    pub fn set_subscribed_accounts(&self, count: usize) {
        self.inner.lock().subscribed_accounts = count;
    }

    /// `min(maxConcurrentSynchronizations, max(1, ceil(subscribedAccountsInRegionForBucket / 10)))`.
    fn effective_cap(&self, subscribed: usize) -> usize {
        let scaled = (subscribed + 9) / 10; // ceil(subscribed / 10) for integers
        self.config.max_concurrent_synchronizations.min(scaled.max(1))
    }

    fn is_admissible(&self, inner: &Inner) -> bool {
        inner.active.len() < self.effective_cap(inner.subscribed_accounts)
            && self.region_activity.total(&self.region, self.bucket) < self.config.max_concurrent_synchronizations
    }

    fn admit_now(&self, inner: &mut Inner, sync_id: SyncId) {
        inner.active.insert(sync_id, Instant::now());
        self.region_activity.inc(&self.region, self.bucket);
    }

    /// Drops any existing entry (active or queued) sharing `key`, cancelling
    /// it if queued. Must be called with `inner` locked.
    fn coalesce(&self, inner: &mut Inner, key: &SyncKey) {
        let Some(old_id) = inner
            .by_sync_id
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(id, _)| id.clone())
        else {
            return;
        };

        inner.by_sync_id.remove(&old_id);

        if inner.active.remove(&old_id).is_some() {
            self.region_activity.dec(&self.region, self.bucket);
        }

        if let Some(pos) = inner.queue.iter().position(|e| e.sync_id == old_id) {
            let entry = inner.queue.remove(pos).expect("checked position");
            let _ = entry.resolver.send(Resolution::Cancel);
        }

        trace!(old = %old_id, "coalesced redundant synchronization");
    }

    /// `schedule(accountId, request, fetchHashes)`. Returns `Ok(true)` when
    /// admitted (the caller should now fetch hashes, attach them, and send
    /// the RPC), `Ok(false)` when coalesced away or cancelled on disconnect,
    /// and `Err(CoreError::Timeout)` if it sat in queue past
    /// `queueTimeoutInSeconds`.
    pub async fn schedule(&self, sync_id: SyncId, key: SyncKey) -> CoreResult<bool> {
        let rx = {
            let mut inner = self.inner.lock();
            self.coalesce(&mut inner, &key);
            inner.by_sync_id.insert(sync_id.clone(), key);

            if self.is_admissible(&inner) {
                self.admit_now(&mut inner, sync_id);
                return Ok(true);
            }

            let (tx, rx) = oneshot::channel();
            inner.queue.push_back(QueueEntry {
                sync_id,
                enqueued_at: Instant::now(),
                resolver: tx,
            });
            rx
        };

        match rx.await {
            Ok(Resolution::Synchronize) => Ok(true),
            Ok(Resolution::Cancel) | Err(_) => Ok(false),
            Ok(Resolution::Timeout) => Err(CoreError::timeout()),
        }
    }

    /// `updateSynchronizationId(id)`.
    pub fn touch(&self, sync_id: &SyncId) {
        let mut inner = self.inner.lock();
        if let Some(last_touch) = inner.active.get_mut(sync_id) {
            *last_touch = Instant::now();
        }
    }

    /// `removeSynchronizationId(id)`.
    pub fn remove(&self, sync_id: &SyncId) {
        let mut inner = self.inner.lock();

        let Some(key) = inner.by_sync_id.get(sync_id).cloned() else {
            return; // removing an unknown id is a no-op
        };

        let ids_to_drop: Vec<SyncId> = inner
            .by_sync_id
            .iter()
            .filter(|(_, k)| **k == key)
            .map(|(id, _)| id.clone())
            .collect();

        for id in ids_to_drop {
            inner.by_sync_id.remove(&id);

            if inner.active.remove(&id).is_some() {
                self.region_activity.dec(&self.region, self.bucket);
            }

            if let Some(pos) = inner.queue.iter().position(|e| e.sync_id == id) {
                let entry = inner.queue.remove(pos).expect("checked position");
                let _ = entry.resolver.send(Resolution::Cancel);
            }
        }

        self.advance_queue(&mut inner);
    }

    /// Resolve head-of-queue entries while admissible (FIFO), called after
    /// any event that might free capacity. Must be called with `inner`
    /// locked.
    fn advance_queue(&self, inner: &mut Inner) {
        while self.is_admissible(inner) {
            let Some(entry) = inner.queue.pop_front() else { break };
            debug!(sync_id = %entry.sync_id, "admitting queued synchronization");
            self.admit_now(inner, entry.sync_id.clone());
            let _ = entry.resolver.send(Resolution::Synchronize);
        }
    }

    /// Periodic (1s) expiry pass: drops stale active slots and stale queue
    /// entries, then advances the queue.
    pub fn expire(&self, now: Instant) {
        let mut inner = self.inner.lock();

        let sync_timeout = self.config.synchronization_timeout();
        let stale_active: Vec<SyncId> = inner
            .active
            .iter()
            .filter(|(_, last_touch)| **last_touch + sync_timeout < now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale_active {
            inner.active.remove(&id);
            inner.by_sync_id.remove(&id);
            self.region_activity.dec(&self.region, self.bucket);
        }

        let queue_timeout = self.config.queue_timeout();
        while let Some(front) = inner.queue.front() {
            if front.enqueued_at + queue_timeout < now {
                let entry = inner.queue.pop_front().expect("front checked");
                inner.by_sync_id.remove(&entry.sync_id);
                let _ = entry.resolver.send(Resolution::Timeout);
            } else {
                break;
            }
        }

        self.advance_queue(&mut inner);
    }

    /// `onDisconnect`: cancel every queued entry, clear all maps.
    pub fn on_disconnect(&self) {
        let mut inner = self.inner.lock();

        for entry in inner.queue.drain(..) {
            let _ = entry.resolver.send(Resolution::Cancel);
        }

        for _ in inner.active.drain() {
            self.region_activity.dec(&self.region, self.bucket);
        }

        inner.by_sync_id.clear();
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn queue_timeout(&self) -> Duration {
        self.config.queue_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(cap: usize) -> SynchronizationThrottler {
        let config = SynchronizationThrottlerConfig {
            max_concurrent_synchronizations: cap,
            queue_timeout_in_seconds: 300,
            synchronization_timeout_in_seconds: 10,
        };
        let t = SynchronizationThrottler::new(
            config,
            "vint-hill".into(),
            Bucket::Zero,
            Arc::new(RegionActivity::new()),
        );
        t.set_subscribed_accounts(100); // keep effective_cap == hard cap for these tests
        t
    }

    fn key(n: &str) -> SyncKey {
        SyncKey {
            account_id: n.into(),
            instance_index: Bucket::Zero,
            host: "h1".into(),
        }
    }

    #[tokio::test]
    async fn second_request_queues_behind_first_when_cap_is_one() {
        let t = throttler(1);

        assert!(t.schedule("r1".into(), key("a1")).await.unwrap());
        assert_eq!(t.active_count(), 1);

        // r2 must queue rather than run concurrently with r1.
        let t = Arc::new(t);
        let t2 = t.clone();
        let handle = tokio::spawn(async move { t2.schedule("r2".into(), key("a2")).await });

        tokio::task::yield_now().await;
        assert_eq!(t.queue_len(), 1, "second request queues behind the first");

        t.remove(&"r1".into());
        assert!(handle.await.unwrap().unwrap(), "queued request admitted once r1 completes");
        assert_eq!(t.active_count(), 1);
    }

    #[tokio::test]
    async fn coalescing_cancels_the_older_queued_request() {
        // scenario 4 from spec.md §8: a newer request for the same
        // (account, instanceIndex, host) replaces an older queued one.
        let t = Arc::new(throttler(1));
        assert!(t.schedule("r1".into(), key("a1")).await.unwrap());

        let t2 = t.clone();
        let stale = tokio::spawn(async move { t2.schedule("r2".into(), key("a2")).await });
        tokio::task::yield_now().await;
        assert_eq!(t.queue_len(), 1);

        // r3 targets the same (account, instanceIndex, host) as r2: coalesce.
        let t3 = t.clone();
        let fresh = tokio::spawn(async move { t3.schedule("r3".into(), key("a2")).await });
        tokio::task::yield_now().await;

        assert_eq!(t.queue_len(), 1, "stale entry replaced, not appended");
        assert!(!stale.await.unwrap().unwrap(), "coalesced request resolves to cancel");

        t.remove(&"r1".into());
        assert!(fresh.await.unwrap().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_entries_time_out_after_queue_timeout() {
        let t = Arc::new(throttler(1));
        assert!(t.schedule("r1".into(), key("a1")).await.unwrap());

        let t2 = t.clone();
        let queued = tokio::spawn(async move { t2.schedule("r2".into(), key("a2")).await });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(301)).await;
        t.expire(Instant::now());

        assert!(matches!(queued.await.unwrap(), Err(CoreError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn active_slots_expire_without_touch() {
        let t = throttler(1);
        assert!(t.schedule("r1".into(), key("a1")).await.unwrap());
        assert_eq!(t.active_count(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        t.expire(Instant::now());
        assert_eq!(t.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_the_expiry_clock() {
        let t = throttler(1);
        assert!(t.schedule("r1".into(), key("a1")).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        t.touch(&"r1".into());

        tokio::time::advance(Duration::from_secs(8)).await;
        t.expire(Instant::now());
        assert_eq!(t.active_count(), 1, "touch kept the slot from expiring at 16s");
    }

    #[tokio::test]
    async fn remove_unknown_id_is_noop() {
        let t = throttler(1);
        t.remove(&"does-not-exist".into());
        assert_eq!(t.active_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_cancels_queue_and_clears_state() {
        let t = Arc::new(throttler(1));
        assert!(t.schedule("r1".into(), key("a1")).await.unwrap());

        let t2 = t.clone();
        let queued = tokio::spawn(async move { t2.schedule("r2".into(), key("a2")).await });
        tokio::task::yield_now().await;

        t.on_disconnect();
        assert!(!queued.await.unwrap().unwrap());
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.queue_len(), 0);
    }

    #[tokio::test]
    async fn effective_cap_scales_with_subscribed_accounts() {
        let config = SynchronizationThrottlerConfig {
            max_concurrent_synchronizations: 15,
            queue_timeout_in_seconds: 300,
            synchronization_timeout_in_seconds: 10,
        };
        let t = SynchronizationThrottler::new(config, "vint-hill".into(), Bucket::Zero, Arc::new(RegionActivity::new()));

        t.set_subscribed_accounts(25); // ceil(25/10) = 3
        assert_eq!(t.effective_cap(25), 3);

        t.set_subscribed_accounts(500); // ceil(500/10) = 50, capped at 15
        assert_eq!(t.effective_cap(500), 15);

        t.set_subscribed_accounts(0); // max(1, 0) = 1
        assert_eq!(t.effective_cap(0), 1);
    }
}

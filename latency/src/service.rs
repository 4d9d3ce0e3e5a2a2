//! See module-level docs in `lib.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};
use watermill::ewmean::EWMean;
use watermill::Univariate;

use crate::ids::{AccountId, Bucket, Host, InstanceId, Region, ReplicaId};

/// How much weight a fresh probe carries against the running estimate. Low
/// enough that one noisy probe doesn't flip the best-region election.
const LATENCY_EWMA_ALPHA: f64 = 0.3;

/// What the latency service needs from the websocket client (C6) to act on
/// its elections, kept abstract so this crate has no dependency on the
/// concrete socket/slot machinery.
#[async_trait]
pub trait LatencyTransport: Send + Sync + 'static {
    async fn unsubscribe(&self, replica_id: &ReplicaId);
    async fn unsubscribe_account_region(&self, account_id: &AccountId, region: &Region);
    async fn ensure_subscribe(&self, replica_id: &ReplicaId, bucket: Bucket);
}

/// Measures one region's latency by opening (and promptly closing) a
/// websocket to it and timing the connect. Implementations typically wrap
/// the domain client (C1) to resolve the region's URL first.
#[async_trait]
pub trait RegionProber: Send + Sync + 'static {
    async fn probe(&self, region: &Region) -> anyhow::Result<Duration>;
}

#[derive(Debug, Clone)]
pub enum LatencyEvent {
    RegionProbed { region: Region, latency: Duration },
    ReplicaUnsubscribed { account_id: AccountId, region: Region },
    ReplicaEnsureSubscribe { account_id: AccountId, region: Region, bucket: Bucket },
}

struct Inner {
    /// Smoothed per-region latency (spec.md §4.4 `latency[region]`).
    latency: HashMap<Region, Duration>,
    ewma: HashMap<Region, EWMean<f64>>,
    connected: HashMap<InstanceId, bool>,
    synced: HashMap<InstanceId, bool>,
    /// `replicas(A): region -> replicaId` (spec.md §3 Data Model).
    accounts: HashMap<AccountId, HashMap<Region, ReplicaId>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            latency: HashMap::new(),
            ewma: HashMap::new(),
            connected: HashMap::new(),
            synced: HashMap::new(),
            accounts: HashMap::new(),
        }
    }

    fn record_latency(&mut self, region: &Region, sample: Duration) -> Duration {
        let ewma = self.ewma.entry(region.clone()).or_insert_with(|| EWMean::new(LATENCY_EWMA_ALPHA));
        ewma.update(sample.as_secs_f64() * 1000.0);
        let smoothed = Duration::from_secs_f64((ewma.get() / 1000.0).max(0.0));
        self.latency.insert(region.clone(), smoothed);
        smoothed
    }

    /// Regions of `account_id`'s replicas, ascending by latency. Unknown
    /// latencies sort last (they haven't been probed yet).
    fn regions_sorted_by_latency(&self, account_id: &AccountId) -> Vec<Region> {
        let Some(replicas) = self.accounts.get(account_id) else {
            return Vec::new();
        };

        let mut regions: Vec<Region> = replicas.keys().cloned().collect();
        regions.sort_by_key(|r| self.latency.get(r).copied().unwrap_or(Duration::MAX));
        regions
    }

    fn replica_of(&self, account_id: &AccountId, region: &Region) -> Option<ReplicaId> {
        self.accounts.get(account_id)?.get(region).cloned()
    }

    fn instances_of(&self, account_id: &AccountId) -> Vec<InstanceId> {
        self.connected.keys().filter(|id| &id.account_id == account_id).cloned().collect()
    }

    fn connected_regions(&self, account_id: &AccountId) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .connected
            .iter()
            .filter(|(id, &is_connected)| &id.account_id == account_id && is_connected)
            .map(|(id, _)| id.region.clone())
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }

    fn synced_regions(&self, account_id: &AccountId) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .synced
            .iter()
            .filter(|(id, &is_synced)| &id.account_id == account_id && is_synced)
            .map(|(id, _)| id.region.clone())
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }

    fn any_connected(&self, account_id: &AccountId) -> bool {
        self.connected.iter().any(|(id, &v)| &id.account_id == account_id && v)
    }
}

/// Region probe + best-region election + replica supervision (C5, spec.md
/// §4.4).
pub struct LatencyService<P: RegionProber, T: LatencyTransport> {
    inner: Mutex<Inner>,
    probe_locks: DashMap<Region, Arc<AsyncMutex<()>>>,
    prober: Arc<P>,
    transport: Arc<T>,
}

impl<P: RegionProber, T: LatencyTransport> LatencyService<P, T> {
    pub fn new(prober: Arc<P>, transport: Arc<T>) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            probe_locks: DashMap::new(),
            prober,
            transport,
        }
    }

    /// Registers (or replaces) `replicas(A): region -> replicaId` for an
    /// account (spec.md §3 Data Model).
    pub fn register_account(&self, account_id: AccountId, replicas: HashMap<Region, ReplicaId>) {
        self.inner.lock().accounts.insert(account_id, replicas);
    }

    pub fn regions_sorted_by_latency(&self, account_id: &AccountId) -> Vec<Region> {
        self.inner.lock().regions_sorted_by_latency(account_id)
    }

    /// Single-flight probe of `region`'s latency if unknown; no-op if a
    /// probe already completed (spec.md §4.4 `onConnected`).
    async fn ensure_probed(&self, region: &Region) {
        if self.inner.lock().latency.contains_key(region) {
            return;
        }

        let lock = self
            .probe_locks
            .entry(region.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.inner.lock().latency.contains_key(region) {
            return; // another caller finished the probe while we waited
        }

        match self.prober.probe(region).await {
            Ok(sample) => {
                let smoothed = self.inner.lock().record_latency(region, sample);
                debug!(%region, ?sample, ?smoothed, "probed region latency");
            }
            Err(err) => warn!(%region, error = %err, "region latency probe failed"),
        }
    }

    /// `onConnected(instanceId)` (spec.md §4.4).
    pub async fn on_connected(&self, instance_id: InstanceId) {
        self.inner.lock().connected.insert(instance_id.clone(), true);
        self.ensure_probed(&instance_id.region).await;

        let account_id = instance_id.account_id.clone();
        let (connected_regions, any_synced, best) = {
            let inner = self.inner.lock();
            let connected_regions = inner.connected_regions(&account_id);
            let any_synced = inner.synced_regions(&account_id).iter().any(|_| true)
                || inner.synced.iter().any(|(id, &v)| id.account_id == account_id && v);
            let best = connected_regions
                .iter()
                .min_by_key(|r| inner.latency.get(*r).copied().unwrap_or(Duration::MAX))
                .cloned();
            (connected_regions, any_synced, best)
        };

        if connected_regions.len() > 1 && !any_synced {
            if let Some(best) = best {
                self.demote_losers(&account_id, &connected_regions, &best).await;
            }
        }
    }

    /// `onDealsSynchronized(instanceId)` (spec.md §4.4).
    pub async fn on_deals_synchronized(&self, instance_id: InstanceId) {
        self.inner.lock().synced.insert(instance_id.clone(), true);

        let account_id = instance_id.account_id.clone();
        let (synced_regions, best) = {
            let inner = self.inner.lock();
            let synced_regions = inner.synced_regions(&account_id);
            let best = synced_regions
                .iter()
                .min_by_key(|r| inner.latency.get(*r).copied().unwrap_or(Duration::MAX))
                .cloned();
            (synced_regions, best)
        };

        if let Some(best) = best {
            self.demote_losers(&account_id, &synced_regions, &best).await;
        }
    }

    async fn demote_losers(&self, account_id: &AccountId, regions: &[Region], best: &Region) {
        for region in regions {
            if region == best {
                continue;
            }
            let replica_id = self.inner.lock().replica_of(account_id, region);
            if let Some(replica_id) = replica_id {
                trace!(%account_id, %region, %best, "demoting non-best replica");
                self.transport.unsubscribe(&replica_id).await;
                self.transport.unsubscribe_account_region(account_id, region).await;
            }
        }
    }

    /// `onDisconnected(instanceId)` (spec.md §4.4): brings the account back
    /// up via its siblings if nothing is left connected anywhere.
    pub async fn on_disconnected(&self, instance_id: InstanceId) {
        {
            let mut inner = self.inner.lock();
            inner.connected.insert(instance_id.clone(), false);
            inner.synced.insert(instance_id.clone(), false);
        }

        let account_id = instance_id.account_id.clone();
        if self.inner.lock().any_connected(&account_id) {
            return;
        }

        let siblings: Vec<(Region, ReplicaId)> = {
            let inner = self.inner.lock();
            inner
                .accounts
                .get(&account_id)
                .map(|replicas| {
                    replicas
                        .iter()
                        .filter(|(region, _)| **region != instance_id.region)
                        .map(|(region, replica)| (region.clone(), replica.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (region, replica_id) in siblings {
            debug!(%account_id, %region, "no instance connected anywhere, ensuring sibling replicas resubscribe");
            self.transport.ensure_subscribe(&replica_id, Bucket::Zero).await;
            self.transport.ensure_subscribe(&replica_id, Bucket::One).await;
        }
    }

    /// `onUnsubscribe(accountId)` (spec.md §4.4).
    pub async fn on_unsubscribe(&self, account_id: &AccountId) {
        let mut inner = self.inner.lock();
        let current_region = inner.connected_regions(account_id).into_iter().next();
        let Some(current_region) = current_region else { return };

        let instance_ids: Vec<InstanceId> = inner
            .instances_of(account_id)
            .into_iter()
            .filter(|id| id.region == current_region)
            .collect();

        for id in instance_ids {
            inner.connected.insert(id.clone(), false);
            inner.synced.insert(id, false);
        }
    }

    /// Periodic refresh (every 15 min, spec.md §4.4): re-probe all known
    /// regions, then nudge single-instance accounts toward a better region
    /// if the election has shifted.
    pub async fn periodic_refresh(&self) {
        let known_regions: Vec<Region> = self.inner.lock().latency.keys().cloned().collect();

        for region in &known_regions {
            match self.prober.probe(region).await {
                Ok(sample) => {
                    self.inner.lock().record_latency(region, sample);
                }
                Err(err) => warn!(%region, error = %err, "periodic region latency re-probe failed"),
            }
        }

        let candidates: Vec<(AccountId, InstanceId, Region)> = {
            let inner = self.inner.lock();
            let mut out = Vec::new();
            let account_ids: Vec<AccountId> = inner.accounts.keys().cloned().collect();

            for account_id in account_ids {
                let connected: Vec<InstanceId> = inner
                    .connected
                    .iter()
                    .filter(|(id, &v)| id.account_id == account_id && v)
                    .map(|(id, _)| id.clone())
                    .collect();

                if connected.len() != 1 {
                    continue;
                }

                let current = &connected[0];
                let Some(best) = inner.regions_sorted_by_latency(&account_id).into_iter().next() else {
                    continue;
                };

                if best != current.region {
                    out.push((account_id.clone(), current.clone(), best));
                }
            }

            out
        };

        for (account_id, current, better_region) in candidates {
            let replica_id = self.inner.lock().replica_of(&account_id, &better_region);
            if let Some(replica_id) = replica_id {
                debug!(%account_id, from = %current.region, to = %better_region, "latency election shifted, nudging sibling to take over");
                self.transport.ensure_subscribe(&replica_id, current.bucket).await;
            }
        }
    }

    pub fn get_active_account_instances(&self, account_id: &AccountId) -> Vec<InstanceId> {
        let inner = self.inner.lock();
        let mut ids: Vec<InstanceId> = inner
            .connected
            .iter()
            .filter(|(id, &v)| &id.account_id == account_id && v)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_synchronized_account_instances(&self, account_id: &AccountId) -> Vec<InstanceId> {
        let inner = self.inner.lock();
        let mut ids: Vec<InstanceId> = inner
            .synced
            .iter()
            .filter(|(id, &v)| &id.account_id == account_id && v)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FixedProber {
        latencies: HashMap<Region, Duration>,
    }

    #[async_trait]
    impl RegionProber for FixedProber {
        async fn probe(&self, region: &Region) -> anyhow::Result<Duration> {
            Ok(self.latencies.get(region).copied().unwrap_or(Duration::from_millis(100)))
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        unsubscribed: StdMutex<Vec<ReplicaId>>,
        unsubscribed_regions: StdMutex<Vec<(AccountId, Region)>>,
        ensure_subscribes: StdMutex<Vec<(ReplicaId, Bucket)>>,
        probe_calls: AtomicUsize,
    }

    #[async_trait]
    impl LatencyTransport for RecordingTransport {
        async fn unsubscribe(&self, replica_id: &ReplicaId) {
            self.unsubscribed.lock().unwrap().push(replica_id.clone());
        }

        async fn unsubscribe_account_region(&self, account_id: &AccountId, region: &Region) {
            self.unsubscribed_regions.lock().unwrap().push((account_id.clone(), region.clone()));
        }

        async fn ensure_subscribe(&self, replica_id: &ReplicaId, bucket: Bucket) {
            self.ensure_subscribes.lock().unwrap().push((replica_id.clone(), bucket));
        }
    }

    fn svc(latencies: HashMap<Region, Duration>) -> (LatencyService<FixedProber, RecordingTransport>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let prober = Arc::new(FixedProber { latencies });
        (LatencyService::new(prober, transport.clone()), transport)
    }

    #[tokio::test]
    async fn best_region_election_demotes_non_best_replica() {
        // scenario 1 from spec.md §8
        let mut latencies = HashMap::new();
        latencies.insert(Region::from("vint-hill"), Duration::from_millis(50));
        latencies.insert(Region::from("new-york"), Duration::from_millis(200));
        let (svc, transport) = svc(latencies);

        let mut replicas = HashMap::new();
        replicas.insert(Region::from("vint-hill"), ReplicaId::from("A"));
        replicas.insert(Region::from("new-york"), ReplicaId::from("Ar"));
        svc.register_account("A".into(), replicas);

        svc.on_connected(InstanceId::new("A".into(), "new-york".into(), Bucket::Zero, "h".into())).await;
        svc.on_connected(InstanceId::new("A".into(), "vint-hill".into(), Bucket::Zero, "h".into())).await;

        assert_eq!(transport.unsubscribed.lock().unwrap().as_slice(), &[ReplicaId::from("Ar")]);
        assert_eq!(
            transport.unsubscribed_regions.lock().unwrap().as_slice(),
            &[("A".into(), Region::from("new-york"))]
        );

        let mut active = svc.get_active_account_instances(&"A".into());
        active.sort();
        assert_eq!(active.len(), 2, "both stay marked active until the higher layer tears new-york down");
    }

    #[tokio::test]
    async fn replica_fails_back_when_all_instances_disconnect() {
        // scenario 2 from spec.md §8
        let mut latencies = HashMap::new();
        latencies.insert(Region::from("vint-hill"), Duration::from_millis(50));
        latencies.insert(Region::from("new-york"), Duration::from_millis(200));
        let (svc, transport) = svc(latencies);

        let mut replicas = HashMap::new();
        replicas.insert(Region::from("vint-hill"), ReplicaId::from("A"));
        replicas.insert(Region::from("new-york"), ReplicaId::from("Ar"));
        svc.register_account("A".into(), replicas);

        let ny = InstanceId::new("A".into(), "new-york".into(), Bucket::Zero, "h".into());
        let vh = InstanceId::new("A".into(), "vint-hill".into(), Bucket::Zero, "h".into());
        svc.on_connected(ny.clone()).await;
        svc.on_connected(vh.clone()).await;
        svc.on_deals_synchronized(ny.clone()).await;
        svc.on_deals_synchronized(vh.clone()).await;

        svc.on_disconnected(ny).await;
        assert!(transport.ensure_subscribes.lock().unwrap().is_empty(), "other region still up: no ensureSubscribe yet");

        svc.on_disconnected(vh).await;
        let ensure_calls = transport.ensure_subscribes.lock().unwrap();
        assert_eq!(ensure_calls.len(), 2);
        assert!(ensure_calls.contains(&(ReplicaId::from("Ar"), Bucket::Zero)));
        assert!(ensure_calls.contains(&(ReplicaId::from("Ar"), Bucket::One)));
    }

    #[tokio::test]
    async fn probing_a_region_is_single_flight() {
        let (svc, _transport) = svc(HashMap::new());
        svc.register_account("A".into(), HashMap::from([(Region::from("vint-hill"), ReplicaId::from("A"))]));

        let svc = Arc::new(svc);
        let a = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.on_connected(InstanceId::new("A".into(), "vint-hill".into(), Bucket::Zero, "h1".into())).await })
        };
        let b = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.on_connected(InstanceId::new("A".into(), "vint-hill".into(), Bucket::Zero, "h2".into())).await })
        };

        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(svc.regions_sorted_by_latency(&"A".into()), vec![Region::from("vint-hill")]);
    }

    #[tokio::test]
    async fn on_unsubscribe_marks_current_region_instances_down() {
        let (svc, _transport) = svc(HashMap::from([(Region::from("vint-hill"), Duration::from_millis(10))]));
        svc.register_account("A".into(), HashMap::from([(Region::from("vint-hill"), ReplicaId::from("A"))]));

        let instance = InstanceId::new("A".into(), "vint-hill".into(), Bucket::Zero, "h1".into());
        svc.on_connected(instance.clone()).await;
        svc.on_deals_synchronized(instance.clone()).await;

        svc.on_unsubscribe(&"A".into()).await;

        assert!(svc.get_active_account_instances(&"A".into()).is_empty());
        assert!(svc.get_synchronized_account_instances(&"A".into()).is_empty());
    }
}

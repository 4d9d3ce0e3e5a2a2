//! Websocket Client (C6, spec.md §4.6): the multiplexer that owns every
//! socket slot, wires the collaborator modules (C1 domain client, C3
//! throttler, C4 subscription manager, C5 latency service, C7 dispatcher)
//! together, and exposes the public RPC/subscribe/trade surface.
//!
//! `WebsocketClient<O>` needs to hand itself, as a transport, to three
//! collaborators that each take a generic type parameter
//! (`SubscriptionManager<T: SubscribeTransport>`, `EventDispatcher<H:
//! DispatcherHooks, O>`, `LatencyService<P, T: LatencyTransport>`). Rather
//! than a self-referential generic (`ClientCore<O>` containing a
//! `LatencyService<_, ClientCore<O>>` field), each collaborator is handed a
//! thin `Weak`-holding handle that implements exactly one trait and
//! upgrades back into the core to do real work. The handles are built with
//! `Arc::new_cyclic` so the core and its collaborators can reference each
//! other without a cycle of strong counts.
//!
//! The `latency` crate carries its own copy of the id newtypes (so it has
//! no dependency on this crate, see its `ids.rs`); the small `convert`
//! module below translates across that boundary.

pub mod rpc;
pub mod socket;
pub mod trade;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::Config;
use crate::dispatcher::{DispatcherHooks, EventDispatcher};
use crate::domain::DomainClient;
use crate::errors::{CoreError, CoreResult};
use crate::ids::{AccountId, Bucket, Host, Region, ReplicaId, StreamId, SyncId, BUCKETS};
use crate::observer::Observer;
use crate::packets::RateLimitMetadata;
use crate::subscriptions::{SubscribeTransport, SubscriptionManager};
use crate::throttler::RegionActivity;

use latency::prober::{RegionUrlResolver, WebsocketRegionProber};
use latency::service::{LatencyService, LatencyTransport};

use self::socket::{SlotEvent, SocketSlot, UrlSource};

pub use self::rpc::RpcRequestOptions;
pub use self::trade::Reliability;

/// Translation between this crate's id newtypes and `latency`'s own copies
/// (kept distinct so `latency` has no dependency on `streaming-core`).
pub(super) mod convert {
    use crate::ids as core_ids;

    pub fn account(a: &core_ids::AccountId) -> latency::ids::AccountId {
        latency::ids::AccountId(a.0.clone())
    }

    pub fn account_back(a: &latency::ids::AccountId) -> core_ids::AccountId {
        core_ids::AccountId(a.0.clone())
    }

    pub fn region(r: &core_ids::Region) -> latency::ids::Region {
        latency::ids::Region(r.0.clone())
    }

    pub fn region_back(r: &latency::ids::Region) -> core_ids::Region {
        core_ids::Region(r.0.clone())
    }

    pub fn host(h: &core_ids::Host) -> latency::ids::Host {
        latency::ids::Host(h.0.clone())
    }

    pub fn replica(r: &core_ids::ReplicaId) -> latency::ids::ReplicaId {
        latency::ids::ReplicaId(r.0.clone())
    }

    pub fn replica_back(r: &latency::ids::ReplicaId) -> core_ids::ReplicaId {
        core_ids::ReplicaId(r.0.clone())
    }

    pub fn bucket(b: core_ids::Bucket) -> latency::ids::Bucket {
        match b {
            core_ids::Bucket::Zero => latency::ids::Bucket::Zero,
            core_ids::Bucket::One => latency::ids::Bucket::One,
        }
    }

    pub fn bucket_back(b: latency::ids::Bucket) -> core_ids::Bucket {
        match b {
            latency::ids::Bucket::Zero => core_ids::Bucket::Zero,
            latency::ids::Bucket::One => core_ids::Bucket::One,
        }
    }

    pub fn instance_id(
        account_id: &core_ids::AccountId,
        region: &core_ids::Region,
        bucket: core_ids::Bucket,
        host: &core_ids::Host,
    ) -> latency::ids::InstanceId {
        latency::ids::InstanceId::new(self::account(account_id), self::region(region), self::bucket(bucket), self::host(host))
    }
}

/// Point-in-time counters for observability (SPEC_FULL.md §11): explicitly
/// not the teacher's `metered`/prometheus exporter stack, just a plain
/// snapshot struct an embedder can poll or log.
#[derive(Debug, Clone, Default)]
pub struct CoreMetrics {
    pub open_slots: usize,
    pub connected_slots: usize,
    pub active_throttler_slots: usize,
    pub queued_subscriptions: usize,
    pub gap_events_emitted: u64,
}

/// Resolves a region/bucket to a websocket URL via the domain client (C1),
/// implementing both `client::socket::UrlSource` (3-argument internal
/// shape) and `latency::RegionUrlResolver` (the latency crate's own,
/// bucket-less shape, since the probe always targets the bucket-0 host).
pub struct DomainRegionResolver {
    domain: Arc<DomainClient>,
}

#[async_trait]
impl UrlSource for DomainRegionResolver {
    async fn resolve(&self, region: &Region, bucket: Bucket) -> CoreResult<Url> {
        self.domain.get_url(region, bucket).await
    }
}

#[async_trait]
impl RegionUrlResolver for DomainRegionResolver {
    async fn resolve(&self, region: &latency::ids::Region) -> anyhow::Result<Url> {
        let region = convert::region_back(region);
        Ok(self.domain.get_url(&region, Bucket::Zero).await?)
    }
}

struct AccountBinding {
    region: Region,
    bucket: Bucket,
    slot_index: usize,
    replicas: HashMap<Region, ReplicaId>,
}

/// Shared state behind `WebsocketClient`. Never constructed directly:
/// always reached through the `Arc` the client itself owns, or through one
/// of the `*Handle` wrappers below.
pub struct ClientCore<O: Observer> {
    config: Config,
    auth_token: String,
    #[allow(dead_code)]
    observer: Arc<O>,
    domain: Arc<DomainClient>,
    region_activity: Arc<RegionActivity>,
    slots: DashMap<(Region, Bucket), SyncMutex<Vec<Arc<SocketSlot>>>>,
    accounts: DashMap<AccountId, SyncMutex<AccountBinding>>,
    current_sync_id: DashMap<(AccountId, Bucket), SyncId>,
    unsubscribe_throttle: DashMap<AccountId, Instant>,
    gap_events_emitted: std::sync::atomic::AtomicU64,
    process_lock: AsyncMutex<()>,
    closed: AtomicBool,
    dispatcher: Arc<EventDispatcher<DispatcherHandle<O>, O>>,
    subscriptions: SubscriptionManager<SubscribeHandle<O>>,
    latency: Arc<LatencyService<WebsocketRegionProber<DomainRegionResolver>, LatencyHandle<O>>>,
}

/// Public handle. Cheap to clone; all state lives behind the inner `Arc`.
pub struct WebsocketClient<O: Observer> {
    core: Arc<ClientCore<O>>,
}

impl<O: Observer> Clone for WebsocketClient<O> {
    fn clone(&self) -> Self {
        Self { core: self.core.clone() }
    }
}

impl<O: Observer> WebsocketClient<O> {
    /// Builds the full collaborator graph: domain client, latency service
    /// (with its own region prober wired through the domain client),
    /// subscription manager, and event dispatcher, each holding a `Weak`
    /// handle back into this client rather than a direct generic reference.
    #[instrument(skip(config, observer), fields(domain = %config.domain))]
    pub fn new(config: Config, auth_token: String, observer: Arc<O>) -> CoreResult<Self> {
        config.validate().map_err(CoreError::Validation)?;

        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout())
            .build()
            .map_err(CoreError::from)?;
        let provisioning_url = Url::parse(&format!("https://{}/users/current/provisioning-profiles", config.domain))
            .map_err(CoreError::from)?;
        let domain = Arc::new(DomainClient::new(http, provisioning_url, auth_token.clone()));
        let resolver = DomainRegionResolver { domain: domain.clone() };
        let prober = Arc::new(WebsocketRegionProber::new(resolver));

        let core = Arc::new_cyclic(|weak: &Weak<ClientCore<O>>| {
            let dispatcher = Arc::new(EventDispatcher::new(
                Arc::new(DispatcherHandle { core: weak.clone() }),
                observer.clone(),
                config.packet_ordering_timeout(),
            ));
            let latency = Arc::new(LatencyService::new(prober, Arc::new(LatencyHandle { core: weak.clone() })));
            let subscriptions = SubscriptionManager::new(Arc::new(SubscribeHandle { core: weak.clone() }));

            ClientCore {
                config,
                auth_token,
                observer,
                domain,
                region_activity: Arc::new(RegionActivity::new()),
                slots: DashMap::new(),
                accounts: DashMap::new(),
                current_sync_id: DashMap::new(),
                unsubscribe_throttle: DashMap::new(),
                gap_events_emitted: std::sync::atomic::AtomicU64::new(0),
                process_lock: AsyncMutex::new(()),
                closed: AtomicBool::new(false),
                dispatcher,
                subscriptions,
                latency,
            }
        });

        core.spawn_periodic_tasks();

        Ok(Self { core })
    }

    /// Registers `accountId`'s replica map (spec.md §3 Data Model) and
    /// starts its subscribe retry loop on every bucket it has a replica
    /// for (spec.md §4.3/§4.6).
    #[instrument(skip(self, replicas), fields(%account_id))]
    pub async fn subscribe(&self, account_id: AccountId, replicas: HashMap<Region, ReplicaId>) -> CoreResult<()> {
        let latency_replicas = replicas.iter().map(|(r, id)| (convert::region(r), convert::replica(id))).collect();
        self.core.latency.register_account(convert::account(&account_id), latency_replicas);

        self.core
            .accounts
            .entry(account_id.clone())
            .or_insert_with(|| {
                SyncMutex::new(AccountBinding {
                    region: replicas.keys().next().cloned().unwrap_or_else(|| Region::from("")),
                    bucket: Bucket::Zero,
                    slot_index: 0,
                    replicas: replicas.clone(),
                })
            })
            .lock()
            .replicas = replicas;

        for bucket in BUCKETS {
            self.core.subscriptions.schedule_subscribe(account_id.clone(), bucket, false);
        }

        Ok(())
    }

    /// Cancels every subscribe loop and latency supervision for an account
    /// (spec.md §4.3 `cancelAccount`, §4.4 `onUnsubscribe`).
    pub async fn unsubscribe(&self, account_id: &AccountId) {
        self.core.subscriptions.cancel_account(account_id);
        self.core.latency.on_unsubscribe(&convert::account(account_id)).await;

        for bucket in BUCKETS {
            if let Some(slot) = self.core.find_slot_for_account(account_id, bucket) {
                slot.unbind_account(account_id);
            }
        }
        self.core.accounts.remove(account_id);
    }

    /// General-purpose RPC (spec.md §4.6 `rpcRequest`). See [`rpc`] for the
    /// retry/timeout/active-instance-rewrite machinery.
    pub async fn rpc_request(
        &self,
        account_id: &AccountId,
        request_type: crate::packets::RequestType,
        payload: serde_json::Value,
        options: Option<RpcRequestOptions>,
    ) -> CoreResult<serde_json::Value> {
        rpc::rpc_request(&self.core, account_id, request_type, payload, options).await
    }

    /// `trade(accountId, trade, application?, reliability?)` (spec.md §4.6,
    /// C8).
    pub async fn trade(&self, account_id: &AccountId, trade_payload: serde_json::Value, reliability: Reliability) -> CoreResult<serde_json::Value> {
        trade::trade(&self.core, account_id, trade_payload, reliability).await
    }

    /// Point-in-time counters (SPEC_FULL.md §11).
    pub fn metrics(&self) -> CoreMetrics {
        self.core.metrics()
    }

    /// Graceful shutdown (SPEC_FULL.md §11): close every slot, reject every
    /// pending request, cancel every subscribe/throttler entry.
    pub async fn close(&self) {
        self.core.close().await;
    }
}

impl<O: Observer> ClientCore<O> {
    fn metrics(&self) -> CoreMetrics {
        let mut open_slots = 0usize;
        let mut connected_slots = 0usize;
        let mut active_throttler_slots = 0usize;
        let mut queued_subscriptions = 0usize;
        for entry in self.slots.iter() {
            let slots = entry.value().lock();
            open_slots += slots.len();
            connected_slots += slots.iter().filter(|s| s.is_connected()).count();
            active_throttler_slots += slots.iter().map(|s| s.throttler.active_count()).sum::<usize>();
            queued_subscriptions += slots.iter().map(|s| s.throttler.queue_len()).sum::<usize>();
        }

        CoreMetrics {
            open_slots,
            connected_slots,
            active_throttler_slots,
            queued_subscriptions,
            gap_events_emitted: self.gap_events_emitted.load(Ordering::Relaxed),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.slots.iter() {
            for slot in entry.value().lock().iter() {
                slot.close();
            }
        }
        info!("websocket client closed");
    }

    /// Open Question #2 (SPEC_FULL.md §12): "active" means
    /// `LatencyService::get_active_account_instances` is non-empty; when
    /// more than one instance is active, the first in ascending-latency
    /// region order wins.
    pub(super) fn active_bucket(&self, account_id: &latency::ids::AccountId) -> Option<Bucket> {
        let active = self.latency.get_active_account_instances(account_id);
        if active.is_empty() {
            return None;
        }

        let order = self.latency.regions_sorted_by_latency(account_id);
        let best = order.iter().find_map(|region| active.iter().find(|i| &i.region == region)).or_else(|| active.first());

        best.map(|i| convert::bucket_back(i.bucket))
    }

    /// Spawns the three periodic jobs the spec describes as "fires every
    /// N": gap-timeout + throttler expiry tick every second (spec.md §4.1,
    /// §4.2), the disconnect-timer sweep on the same cadence (spec.md
    /// §4.7), and the latency region-refresh every 15 minutes (spec.md
    /// §4.4).
    fn spawn_periodic_tasks(self: &Arc<Self>) {
        let tick = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if tick.closed.load(Ordering::Acquire) {
                    break;
                }
                tick.run_second_tick().await;
            }
        });

        let refresh = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15 * 60));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if refresh.closed.load(Ordering::Acquire) {
                    break;
                }
                refresh.latency.periodic_refresh().await;
            }
        });
    }

    /// One second's worth of housekeeping: expire stale throttler slots,
    /// emit packet-orderer gap events (force-resubscribing the affected
    /// account/bucket), and sweep the dispatcher's disconnect timers.
    async fn run_second_tick(self: &Arc<Self>) {
        let now = Instant::now();

        for entry in self.slots.iter() {
            for slot in entry.value().lock().iter() {
                slot.throttler.expire(now);
            }
        }

        for gap in self.dispatcher.check_gaps(now) {
            warn!(stream_id = %gap.stream_id, expected = gap.expected, actual = gap.actual, "packet ordering gap, forcing resubscribe");
            self.gap_events_emitted.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.schedule_subscribe(gap.stream_id.account_id.clone(), gap.stream_id.bucket, false);
        }

        self.dispatcher.check_disconnect_timers(now).await;
    }

    fn find_slot_for_account(&self, account_id: &AccountId, bucket: Bucket) -> Option<Arc<SocketSlot>> {
        let binding = self.accounts.get(account_id)?;
        let binding = binding.lock();
        if binding.bucket != bucket {
            return None;
        }
        let slots = self.slots.get(&(binding.region.clone(), bucket))?;
        let slots = slots.lock();
        slots.get(binding.slot_index).cloned()
    }

    /// `createSocketInstanceByAccount(accountId, bucket)` (spec.md §4.6):
    /// picks the best-latency region for the account, then the first slot
    /// in that region/bucket under `maxAccountsPerInstance`, opening a new
    /// one if none has room.
    async fn create_socket_instance_by_account(self: &Arc<Self>, account_id: &AccountId, bucket: Bucket) -> CoreResult<Arc<SocketSlot>> {
        let latency_account = convert::account(account_id);
        let region = self
            .latency
            .regions_sorted_by_latency(&latency_account)
            .into_iter()
            .next()
            .map(|r| convert::region_back(&r))
            .ok_or_else(|| CoreError::internal("account has no registered replicas"))?;

        let _lock = self.process_lock.lock().await;

        let list = self.slots.entry((region.clone(), bucket)).or_insert_with(|| SyncMutex::new(Vec::new()));

        {
            let slots = list.lock();
            for slot in slots.iter() {
                if slot.account_count() < self.config.max_accounts_per_instance && !slot.is_locked() {
                    if let Some(binding_ref) = self.accounts.get(account_id) {
                        let mut binding = binding_ref.lock();
                        binding.region = region.clone();
                        binding.bucket = bucket;
                        binding.slot_index = slot.slot_index;
                    }
                    return Ok(slot.clone());
                }
            }
        }

        let slot_index = list.lock().len();
        let (tx, rx) = flume::unbounded();
        let slot = SocketSlot::new(
            region.clone(),
            bucket,
            slot_index,
            self.config.synchronization_throttler.clone(),
            self.region_activity.clone(),
            tx,
        );
        list.lock().push(slot.clone());

        if let Some(binding_ref) = self.accounts.get(account_id) {
            let mut binding = binding_ref.lock();
            binding.region = region.clone();
            binding.bucket = bucket;
            binding.slot_index = slot_index;
        }

        let url_source = Arc::new(DomainRegionResolver { domain: self.domain.clone() });
        slot.spawn_connection_loop(url_source, self.auth_token.clone());
        self.spawn_intake_pump(slot.clone(), rx);

        Ok(slot)
    }

    /// Pumps a slot's `SlotEvent`s: connect/disconnect milestones drive
    /// latency + subscription-manager hooks, and synchronization packets go
    /// through packet intake (spec.md §4.6) before reaching the dispatcher.
    fn spawn_intake_pump(self: &Arc<Self>, slot: Arc<SocketSlot>, events: flume::Receiver<(usize, SlotEvent)>) {
        let core = self.clone();
        tokio::spawn(async move {
            while let Ok((_slot_index, event)) = events.recv_async().await {
                match event {
                    SlotEvent::Connected { first } => core.on_slot_connected(&slot, first).await,
                    SlotEvent::Disconnected => core.on_slot_disconnected(&slot).await,
                    SlotEvent::Synchronization(packet) => core.on_synchronization_packet(&slot, packet).await,
                }
            }
        });
    }

    /// Socket-level connect/reconnect (spec.md §4.6 connection lifecycle).
    /// Latency tracking is intentionally *not* driven from here: `onConnected`
    /// (and the real per-replica host) is only known once the server's
    /// `authenticated` packet arrives for a given account, which the
    /// dispatcher already reports via `latency_on_connected`. A raw reconnect
    /// instead re-arms the per-account subscribe loops and the orderer's
    /// sequence state for every account still bound to this slot (spec.md
    /// §4.1 `onReconnected`, §4.3 `onReconnected`).
    async fn on_slot_connected(self: &Arc<Self>, slot: &Arc<SocketSlot>, first: bool) {
        debug!(region = %slot.region, bucket = %slot.bucket, slot = slot.slot_index, first, "slot connected");
        if first {
            return;
        }

        let account_ids = slot.bound_account_ids();
        self.dispatcher.on_reconnected(&account_ids);
        self.subscriptions.on_reconnected(slot.bucket, slot.slot_index, account_ids).await;
    }

    async fn on_slot_disconnected(self: &Arc<Self>, slot: &Arc<SocketSlot>) {
        warn!(region = %slot.region, bucket = %slot.bucket, slot = slot.slot_index, "slot disconnected");
    }

    /// Packet intake (spec.md §4.6): drop instance-index/bucket mismatches,
    /// rewrite stale-`synchronizationId` packets to noop, then hand the
    /// result to the dispatcher (which owns the packet orderer, C2/C7).
    async fn on_synchronization_packet(self: &Arc<Self>, slot: &Arc<SocketSlot>, packet: crate::packets::SynchronizationPacket) {
        let envelope = packet.envelope().clone();

        if let Some(instance_index) = envelope.instance_index {
            if instance_index as usize != slot.bucket.as_index() {
                return;
            }
        }

        // A `synchronizationStarted` packet establishes the active
        // synchronization id for this instance; record it before the
        // stale-id filter runs below so the packet itself (and everything
        // that follows under the new id) isn't immediately judged stale
        // against the *previous* id and dropped.
        if let crate::packets::SynchronizationPacket::SynchronizationStarted(_) = &packet {
            self.current_sync_id.insert(
                (envelope.account_id.clone(), slot.bucket),
                envelope.synchronization_id.clone().unwrap_or_else(|| SyncId::from("")),
            );
        }

        let packet = if matches!(packet, crate::packets::SynchronizationPacket::SynchronizationStarted(_)) {
            packet
        } else if let Some(sync_id) = &envelope.synchronization_id {
            let key = (envelope.account_id.clone(), slot.bucket);
            let is_current = self.current_sync_id.get(&key).map(|v| v.value().clone() == *sync_id).unwrap_or(true);
            if is_current {
                packet
            } else {
                packet.into_noop()
            }
        } else {
            packet
        };

        let host = envelope.host.clone().unwrap_or_else(|| Host::from(""));
        let stream_id = StreamId::new(envelope.account_id.clone(), slot.bucket, host);

        self.throttle_inactive_unsubscribe(&packet, &envelope.account_id, slot.bucket);

        self.dispatcher.queue_packet(slot.region.clone(), stream_id, packet);
    }

    /// §4.6 packet intake: "for inactive-subscription packets other than
    /// disconnected/status/keepalive, throttle an unsubscribe(accountId) at
    /// most once per `unsubscribeThrottlingIntervalInSeconds`".
    fn throttle_inactive_unsubscribe(self: &Arc<Self>, packet: &crate::packets::SynchronizationPacket, account_id: &AccountId, bucket: Bucket) {
        if packet.is_always_considered_active() || self.subscriptions.is_subscription_active(account_id) {
            return;
        }

        let now = Instant::now();
        let interval = self.config.unsubscribe_throttling_interval();
        let should_fire = match self.unsubscribe_throttle.get(account_id) {
            Some(last) => now.duration_since(*last.value()) >= interval,
            None => true,
        };
        if !should_fire {
            return;
        }
        self.unsubscribe_throttle.insert(account_id.clone(), now);

        let core = self.clone();
        let account_id = account_id.clone();
        tokio::spawn(async move {
            if let Err(err) = core.rpc_request_unsubscribe_best_effort(&account_id, bucket).await {
                debug!(%account_id, %bucket, error = %err, "throttled unsubscribe for inactive subscription failed");
            }
        });
    }

    async fn rpc_request_unsubscribe_best_effort(self: &Arc<Self>, account_id: &AccountId, bucket: Bucket) -> CoreResult<()> {
        let options = RpcRequestOptions {
            instance_index: Some(bucket),
            ..Default::default()
        };
        match rpc::rpc_request(self, account_id, crate::packets::RequestType::Unsubscribe, serde_json::json!({}), Some(options)).await {
            Ok(_) => Ok(()),
            // spec.md §7: "unsubscribe silently swallows Timeout and NotFound".
            Err(CoreError::Timeout) | Err(CoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// `SubscribeTransport` for `SubscriptionManager<SubscribeHandle<O>>`
/// (spec.md §4.3/§4.6 boundary between the two modules).
pub struct SubscribeHandle<O: Observer> {
    core: Weak<ClientCore<O>>,
}

#[async_trait]
impl<O: Observer> SubscribeTransport for SubscribeHandle<O> {
    async fn subscribe(&self, account_id: &AccountId, bucket: Bucket) -> Result<(), CoreError> {
        let Some(core) = self.core.upgrade() else { return Err(CoreError::Closed) };
        let slot = core.create_socket_instance_by_account(account_id, bucket).await?;
        slot.await_connected().await;
        slot.bind_account(account_id.clone());

        let request_id = socket::random_token(32);
        let payload = serde_json::json!({
            "requestId": request_id,
            "type": "subscribe",
            "accountId": account_id.as_str(),
            "instanceIndex": bucket.as_index(),
            "sessionId": slot.session_id(),
        });
        let rx = slot.send_request(request_id, payload).await?;
        match tokio::time::timeout(core.config.request_timeout(), rx).await {
            Ok(Ok(socket::RpcOutcome::Response(_))) => Ok(()),
            Ok(Ok(socket::RpcOutcome::ProcessingError(e))) => Err(rpc::processing_error_to_core_error(e)),
            Ok(Err(_)) => Err(CoreError::Cancelled),
            Err(_) => Err(CoreError::Timeout),
        }
    }

    async fn unbind_account(&self, account_id: &AccountId, bucket: Bucket) {
        let Some(core) = self.core.upgrade() else { return };
        if let Some(slot) = core.find_slot_for_account(account_id, bucket) {
            slot.unbind_account(account_id);
        }
    }

    async fn lock_socket_instance(&self, account_id: &AccountId, bucket: Bucket, metadata: &RateLimitMetadata) {
        let Some(core) = self.core.upgrade() else { return };
        if let Some(slot) = core.find_slot_for_account(account_id, bucket) {
            slot.lock(metadata.recommended_retry_time);
        }
    }

    async fn is_slot_connected(&self, account_id: &AccountId, bucket: Bucket) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        core.find_slot_for_account(account_id, bucket).map(|s| s.is_connected()).unwrap_or(false)
    }
}

/// `DispatcherHooks` for `EventDispatcher<DispatcherHandle<O>, O>` (spec.md
/// §4.7 collaborator boundary).
pub struct DispatcherHandle<O: Observer> {
    core: Weak<ClientCore<O>>,
}

#[async_trait]
impl<O: Observer> DispatcherHooks for DispatcherHandle<O> {
    async fn cancel_subscribe(&self, account_id: &AccountId, bucket: Bucket) {
        if let Some(core) = self.core.upgrade() {
            core.subscriptions.cancel_subscribe(account_id, bucket);
        }
    }

    async fn cancel_account(&self, account_id: &AccountId) {
        if let Some(core) = self.core.upgrade() {
            core.subscriptions.cancel_account(account_id);
        }
    }

    async fn schedule_subscribe_on_timeout(&self, account_id: &AccountId, bucket: Bucket) {
        if let Some(core) = self.core.upgrade() {
            core.subscriptions.on_timeout(account_id.clone(), bucket).await;
        }
    }

    async fn schedule_subscribe_on_disconnected(&self, account_id: &AccountId, bucket: Bucket) {
        if let Some(core) = self.core.upgrade() {
            core.subscriptions.on_disconnected(account_id.clone(), bucket).await;
        }
    }

    async fn ensure_subscribe(&self, account_id: &AccountId, bucket: Bucket) {
        if let Some(core) = self.core.upgrade() {
            if !core.subscriptions.is_account_subscribing(account_id, Some(bucket)) {
                core.subscriptions.schedule_subscribe(account_id.clone(), bucket, false);
            }
        }
    }

    fn is_account_subscribing(&self, account_id: &AccountId, bucket: Bucket) -> bool {
        self.core.upgrade().map(|core| core.subscriptions.is_account_subscribing(account_id, Some(bucket))).unwrap_or(false)
    }

    fn session_id_matches(&self, stream_id: &StreamId, packet_session_id: Option<&str>) -> bool {
        let Some(core) = self.core.upgrade() else { return false };
        let Some(slot) = core.find_slot_for_account(&stream_id.account_id, stream_id.bucket) else {
            return false;
        };
        packet_session_id.map(|id| id == slot.session_id()).unwrap_or(true)
    }

    async fn latency_on_connected(&self, account_id: &AccountId, region: &Region, bucket: Bucket, host: &Host) {
        if let Some(core) = self.core.upgrade() {
            core.latency.on_connected(convert::instance_id(account_id, region, bucket, host)).await;
        }
    }

    async fn latency_on_disconnected(&self, account_id: &AccountId, region: &Region, bucket: Bucket, host: &Host) {
        if let Some(core) = self.core.upgrade() {
            core.latency.on_disconnected(convert::instance_id(account_id, region, bucket, host)).await;
        }
    }

    async fn latency_on_deals_synchronized(&self, account_id: &AccountId, region: &Region, bucket: Bucket, host: &Host) {
        if let Some(core) = self.core.upgrade() {
            core.latency.on_deals_synchronized(convert::instance_id(account_id, region, bucket, host)).await;
        }
    }

    async fn release_throttler_slot(&self, account_id: &AccountId, bucket: Bucket, _synchronization_id: &SyncId) {
        let Some(core) = self.core.upgrade() else { return };
        if let Some(slot) = core.find_slot_for_account(account_id, bucket) {
            slot.throttler.set_subscribed_accounts(slot.account_count());
        }
    }
}

/// `LatencyTransport` for `LatencyService<_, LatencyHandle<O>>` (spec.md
/// §4.4 collaborator boundary). Parameters here are `latency::ids` types;
/// everything is converted back to this crate's ids before touching
/// `ClientCore` state.
pub struct LatencyHandle<O: Observer> {
    core: Weak<ClientCore<O>>,
}

#[async_trait]
impl<O: Observer> LatencyTransport for LatencyHandle<O> {
    async fn unsubscribe(&self, replica_id: &latency::ids::ReplicaId) {
        let Some(core) = self.core.upgrade() else { return };
        let replica_id = convert::replica_back(replica_id);

        for entry in core.slots.iter() {
            for slot in entry.value().lock().iter() {
                for account_id in slot.bound_account_ids() {
                    let matches = core
                        .accounts
                        .get(&account_id)
                        .map(|b| b.lock().replicas.values().any(|r| *r == replica_id))
                        .unwrap_or(false);
                    if matches {
                        slot.unbind_account(&account_id);
                    }
                }
            }
        }
    }

    async fn unsubscribe_account_region(&self, account_id: &latency::ids::AccountId, region: &latency::ids::Region) {
        let Some(core) = self.core.upgrade() else { return };
        let account_id = convert::account_back(account_id);
        let region = convert::region_back(region);

        for bucket in BUCKETS {
            if let Some(slot) = core.find_slot_for_account(&account_id, bucket) {
                if slot.region == region {
                    slot.unbind_account(&account_id);
                }
            }
        }
    }

    async fn ensure_subscribe(&self, replica_id: &latency::ids::ReplicaId, bucket: latency::ids::Bucket) {
        let Some(core) = self.core.upgrade() else { return };
        let replica_id = convert::replica_back(replica_id);
        let bucket = convert::bucket_back(bucket);

        let account_id = core.accounts.iter().find(|e| e.value().lock().replicas.values().any(|r| *r == replica_id)).map(|e| e.key().clone());

        if let Some(account_id) = account_id {
            if !core.subscriptions.is_account_subscribing(&account_id, Some(bucket)) {
                core.subscriptions.schedule_subscribe(account_id, bucket, false);
            }
        }
    }
}

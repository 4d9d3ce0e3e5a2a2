//! Event Dispatcher (C7, spec.md §4.7): orders per-packet listener callbacks,
//! paces long-running handlers, and translates wire packets into the stable
//! [`Observer`] API.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::ids::{AccountId, Bucket, Host, Region, StreamId, SyncId};
use crate::observer::Observer;
use crate::orderer::PacketOrderer;
use crate::packets::SynchronizationPacket;

/// Long-running-handler pacing thresholds (spec.md §4.7, §5).
const LONG_HANDLER_WARN: Duration = Duration::from_secs(1);
/// Per-instance disconnect timer (spec.md §4.7).
const DISCONNECT_TIMER: Duration = Duration::from_secs(60);

/// What the dispatcher needs from its collaborators (subscription manager,
/// websocket client slot state, latency service, synchronization throttler)
/// to react to wire events, kept abstract the way `subscriptions::
/// SubscribeTransport` and `latency::LatencyTransport` are.
#[async_trait]
pub trait DispatcherHooks: Send + Sync + 'static {
    async fn cancel_subscribe(&self, account_id: &AccountId, bucket: Bucket);
    async fn cancel_account(&self, account_id: &AccountId);
    async fn schedule_subscribe_on_timeout(&self, account_id: &AccountId, bucket: Bucket);
    async fn schedule_subscribe_on_disconnected(&self, account_id: &AccountId, bucket: Bucket);
    async fn ensure_subscribe(&self, account_id: &AccountId, bucket: Bucket);
    fn is_account_subscribing(&self, account_id: &AccountId, bucket: Bucket) -> bool;

    /// Compares a packet's `sessionId` against the slot's current one
    /// (spec.md §4.7 `authenticated`: "if `sessionId` matches, record host").
    fn session_id_matches(&self, stream_id: &StreamId, packet_session_id: Option<&str>) -> bool;

    async fn latency_on_connected(&self, account_id: &AccountId, region: &Region, bucket: Bucket, host: &Host);
    async fn latency_on_disconnected(&self, account_id: &AccountId, region: &Region, bucket: Bucket, host: &Host);
    async fn latency_on_deals_synchronized(&self, account_id: &AccountId, region: &Region, bucket: Bucket, host: &Host);

    async fn release_throttler_slot(&self, account_id: &AccountId, bucket: Bucket, synchronization_id: &SyncId);
}

#[derive(Clone)]
struct QueuedPacket {
    region: Region,
    stream_id: StreamId,
    packet: SynchronizationPacket,
}

#[derive(Default, Clone)]
struct SyncFlags {
    specifications_updated: bool,
    positions_updated: bool,
    orders_updated: bool,
    positions_synced_fired: bool,
    orders_synced_fired: bool,
}

/// Per-`accountId` sequential event queue plus wire -> observer translation
/// (C7, spec.md §4.7).
pub struct EventDispatcher<H: DispatcherHooks, O: Observer> {
    hooks: Arc<H>,
    observer: Arc<O>,
    orderer: Mutex<PacketOrderer>,
    queues: DashMap<AccountId, Arc<Mutex<VecDeque<QueuedPacket>>>>,
    draining: DashMap<AccountId, ()>,
    /// Hosts actively authenticated for a given (account, bucket); used to
    /// decide whether a `disconnected` packet is the account's last stream.
    active_hosts: DashMap<(AccountId, Bucket), HashSet<Host>>,
    authenticated: DashMap<StreamId, bool>,
    sync_flags: DashMap<SyncId, SyncFlags>,
    /// Maps an in-flight synchronization back to the account/bucket it
    /// belongs to, so `dealSynchronizationFinished`/`orderSynchronizationFinished`
    /// can release the right throttler slot without the wire packet having
    /// to repeat it.
    sync_owner: DashMap<SyncId, (AccountId, Bucket)>,
    last_seen: DashMap<StreamId, Instant>,
}

impl<H: DispatcherHooks, O: Observer> EventDispatcher<H, O> {
    pub fn new(hooks: Arc<H>, observer: Arc<O>, packet_ordering_timeout: Duration) -> Self {
        Self {
            hooks,
            observer,
            orderer: Mutex::new(PacketOrderer::new(packet_ordering_timeout)),
            queues: DashMap::new(),
            draining: DashMap::new(),
            active_hosts: DashMap::new(),
            authenticated: DashMap::new(),
            sync_flags: DashMap::new(),
            sync_owner: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// `queuePacket(packet)`: runs the orderer, enqueues every packet it
    /// releases, and starts a drainer if the account's queue was empty.
    pub fn queue_packet(self: &Arc<Self>, region: Region, stream_id: StreamId, packet: SynchronizationPacket)
    where
        H: 'static,
        O: 'static,
    {
        let delivered = self.orderer.lock().process(stream_id.clone(), packet);

        for packet in delivered {
            if matches!(packet, SynchronizationPacket::Noop(_)) {
                continue;
            }

            let account_id = packet.envelope().account_id.clone();
            let queue = self
                .queues
                .entry(account_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
                .clone();

            let was_empty = {
                let mut q = queue.lock();
                let empty = q.is_empty();
                q.push_back(QueuedPacket {
                    region: region.clone(),
                    stream_id: stream_id.clone(),
                    packet,
                });
                empty
            };

            if was_empty && self.draining.insert(account_id.clone(), ()).is_none() {
                let this = self.clone();
                tokio::spawn(async move { this.drain(account_id).await });
            }
        }
    }

    async fn drain(self: Arc<Self>, account_id: AccountId) {
        loop {
            let Some(queue) = self.queues.get(&account_id).map(|q| q.clone()) else { break };
            let next = queue.lock().pop_front();

            let Some(item) = next else {
                self.draining.remove(&account_id);
                break;
            };

            let started = Instant::now();
            self.process_packet(item.region, item.stream_id.clone(), item.packet).await;
            let elapsed = started.elapsed();

            if elapsed > LONG_HANDLER_WARN {
                warn!(%account_id, stream_id = %item.stream_id, ?elapsed, "event handler took longer than expected");
            } else {
                debug!(%account_id, ?elapsed, "processed synchronization packet");
            }
        }
    }

    fn touch_disconnect_timer(&self, stream_id: &StreamId) {
        self.last_seen.insert(stream_id.clone(), Instant::now());
    }

    /// Disconnect timer sweep (spec.md §4.7), driven externally like
    /// `PacketOrderer::check_gaps`/`SynchronizationThrottler::expire`.
    pub async fn check_disconnect_timers(&self, now: Instant) {
        let stale: Vec<StreamId> = self
            .last_seen
            .iter()
            .filter(|e| *e.value() + DISCONNECT_TIMER < now)
            .map(|e| e.key().clone())
            .collect();

        for stream_id in stale {
            self.last_seen.remove(&stream_id);
            warn!(%stream_id, "no status/authenticated packet within disconnect timer, firing onDisconnected");
            self.observer.on_disconnected(&stream_id.account_id, stream_id.bucket).await;

            let is_only_active = self.deactivate_host(&stream_id);
            if is_only_active {
                self.hooks.schedule_subscribe_on_timeout(&stream_id.account_id, Bucket::Zero).await;
                self.hooks.schedule_subscribe_on_timeout(&stream_id.account_id, Bucket::One).await;
            }
        }
    }

    /// Gap timeout job (spec.md §4.1), driven externally like
    /// `check_disconnect_timers`.
    pub fn check_gaps(&self, now: Instant) -> Vec<crate::orderer::GapEvent> {
        self.orderer.lock().check_gaps(now)
    }

    /// `onReconnected(accountIds)` (spec.md §4.1 reset hooks), forwarded to
    /// the orderer so a fresh session doesn't replay stale sequence state.
    pub fn on_reconnected(&self, account_ids: &[AccountId]) {
        self.orderer.lock().on_reconnected(account_ids);
    }

    fn activate_host(&self, account_id: &AccountId, bucket: Bucket, host: &Host) {
        self.active_hosts
            .entry((account_id.clone(), bucket))
            .or_default()
            .insert(host.clone());
    }

    /// Removes `stream_id`'s host from the active set, returning whether it
    /// was the only active host for the account on this bucket.
    fn deactivate_host(&self, stream_id: &StreamId) -> bool {
        let key = (stream_id.account_id.clone(), stream_id.bucket);
        let Some(mut hosts) = self.active_hosts.get_mut(&key) else { return true };
        hosts.remove(&stream_id.host);
        hosts.is_empty()
    }

    async fn process_packet(&self, region: Region, stream_id: StreamId, packet: SynchronizationPacket) {
        let account_id = stream_id.account_id.clone();
        let bucket = stream_id.bucket;

        match packet {
            SynchronizationPacket::Authenticated(p) => {
                self.touch_disconnect_timer(&stream_id);

                if self.hooks.session_id_matches(&stream_id, p.session_id.as_deref()) {
                    self.authenticated.insert(stream_id.clone(), true);
                    self.activate_host(&account_id, bucket, &stream_id.host);

                    let replicas = p.replicas.unwrap_or(1);
                    self.observer.on_connected(&account_id, bucket, replicas).await;
                    self.hooks.cancel_subscribe(&account_id, bucket).await;
                    if replicas == 1 {
                        self.hooks.cancel_account(&account_id).await;
                    }
                    self.hooks.latency_on_connected(&account_id, &region, bucket, &stream_id.host).await;
                }
            }

            SynchronizationPacket::Disconnected(_) => {
                self.last_seen.remove(&stream_id);
                self.authenticated.remove(&stream_id);
                self.orderer.lock().on_stream_closed(&stream_id);

                if self.deactivate_host(&stream_id) {
                    self.observer.on_disconnected(&account_id, bucket).await;
                    self.hooks.schedule_subscribe_on_disconnected(&account_id, Bucket::Zero).await;
                    self.hooks.schedule_subscribe_on_disconnected(&account_id, Bucket::One).await;
                    self.hooks.latency_on_disconnected(&account_id, &region, bucket, &stream_id.host).await;
                }
            }

            SynchronizationPacket::Status(p) => {
                self.touch_disconnect_timer(&stream_id);

                let is_authenticated = self.authenticated.get(&stream_id).map(|v| *v).unwrap_or(false);
                if !is_authenticated && !self.hooks.is_account_subscribing(&account_id, bucket) {
                    self.hooks.ensure_subscribe(&account_id, bucket).await;
                } else {
                    if let Some(connected) = p.connected {
                        self.observer.on_broker_connection_status_changed(&account_id, connected).await;
                    }
                    if let Some(health_status) = p.health_status.as_ref() {
                        self.observer.on_health_status(&account_id, health_status).await;
                    }
                }
            }

            SynchronizationPacket::Keepalive(_) => {}

            SynchronizationPacket::SynchronizationStarted(p) => {
                let Some(sync_id) = p.envelope.synchronization_id.clone() else { return };

                let specifications_updated = p.specifications_updated.unwrap_or(true);
                let positions_updated = p.positions_updated.unwrap_or(true);
                let orders_updated = p.orders_updated.unwrap_or(true);

                self.sync_flags.insert(
                    sync_id.clone(),
                    SyncFlags {
                        specifications_updated,
                        positions_updated,
                        orders_updated,
                        positions_synced_fired: false,
                        orders_synced_fired: false,
                    },
                );
                self.sync_owner.insert(sync_id.clone(), (account_id.clone(), bucket));

                self.observer
                    .on_synchronization_started(&account_id, specifications_updated, positions_updated, orders_updated, &sync_id)
                    .await;
            }

            SynchronizationPacket::AccountInformation(p) => {
                if let Some(info) = p.account_information.as_ref() {
                    self.observer.on_account_information_updated(&account_id, info).await;
                }

                if let Some(sync_id) = p.envelope.synchronization_id.clone() {
                    self.fire_implicit_synchronized_from_account_info(&account_id, &sync_id).await;
                }
            }

            SynchronizationPacket::Positions(p) => {
                self.observer.on_positions_replaced(&account_id, &p.positions).await;

                if let Some(sync_id) = p.envelope.synchronization_id.clone() {
                    self.mark_positions_synced(&sync_id).await;
                    self.observer.on_positions_synchronized(&account_id, &sync_id).await;
                    self.fire_implicit_orders_synced_if_needed(&account_id, &sync_id).await;
                }
            }

            SynchronizationPacket::Orders(p) => {
                self.observer.on_pending_orders_replaced(&account_id, &p.orders).await;

                if let Some(sync_id) = p.envelope.synchronization_id.clone() {
                    self.mark_orders_synced(&sync_id).await;
                    self.observer.on_pending_orders_synchronized(&account_id, &sync_id).await;
                }
            }

            SynchronizationPacket::HistoryOrders(p) => {
                for order in &p.history_orders {
                    self.observer.on_history_order_added(&account_id, order).await;
                }
            }

            SynchronizationPacket::Deals(p) => {
                for deal in &p.deals {
                    self.observer.on_deal_added(&account_id, deal).await;
                }
            }

            SynchronizationPacket::Update(p) => {
                if let Some(info) = p.account_information.as_ref() {
                    self.observer.on_account_information_updated(&account_id, info).await;
                }
                for position in &p.updated_positions {
                    self.observer.on_position_updated(&account_id, position).await;
                }
                for position_id in &p.removed_position_ids {
                    self.observer.on_position_removed(&account_id, position_id).await;
                }
                for order in &p.updated_order {
                    self.observer.on_pending_order_updated(&account_id, order).await;
                }
                for order_id in &p.completed_order_ids {
                    self.observer.on_pending_order_completed(&account_id, order_id).await;
                }
                for order in &p.history_orders {
                    self.observer.on_history_order_added(&account_id, order).await;
                }
                for deal in &p.deals {
                    self.observer.on_deal_added(&account_id, deal).await;
                }
                self.observer.on_update(&account_id).await;
            }

            SynchronizationPacket::DealSynchronizationFinished(p) => {
                let Some(sync_id) = p.envelope.synchronization_id.clone() else { return };

                self.observer.on_deals_synchronized(&account_id, &sync_id).await;
                self.hooks.latency_on_deals_synchronized(&account_id, &region, bucket, &stream_id.host).await;
                self.hooks.release_throttler_slot(&account_id, bucket, &sync_id).await;

                self.sync_flags.remove(&sync_id);
                self.sync_owner.remove(&sync_id);
            }

            SynchronizationPacket::OrderSynchronizationFinished(p) => {
                if let Some(sync_id) = p.envelope.synchronization_id.clone() {
                    self.observer.on_history_orders_synchronized(&account_id, &sync_id).await;
                }
            }

            SynchronizationPacket::Specifications(p) => {
                self.observer
                    .on_symbol_specifications_updated(&account_id, &p.specifications, &p.removed_symbols)
                    .await;
                for specification in &p.specifications {
                    self.observer.on_symbol_specification_updated(&account_id, specification).await;
                }
                for symbol in &p.removed_symbols {
                    self.observer.on_symbol_specification_removed(&account_id, symbol).await;
                }
            }

            SynchronizationPacket::Prices(p) => {
                if !p.prices.is_empty() {
                    self.observer
                        .on_symbol_prices_updated(
                            &account_id,
                            &p.prices,
                            p.equity,
                            p.margin,
                            p.free_margin,
                            p.margin_level,
                            p.account_currency_exchange_rate,
                        )
                        .await;
                }
                if !p.candles.is_empty() {
                    self.observer.on_candles_updated(&account_id, &p.candles).await;
                }
                if !p.ticks.is_empty() {
                    self.observer.on_ticks_updated(&account_id, &p.ticks).await;
                }
                if !p.books.is_empty() {
                    self.observer.on_books_updated(&account_id, &p.books).await;
                }
                for price in &p.prices {
                    self.observer.on_symbol_price_updated(&account_id, price).await;
                }
            }

            SynchronizationPacket::DowngradeSubscription(p) => {
                self.observer
                    .on_subscription_downgraded(&account_id, p.symbol.as_deref(), &p.updates, &p.unsubscriptions)
                    .await;
            }

            SynchronizationPacket::Noop(_) => {}
        }
    }

    async fn fire_implicit_synchronized_from_account_info(&self, account_id: &AccountId, sync_id: &SyncId) {
        let (fire_positions, fire_orders) = {
            let Some(mut flags) = self.sync_flags.get_mut(sync_id) else { return };
            let fire_positions = !flags.positions_updated && !flags.positions_synced_fired;
            if fire_positions {
                flags.positions_synced_fired = true;
            }
            let fire_orders = !flags.orders_updated && !flags.orders_synced_fired;
            if fire_orders {
                flags.orders_synced_fired = true;
            }
            (fire_positions, fire_orders)
        };

        if fire_positions {
            self.observer.on_positions_synchronized(account_id, sync_id).await;
        }
        if fire_orders {
            self.observer.on_pending_orders_synchronized(account_id, sync_id).await;
        }
    }

    async fn mark_positions_synced(&self, sync_id: &SyncId) {
        if let Some(mut flags) = self.sync_flags.get_mut(sync_id) {
            flags.positions_synced_fired = true;
        }
    }

    async fn mark_orders_synced(&self, sync_id: &SyncId) {
        if let Some(mut flags) = self.sync_flags.get_mut(sync_id) {
            flags.orders_synced_fired = true;
        }
    }

    async fn fire_implicit_orders_synced_if_needed(&self, account_id: &AccountId, sync_id: &SyncId) {
        let fire = {
            let Some(mut flags) = self.sync_flags.get_mut(sync_id) else { return };
            let fire = !flags.orders_updated && !flags.orders_synced_fired;
            if fire {
                flags.orders_synced_fired = true;
            }
            fire
        };

        if fire {
            self.observer.on_pending_orders_synchronized(account_id, sync_id).await;
        }
    }

    /// For tests / metrics: whether the dispatcher considers `sync_id` still
    /// in flight.
    pub fn has_synchronization(&self, sync_id: &SyncId) -> bool {
        self.sync_flags.contains_key(sync_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn push(&self, s: impl Into<String>) {
            self.events.lock().unwrap().push(s.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Observer for RecordingObserver {
        async fn on_connected(&self, account_id: &AccountId, _instance_index: Bucket, _replicas: u8) {
            self.push(format!("connected:{account_id}"));
        }
        async fn on_disconnected(&self, account_id: &AccountId, _instance_index: Bucket) {
            self.push(format!("disconnected:{account_id}"));
        }
        async fn on_synchronization_started(
            &self,
            account_id: &AccountId,
            _s: bool,
            _p: bool,
            _o: bool,
            sync_id: &SyncId,
        ) {
            self.push(format!("started:{account_id}:{sync_id}"));
        }
        async fn on_positions_replaced(&self, account_id: &AccountId, _positions: &[Value]) {
            self.push(format!("positions:{account_id}"));
        }
        async fn on_positions_synchronized(&self, account_id: &AccountId, _sync_id: &SyncId) {
            self.push(format!("positions_synced:{account_id}"));
        }
        async fn on_pending_orders_replaced(&self, account_id: &AccountId, _orders: &[Value]) {
            self.push(format!("orders:{account_id}"));
        }
        async fn on_pending_orders_synchronized(&self, account_id: &AccountId, _sync_id: &SyncId) {
            self.push(format!("orders_synced:{account_id}"));
        }
        async fn on_deals_synchronized(&self, account_id: &AccountId, _sync_id: &SyncId) {
            self.push(format!("deals_synced:{account_id}"));
        }
    }

    #[derive(Default)]
    struct NoopHooks {
        ensure_subscribe_calls: StdMutex<usize>,
        released: StdMutex<Vec<SyncId>>,
    }

    #[async_trait]
    impl DispatcherHooks for NoopHooks {
        async fn cancel_subscribe(&self, _account_id: &AccountId, _bucket: Bucket) {}
        async fn cancel_account(&self, _account_id: &AccountId) {}
        async fn schedule_subscribe_on_timeout(&self, _account_id: &AccountId, _bucket: Bucket) {}
        async fn schedule_subscribe_on_disconnected(&self, _account_id: &AccountId, _bucket: Bucket) {}
        async fn ensure_subscribe(&self, _account_id: &AccountId, _bucket: Bucket) {
            *self.ensure_subscribe_calls.lock().unwrap() += 1;
        }
        fn is_account_subscribing(&self, _account_id: &AccountId, _bucket: Bucket) -> bool {
            false
        }
        fn session_id_matches(&self, _stream_id: &StreamId, _packet_session_id: Option<&str>) -> bool {
            true
        }
        async fn latency_on_connected(&self, _a: &AccountId, _r: &Region, _b: Bucket, _h: &Host) {}
        async fn latency_on_disconnected(&self, _a: &AccountId, _r: &Region, _b: Bucket, _h: &Host) {}
        async fn latency_on_deals_synchronized(&self, _a: &AccountId, _r: &Region, _b: Bucket, _h: &Host) {}
        async fn release_throttler_slot(&self, _a: &AccountId, _b: Bucket, sync_id: &SyncId) {
            self.released.lock().unwrap().push(sync_id.clone());
        }
    }

    fn stream_id() -> StreamId {
        StreamId::new("A".into(), Bucket::Zero, "h1".into())
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn packet_reorder_delivers_in_spec_order() {
        // scenario 3 from spec.md §8, through the full dispatcher path
        let hooks = Arc::new(NoopHooks::default());
        let observer = Arc::new(RecordingObserver::default());
        let d = Arc::new(EventDispatcher::new(hooks, observer.clone(), Duration::from_secs(60)));

        let started: SynchronizationPacket = serde_json::from_value(json!({
            "type": "synchronizationStarted", "accountId": "A", "sequenceNumber": 1,
            "sequenceTimestamp": "2023-01-01T00:00:00Z", "synchronizationId": "s1",
        }))
        .unwrap();
        let orders: SynchronizationPacket = serde_json::from_value(json!({
            "type": "orders", "accountId": "A", "orders": [], "sequenceNumber": 3,
            "sequenceTimestamp": "2023-01-01T00:00:02Z", "synchronizationId": "s1",
        }))
        .unwrap();
        let positions: SynchronizationPacket = serde_json::from_value(json!({
            "type": "positions", "accountId": "A", "positions": [], "sequenceNumber": 2,
            "sequenceTimestamp": "2023-01-01T00:00:01Z", "synchronizationId": "s1",
        }))
        .unwrap();

        d.queue_packet("vint-hill".into(), stream_id(), started);
        d.queue_packet("vint-hill".into(), stream_id(), orders);
        d.queue_packet("vint-hill".into(), stream_id(), positions);

        settle().await;

        let events = observer.events();
        let started_idx = events.iter().position(|e| e == "started:A:s1").unwrap();
        let positions_idx = events.iter().position(|e| e == "positions:A").unwrap();
        let orders_idx = events.iter().position(|e| e == "orders:A").unwrap();
        assert!(started_idx < positions_idx, "started must precede positions");
        assert!(positions_idx < orders_idx, "positions must precede orders (delivered after reordering)");
    }

    #[tokio::test]
    async fn authenticated_then_disconnected_round_trip() {
        let hooks = Arc::new(NoopHooks::default());
        let observer = Arc::new(RecordingObserver::default());
        let d = Arc::new(EventDispatcher::new(hooks.clone(), observer.clone(), Duration::from_secs(60)));

        let authenticated: SynchronizationPacket = serde_json::from_value(json!({
            "type": "authenticated", "accountId": "A", "sessionId": "s1", "replicas": 2,
        }))
        .unwrap();
        d.queue_packet("vint-hill".into(), stream_id(), authenticated);
        settle().await;
        assert!(observer.events().contains(&"connected:A".to_string()));

        let disconnected: SynchronizationPacket = serde_json::from_value(json!({
            "type": "disconnected", "accountId": "A",
        }))
        .unwrap();
        d.queue_packet("vint-hill".into(), stream_id(), disconnected);
        settle().await;
        assert!(observer.events().contains(&"disconnected:A".to_string()));
    }

    #[tokio::test]
    async fn deal_synchronization_finished_releases_throttler_slot() {
        let hooks = Arc::new(NoopHooks::default());
        let observer = Arc::new(RecordingObserver::default());
        let d = Arc::new(EventDispatcher::new(hooks.clone(), observer.clone(), Duration::from_secs(60)));

        let finished: SynchronizationPacket = serde_json::from_value(json!({
            "type": "dealSynchronizationFinished", "accountId": "A", "synchronizationId": "s1",
        }))
        .unwrap();
        d.queue_packet("vint-hill".into(), stream_id(), finished);
        settle().await;

        assert_eq!(hooks.released.lock().unwrap().as_slice(), &[SyncId::from("s1")]);
        assert!(observer.events().contains(&"deals_synced:A".to_string()));
    }

    #[tokio::test]
    async fn positions_updated_false_fires_synchronized_implicitly_from_account_information() {
        let hooks = Arc::new(NoopHooks::default());
        let observer = Arc::new(RecordingObserver::default());
        let d = Arc::new(EventDispatcher::new(hooks.clone(), observer.clone(), Duration::from_secs(60)));

        let started: SynchronizationPacket = serde_json::from_value(json!({
            "type": "synchronizationStarted", "accountId": "A", "synchronizationId": "s1",
            "positionsUpdated": false, "ordersUpdated": true,
        }))
        .unwrap();
        d.queue_packet("vint-hill".into(), stream_id(), started);
        settle().await;

        let info: SynchronizationPacket = serde_json::from_value(json!({
            "type": "accountInformation", "accountId": "A", "synchronizationId": "s1",
            "accountInformation": {"balance": 100},
        }))
        .unwrap();
        d.queue_packet("vint-hill".into(), stream_id(), info);
        settle().await;

        assert!(observer.events().contains(&"positions_synced:A".to_string()));
        assert!(!observer.events().contains(&"orders_synced:A".to_string()));
    }
}

//! Subscription Manager (C4, spec.md §4.3): owns the retry loop that keeps
//! re-issuing `subscribe` until the server confirms authentication, and the
//! event hooks that restart it around timeouts/disconnects/reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::ids::{AccountId, Bucket};
use crate::packets::{LimitType, RateLimitMetadata};

const INITIAL_BACKOFF: Duration = Duration::from_secs(3);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What the subscription manager needs from the websocket client (C6) to
/// drive its retry loop, kept abstract so this module doesn't depend on the
/// concrete socket/slot machinery.
#[async_trait]
pub trait SubscribeTransport: Send + Sync + 'static {
    async fn subscribe(&self, account_id: &AccountId, bucket: Bucket) -> Result<(), CoreError>;
    async fn unbind_account(&self, account_id: &AccountId, bucket: Bucket);
    async fn lock_socket_instance(&self, account_id: &AccountId, bucket: Bucket, metadata: &RateLimitMetadata);
    async fn is_slot_connected(&self, account_id: &AccountId, bucket: Bucket) -> bool;
}

type Key = (AccountId, Bucket);

struct LoopHandle {
    generation: AtomicU64,
    should_retry: AtomicBool,
    is_disconnected_retry_mode: AtomicBool,
    is_subscribing: AtomicBool,
    cancel: Notify,
}

impl LoopHandle {
    fn new(generation: u64, disconnected_retry_mode: bool) -> Self {
        Self {
            generation: AtomicU64::new(generation),
            should_retry: AtomicBool::new(true),
            is_disconnected_retry_mode: AtomicBool::new(disconnected_retry_mode),
            is_subscribing: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }
}

/// Sleep `duration`, bailing out early (returning `false`) if the loop is
/// cancelled meanwhile.
async fn cancellable_sleep(duration: Duration, cancel: &Notify) -> bool {
    tokio::select! {
        _ = cancel.notified() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub struct SubscriptionManager<T: SubscribeTransport> {
    transport: Arc<T>,
    states: Arc<DashMap<Key, Arc<LoopHandle>>>,
    subscription_active: Arc<DashMap<AccountId, bool>>,
    next_generation: Arc<AtomicU64>,
}

impl<T: SubscribeTransport> Clone for SubscriptionManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            states: self.states.clone(),
            subscription_active: self.subscription_active.clone(),
            next_generation: self.next_generation.clone(),
        }
    }
}

impl<T: SubscribeTransport> SubscriptionManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            states: Arc::new(DashMap::new()),
            subscription_active: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `scheduleSubscribe(accountId, bucket, isDisconnectedRetryMode)`.
    pub fn schedule_subscribe(&self, account_id: AccountId, bucket: Bucket, is_disconnected_retry_mode: bool) {
        let key: Key = (account_id.clone(), bucket);
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel);
        let handle = Arc::new(LoopHandle::new(generation, is_disconnected_retry_mode));

        if let Some((_, old)) = self.states.remove(&key) {
            old.should_retry.store(false, Ordering::Release);
            old.cancel.notify_waiters();
        }
        self.states.insert(key.clone(), handle.clone());

        let transport = self.transport.clone();
        let subscription_active = self.subscription_active.clone();
        tokio::spawn(async move {
            run_retry_loop(transport, subscription_active, key, handle).await;
        });
    }

    /// `cancelSubscribe(accountId:bucket)`.
    pub fn cancel_subscribe(&self, account_id: &AccountId, bucket: Bucket) {
        if let Some((_, handle)) = self.states.remove(&(account_id.clone(), bucket)) {
            handle.should_retry.store(false, Ordering::Release);
            handle.cancel.notify_waiters();
        }
    }

    /// `cancelAccount(accountId)`: cancels every bucket's retry loop.
    pub fn cancel_account(&self, account_id: &AccountId) {
        let keys: Vec<Key> = self
            .states
            .iter()
            .filter(|e| &e.key().0 == account_id)
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            self.cancel_subscribe(&key.0, key.1);
        }

        self.subscription_active.remove(account_id);
    }

    /// `onTimeout(accountId, bucket)`.
    pub async fn on_timeout(&self, account_id: AccountId, bucket: Bucket) {
        if self.transport.is_slot_connected(&account_id, bucket).await {
            self.schedule_subscribe(account_id, bucket, true);
        }
    }

    /// `onDisconnected(accountId, bucket)`.
    pub async fn on_disconnected(&self, account_id: AccountId, bucket: Bucket) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(1_000..=5_000));
        tokio::time::sleep(jitter).await;
        self.schedule_subscribe(account_id, bucket, true);
    }

    /// `onReconnected(bucket, slotIndex, reconnectAccountIds)`. `slot_index`
    /// is accepted for parity with the spec's signature; this manager tracks
    /// loops by `(accountId, bucket)` rather than by slot, so cancellation
    /// of "subscribes owned by this slot" is approximated by cancelling the
    /// named accounts at this bucket.
    pub async fn on_reconnected(&self, bucket: Bucket, _slot_index: usize, reconnect_account_ids: Vec<AccountId>) {
        for account_id in &reconnect_account_ids {
            self.cancel_subscribe(account_id, bucket);
        }

        for account_id in reconnect_account_ids {
            while self.is_account_subscribing(&account_id, Some(bucket)) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=5_000));
            let seen_generation = self.next_generation.load(Ordering::Acquire);
            tokio::time::sleep(jitter).await;

            // if nothing else (re-)scheduled this account+bucket while we slept
            let still_unscheduled = !self.states.contains_key(&(account_id.clone(), bucket));
            if still_unscheduled && self.next_generation.load(Ordering::Acquire) == seen_generation {
                self.schedule_subscribe(account_id, bucket, false);
            }
        }
    }

    pub fn is_account_subscribing(&self, account_id: &AccountId, bucket: Option<Bucket>) -> bool {
        self.states.iter().any(|e| {
            let (a, b) = e.key();
            a == account_id && bucket.map_or(true, |bucket| *b == bucket) && e.value().should_retry.load(Ordering::Acquire)
        })
    }

    pub fn is_disconnected_retry_mode(&self, account_id: &AccountId, bucket: Bucket) -> bool {
        self.states
            .get(&(account_id.clone(), bucket))
            .map(|h| h.is_disconnected_retry_mode.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn is_subscription_active(&self, account_id: &AccountId) -> bool {
        self.subscription_active.get(account_id).map(|v| *v).unwrap_or(false)
    }
}

async fn run_retry_loop<T: SubscribeTransport>(
    transport: Arc<T>,
    subscription_active: Arc<DashMap<AccountId, bool>>,
    key: Key,
    handle: Arc<LoopHandle>,
) {
    let (account_id, bucket) = key;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if !handle.should_retry.load(Ordering::Acquire) {
            return;
        }

        handle.is_subscribing.store(true, Ordering::Release);
        let result = transport.subscribe(&account_id, bucket).await;
        handle.is_subscribing.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                subscription_active.insert(account_id.clone(), true);
                if !cancellable_sleep(backoff, &handle.cancel).await {
                    return;
                }
            }
            Err(CoreError::TooManyRequests { metadata }) => {
                handle_rate_limit(&transport, &account_id, bucket, &metadata, backoff, &handle.cancel).await;
            }
            Err(err) => {
                debug!(%account_id, %bucket, error = %err, "subscribe attempt failed, retrying");
                if !cancellable_sleep(backoff, &handle.cancel).await {
                    return;
                }
            }
        }

        backoff = (backoff * 2).min(MAX_BACKOFF);

        if !handle.should_retry.load(Ordering::Acquire) {
            return;
        }
    }
}

async fn handle_rate_limit<T: SubscribeTransport>(
    transport: &Arc<T>,
    account_id: &AccountId,
    bucket: Bucket,
    metadata: &RateLimitMetadata,
    backoff: Duration,
    cancel: &Notify,
) {
    match metadata.limit_type {
        LimitType::AccountSubscriptionsPerUserPerServer | LimitType::AccountSubscriptionsPerServer => {
            transport.unbind_account(account_id, bucket).await;
            transport.lock_socket_instance(account_id, bucket, metadata).await;
        }
        LimitType::AccountSubscriptionsPerUser => {
            warn!(%account_id, %bucket, "per-user subscription limit hit, honoring recommendedRetryTime");
            if let Some(retry_at) = metadata.recommended_retry_time {
                sleep_until(retry_at, cancel).await;
            }
        }
        LimitType::RequestRatePerUser => {
            if let Some(retry_at) = metadata.recommended_retry_time {
                let now = chrono::Utc::now();
                if retry_at > now + chrono::Duration::from_std(backoff).unwrap_or_default() {
                    sleep_until(retry_at, cancel).await;
                }
            }
        }
    }
}

async fn sleep_until(retry_at: chrono::DateTime<chrono::Utc>, cancel: &Notify) {
    let now = chrono::Utc::now();
    if let Ok(remaining) = (retry_at - now).to_std() {
        cancellable_sleep(remaining, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MockTransport {
        subscribe_calls: StdMutex<Vec<(AccountId, Bucket)>>,
        unbind_calls: StdMutex<Vec<(AccountId, Bucket)>>,
        lock_calls: StdMutex<Vec<(AccountId, Bucket)>>,
        responses: StdMutex<Vec<Result<(), CoreError>>>,
        connected: StdMutex<bool>,
    }

    #[async_trait]
    impl SubscribeTransport for MockTransport {
        async fn subscribe(&self, account_id: &AccountId, bucket: Bucket) -> Result<(), CoreError> {
            self.subscribe_calls.lock().unwrap().push((account_id.clone(), bucket));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(())
            } else {
                responses.remove(0)
            }
        }

        async fn unbind_account(&self, account_id: &AccountId, bucket: Bucket) {
            self.unbind_calls.lock().unwrap().push((account_id.clone(), bucket));
        }

        async fn lock_socket_instance(&self, account_id: &AccountId, bucket: Bucket, _metadata: &RateLimitMetadata) {
            self.lock_calls.lock().unwrap().push((account_id.clone(), bucket));
        }

        async fn is_slot_connected(&self, _account_id: &AccountId, _bucket: Bucket) -> bool {
            *self.connected.lock().unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_subscribe_retries_on_backoff_until_cancelled() {
        let transport = Arc::new(MockTransport::default());
        let mgr = SubscriptionManager::new(transport.clone());

        mgr.schedule_subscribe("A".into(), Bucket::Zero, false);
        tokio::task::yield_now().await;
        assert_eq!(transport.subscribe_calls.lock().unwrap().len(), 1);
        assert!(mgr.is_subscription_active(&"A".into()));

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.subscribe_calls.lock().unwrap().len(), 2, "retries after backoff while awaiting auth confirmation");

        mgr.cancel_subscribe(&"A".into(), Bucket::Zero);
        let calls_after_cancel = transport.subscribe_calls.lock().unwrap().len();
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.subscribe_calls.lock().unwrap().len(), calls_after_cancel, "cancelled loop stops retrying");
    }

    #[tokio::test(start_paused = true)]
    async fn per_server_rate_limit_unbinds_and_locks_then_keeps_retrying() {
        let transport = Arc::new(MockTransport::default());
        transport.responses.lock().unwrap().push(Err(CoreError::TooManyRequests {
            metadata: RateLimitMetadata {
                limit_type: LimitType::AccountSubscriptionsPerServer,
                recommended_retry_time: None,
                locked_at_accounts: None,
            },
        }));
        let mgr = SubscriptionManager::new(transport.clone());

        mgr.schedule_subscribe("A".into(), Bucket::Zero, false);
        tokio::task::yield_now().await;

        assert_eq!(transport.unbind_calls.lock().unwrap().len(), 1);
        assert_eq!(transport.lock_calls.lock().unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.subscribe_calls.lock().unwrap().len(), 2, "loop continues retrying after lock");
    }

    #[tokio::test(start_paused = true)]
    async fn on_timeout_reschedules_only_if_slot_still_connected() {
        let transport = Arc::new(MockTransport::default());
        *transport.connected.lock().unwrap() = false;
        let mgr = SubscriptionManager::new(transport.clone());

        mgr.on_timeout("A".into(), Bucket::Zero).await;
        tokio::task::yield_now().await;
        assert!(!mgr.is_account_subscribing(&"A".into(), None), "slot not connected: no reschedule");

        *transport.connected.lock().unwrap() = true;
        mgr.on_timeout("A".into(), Bucket::Zero).await;
        tokio::task::yield_now().await;
        assert!(mgr.is_account_subscribing(&"A".into(), None));
    }

    #[tokio::test(start_paused = true)]
    async fn on_disconnected_waits_jitter_then_schedules_in_disconnected_retry_mode() {
        let transport = Arc::new(MockTransport::default());
        let mgr = SubscriptionManager::new(transport.clone());

        let mgr2 = mgr.clone();
        let handle = tokio::spawn(async move {
            mgr2.on_disconnected("A".into(), Bucket::Zero).await;
        });

        tokio::time::advance(Duration::from_secs(6)).await;
        handle.await.unwrap();

        assert!(mgr.is_disconnected_retry_mode(&"A".into(), Bucket::Zero));
    }

    #[tokio::test(start_paused = true)]
    async fn on_reconnected_cancels_then_reschedules_named_accounts() {
        let transport = Arc::new(MockTransport::default());
        let mgr = SubscriptionManager::new(transport.clone());

        mgr.schedule_subscribe("A".into(), Bucket::Zero, false);
        tokio::task::yield_now().await;
        let calls_before = transport.subscribe_calls.lock().unwrap().len();

        let mgr2 = mgr.clone();
        let handle = tokio::spawn(async move {
            mgr2.on_reconnected(Bucket::Zero, 0, vec!["A".into()]).await;
        });

        tokio::time::advance(Duration::from_secs(6)).await;
        handle.await.unwrap();

        assert!(mgr.is_account_subscribing(&"A".into(), Some(Bucket::Zero)));
        assert!(
            transport.subscribe_calls.lock().unwrap().len() > calls_before,
            "fresh loop issued a new subscribe after reconnect"
        );
    }

    #[tokio::test]
    async fn cancel_account_stops_every_bucket() {
        let transport = Arc::new(MockTransport::default());
        let mgr = SubscriptionManager::new(transport.clone());

        mgr.schedule_subscribe("A".into(), Bucket::Zero, false);
        mgr.schedule_subscribe("A".into(), Bucket::One, false);
        tokio::task::yield_now().await;

        mgr.cancel_account(&"A".into());
        assert!(!mgr.is_account_subscribing(&"A".into(), None));
        assert!(!mgr.is_subscription_active(&"A".into()));
    }
}

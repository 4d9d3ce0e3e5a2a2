//! Socket slot + connection lifecycle (part of C6, spec.md §4.6 "Connection
//! lifecycle"). One [`SocketSlot`] is one bidirectional channel keyed by
//! `(region, bucket, slotIndex)`; the multiplexer (`client::mod`) owns the
//! collection of slots, each slot owns its own `requestResolves` map,
//! `synchronizationThrottler` (C3), and reconnect state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};
use url::Url;

use crate::config::SynchronizationThrottlerConfig;
use crate::errors::{CoreError, CoreResult};
use crate::ids::{AccountId, Bucket, Region};
use crate::packets::{normalize_times, parse_server_message, ProcessingError, ResponseEnvelope, ServerMessage, SynchronizationPacket};
use crate::throttler::{RegionActivity, SynchronizationThrottler};

pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Random alphanumeric token: 32-char `requestId`/`sessionId`, shorter
/// `clientId` (spec.md §6 connect-time query params, §6 request envelope).
pub fn random_token(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// The `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER` / `..._USER_PER_SERVER` lock
/// attached to one slot (spec.md §4.6 `lockSocketInstance`).
#[derive(Debug, Clone)]
pub struct PerSlotLock {
    pub locked_at: Instant,
    pub recommended_retry_time: Option<DateTime<Utc>>,
}

impl PerSlotLock {
    fn is_active(&self) -> bool {
        self.recommended_retry_time.map_or(true, |t| t > Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Connecting,
    Connected,
    Closed,
}

/// One server-facing frame resolved out of a slot's pending requests
/// (spec.md §4.6 "Response matching").
pub enum RpcOutcome {
    Response(ResponseEnvelope),
    ProcessingError(ProcessingError),
}

/// Events a slot's reader task hands back to the multiplexer: connection
/// milestones (so the multiplexer can run reconnect fan-out, §4.6 "On first
/// `connect`... on subsequent `connect`/`reconnect`...") and synchronization
/// packets (so the multiplexer can run packet intake, §4.6).
pub enum SlotEvent {
    Connected { first: bool },
    Disconnected,
    Synchronization(SynchronizationPacket),
}

/// A connected bidirectional channel, keyed by `(region, bucket,
/// slotIndex)` (spec.md §3 Data Model "Socket slot").
pub struct SocketSlot {
    pub region: Region,
    pub bucket: Bucket,
    pub slot_index: usize,
    session_id: SyncMutex<String>,
    client_id: SyncMutex<String>,
    reconnect_wait: SyncMutex<Duration>,
    state: SyncMutex<SlotState>,
    sink: AsyncMutex<Option<WsSink>>,
    pub request_resolves: DashMap<String, oneshot::Sender<RpcOutcome>>,
    pub throttler: Arc<SynchronizationThrottler>,
    slot_lock: SyncMutex<Option<PerSlotLock>>,
    pub accounts: DashMap<AccountId, ()>,
    is_reconnecting: AtomicBool,
    closed: AtomicBool,
    events: flume::Sender<(usize, SlotEvent)>,
    connected_notify: Notify,
}

impl SocketSlot {
    pub fn new(
        region: Region,
        bucket: Bucket,
        slot_index: usize,
        throttler_config: SynchronizationThrottlerConfig,
        region_activity: Arc<RegionActivity>,
        events: flume::Sender<(usize, SlotEvent)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            throttler: Arc::new(SynchronizationThrottler::new(throttler_config, region.clone(), bucket, region_activity)),
            region,
            bucket,
            slot_index,
            session_id: SyncMutex::new(random_token(32)),
            client_id: SyncMutex::new(random_token(20)),
            reconnect_wait: SyncMutex::new(RECONNECT_BASE),
            state: SyncMutex::new(SlotState::Connecting),
            sink: AsyncMutex::new(None),
            request_resolves: DashMap::new(),
            slot_lock: SyncMutex::new(None),
            accounts: DashMap::new(),
            is_reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            connected_notify: Notify::new(),
        })
    }

    pub fn session_id(&self) -> String {
        self.session_id.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock() == SlotState::Connected
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn bind_account(&self, account_id: AccountId) {
        self.accounts.insert(account_id, ());
    }

    pub fn unbind_account(&self, account_id: &AccountId) {
        self.accounts.remove(account_id);
    }

    pub fn bound_account_ids(&self) -> Vec<AccountId> {
        self.accounts.iter().map(|e| e.key().clone()).collect()
    }

    /// Attach a `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER`-class lock to this
    /// slot (spec.md §4.6 `lockSocketInstance`).
    pub fn lock(&self, recommended_retry_time: Option<DateTime<Utc>>) {
        *self.slot_lock.lock() = Some(PerSlotLock {
            locked_at: Instant::now(),
            recommended_retry_time,
        });
    }

    /// Whether this slot is currently barred from new-account admission by
    /// an active per-slot lock.
    pub fn is_locked(&self) -> bool {
        self.slot_lock.lock().as_ref().is_some_and(PerSlotLock::is_active)
    }

    /// Wait until the first `connect` event (or the slot closes). Used by
    /// `rpcRequest` step 3: "if not connected yet, connect or await the
    /// pending connect future".
    pub async fn await_connected(&self) {
        while !self.is_connected() && !self.closed.load(Ordering::Acquire) {
            self.connected_notify.notified().await;
        }
    }

    /// Open the socket and run the reconnect loop for as long as the slot
    /// isn't explicitly closed (spec.md §4.6 "Connection lifecycle").
    pub fn spawn_connection_loop(self: &Arc<Self>, url_source: Arc<dyn UrlSource>, auth_token: String) {
        let slot = self.clone();
        tokio::spawn(async move {
            slot.connection_loop(url_source, auth_token).await;
        });
    }

    async fn connection_loop(self: Arc<Self>, url_source: Arc<dyn UrlSource>, auth_token: String) {
        let mut first = true;

        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }

            match self.connect_once(url_source.as_ref(), &auth_token).await {
                Ok(stream) => {
                    *self.reconnect_wait.lock() = RECONNECT_BASE;
                    *self.state.lock() = SlotState::Connected;
                    self.connected_notify.notify_waiters();
                    let _ = self.events.send((self.slot_index, SlotEvent::Connected { first }));
                    first = false;

                    self.run_stream(stream).await;

                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    *self.state.lock() = SlotState::Connecting;
                    self.throttler.on_disconnect();
                    let _ = self.events.send((self.slot_index, SlotEvent::Disconnected));
                }
                Err(err) => {
                    warn!(region = %self.region, bucket = %self.bucket, slot = self.slot_index, error = %err, "socket connect failed");
                }
            }

            if self.closed.load(Ordering::Acquire) {
                return;
            }

            if self.is_reconnecting.swap(true, Ordering::AcqRel) {
                // a concurrent caller is already backing off; shouldn't
                // happen since this loop is the only reconnector, kept as a
                // defensive re-entry guard per spec.md §4.6.
                return;
            }

            let wait = {
                let mut w = self.reconnect_wait.lock();
                *w = (*w * 2).min(RECONNECT_CAP);
                *w
            };
            *self.session_id.lock() = random_token(32);
            *self.client_id.lock() = random_token(20);
            tokio::time::sleep(wait).await;
            self.is_reconnecting.store(false, Ordering::Release);
        }
    }

    async fn connect_once(&self, url_source: &dyn UrlSource, auth_token: &str) -> CoreResult<WsStream> {
        let mut url = url_source.resolve(&self.region, self.bucket).await?;
        let client_id = self.client_id.lock().clone();
        url.query_pairs_mut()
            .append_pair("auth-token", auth_token)
            .append_pair("clientId", &client_id)
            .append_pair("protocol", "3");

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(url.as_str())
            .header("Client-Id", &client_id)
            .header("Host", url.host_str().unwrap_or_default())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", tokio_tungstenite::tungstenite::handshake::client::generate_key())
            .body(())
            .map_err(|e| CoreError::internal(format!("bad websocket request: {e}")))?;

        let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
        debug!(region = %self.region, bucket = %self.bucket, slot = self.slot_index, "socket connected");
        Ok(stream)
    }

    async fn run_stream(self: &Arc<Self>, stream: WsStream) {
        let (sink, mut source) = stream.split();
        *self.sink.lock().await = Some(sink);

        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_text(&text),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(region = %self.region, bucket = %self.bucket, error = %err, "socket read error");
                    break;
                }
            }
        }

        *self.sink.lock().await = None;
        self.fail_all_pending();
    }

    fn handle_text(&self, text: &str) {
        let mut value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to parse server frame as JSON");
                return;
            }
        };

        // spec.md §4.6/§4.7: "Recursively normalize ISO times to absolute
        // timestamps" before anything downstream sees the frame.
        normalize_times(&mut value);

        match parse_server_message(value) {
            Ok(ServerMessage::Response(r)) => self.resolve_request(&r.request_id.clone(), RpcOutcome::Response(r)),
            Ok(ServerMessage::ProcessingError(e)) => self.resolve_request(&e.request_id.clone(), RpcOutcome::ProcessingError(e)),
            Ok(ServerMessage::Synchronization(packet)) => {
                let _ = self.events.send((self.slot_index, SlotEvent::Synchronization(packet)));
            }
            Err(err) => {
                warn!(error = %err, "failed to decode server frame");
            }
        }
    }

    fn resolve_request(&self, request_id: &str, outcome: RpcOutcome) {
        if let Some((_, tx)) = self.request_resolves.remove(request_id) {
            let _ = tx.send(outcome);
        } else {
            trace!(%request_id, "response for unknown/already-resolved request");
        }
    }

    fn fail_all_pending(&self) {
        let ids: Vec<String> = self.request_resolves.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.request_resolves.remove(&id);
        }
    }

    /// Register a pending request, send its envelope, and hand back the
    /// receiver the caller should race against a deadline (spec.md §4.6
    /// "Promise race/timeout idiom").
    pub async fn send_request(&self, request_id: String, payload: serde_json::Value) -> CoreResult<oneshot::Receiver<RpcOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.request_resolves.insert(request_id.clone(), tx);

        let text = serde_json::to_string(&payload)?;
        let mut sink_guard = self.sink.lock().await;
        let Some(sink) = sink_guard.as_mut() else {
            drop(sink_guard);
            self.request_resolves.remove(&request_id);
            return Err(CoreError::Closed);
        };

        if let Err(err) = sink.send(Message::Text(text)).await {
            drop(sink_guard);
            self.request_resolves.remove(&request_id);
            return Err(CoreError::from(err));
        }

        Ok(rx)
    }

    /// Cancel a pending request without waiting further (used on RPC
    /// timeout, spec.md §4.6: "On timeout, throw Timeout and delete the
    /// resolver").
    pub fn cancel_request(&self, request_id: &str) {
        self.request_resolves.remove(request_id);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        *self.state.lock() = SlotState::Closed;
        self.connected_notify.notify_waiters();
        self.throttler.on_disconnect();
        self.fail_all_pending();
    }
}

/// Resolves `(region, bucket) -> websocket URL`, abstracting over the
/// domain client (C1) so this module doesn't depend on it directly (kept
/// symmetric with `latency::RegionUrlResolver`).
#[async_trait::async_trait]
pub trait UrlSource: Send + Sync + 'static {
    async fn resolve(&self, region: &Region, bucket: Bucket) -> CoreResult<Url>;
}

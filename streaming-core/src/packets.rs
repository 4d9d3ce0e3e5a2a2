//! Wire protocol types (spec.md §3 Packet, §6 External interfaces) and the
//! ISO-8601 "normalize to absolute timestamps" pre-pass §4.6/§4.7 call for.
//!
//! The source treats packets as untyped associative arrays; §9 DESIGN NOTES
//! asks for "a tagged-variant packet type over the enumerated `type` field".
//! Structural/control fields (ids, sequence numbers, synchronization ids)
//! are fully typed; per-type domain payloads stay `serde_json::Value` since
//! typing MetaTrader's account/position/order/deal schemas is outside this
//! transport core's scope (spec.md §1 non-goals: not a trading-strategy or
//! data-analytics engine).

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AccountId, Bucket, Host, SyncId};

/// `TooManyRequestsError.metadata` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMetadata {
    #[serde(rename = "type")]
    pub limit_type: LimitType,
    pub recommended_retry_time: Option<DateTime<Utc>>,
    /// Present for `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER`: the account count
    /// the lock was taken against (spec.md §4.6 `lockSocketInstance`).
    #[serde(default)]
    pub locked_at_accounts: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
pub enum LimitType {
    #[strum(serialize = "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER")]
    #[serde(rename = "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER")]
    AccountSubscriptionsPerUser,
    #[strum(serialize = "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER")]
    #[serde(rename = "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER")]
    AccountSubscriptionsPerServer,
    #[strum(serialize = "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER_PER_SERVER")]
    #[serde(rename = "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER_PER_SERVER")]
    AccountSubscriptionsPerUserPerServer,
    #[strum(serialize = "LIMIT_REQUEST_RATE_PER_USER")]
    #[serde(rename = "LIMIT_REQUEST_RATE_PER_USER")]
    RequestRatePerUser,
}

/// `processingError.error` taxonomy tag (spec.md §6), kept distinct from
/// `CoreError` because it's the wire name, not our internal representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display)]
pub enum WireErrorKind {
    ValidationError,
    NotFoundError,
    NotSynchronizedError,
    TimeoutError,
    NotAuthenticatedError,
    TradeError,
    UnauthorizedError,
    TooManyRequestsError,
}

/// `processingError{requestId, error, message, details?, metadata?,
/// numericCode?, stringCode?}` (spec.md §6). Open Question #1 (SPEC_FULL.md
/// §12): canonicalize `stringCode`/`description` and `numericCode`/`error`
/// aliasing by accepting either on intake.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingError {
    pub request_id: String,
    pub error: WireErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub metadata: Option<RateLimitMetadata>,
    #[serde(default)]
    pub numeric_code: Option<i64>,
    #[serde(default)]
    pub string_code: Option<String>,
}

/// `response{requestId, accountId, timestamps?, ...result}` (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: String,
    #[serde(default)]
    pub account_id: Option<AccountId>,
    #[serde(default)]
    pub timestamps: Option<Value>,
    #[serde(flatten)]
    pub result: Value,
}

/// Client-to-server request envelope (spec.md §6).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: String,
    #[serde(rename = "type")]
    pub request_type: String,
    pub account_id: AccountId,
    pub application: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_index: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamps: RequestTimestamps,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTimestamps {
    pub client_processing_started: DateTime<Utc>,
}

/// Request types recognized on intake (spec.md §6). `ignored set` in
/// `rpcRequest` step 1 refers to `SUBSCRIBE | SYNCHRONIZE |
/// REFRESH_MARKET_DATA_SUBSCRIPTIONS | UNSUBSCRIBE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum RequestType {
    Subscribe,
    Unsubscribe,
    Synchronize,
    WaitSynchronized,
    Trade,
    RemoveApplication,
    SubscribeToMarketData,
    RefreshMarketDataSubscriptions,
    UnsubscribeFromMarketData,
    GetAccountInformation,
    GetPositions,
    GetPosition,
    GetOrders,
    GetOrder,
    GetHistoryOrdersByTicket,
    GetHistoryOrdersByPosition,
    GetHistoryOrdersByTimeRange,
    GetDealsByTicket,
    GetDealsByPosition,
    GetDealsByTimeRange,
    GetSymbols,
    GetSymbolSpecification,
    GetSymbolPrice,
    GetCandle,
    GetTick,
    GetBook,
    GetServerTime,
    CalculateMargin,
    SaveUptime,
}

impl RequestType {
    /// §4.6 `rpcRequest` step 1's "ignored set": these request types are
    /// never rewritten to the active-instance replica/bucket.
    pub fn is_active_instance_rewrite_ignored(self) -> bool {
        matches!(
            self,
            RequestType::Subscribe
                | RequestType::Synchronize
                | RequestType::RefreshMarketDataSubscriptions
                | RequestType::Unsubscribe
        )
    }

    /// `subscribe`/`trade` requests are not retried on failure (§4.6 step 4).
    pub fn is_retry_exempt(self) -> bool {
        matches!(self, RequestType::Subscribe | RequestType::Trade)
    }
}

/// Synchronization-channel wire types recognized on intake (spec.md §6, §4.7).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SynchronizationPacket {
    Authenticated(AuthenticatedPacket),
    Disconnected(DisconnectedPacket),
    Status(StatusPacket),
    Keepalive(EnvelopePacket),
    SynchronizationStarted(SynchronizationStartedPacket),
    AccountInformation(AccountInformationPacket),
    Positions(PositionsPacket),
    Orders(OrdersPacket),
    HistoryOrders(HistoryOrdersPacket),
    Deals(DealsPacket),
    Update(UpdatePacket),
    DealSynchronizationFinished(SyncFinishedPacket),
    OrderSynchronizationFinished(SyncFinishedPacket),
    Specifications(SpecificationsPacket),
    Prices(PricesPacket),
    DowngradeSubscription(DowngradeSubscriptionPacket),
    /// Not a wire type: packets are rewritten to this when their
    /// `synchronizationId` no longer matches the slot's active set (§4.6
    /// packet intake), so the orderer/dispatcher drop them silently.
    Noop(EnvelopePacket),
}

/// Fields common to every synchronization packet (spec.md §3 Packet).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub account_id: AccountId,
    #[serde(default)]
    pub instance_index: Option<u8>,
    #[serde(default)]
    pub host: Option<Host>,
    #[serde(default)]
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub sequence_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synchronization_id: Option<SyncId>,
}

macro_rules! packet_with_envelope {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            #[serde(flatten)]
            pub envelope: Envelope,
            $(#[serde(default)] pub $field: $ty,)*
        }
    };
}

packet_with_envelope!(EnvelopePacket {});
packet_with_envelope!(AuthenticatedPacket { session_id: Option<String>, replicas: Option<u8> });
packet_with_envelope!(DisconnectedPacket {});
packet_with_envelope!(StatusPacket { connected: Option<bool>, health_status: Option<Value>, authenticated: Option<bool> });
packet_with_envelope!(SynchronizationStartedPacket {
    specifications_updated: Option<bool>,
    positions_updated: Option<bool>,
    orders_updated: Option<bool>,
});
packet_with_envelope!(AccountInformationPacket { account_information: Option<Value> });
packet_with_envelope!(PositionsPacket { positions: Vec<Value> });
packet_with_envelope!(OrdersPacket { orders: Vec<Value> });
packet_with_envelope!(HistoryOrdersPacket { history_orders: Vec<Value> });
packet_with_envelope!(DealsPacket { deals: Vec<Value> });
packet_with_envelope!(SyncFinishedPacket {});
packet_with_envelope!(SpecificationsPacket { specifications: Vec<Value>, removed_symbols: Vec<String> });
packet_with_envelope!(PricesPacket {
    prices: Vec<Value>,
    candles: Vec<Value>,
    ticks: Vec<Value>,
    books: Vec<Value>,
    equity: Option<f64>,
    margin: Option<f64>,
    free_margin: Option<f64>,
    margin_level: Option<f64>,
    account_currency_exchange_rate: Option<f64>,
});
packet_with_envelope!(DowngradeSubscriptionPacket {
    symbol: Option<String>,
    updates: Vec<Value>,
    unsubscriptions: Vec<Value>,
});

packet_with_envelope!(UpdatePacket {
    account_information: Option<Value>,
    updated_positions: Vec<Value>,
    removed_position_ids: Vec<String>,
    updated_order: Vec<Value>,
    completed_order_ids: Vec<String>,
    history_orders: Vec<Value>,
    deals: Vec<Value>,
});

impl SynchronizationPacket {
    pub fn envelope(&self) -> &Envelope {
        match self {
            SynchronizationPacket::Authenticated(p) => &p.envelope,
            SynchronizationPacket::Disconnected(p) => &p.envelope,
            SynchronizationPacket::Status(p) => &p.envelope,
            SynchronizationPacket::Keepalive(p) => &p.envelope,
            SynchronizationPacket::SynchronizationStarted(p) => &p.envelope,
            SynchronizationPacket::AccountInformation(p) => &p.envelope,
            SynchronizationPacket::Positions(p) => &p.envelope,
            SynchronizationPacket::Orders(p) => &p.envelope,
            SynchronizationPacket::HistoryOrders(p) => &p.envelope,
            SynchronizationPacket::Deals(p) => &p.envelope,
            SynchronizationPacket::Update(p) => &p.envelope,
            SynchronizationPacket::DealSynchronizationFinished(p) => &p.envelope,
            SynchronizationPacket::OrderSynchronizationFinished(p) => &p.envelope,
            SynchronizationPacket::Specifications(p) => &p.envelope,
            SynchronizationPacket::Prices(p) => &p.envelope,
            SynchronizationPacket::DowngradeSubscription(p) => &p.envelope,
            SynchronizationPacket::Noop(p) => &p.envelope,
        }
    }

    pub fn bucket(&self) -> Option<Bucket> {
        self.envelope().instance_index.and_then(|i| Bucket::try_from(i).ok())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SynchronizationPacket::Authenticated(_) => "authenticated",
            SynchronizationPacket::Disconnected(_) => "disconnected",
            SynchronizationPacket::Status(_) => "status",
            SynchronizationPacket::Keepalive(_) => "keepalive",
            SynchronizationPacket::SynchronizationStarted(_) => "synchronizationStarted",
            SynchronizationPacket::AccountInformation(_) => "accountInformation",
            SynchronizationPacket::Positions(_) => "positions",
            SynchronizationPacket::Orders(_) => "orders",
            SynchronizationPacket::HistoryOrders(_) => "historyOrders",
            SynchronizationPacket::Deals(_) => "deals",
            SynchronizationPacket::Update(_) => "update",
            SynchronizationPacket::DealSynchronizationFinished(_) => "dealSynchronizationFinished",
            SynchronizationPacket::OrderSynchronizationFinished(_) => "orderSynchronizationFinished",
            SynchronizationPacket::Specifications(_) => "specifications",
            SynchronizationPacket::Prices(_) => "prices",
            SynchronizationPacket::DowngradeSubscription(_) => "downgradeSubscription",
            SynchronizationPacket::Noop(_) => "noop",
        }
    }

    /// Types that never count toward the "inactive subscription" unsubscribe
    /// throttle (§4.6 packet intake).
    pub fn is_always_considered_active(&self) -> bool {
        matches!(
            self,
            SynchronizationPacket::Disconnected(_) | SynchronizationPacket::Status(_) | SynchronizationPacket::Keepalive(_)
        )
    }

    /// Rewrite this packet's `type` to `noop` in place (§4.6 packet intake:
    /// stale `synchronizationId`).
    pub fn into_noop(self) -> Self {
        let envelope = self.envelope().clone();
        SynchronizationPacket::Noop(EnvelopePacket { envelope })
    }
}

/// One decoded server->client frame (spec.md §6 External interfaces: the
/// three server->client message names share one websocket text channel, so
/// intake has to sniff which one arrived before picking a deserializer).
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    ProcessingError(ProcessingError),
    Synchronization(SynchronizationPacket),
}

/// Sniff and parse one server->client frame. `processingError` carries both
/// `requestId` and `error`; `response` carries `requestId` without `error`;
/// everything else is a synchronization-channel packet tagged by `type`.
pub fn parse_server_message(value: Value) -> Result<ServerMessage, serde_json::Error> {
    let has_request_id = value.get("requestId").is_some();
    let has_error = value.get("error").is_some();

    if has_request_id && has_error {
        Ok(ServerMessage::ProcessingError(serde_json::from_value(value)?))
    } else if has_request_id {
        Ok(ServerMessage::Response(serde_json::from_value(value)?))
    } else {
        Ok(ServerMessage::Synchronization(serde_json::from_value(value)?))
    }
}

/// Recursively rewrite naive (timezone-less) ISO-8601-ish datetime strings
/// into absolute UTC RFC3339 strings (spec.md §4.6/§4.7: "Recursively
/// normalize ISO times to absolute timestamps"). Values that already carry
/// an offset, or aren't timestamps at all, pass through unchanged.
pub fn normalize_times(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for v in map.values_mut() {
                normalize_times(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                normalize_times(v);
            }
        }
        Value::String(s) => {
            if let Some(normalized) = normalize_timestamp_str(s) {
                *s = normalized;
            }
        }
        _ => {}
    }
}

fn normalize_timestamp_str(s: &str) -> Option<String> {
    // Already has an offset/zone marker; leave it alone.
    if s.len() < "YYYY-MM-DDTHH:MM:SS".len() {
        return None;
    }
    if s.ends_with('Z') || s.contains('+') {
        return None;
    }

    const FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    for fmt in FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            let utc = DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc);
            return Some(utc.to_rfc3339_opts(chrono::SecondsFormat::Millis, true));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_naive_timestamps_recursively() {
        let mut v = json!({
            "time": "2023-01-01T10:00:00.000",
            "nested": {"time": "2023-01-01 10:00:01.500"},
            "already_utc": "2023-01-01T10:00:00.000Z",
            "not_a_time": "hello",
        });

        normalize_times(&mut v);

        assert_eq!(v["time"], "2023-01-01T10:00:00.000Z");
        assert_eq!(v["nested"]["time"], "2023-01-01T10:00:01.500Z");
        assert_eq!(v["already_utc"], "2023-01-01T10:00:00.000Z");
        assert_eq!(v["not_a_time"], "hello");
    }

    #[test]
    fn parses_synchronization_started() {
        let raw = json!({
            "type": "synchronizationStarted",
            "accountId": "A",
            "instanceIndex": 0,
            "host": "h1",
            "sequenceNumber": 1,
            "sequenceTimestamp": "2023-01-01T00:00:00Z",
            "synchronizationId": "sync-1",
            "positionsUpdated": true,
            "ordersUpdated": false,
        });

        let packet: SynchronizationPacket = serde_json::from_value(raw).unwrap();
        assert_eq!(packet.type_name(), "synchronizationStarted");
        assert_eq!(packet.envelope().sequence_number, Some(1));
        assert_eq!(packet.bucket(), Some(Bucket::Zero));
    }
}

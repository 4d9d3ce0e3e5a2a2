//! Stable observer API (§1, supplemented as a trait per SPEC_FULL.md §11):
//! one method per row of the §4.7 dispatch table, default no-op bodies so
//! embedders implement only what they need.
//!
//! Domain payloads (positions, orders, deals, specifications, prices, …)
//! stay `serde_json::Value`: typing MetaTrader's account/position/order/deal
//! schemas is outside this transport core's scope (spec.md §1 non-goals).

use async_trait::async_trait;
use serde_json::Value;

use crate::ids::{AccountId, Bucket, SyncId};

/// Translates wire packets into a stable, typed callback surface (spec.md
/// §4.7 `processSynchronizationPacket`'s dispatch table).
#[async_trait]
pub trait Observer: Send + Sync + 'static {
    async fn on_connected(&self, _account_id: &AccountId, _instance_index: Bucket, _replicas: u8) {}
    async fn on_disconnected(&self, _account_id: &AccountId, _instance_index: Bucket) {}

    async fn on_synchronization_started(
        &self,
        _account_id: &AccountId,
        _specifications_updated: bool,
        _positions_updated: bool,
        _orders_updated: bool,
        _synchronization_id: &SyncId,
    ) {
    }

    async fn on_account_information_updated(&self, _account_id: &AccountId, _account_information: &Value) {}

    async fn on_positions_replaced(&self, _account_id: &AccountId, _positions: &[Value]) {}
    async fn on_positions_synchronized(&self, _account_id: &AccountId, _synchronization_id: &SyncId) {}
    async fn on_pending_orders_replaced(&self, _account_id: &AccountId, _orders: &[Value]) {}
    async fn on_pending_orders_synchronized(&self, _account_id: &AccountId, _synchronization_id: &SyncId) {}

    async fn on_history_order_added(&self, _account_id: &AccountId, _history_order: &Value) {}
    async fn on_deal_added(&self, _account_id: &AccountId, _deal: &Value) {}

    async fn on_position_updated(&self, _account_id: &AccountId, _position: &Value) {}
    async fn on_position_removed(&self, _account_id: &AccountId, _position_id: &str) {}
    async fn on_pending_order_updated(&self, _account_id: &AccountId, _order: &Value) {}
    async fn on_pending_order_completed(&self, _account_id: &AccountId, _order_id: &str) {}
    async fn on_update(&self, _account_id: &AccountId) {}

    async fn on_deals_synchronized(&self, _account_id: &AccountId, _synchronization_id: &SyncId) {}
    async fn on_history_orders_synchronized(&self, _account_id: &AccountId, _synchronization_id: &SyncId) {}

    async fn on_broker_connection_status_changed(&self, _account_id: &AccountId, _connected: bool) {}
    async fn on_health_status(&self, _account_id: &AccountId, _health_status: &Value) {}

    async fn on_symbol_specifications_updated(
        &self,
        _account_id: &AccountId,
        _specifications: &[Value],
        _removed_symbols: &[String],
    ) {
    }
    async fn on_symbol_specification_updated(&self, _account_id: &AccountId, _specification: &Value) {}
    async fn on_symbol_specification_removed(&self, _account_id: &AccountId, _symbol: &str) {}

    #[allow(clippy::too_many_arguments)]
    async fn on_symbol_prices_updated(
        &self,
        _account_id: &AccountId,
        _prices: &[Value],
        _equity: Option<f64>,
        _margin: Option<f64>,
        _free_margin: Option<f64>,
        _margin_level: Option<f64>,
        _account_currency_exchange_rate: Option<f64>,
    ) {
    }
    async fn on_candles_updated(&self, _account_id: &AccountId, _candles: &[Value]) {}
    async fn on_ticks_updated(&self, _account_id: &AccountId, _ticks: &[Value]) {}
    async fn on_books_updated(&self, _account_id: &AccountId, _books: &[Value]) {}
    async fn on_symbol_price_updated(&self, _account_id: &AccountId, _price: &Value) {}

    async fn on_subscription_downgraded(
        &self,
        _account_id: &AccountId,
        _symbol: Option<&str>,
        _updates: &[Value],
        _unsubscriptions: &[Value],
    ) {
    }
}

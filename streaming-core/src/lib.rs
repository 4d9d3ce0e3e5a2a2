//! Transport core for a hosted trading-terminal streaming API: a
//! multiplexed websocket client, subscription manager, packet orderer,
//! synchronization throttler, latency-aware instance selection, and a
//! typed [`Observer`] dispatch surface sitting on top of the wire
//! protocol described in `spec.md`.
//!
//! This crate never installs a global `tracing` subscriber; embedders
//! wire up their own, or call [`tracing_init`] in binaries and tests.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod ids;
pub mod observer;
pub mod orderer;
pub mod packets;
pub mod subscriptions;
pub mod throttler;

pub use client::{CoreMetrics, RpcRequestOptions, Reliability, WebsocketClient};
pub use config::Config;
pub use errors::{CoreError, CoreResult};
pub use ids::{AccountId, Bucket, Host, Region, ReplicaId, RequestId, StreamId, SyncId};
pub use observer::Observer;

/// Installs a `tracing-subscriber` `Registry` filtered by `RUST_LOG`
/// (default `info`). Intended for binaries and integration tests; the
/// library itself stays subscriber-agnostic.
pub fn tracing_init() {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).try_init();
}

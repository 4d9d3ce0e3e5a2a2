//! Latency Service (C5, spec.md §4.4): measures region latencies, elects the
//! best region per account, and supervises replicas — silently unsubscribing
//! non-best replicas once one is connected/synchronized, and re-subscribing
//! others if all go down.
//!
//! Grounded in the teacher's sibling `latency` crate (`sambacha-web3-proxy`),
//! which tracks a per-provider exponentially-weighted-moving-average latency
//! via `watermill` to pick the fastest upstream RPC node; here the same
//! EWMA-over-probes idea picks the fastest *region* for a trading account
//! instead of the fastest JSON-RPC provider.

pub mod ids;
pub mod prober;
pub mod service;

pub use ids::{AccountId, Bucket, Host, InstanceId, Region, ReplicaId};
pub use prober::{RegionUrlResolver, WebsocketRegionProber};
pub use service::{LatencyEvent, LatencyService, LatencyTransport, RegionProber};

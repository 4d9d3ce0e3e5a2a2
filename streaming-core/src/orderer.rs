//! Packet Orderer (C2, spec.md §4.1): per-instance sequence-number
//! reordering with a bounded out-of-order waitlist and a gap-timeout job.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::ids::{AccountId, StreamId};
use crate::packets::SynchronizationPacket;

const DEFAULT_WAITLIST_CAP: usize = 100;

struct WaitEntry {
    sequence_number: u64,
    sequence_timestamp: Option<DateTime<Utc>>,
    received_at: Instant,
    packet: SynchronizationPacket,
}

struct InstanceState {
    expected_seq: Option<u64>,
    session_start: Option<DateTime<Utc>>,
    wait_list: Vec<WaitEntry>,
    gap_emitted_since_reset: bool,
}

impl InstanceState {
    fn new() -> Self {
        Self {
            expected_seq: None,
            session_start: None,
            wait_list: Vec::new(),
            gap_emitted_since_reset: false,
        }
    }
}

/// One gap event: emitted once per session when the head of the waitlist
/// has sat longer than `orderingTimeoutSeconds` (spec.md §4.1 gap timeout
/// job). The higher layer force-resubscribes the account on that bucket.
#[derive(Debug, Clone)]
pub struct GapEvent {
    pub stream_id: StreamId,
    pub expected: u64,
    pub actual: u64,
    pub received_at: Instant,
}

/// Restores per-instance ordering of streamed packets (spec.md §4.1).
pub struct PacketOrderer {
    waitlist_cap: usize,
    ordering_timeout: Duration,
    instances: HashMap<StreamId, InstanceState>,
}

impl PacketOrderer {
    pub fn new(ordering_timeout: Duration) -> Self {
        Self {
            waitlist_cap: DEFAULT_WAITLIST_CAP,
            ordering_timeout,
            instances: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_waitlist_cap(ordering_timeout: Duration, cap: usize) -> Self {
        Self {
            waitlist_cap: cap,
            ordering_timeout,
            instances: HashMap::new(),
        }
    }

    /// Feed one packet in; get back the (possibly empty) list of packets to
    /// deliver now, in delivery order (spec.md §4.1 Policy).
    pub fn process(&mut self, stream_id: StreamId, packet: SynchronizationPacket) -> Vec<SynchronizationPacket> {
        let envelope = packet.envelope().clone();

        let Some(sequence_number) = envelope.sequence_number else {
            // "Packet with no sequenceNumber: deliver as-is."
            return vec![packet];
        };

        let state = self.instances.entry(stream_id.clone()).or_insert_with(InstanceState::new);

        if let SynchronizationPacket::SynchronizationStarted(_) = &packet {
            if let Some(sequence_timestamp) = envelope.sequence_timestamp {
                let is_newer = state.session_start.map_or(true, |start| sequence_timestamp > start);
                if is_newer {
                    state.session_start = Some(sequence_timestamp);
                    state.expected_seq = Some(sequence_number);
                    state.gap_emitted_since_reset = false;
                    state
                        .wait_list
                        .retain(|e| e.sequence_timestamp.map_or(true, |ts| ts >= sequence_timestamp));

                    let mut delivered = vec![packet];
                    delivered.extend(Self::drain_waitlist(state));
                    trace!(%stream_id, seq = sequence_number, "synchronizationStarted reset orderer session");
                    return delivered;
                }
            }
        }

        if let (Some(session_start), Some(sequence_timestamp)) = (state.session_start, envelope.sequence_timestamp) {
            if sequence_timestamp < session_start {
                trace!(%stream_id, seq = sequence_number, "discarding packet from old session");
                return vec![];
            }
        }

        match state.expected_seq {
            Some(expected) if sequence_number == expected => vec![packet],
            Some(expected) if sequence_number == expected + 1 => {
                state.expected_seq = Some(expected + 1);
                let mut delivered = vec![packet];
                delivered.extend(Self::drain_waitlist(state));
                delivered
            }
            Some(_) | None => {
                Self::insert_sorted(state, sequence_number, envelope.sequence_timestamp, packet);

                if state.wait_list.len() > self.waitlist_cap {
                    // drop lowest (oldest) sequence
                    state.wait_list.remove(0);
                }

                vec![]
            }
        }
    }

    fn insert_sorted(
        state: &mut InstanceState,
        sequence_number: u64,
        sequence_timestamp: Option<DateTime<Utc>>,
        packet: SynchronizationPacket,
    ) {
        let entry = WaitEntry {
            sequence_number,
            sequence_timestamp,
            received_at: Instant::now(),
            packet,
        };

        let pos = state
            .wait_list
            .binary_search_by_key(&sequence_number, |e| e.sequence_number)
            .unwrap_or_else(|i| i);
        state.wait_list.insert(pos, entry);
    }

    /// Drain waitlist entries while the head matches `{expected,
    /// expected+1}` or is older than `session_start` (spec.md §4.1).
    fn drain_waitlist(state: &mut InstanceState) -> Vec<SynchronizationPacket> {
        let mut delivered = Vec::new();

        loop {
            let Some(head) = state.wait_list.first() else { break };

            let is_stale = state
                .session_start
                .zip(head.sequence_timestamp)
                .map_or(false, |(start, ts)| ts < start);

            let expected = state.expected_seq;
            let matches_expected = expected
                .map(|e| head.sequence_number == e || head.sequence_number == e + 1)
                .unwrap_or(false);

            if is_stale {
                state.wait_list.remove(0);
                continue;
            }

            if !matches_expected {
                break;
            }

            let head = state.wait_list.remove(0);
            if let Some(expected) = state.expected_seq {
                if head.sequence_number == expected + 1 {
                    state.expected_seq = Some(expected + 1);
                }
            }
            delivered.push(head.packet);
        }

        delivered
    }

    /// Gap timeout job (spec.md §4.1), fired every 1s by the caller.
    pub fn check_gaps(&mut self, now: Instant) -> Vec<GapEvent> {
        let mut events = Vec::new();

        for (stream_id, state) in self.instances.iter_mut() {
            if state.gap_emitted_since_reset {
                continue;
            }
            let Some(expected) = state.expected_seq else { continue };
            let Some(head) = state.wait_list.first() else { continue };

            if head.received_at + self.ordering_timeout < now {
                warn!(%stream_id, expected, actual = head.sequence_number, "packet ordering gap timed out");
                state.gap_emitted_since_reset = true;
                events.push(GapEvent {
                    stream_id: stream_id.clone(),
                    expected,
                    actual: head.sequence_number,
                    received_at: head.received_at,
                });
            }
        }

        events
    }

    /// `onStreamClosed(instanceId)` (spec.md §4.1 reset hooks).
    pub fn on_stream_closed(&mut self, stream_id: &StreamId) {
        self.instances.remove(stream_id);
    }

    /// `onReconnected(accountIds)` (spec.md §4.1 reset hooks).
    pub fn on_reconnected(&mut self, account_ids: &[AccountId]) {
        self.instances.retain(|id, _| !account_ids.contains(&id.account_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Bucket, StreamId};
    use serde_json::json;

    fn packet(seq: u64, ts: &str, variant_json: serde_json::Value) -> SynchronizationPacket {
        let mut v = variant_json;
        v["sequenceNumber"] = json!(seq);
        v["sequenceTimestamp"] = json!(ts);
        v["accountId"] = json!("A");
        serde_json::from_value(v).unwrap()
    }

    fn started(seq: u64, ts: &str) -> SynchronizationPacket {
        packet(
            seq,
            ts,
            json!({"type": "synchronizationStarted", "synchronizationId": "s1"}),
        )
    }

    fn orders(seq: u64, ts: &str) -> SynchronizationPacket {
        packet(seq, ts, json!({"type": "orders", "orders": []}))
    }

    fn positions(seq: u64, ts: &str) -> SynchronizationPacket {
        packet(seq, ts, json!({"type": "positions", "positions": []}))
    }

    fn sid() -> StreamId {
        StreamId::new("A".into(), Bucket::Zero, "h1".into())
    }

    #[test]
    fn delivers_in_order_reorders_out_of_order_arrivals() {
        // scenario 3 from spec.md §8
        let mut orderer = PacketOrderer::new(Duration::from_secs(60));

        let mut out = orderer.process(sid(), started(1, "2023-01-01T00:00:00Z"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].type_name(), "synchronizationStarted");

        out = orderer.process(sid(), orders(3, "2023-01-01T00:00:02Z"));
        assert!(out.is_empty(), "out of order packet should buffer");

        out = orderer.process(sid(), positions(2, "2023-01-01T00:00:01Z"));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].type_name(), "positions");
        assert_eq!(out[1].type_name(), "orders");
    }

    #[test]
    fn duplicate_delivery_is_idempotent_never_drops_first() {
        let mut orderer = PacketOrderer::new(Duration::from_secs(60));
        orderer.process(sid(), started(1, "2023-01-01T00:00:00Z"));

        let first = orderer.process(sid(), orders(2, "2023-01-01T00:00:01Z"));
        assert_eq!(first.len(), 1);

        let second = orderer.process(sid(), orders(2, "2023-01-01T00:00:01Z"));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn passes_through_packets_without_sequence_number() {
        let mut orderer = PacketOrderer::new(Duration::from_secs(60));
        let p: SynchronizationPacket =
            serde_json::from_value(json!({"type": "keepalive", "accountId": "A"})).unwrap();
        let out = orderer.process(sid(), p);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn waitlist_drops_oldest_beyond_cap() {
        let mut orderer = PacketOrderer::with_waitlist_cap(Duration::from_secs(60), 2);
        orderer.process(sid(), started(1, "2023-01-01T00:00:00Z"));

        // none of these are expected+1, so they all buffer
        orderer.process(sid(), orders(10, "2023-01-01T00:00:10Z"));
        orderer.process(sid(), orders(11, "2023-01-01T00:00:11Z"));
        orderer.process(sid(), orders(12, "2023-01-01T00:00:12Z"));

        let state = orderer.instances.get(&sid()).unwrap();
        assert_eq!(state.wait_list.len(), 2);
        assert_eq!(state.wait_list[0].sequence_number, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn gap_timeout_fires_once_per_session() {
        let mut orderer = PacketOrderer::new(Duration::from_secs(5));
        orderer.process(sid(), started(1, "2023-01-01T00:00:00Z"));
        orderer.process(sid(), orders(5, "2023-01-01T00:00:05Z"));

        tokio::time::advance(Duration::from_secs(6)).await;
        let events = orderer.check_gaps(Instant::now());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].expected, 1);
        assert_eq!(events[0].actual, 5);

        // still stuck, but already emitted once this session
        tokio::time::advance(Duration::from_secs(6)).await;
        let events = orderer.check_gaps(Instant::now());
        assert!(events.is_empty());
    }

    #[test]
    fn newer_synchronization_started_resets_and_drops_stale_waitlist_entries() {
        let mut orderer = PacketOrderer::new(Duration::from_secs(60));
        orderer.process(sid(), started(1, "2023-01-01T00:00:00Z"));
        orderer.process(sid(), orders(50, "2023-01-01T00:00:05Z"));

        let out = orderer.process(sid(), started(1, "2023-01-01T00:01:00Z"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].type_name(), "synchronizationStarted");

        let state = orderer.instances.get(&sid()).unwrap();
        assert!(state.wait_list.is_empty());
    }

    #[test]
    fn on_stream_closed_drops_state() {
        let mut orderer = PacketOrderer::new(Duration::from_secs(60));
        orderer.process(sid(), started(1, "2023-01-01T00:00:00Z"));
        assert!(orderer.instances.contains_key(&sid()));
        orderer.on_stream_closed(&sid());
        assert!(!orderer.instances.contains_key(&sid()));
    }
}

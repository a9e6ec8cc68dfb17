//! Dispatcher
//!
//! Pulls packets from the source, applies the packet filter, normalizes
//! tunnelling and capture length, and routes each packet to the meter owning
//! its flow key. Routing uses the key's FNV-1a hash, so a key maps to the same
//! meter for the whole run and across runs.

use crate::config::ObserverConfig;
use crate::error::SourceError;
use crate::filter::PacketFilter;
use crate::flow::FlowKey;
use crate::packet::Packet;
use crate::source::PacketSource;
use crate::stats::{CaptureStats, CounterSemantics, MeterStats, Reconciliation};
use std::sync::Arc;

/// Packets between two publications of capture counters
pub const PUBLISH_INTERVAL: u64 = 256;

/// Packet routed to its owning meter
#[derive(Debug, Clone, PartialEq)]
pub struct Routed {
    pub meter: usize,
    pub packet: Packet,
}

/// Observer-side router
pub struct Dispatcher {
    n_meters: usize,
    filter: Option<PacketFilter>,
    decode_tunnels: bool,
    snapshot_length: usize,
    reconciliation: &'static dyn Reconciliation,
    stats: Arc<MeterStats>,
    ignored: Vec<u64>,
    seen: u64,
}

impl Dispatcher {
    /// Router over `stats.len()` meters
    pub fn new(observer: &ObserverConfig, semantics: CounterSemantics, stats: Arc<MeterStats>) -> Self {
        let n_meters = stats.len().max(1);
        Self {
            n_meters,
            filter: observer.bpf_filter.clone(),
            decode_tunnels: observer.decode_tunnels,
            snapshot_length: observer.snapshot_length,
            reconciliation: semantics.reconciliation(),
            stats,
            ignored: vec![0; n_meters],
            seen: 0,
        }
    }

    /// Owning meter of a key
    #[inline]
    pub fn route(&self, key: &FlowKey) -> usize {
        (key.hash() % self.n_meters as u64) as usize
    }

    /// Next packet that passes the filter, with its owner. `None` at end of
    /// input, after a final publication of capture counters.
    pub fn next<S>(&mut self, source: &mut S) -> Result<Option<Routed>, SourceError>
    where
        S: PacketSource + ?Sized,
    {
        loop {
            let Some(packet) = source.next_packet()? else {
                self.publish(source.capture_stats());
                return Ok(None);
            };

            self.seen += 1;
            if self.seen % PUBLISH_INTERVAL == 0 {
                self.publish(source.capture_stats());
            }

            if let Some(routed) = self.dispatch(packet) {
                return Ok(Some(routed));
            }
        }
    }

    /// Filter, normalize and route one packet. Filtered packets are counted
    /// as ignored against their owner and yield `None`.
    pub fn dispatch(&mut self, mut packet: Packet) -> Option<Routed> {
        let passes = self.filter.as_ref().map_or(true, |f| f.matches(&packet));

        if self.decode_tunnels {
            packet.decapsulate();
        } else {
            packet.strip_tunnel();
        }
        packet.truncate_payload(self.snapshot_length);

        let meter = self.route(&FlowKey::from_packet(&packet));
        if !passes {
            self.ignored[meter] += 1;
            return None;
        }
        Some(Routed { meter, packet })
    }

    /// Project filter and capture counters into every meter's counter set.
    /// Capture-level counts are attributed to the first meter.
    pub fn publish(&self, capture: CaptureStats) {
        let mut ignored = self.ignored.clone();
        ignored[0] += capture.ignored;
        let mut dropped = vec![0; self.n_meters];
        dropped[0] = capture.dropped;

        for worker in 0..self.stats.len() {
            self.stats.meter(worker).publish_capture(
                self.reconciliation.project(&ignored, worker),
                self.reconciliation.project(&dropped, worker),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamerConfig;
    use crate::packet::TunnelHeader;
    use crate::source::MemorySource;
    use crate::stats::PerformanceAggregator;
    use crate::testing::{mixed_trace, v4};

    fn dispatcher(config: &StreamerConfig, n: usize, semantics: CounterSemantics) -> (Dispatcher, Arc<MeterStats>) {
        let stats = Arc::new(MeterStats::new(n));
        (Dispatcher::new(&config.observer, semantics, stats.clone()), stats)
    }

    #[test]
    fn test_routing_is_stable_per_key() {
        let config = StreamerConfig::default();
        let (mut a, _) = dispatcher(&config, 4, CounterSemantics::Shared);
        let (mut b, _) = dispatcher(&config, 4, CounterSemantics::Shared);

        for p in mixed_trace() {
            let key = FlowKey::from_packet(&p);
            let ra = a.dispatch(p.clone()).unwrap();
            let rb = b.dispatch(p).unwrap();
            assert_eq!(ra.meter, rb.meter);
            assert_eq!(ra.meter, a.route(&key));
            assert!(ra.meter < 4);
        }
    }

    #[test]
    fn test_both_directions_share_owner() {
        let config = StreamerConfig::default();
        let (d, _) = dispatcher(&config, 7, CounterSemantics::Shared);
        for p in mixed_trace() {
            let reverse = FlowKey::new(p.dst_ip, p.dst_port, p.src_ip, p.src_port, p.protocol, 0, 0);
            assert_eq!(d.route(&FlowKey::from_packet(&p)), d.route(&reverse));
        }
    }

    #[test]
    fn test_filtered_packets_counted_as_ignored() {
        let config = StreamerConfig::builder().bpf_filter("port 443").build().unwrap();
        let trace = mixed_trace();
        let expected_pass = trace.iter().filter(|p| p.src_port == 443 || p.dst_port == 443).count();

        let (mut d, stats) = dispatcher(&config, 3, CounterSemantics::PerWorker);
        let mut source = MemorySource::from(trace.clone());
        let mut passed = 0;
        while let Some(routed) = d.next(&mut source).unwrap() {
            assert!(routed.packet.src_port == 443 || routed.packet.dst_port == 443);
            passed += 1;
        }

        assert_eq!(passed, expected_pass);
        let report = PerformanceAggregator::new(stats, CounterSemantics::PerWorker).report();
        assert_eq!(report.packets_ignored as usize, trace.len() - expected_pass);
    }

    #[test]
    fn test_capture_counters_reconcile_per_semantics() {
        let config = StreamerConfig::default();
        let capture = CaptureStats { dropped: 12, ignored: 3 };

        for semantics in [CounterSemantics::PerWorker, CounterSemantics::Shared] {
            let (mut d, stats) = dispatcher(&config, 4, semantics);
            let mut source = MemorySource::from(mixed_trace())
                .with_capture_stats(capture)
                .with_counter_semantics(semantics);
            while d.next(&mut source).unwrap().is_some() {}

            let report = PerformanceAggregator::new(stats.clone(), semantics).report();
            assert_eq!(report.packets_dropped_filtered_by_kernel, 12, "{semantics:?}");
            assert_eq!(report.packets_ignored, 3, "{semantics:?}");

            if semantics == CounterSemantics::Shared {
                assert!((0..4).all(|w| stats.meter(w).snapshot().dropped == 12));
            }
        }
    }

    fn tunnelled() -> Packet {
        Packet::new(0, v4(1, 1, 1, 1), 2152, v4(2, 2, 2, 2), 2152, 17)
            .with_payload(vec![7u8; 64])
            .with_tunnel(TunnelHeader {
                tunnel_id: 42,
                src_ip: v4(10, 0, 0, 1),
                dst_ip: v4(10, 0, 0, 2),
                src_port: 5000,
                dst_port: 443,
                protocol: 6,
            })
    }

    #[test]
    fn test_tunnel_decoding() {
        let decode = StreamerConfig::builder().snapshot_length(16).build().unwrap();
        let (mut d, _) = dispatcher(&decode, 1, CounterSemantics::Shared);
        let routed = d.dispatch(tunnelled()).unwrap();
        assert_eq!(routed.packet.tunnel_id, 42);
        assert_eq!(routed.packet.dst_port, 443);
        assert_eq!(routed.packet.payload.len(), 16);

        let keep_outer = StreamerConfig::builder().decode_tunnels(false).build().unwrap();
        let (mut d, _) = dispatcher(&keep_outer, 1, CounterSemantics::Shared);
        let routed = d.dispatch(tunnelled()).unwrap();
        assert_eq!(routed.packet.tunnel_id, 0);
        assert_eq!(routed.packet.dst_port, 2152);
        assert!(routed.packet.inner.is_none());
    }
}

//! Meter
//!
//! Owns one partition of the flow space and runs the per-packet state
//! machine over it:
//!
//! 1. Expire the packet's flow first if it already timed out
//! 2. Create (on_init) or update (on_update) the flow
//! 3. Expire it if a hook asked to, or if a timeout is reached
//! 4. Every second of packet time, sweep the table for silent flows
//!
//! Time only moves with packet timestamps, so flow boundaries depend on the
//! trace alone and not on wall clock or scheduling.

use crate::classify::Classifier;
use crate::config::MeterConfig;
use crate::error::StreamResult;
use crate::flow::{ExpirationReason, FlowKey, FlowRecord};
use crate::packet::{Direction, Packet};
use crate::pipeline::{FlowPacket, Namespace, Plugin, PluginPipeline};
use crate::splt::Splt;
use crate::stats::MeterStats;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

/// Packet-time interval between table sweeps (ms)
pub const SWEEP_INTERVAL_MS: u64 = 1_000;

/// Assemble a meter's hook pipeline: built-in features first, then user
/// plugins in registration order
pub fn build_pipeline(config: &MeterConfig, udps: &[Arc<dyn Plugin>]) -> PluginPipeline {
    let mut pipeline = PluginPipeline::new();
    if config.splt_analysis > 0 {
        pipeline.add_stage(
            Arc::new(Splt::new(config.splt_analysis as usize, config.accounting_mode)),
            Namespace::Features,
        );
    }
    for plugin in udps {
        pipeline.add_stage(plugin.clone(), Namespace::Udps);
    }
    pipeline
}

/// One partition's flow table and expiration policy
pub struct Meter {
    index: usize,
    config: MeterConfig,
    pipeline: PluginPipeline,
    classifier: Arc<dyn Classifier>,
    stats: Arc<MeterStats>,
    flows: HashMap<FlowKey, FlowRecord>,
    next_id: u64,
    clock: u64,
    last_sweep: Option<u64>,
}

impl Meter {
    pub fn new(
        index: usize,
        config: MeterConfig,
        pipeline: PluginPipeline,
        classifier: Arc<dyn Classifier>,
        stats: Arc<MeterStats>,
    ) -> Self {
        Self {
            index,
            config,
            pipeline,
            classifier,
            stats,
            flows: HashMap::new(),
            next_id: 0,
            clock: 0,
            last_sweep: None,
        }
    }

    /// Partition index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Flows currently in the table
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Meter one packet. Flows that end are appended to `expired`.
    pub fn process(&mut self, packet: &Packet, expired: &mut Vec<FlowRecord>) -> StreamResult<()> {
        let now = packet.time.max(self.clock);
        self.clock = now;
        let reordered;
        let packet = if packet.time < now {
            reordered = Packet {
                time: now,
                ..packet.clone()
            };
            &reordered
        } else {
            packet
        };
        self.stats.meter(self.index).record_processed();
        self.maybe_sweep(now, expired);

        let key = FlowKey::from_packet(packet);
        let size = packet.size(self.config.accounting_mode);

        let stale = self
            .flows
            .get(&key)
            .and_then(|flow| timeout_reason(&self.config, flow, now));
        if let Some(reason) = stale {
            if let Some(flow) = self.flows.remove(&key) {
                self.expire(flow, reason, expired);
            }
        }

        let flow = match self.flows.entry(key) {
            Entry::Occupied(entry) => {
                let flow = entry.into_mut();
                let direction = flow.direction_of(packet);
                let delta_time = flow.update(packet, direction, size);
                let fp = FlowPacket {
                    packet,
                    direction,
                    delta_time,
                };
                dissect(self.classifier.as_ref(), self.config.n_dissections, flow, &fp);
                self.pipeline.on_update(&fp, flow)?;
                flow
            }
            Entry::Vacant(entry) => {
                let id = self.next_id;
                self.next_id += 1;
                let flow = entry.insert(FlowRecord::new(
                    id,
                    key,
                    packet,
                    size,
                    self.config.statistical_analysis,
                ));
                let fp = FlowPacket {
                    packet,
                    direction: Direction::Src2Dst,
                    delta_time: 0,
                };
                dissect(self.classifier.as_ref(), self.config.n_dissections, flow, &fp);
                self.pipeline.on_init(&fp, flow)?;
                flow
            }
        };

        let reason = match flow.expiration_id {
            0 => timeout_reason(&self.config, flow, now),
            forced => Some(ExpirationReason::from_id(forced)),
        };
        if let Some(reason) = reason {
            if let Some(flow) = self.flows.remove(&key) {
                self.expire(flow, reason, expired);
            }
        }
        Ok(())
    }

    /// End of stream: expire every remaining flow in id order
    pub fn flush(&mut self, expired: &mut Vec<FlowRecord>) {
        let mut remaining: Vec<FlowRecord> = self.flows.drain().map(|(_, flow)| flow).collect();
        remaining.sort_unstable_by_key(|flow| flow.id);
        tracing::debug!(meter = self.index, flows = remaining.len(), "flushing meter");
        for flow in remaining {
            self.expire(flow, ExpirationReason::IdleTimeout, expired);
        }
    }

    fn maybe_sweep(&mut self, now: u64, expired: &mut Vec<FlowRecord>) {
        match self.last_sweep {
            None => self.last_sweep = Some(now),
            Some(last) if now - last >= SWEEP_INTERVAL_MS => {
                self.last_sweep = Some(now);
                self.sweep(now, expired);
            }
            Some(_) => {}
        }
    }

    /// Expire every flow timed out at `now`, in id order
    pub fn sweep(&mut self, now: u64, expired: &mut Vec<FlowRecord>) {
        let mut due: Vec<(u64, FlowKey, ExpirationReason)> = self
            .flows
            .iter()
            .filter_map(|(key, flow)| {
                timeout_reason(&self.config, flow, now).map(|reason| (flow.id, *key, reason))
            })
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort_unstable_by_key(|(id, _, _)| *id);
        tracing::debug!(meter = self.index, expired = due.len(), "swept idle flows");

        for (_, key, reason) in due {
            if let Some(flow) = self.flows.remove(&key) {
                self.expire(flow, reason, expired);
            }
        }
    }

    fn expire(&self, mut flow: FlowRecord, reason: ExpirationReason, expired: &mut Vec<FlowRecord>) {
        flow.expiration_id = reason.id();
        if self.config.n_dissections > 0 && !flow.classification.is_completed() {
            guess(self.classifier.as_ref(), &mut flow);
        }
        self.stats.meter(self.index).record_expired();
        expired.push(flow);
    }
}

fn timeout_reason(config: &MeterConfig, flow: &FlowRecord, now: u64) -> Option<ExpirationReason> {
    if config
        .idle_timeout
        .reached(now.saturating_sub(flow.bidirectional.last_seen_ms))
    {
        Some(ExpirationReason::IdleTimeout)
    } else if config
        .active_timeout
        .reached(now.saturating_sub(flow.bidirectional.first_seen_ms))
    {
        Some(ExpirationReason::ActiveTimeout)
    } else {
        None
    }
}

fn dissect(classifier: &dyn Classifier, n_dissections: u8, flow: &mut FlowRecord, packet: &FlowPacket<'_>) {
    if n_dissections == 0 || flow.classification.is_completed() {
        return;
    }
    if let Some(detection) = classifier.inspect(&flow.key, packet.direction, &packet.payload) {
        flow.classification.apply(detection, false);
    } else if flow.bidirectional.packets >= n_dissections as u64 {
        guess(classifier, flow);
    }
}

fn guess(classifier: &dyn Classifier, flow: &mut FlowRecord) {
    match classifier.guess(&flow.key) {
        Some(detection) => flow.classification.apply(detection, true),
        None => flow.classification.completed = true,
    }
}

//! Sequence of Packet Lengths and Times (SPLT)
//!
//! Records (direction, size, inter-arrival) for the first `sequence_length`
//! packets of a flow. The same plugin backs the `splt_analysis` option and
//! explicit user registration; only the target namespace differs.

use crate::error::PluginError;
use crate::packet::AccountingMode;
use crate::pipeline::{FlowPacket, FlowView, Plugin};
use serde_json::Value;

/// Direction list field
pub const SPLT_DIRECTION: &str = "splt_direction";
/// Packet size list field
pub const SPLT_PS: &str = "splt_ps";
/// Inter-arrival list field (ms)
pub const SPLT_PIAT: &str = "splt_piat_ms";

/// Bounded packet sequence recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Splt {
    sequence_length: usize,
    accounting_mode: AccountingMode,
}

impl Splt {
    pub fn new(sequence_length: usize, accounting_mode: AccountingMode) -> Self {
        Self {
            sequence_length,
            accounting_mode,
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    fn append(flow: &mut FlowView<'_>, name: &str, value: u64, capacity: usize) {
        if let Some(Value::Array(items)) = flow.get_mut(name) {
            if items.len() < capacity {
                items.push(Value::from(value));
            }
        }
    }
}

impl Plugin for Splt {
    fn name(&self) -> &str {
        "splt"
    }

    fn on_init(&self, packet: &FlowPacket<'_>, flow: &mut FlowView<'_>) -> Result<(), PluginError> {
        flow.set(SPLT_DIRECTION, Value::Array(Vec::with_capacity(self.sequence_length)));
        flow.set(SPLT_PS, Value::Array(Vec::with_capacity(self.sequence_length)));
        flow.set(SPLT_PIAT, Value::Array(Vec::with_capacity(self.sequence_length)));
        self.on_update(packet, flow)
    }

    fn on_update(&self, packet: &FlowPacket<'_>, flow: &mut FlowView<'_>) -> Result<(), PluginError> {
        let cap = self.sequence_length;
        Self::append(flow, SPLT_DIRECTION, packet.direction.as_u8() as u64, cap);
        Self::append(flow, SPLT_PS, packet.size(self.accounting_mode) as u64, cap);
        Self::append(flow, SPLT_PIAT, packet.delta_time, cap);
        Ok(())
    }
}

/// Decode one SPLT list from an extension value
pub fn sequence(value: Option<&Value>) -> Vec<u64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

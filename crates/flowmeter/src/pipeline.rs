//! Plugin Hook Pipeline
//!
//! on_init (first packet) / on_update (every later packet), in registration
//! order, on the owning meter's thread.
//!
//! A hook sees the whole flow read-only. Its only write access is the
//! extension namespace its registration targets and the flow's
//! `expiration_id`.

use crate::error::{PluginError, StreamError};
use crate::flow::{Extensions, FlowRecord};
use crate::packet::{Direction, Packet};
use serde_json::Value;
use std::ops::Deref;
use std::sync::Arc;

/// Packet as seen by a hook: the observed packet plus meter-derived context
#[derive(Debug, Clone, Copy)]
pub struct FlowPacket<'a> {
    /// Observed packet
    pub packet: &'a Packet,
    /// Orientation relative to the flow's first packet
    pub direction: Direction,
    /// Milliseconds since the flow's previous packet, 0 on the first
    pub delta_time: u64,
}

impl Deref for FlowPacket<'_> {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        self.packet
    }
}

/// Which extension map a registration writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Built-in features, exported without prefix
    Features,
    /// User plugins, exported under `udps.`
    Udps,
}

/// Restricted mutable view of a flow handed to hooks
pub struct FlowView<'a> {
    record: &'a mut FlowRecord,
    namespace: Namespace,
}

impl<'a> FlowView<'a> {
    pub(crate) fn new(record: &'a mut FlowRecord, namespace: Namespace) -> Self {
        Self { record, namespace }
    }

    fn fields(&self) -> &Extensions {
        match self.namespace {
            Namespace::Features => &self.record.features,
            Namespace::Udps => &self.record.udps,
        }
    }

    fn fields_mut(&mut self) -> &mut Extensions {
        match self.namespace {
            Namespace::Features => &mut self.record.features,
            Namespace::Udps => &mut self.record.udps,
        }
    }

    /// Set an extension field
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields_mut().insert(name.into(), value.into());
    }

    /// Read an extension field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields().get(name)
    }

    /// Modify an extension field in place
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields_mut().get_mut(name)
    }

    /// Force the flow to expire after the current packet
    pub fn set_expiration_id(&mut self, id: i32) {
        self.record.expiration_id = id;
    }
}

impl Deref for FlowView<'_> {
    type Target = FlowRecord;

    fn deref(&self) -> &FlowRecord {
        self.record
    }
}

/// Analysis extension. Both hooks default to no-op.
///
/// An `Err` from a hook is fatal for the whole run; hooks are trusted
/// in-process code and are not isolated per flow.
pub trait Plugin: Send + Sync {
    /// Name used in error reports
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once, on the packet that creates the flow
    fn on_init(&self, _packet: &FlowPacket<'_>, _flow: &mut FlowView<'_>) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called on every later packet, after built-in counters are updated
    fn on_update(&self, _packet: &FlowPacket<'_>, _flow: &mut FlowView<'_>) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Ordered hook registrations of one meter
#[derive(Clone, Default)]
pub struct PluginPipeline {
    stages: Vec<(Arc<dyn Plugin>, Namespace)>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Register a plugin writing to `namespace`
    pub fn add_stage(&mut self, plugin: Arc<dyn Plugin>, namespace: Namespace) {
        self.stages.push((plugin, namespace));
    }

    /// Run every `on_init` hook
    #[inline]
    pub fn on_init(&self, packet: &FlowPacket<'_>, record: &mut FlowRecord) -> Result<(), StreamError> {
        for (plugin, namespace) in &self.stages {
            plugin
                .on_init(packet, &mut FlowView::new(record, *namespace))
                .map_err(|source| StreamError::Plugin {
                    plugin: plugin.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run every `on_update` hook
    #[inline]
    pub fn on_update(&self, packet: &FlowPacket<'_>, record: &mut FlowRecord) -> Result<(), StreamError> {
        for (plugin, namespace) in &self.stages {
            plugin
                .on_update(packet, &mut FlowView::new(record, *namespace))
                .map_err(|source| StreamError::Plugin {
                    plugin: plugin.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

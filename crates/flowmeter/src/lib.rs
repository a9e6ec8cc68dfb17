//! Flowmeter
//!
//! Partitioned flow metering engine: aggregates packets into bidirectional
//! flows, expires them on idle/active timeouts or plugin request, and yields
//! finalized flow records with statistical and per-packet features.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          FLOW STREAMER                           │
//! │                                                                  │
//! │  ┌──────────────┐    ┌──────────────────────────────────────┐    │
//! │  │ PacketSource │───▶│ Dispatcher                           │    │
//! │  └──────────────┘    │  filter ─▶ decap ─▶ snaplen ─▶ hash  │    │
//! │                      └───┬──────────────┬──────────────┬────┘    │
//! │                          ▼              ▼              ▼         │
//! │                   ┌───────────┐  ┌───────────┐  ┌───────────┐    │
//! │                   │  Meter 0  │  │  Meter 1  │  │  Meter N  │    │
//! │                   │ flow table│  │ flow table│  │ flow table│    │
//! │                   │ dissect   │  │ dissect   │  │ dissect   │    │
//! │                   │ plugins   │  │ plugins   │  │ plugins   │    │
//! │                   └─────┬─────┘  └─────┬─────┘  └─────┬─────┘    │
//! │                         └──────────────┼──────────────┘          │
//! │                                        ▼                         │
//! │                              ┌───────────────────┐               │
//! │                              │ FlowStream        │──▶ Frame/CSV  │
//! │                              │ (finalized flows) │               │
//! │                              └───────────────────┘               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each flow key is owned by exactly one meter for the whole run, so flow
//! boundaries do not depend on the number of meters; only the order in which
//! flows are yielded does.
//!
//! # Example
//!
//! ```no_run
//! use flowmeter::{FlowStreamer, StreamerConfig};
//!
//! let config = StreamerConfig::builder()
//!     .source("capture.jsonl")
//!     .idle_timeout(30)
//!     .statistical_analysis(true)
//!     .build()?;
//!
//! for flow in FlowStreamer::new(config).stream()? {
//!     let flow = flow?;
//!     println!("{} {} packets", flow.id, flow.bidirectional.packets);
//! }
//! # Ok::<(), flowmeter::StreamError>(())
//! ```

pub mod anonymize;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod features;
pub mod filter;
pub mod flow;
pub mod meter;
pub mod packet;
pub mod pipeline;
pub mod source;
pub mod splt;
pub mod stats;
pub mod streamer;
pub mod timer;

#[cfg(test)]
mod testing;

pub use anonymize::{Anonymizer, KeyedAnonymizer};
pub use classify::{Classification, Classifier, Detection, NoClassifier, PortClassifier};
pub use config::{RawConfig, StreamerConfig, Timeout};
pub use error::{ConfigError, PluginError, SourceError, StreamError, StreamResult};
pub use export::{CsvWriter, Frame};
pub use features::FlowStatistics;
pub use flow::{ExpirationReason, FlowKey, FlowRecord};
pub use packet::{AccountingMode, Direction, Packet};
pub use pipeline::{FlowPacket, FlowView, Plugin};
pub use source::{JsonLinesSource, MemorySource, PacketSource};
pub use splt::Splt;
pub use stats::{CaptureStats, CounterSemantics, PerformanceReport};
pub use streamer::{FlowStream, FlowStreamer, StopHandle};

//! Packet Sources
//!
//! The observer side of the engine: anything that yields decoded packets in
//! capture order. Two implementations ship with the crate, an in-memory queue
//! and a reader for pre-decoded packet metadata stored as JSON lines.

use crate::error::SourceError;
use crate::packet::Packet;
use crate::stats::{CaptureStats, CounterSemantics};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Yields packets in capture order
pub trait PacketSource: Send {
    /// Next packet, `None` at end of input
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError>;

    /// Capture-layer counters observed so far
    fn capture_stats(&self) -> CaptureStats {
        CaptureStats::default()
    }

    /// How `capture_stats` relates across workers
    fn counter_semantics(&self) -> CounterSemantics {
        CounterSemantics::Shared
    }
}

impl PacketSource for Box<dyn PacketSource> {
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        (**self).next_packet()
    }

    fn capture_stats(&self) -> CaptureStats {
        (**self).capture_stats()
    }

    fn counter_semantics(&self) -> CounterSemantics {
        (**self).counter_semantics()
    }
}

/// Packets held in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    packets: VecDeque<Packet>,
    stats: CaptureStats,
    semantics: CounterSemantics,
}

impl MemorySource {
    pub fn new(packets: impl IntoIterator<Item = Packet>) -> Self {
        Self {
            packets: packets.into_iter().collect(),
            stats: CaptureStats::default(),
            semantics: CounterSemantics::default(),
        }
    }

    /// Report fixed capture counters
    pub fn with_capture_stats(mut self, stats: CaptureStats) -> Self {
        self.stats = stats;
        self
    }

    /// Declare the counter semantics of the simulated platform
    pub fn with_counter_semantics(mut self, semantics: CounterSemantics) -> Self {
        self.semantics = semantics;
        self
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl From<Vec<Packet>> for MemorySource {
    fn from(packets: Vec<Packet>) -> Self {
        Self::new(packets)
    }
}

impl PacketSource for MemorySource {
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        Ok(self.packets.pop_front())
    }

    fn capture_stats(&self) -> CaptureStats {
        self.stats
    }

    fn counter_semantics(&self) -> CounterSemantics {
        self.semantics
    }
}

/// One JSON packet object per line. Blank lines and `#` comments are skipped.
pub struct JsonLinesSource<R = BufReader<File>> {
    reader: R,
    line: usize,
    buf: String,
}

impl JsonLinesSource {
    /// Open a capture file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = File::open(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "opened packet source");
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead + Send> PacketSource for JsonLinesSource<R> {
    fn next_packet(&mut self) -> Result<Option<Packet>, SourceError> {
        loop {
            self.buf.clear();
            if self.reader.read_line(&mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;

            let text = self.buf.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            return serde_json::from_str(text)
                .map(Some)
                .map_err(|source| SourceError::Decode {
                    line: self.line,
                    source,
                });
        }
    }
}

//! Running Packet Statistics
//!
//! Welford accumulators for packet size and inter-arrival time. Memory per
//! flow is constant regardless of packet count. Standard deviation uses the
//! population formula.

/// Incremental min/max/mean/stddev over `u64` samples
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: u64,
    max: u64,
}

impl RunningStats {
    /// Empty accumulator
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: 0,
            max: 0,
        }
    }

    /// Add one sample
    #[inline]
    pub fn push(&mut self, value: u64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let x = value as f64;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Samples seen
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest sample, 0 when empty
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Largest sample, 0 when empty
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Mean, 0 when empty
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation, 0 when empty
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }
}

/// Size and inter-arrival accumulators for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PacketStats {
    /// Packet size
    pub ps: RunningStats,
    /// Packet inter-arrival time (ms)
    pub piat: RunningStats,
}

/// Statistical features of a flow, per direction and bidirectional
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowStatistics {
    /// Both directions
    pub bidirectional: PacketStats,
    /// Packets in the creating direction
    pub src2dst: PacketStats,
    /// Reply packets
    pub dst2src: PacketStats,
}

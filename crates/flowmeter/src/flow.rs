//! Flow Key & Flow Record
//!
//! # Design
//!
//! - The key stores its two endpoints in canonical order so both directions
//!   of a conversation map to the same entry
//! - The record keeps the orientation of the packet that created it; every
//!   later packet is classified as src2dst or dst2src against it
//! - Bidirectional counters are always the sum of the directional ones

use crate::classify::Classification;
use crate::features::FlowStatistics;
use crate::packet::{Direction, Packet, TcpFlags};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Plugin-defined fields of a flow, keyed by name
pub type Extensions = BTreeMap<String, Value>;

/// Flow identity, immutable for the life of the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Smaller (address, port) endpoint
    pub lower_ip: IpAddr,
    /// Larger (address, port) endpoint
    pub upper_ip: IpAddr,
    /// Port of the smaller endpoint
    pub lower_port: u16,
    /// Port of the larger endpoint
    pub upper_port: u16,
    /// IP protocol
    pub protocol: u8,
    /// VLAN id
    pub vlan_id: u16,
    /// Tunnel id of the decoded inner header, 0 when not tunnelled
    pub tunnel_id: u32,
}

impl FlowKey {
    /// Create key from one packet orientation
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        vlan_id: u16,
        tunnel_id: u32,
    ) -> Self {
        let ((lower_ip, lower_port), (upper_ip, upper_port)) =
            if (src_ip, src_port) <= (dst_ip, dst_port) {
                ((src_ip, src_port), (dst_ip, dst_port))
            } else {
                ((dst_ip, dst_port), (src_ip, src_port))
            };
        Self {
            lower_ip,
            upper_ip,
            lower_port,
            upper_port,
            protocol,
            vlan_id,
            tunnel_id,
        }
    }

    /// Key of a (decoded) packet
    #[inline]
    pub fn from_packet(packet: &Packet) -> Self {
        Self::new(
            packet.src_ip,
            packet.src_port,
            packet.dst_ip,
            packet.dst_port,
            packet.protocol,
            packet.vlan_id,
            packet.tunnel_id,
        )
    }

    /// Stable FNV-1a hash. Unlike `std::hash`, identical across processes.
    #[inline]
    pub fn hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        let mut feed = |bytes: &[u8]| {
            for &byte in bytes {
                h ^= byte as u64;
                h = h.wrapping_mul(FNV_PRIME);
            }
        };

        for ip in [self.lower_ip, self.upper_ip] {
            match ip {
                IpAddr::V4(v4) => feed(&v4.octets()),
                IpAddr::V6(v6) => feed(&v6.octets()),
            }
        }
        feed(&self.lower_port.to_be_bytes());
        feed(&self.upper_port.to_be_bytes());
        feed(&[self.protocol]);
        feed(&self.vlan_id.to_be_bytes());
        feed(&self.tunnel_id.to_be_bytes());

        h
    }
}

/// Why a flow left the table. Numeric ids are what `expiration_id` carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationReason {
    /// No packet within the idle timeout, or flushed at end of stream
    IdleTimeout,
    /// Flow lived longer than the active timeout
    ActiveTimeout,
    /// A plugin forced the flow to end
    Custom(i32),
}

impl ExpirationReason {
    /// Value stored in `expiration_id`
    pub const fn id(self) -> i32 {
        match self {
            Self::IdleTimeout => 0,
            Self::ActiveTimeout => 1,
            Self::Custom(id) => id,
        }
    }

    /// Decode an `expiration_id`
    pub const fn from_id(id: i32) -> Self {
        match id {
            0 => Self::IdleTimeout,
            1 => Self::ActiveTimeout,
            other => Self::Custom(other),
        }
    }
}

/// Timing, volume and TCP flag counters for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionalCounters {
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub packets: u64,
    pub bytes: u64,
    pub syn_packets: u64,
    pub cwr_packets: u64,
    pub ece_packets: u64,
    pub urg_packets: u64,
    pub ack_packets: u64,
    pub psh_packets: u64,
    pub rst_packets: u64,
    pub fin_packets: u64,
}

impl DirectionalCounters {
    /// Account one packet
    #[inline]
    fn record(&mut self, time: u64, size: u32, flags: TcpFlags) {
        if self.packets == 0 {
            self.first_seen_ms = time;
        }
        self.last_seen_ms = self.last_seen_ms.max(time);
        self.packets += 1;
        self.bytes += size as u64;
        self.syn_packets += flags.has(TcpFlags::SYN) as u64;
        self.cwr_packets += flags.has(TcpFlags::CWR) as u64;
        self.ece_packets += flags.has(TcpFlags::ECE) as u64;
        self.urg_packets += flags.has(TcpFlags::URG) as u64;
        self.ack_packets += flags.has(TcpFlags::ACK) as u64;
        self.psh_packets += flags.has(TcpFlags::PSH) as u64;
        self.rst_packets += flags.has(TcpFlags::RST) as u64;
        self.fin_packets += flags.has(TcpFlags::FIN) as u64;
    }

    /// `last_seen - first_seen`, 0 when no packet was seen
    pub fn duration_ms(&self) -> u64 {
        self.last_seen_ms - self.first_seen_ms
    }
}

/// Accumulated state of one flow
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    /// Id within the owning meter, assigned in creation order
    pub id: u64,
    /// 0 idle/end of stream, 1 active timeout, other values plugin-forced
    pub expiration_id: i32,
    /// Flow identity
    pub key: FlowKey,
    /// Source of the creating packet
    pub src_ip: IpAddr,
    /// Source port of the creating packet
    pub src_port: u16,
    /// Destination of the creating packet
    pub dst_ip: IpAddr,
    /// Destination port of the creating packet
    pub dst_port: u16,
    /// IP protocol
    pub protocol: u8,
    /// 4 or 6
    pub ip_version: u8,
    /// VLAN id
    pub vlan_id: u16,
    /// Tunnel id
    pub tunnel_id: u32,
    /// Both directions
    pub bidirectional: DirectionalCounters,
    /// Creating direction
    pub src2dst: DirectionalCounters,
    /// Reply direction
    pub dst2src: DirectionalCounters,
    /// Statistical features, when enabled
    pub statistics: Option<FlowStatistics>,
    /// Application classification
    pub classification: Classification,
    pub(crate) features: Extensions,
    pub(crate) udps: Extensions,
}

impl FlowRecord {
    /// Create from the first packet of a flow
    pub fn new(id: u64, key: FlowKey, packet: &Packet, size: u32, statistics: bool) -> Self {
        let mut record = Self {
            id,
            expiration_id: 0,
            key,
            src_ip: packet.src_ip,
            src_port: packet.src_port,
            dst_ip: packet.dst_ip,
            dst_port: packet.dst_port,
            protocol: packet.protocol,
            ip_version: packet.ip_version(),
            vlan_id: packet.vlan_id,
            tunnel_id: packet.tunnel_id,
            bidirectional: DirectionalCounters::default(),
            src2dst: DirectionalCounters::default(),
            dst2src: DirectionalCounters::default(),
            statistics: statistics.then(FlowStatistics::default),
            classification: Classification::default(),
            features: Extensions::new(),
            udps: Extensions::new(),
        };
        record.bidirectional.record(packet.time, size, packet.tcp_flags);
        record.src2dst.record(packet.time, size, packet.tcp_flags);
        if let Some(stats) = record.statistics.as_mut() {
            stats.bidirectional.ps.push(size as u64);
            stats.src2dst.ps.push(size as u64);
        }
        record
    }

    /// Orientation of `packet` relative to the creating packet
    #[inline]
    pub fn direction_of(&self, packet: &Packet) -> Direction {
        if packet.src_ip == self.src_ip
            && packet.src_port == self.src_port
            && packet.dst_ip == self.dst_ip
            && packet.dst_port == self.dst_port
        {
            Direction::Src2Dst
        } else {
            Direction::Dst2Src
        }
    }

    /// Account a subsequent packet. Returns the inter-arrival time since the
    /// previous packet of the flow.
    pub fn update(&mut self, packet: &Packet, direction: Direction, size: u32) -> u64 {
        let time = packet.time.max(self.bidirectional.last_seen_ms);
        let delta = time - self.bidirectional.last_seen_ms;

        let directional = match direction {
            Direction::Src2Dst => &mut self.src2dst,
            Direction::Dst2Src => &mut self.dst2src,
        };
        let directional_delta = (directional.packets > 0)
            .then(|| time.saturating_sub(directional.last_seen_ms));
        directional.record(time, size, packet.tcp_flags);
        self.bidirectional.record(time, size, packet.tcp_flags);

        if let Some(stats) = self.statistics.as_mut() {
            let dir_stats = match direction {
                Direction::Src2Dst => &mut stats.src2dst,
                Direction::Dst2Src => &mut stats.dst2src,
            };
            dir_stats.ps.push(size as u64);
            if let Some(d) = directional_delta {
                dir_stats.piat.push(d);
            }
            stats.bidirectional.ps.push(size as u64);
            stats.bidirectional.piat.push(delta);
        }

        delta
    }

    /// Expiration reason decoded from `expiration_id`
    pub fn expiration_reason(&self) -> ExpirationReason {
        ExpirationReason::from_id(self.expiration_id)
    }

    /// Fields written by user plugins (exported under `udps.`)
    pub fn udps(&self) -> &Extensions {
        &self.udps
    }

    /// One user plugin field
    pub fn udp(&self, name: &str) -> Option<&Value> {
        self.udps.get(name)
    }

    /// Fields written by built-in feature plugins (exported unprefixed)
    pub fn features(&self) -> &Extensions {
        &self.features
    }

    /// One built-in feature field
    pub fn feature(&self, name: &str) -> Option<&Value> {
        self.features.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn packet(time: u64, forward: bool, size: u32, flags: u8) -> Packet {
        let (s, sp, d, dp) = if forward {
            (ip(1), 40000, ip(2), 443)
        } else {
            (ip(2), 443, ip(1), 40000)
        };
        Packet::new(time, s, sp, d, dp, 6)
            .with_sizes(size, size, size, 0)
            .with_tcp_flags(flags)
    }

    #[test]
    fn test_flow_key_is_direction_agnostic() {
        let a = FlowKey::from_packet(&packet(0, true, 60, 0));
        let b = FlowKey::from_packet(&packet(0, false, 60, 0));

        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_flow_key_hash() {
        let key1 = FlowKey::new(ip(1), 12345, ip(8), 443, 6, 0, 0);
        let key2 = FlowKey::new(ip(1), 12345, ip(8), 443, 6, 0, 0);
        let key3 = FlowKey::new(ip(2), 12345, ip(8), 443, 6, 0, 0);
        let key4 = FlowKey::new(ip(1), 12345, ip(8), 443, 6, 10, 0);

        assert_eq!(key1.hash(), key2.hash());
        assert_ne!(key1.hash(), key3.hash());
        assert_ne!(key1.hash(), key4.hash());
    }

    #[test]
    fn test_bidirectional_is_sum_of_directions() {
        let first = packet(100, true, 60, TcpFlags::SYN);
        let key = FlowKey::from_packet(&first);
        let mut flow = FlowRecord::new(0, key, &first, 60, true);

        let reply = packet(130, false, 60, TcpFlags::SYN | TcpFlags::ACK);
        let d = flow.direction_of(&reply);
        assert_eq!(d, Direction::Dst2Src);
        assert_eq!(flow.update(&reply, d, 60), 30);

        let ack = packet(135, true, 52, TcpFlags::ACK);
        let d = flow.direction_of(&ack);
        assert_eq!(flow.update(&ack, d, 52), 5);

        assert_eq!(flow.bidirectional.packets, 3);
        assert_eq!(
            flow.bidirectional.packets,
            flow.src2dst.packets + flow.dst2src.packets
        );
        assert_eq!(flow.bidirectional.bytes, flow.src2dst.bytes + flow.dst2src.bytes);
        assert_eq!(flow.bidirectional.syn_packets, 2);
        assert_eq!(flow.bidirectional.ack_packets, 2);
        assert_eq!(flow.dst2src.first_seen_ms, 130);
        assert_eq!(flow.src2dst.duration_ms(), 35);
        assert_eq!(flow.bidirectional.duration_ms(), 35);

        let stats = flow.statistics.unwrap();
        assert_eq!(stats.bidirectional.piat.count(), 2);
        assert_eq!(stats.src2dst.piat.count(), 1);
        assert_eq!(stats.src2dst.piat.min(), 35);
        assert_eq!(stats.dst2src.piat.count(), 0);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let first = packet(1_000, true, 60, 0);
        let mut flow = FlowRecord::new(0, FlowKey::from_packet(&first), &first, 60, false);
        let late = packet(900, true, 60, 0);

        assert_eq!(flow.update(&late, Direction::Src2Dst, 60), 0);
        assert_eq!(flow.bidirectional.last_seen_ms, 1_000);
        assert_eq!(flow.bidirectional.first_seen_ms, 1_000);
    }

    #[test]
    fn test_expiration_reason_ids() {
        assert_eq!(ExpirationReason::IdleTimeout.id(), 0);
        assert_eq!(ExpirationReason::ActiveTimeout.id(), 1);
        assert_eq!(ExpirationReason::from_id(-1), ExpirationReason::Custom(-1));
    }
}

//! Decoded Packet Metadata
//!
//! What the observer hands to the dispatcher: header fields already parsed,
//! the four framing sizes used by the accounting modes, and the captured
//! payload bytes for classification.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// TCP control bits as carried in the TCP header flags byte
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct TcpFlags(u8);

impl TcpFlags {
    /// No more data from sender
    pub const FIN: u8 = 0x01;
    /// Synchronize sequence numbers
    pub const SYN: u8 = 0x02;
    /// Reset the connection
    pub const RST: u8 = 0x04;
    /// Push function
    pub const PSH: u8 = 0x08;
    /// Acknowledgment field significant
    pub const ACK: u8 = 0x10;
    /// Urgent pointer field significant
    pub const URG: u8 = 0x20;
    /// ECN echo
    pub const ECE: u8 = 0x40;
    /// Congestion window reduced
    pub const CWR: u8 = 0x80;

    /// Create from raw header bits
    #[inline(always)]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw header bits
    #[inline(always)]
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check if flag is set
    #[inline(always)]
    pub const fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// Packet direction relative to the flow's first packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Same orientation as the packet that created the flow
    Src2Dst = 0,
    /// Reverse orientation
    Dst2Src = 1,
}

impl Direction {
    /// Numeric form used in exported sequences
    #[inline(always)]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Byte-counting convention: which framing layers count towards a packet's size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccountingMode {
    /// Link-layer frame length
    #[default]
    Raw = 0,
    /// IP header and everything above
    Ip = 1,
    /// Transport header and payload
    Transport = 2,
    /// Transport payload only
    Payload = 3,
}

impl TryFrom<i64> for AccountingMode {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Ip),
            2 => Ok(Self::Transport),
            3 => Ok(Self::Payload),
            other => Err(other),
        }
    }
}

/// Decoded inner header of a tunnelled packet (GTP, GRE, VXLAN, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelHeader {
    /// Tunnel identifier (TEID, VNI, key)
    pub tunnel_id: u32,
    /// Inner source address
    pub src_ip: IpAddr,
    /// Inner destination address
    pub dst_ip: IpAddr,
    /// Inner source port
    #[serde(default)]
    pub src_port: u16,
    /// Inner destination port
    #[serde(default)]
    pub dst_port: u16,
    /// Inner transport protocol
    pub protocol: u8,
}

/// One captured packet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Capture timestamp (milliseconds)
    pub time: u64,
    /// Source address
    pub src_ip: IpAddr,
    /// Destination address
    pub dst_ip: IpAddr,
    /// Source port (0 for portless protocols)
    #[serde(default)]
    pub src_port: u16,
    /// Destination port
    #[serde(default)]
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
    /// 802.1Q VLAN id (0 when untagged)
    #[serde(default)]
    pub vlan_id: u16,
    /// Tunnel id once the packet has been decapsulated
    #[serde(default)]
    pub tunnel_id: u32,
    /// TCP control bits (empty for non-TCP)
    #[serde(default)]
    pub tcp_flags: TcpFlags,
    /// Link-layer frame length
    pub raw_size: u32,
    /// IP length
    pub ip_size: u32,
    /// Transport length
    pub transport_size: u32,
    /// Transport payload length
    pub payload_size: u32,
    /// Captured payload bytes (hex in serialized form)
    #[serde(default, with = "hex_payload")]
    pub payload: Bytes,
    /// Inner header when the packet travels in a tunnel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner: Option<Box<TunnelHeader>>,
}

impl Packet {
    /// Create a packet with zero sizes and no payload
    pub fn new(
        time: u64,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
    ) -> Self {
        Self {
            time,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
            vlan_id: 0,
            tunnel_id: 0,
            tcp_flags: TcpFlags::default(),
            raw_size: 0,
            ip_size: 0,
            transport_size: 0,
            payload_size: 0,
            payload: Bytes::new(),
            inner: None,
        }
    }

    /// Set framing sizes
    pub fn with_sizes(mut self, raw: u32, ip: u32, transport: u32, payload: u32) -> Self {
        self.raw_size = raw;
        self.ip_size = ip;
        self.transport_size = transport;
        self.payload_size = payload;
        self
    }

    /// Set TCP control bits
    pub fn with_tcp_flags(mut self, bits: u8) -> Self {
        self.tcp_flags = TcpFlags::from_bits(bits);
        self
    }

    /// Set VLAN id
    pub fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    /// Attach captured payload
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Attach a decoded inner header
    pub fn with_tunnel(mut self, inner: TunnelHeader) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// IP version derived from the source address
    #[inline]
    pub fn ip_version(&self) -> u8 {
        match self.src_ip {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// Size under the given accounting mode
    #[inline]
    pub fn size(&self, mode: AccountingMode) -> u32 {
        match mode {
            AccountingMode::Raw => self.raw_size,
            AccountingMode::Ip => self.ip_size,
            AccountingMode::Transport => self.transport_size,
            AccountingMode::Payload => self.payload_size,
        }
    }

    /// Replace the outer 5-tuple by the inner header, if any
    pub fn decapsulate(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.src_ip = inner.src_ip;
            self.dst_ip = inner.dst_ip;
            self.src_port = inner.src_port;
            self.dst_port = inner.dst_port;
            self.protocol = inner.protocol;
            self.tunnel_id = inner.tunnel_id;
        }
    }

    /// Forget the inner header and keep metering on the outer one
    pub fn strip_tunnel(&mut self) {
        self.inner = None;
    }

    /// Drop captured bytes beyond `snaplen`
    pub fn truncate_payload(&mut self, snaplen: usize) {
        if self.payload.len() > snaplen {
            self.payload.truncate(snaplen);
        }
    }
}

mod hex_payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

//! Synthetic traces shared by unit tests

use crate::packet::{Packet, TcpFlags};
use std::net::{IpAddr, Ipv4Addr};

pub fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

/// TCP session of `n` packets starting at `start`, one packet every `gap` ms.
/// Directions alternate in pairs after the handshake.
pub fn tcp_session(client: IpAddr, cport: u16, server: IpAddr, sport: u16, start: u64, gap: u64, n: usize) -> Vec<Packet> {
    (0..n)
        .map(|i| {
            let forward = i == 0 || i == 2 || (i > 2 && (i / 2) % 2 == 1);
            let (flags, size) = match i {
                0 => (TcpFlags::SYN, 74),
                1 => (TcpFlags::SYN | TcpFlags::ACK, 74),
                _ if i == n - 1 => (TcpFlags::FIN | TcpFlags::ACK, 66),
                _ if forward => (TcpFlags::PSH | TcpFlags::ACK, 120 + (i as u32 * 37) % 400),
                _ => (TcpFlags::ACK, 66 + (i as u32 * 211) % 1400),
            };
            let p = if forward {
                Packet::new(start + gap * i as u64, client, cport, server, sport, 6)
            } else {
                Packet::new(start + gap * i as u64, server, sport, client, cport, 6)
            };
            p.with_sizes(size, size - 14, size - 34, size.saturating_sub(66))
                .with_tcp_flags(flags)
                .with_payload(vec![0u8; size.saturating_sub(66) as usize])
        })
        .collect()
}

/// DNS query/response pair
pub fn dns_exchange(client: IpAddr, cport: u16, start: u64) -> Vec<Packet> {
    let server = v4(8, 8, 8, 8);
    vec![
        Packet::new(start, client, cport, server, 53, 17).with_sizes(74, 60, 40, 32),
        Packet::new(start + 12, server, 53, client, cport, 17).with_sizes(90, 76, 56, 48),
    ]
}

/// Several interleaved conversations in capture order
pub fn mixed_trace() -> Vec<Packet> {
    let mut packets = Vec::new();
    packets.extend(tcp_session(v4(192, 168, 1, 10), 52066, v4(31, 13, 64, 35), 443, 1_000, 40, 23));
    packets.extend(tcp_session(v4(192, 168, 1, 10), 52067, v4(31, 13, 64, 35), 443, 1_020, 55, 9));
    packets.extend(tcp_session(v4(10, 0, 0, 7), 40000, v4(151, 101, 1, 69), 80, 1_500, 25, 14));
    packets.extend(tcp_session(v4(10, 0, 0, 8), 40001, v4(151, 101, 1, 69), 80, 1_700, 90, 6));
    packets.extend(tcp_session(v4(172, 16, 5, 4), 33000, v4(140, 82, 112, 4), 22, 2_100, 15, 30));
    packets.extend(dns_exchange(v4(192, 168, 1, 10), 5353, 1_010));
    packets.extend(dns_exchange(v4(10, 0, 0, 7), 5354, 1_490));
    packets.extend(dns_exchange(v4(172, 16, 5, 4), 5355, 2_090));
    packets.sort_by_key(|p| p.time);
    packets
}

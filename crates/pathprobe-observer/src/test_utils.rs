//! Hand-built ethernet frames for trace tests.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::packet::CapturedPacket;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_ECE: u8 = 0x40;
pub const TCP_CWR: u8 = 0x80;

fn ethernet(ethertype: u16, l3: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + l3.len());
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x01]); // dst mac
    frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 0x02]); // src mac
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(l3);
    frame
}

fn tcp_header(sp: u16, dp: u16, flags: u8) -> [u8; 20] {
    let mut tcp = [0u8; 20];
    tcp[0..2].copy_from_slice(&sp.to_be_bytes());
    tcp[2..4].copy_from_slice(&dp.to_be_bytes());
    tcp[12] = 5 << 4; // data offset: 5 words
    tcp[13] = flags;
    tcp
}

/// An IPv4 TCP segment with no payload.
pub fn tcp_frame_v4(src: Ipv4Addr, dst: Ipv4Addr, sp: u16, dp: u16, flags: u8) -> Vec<u8> {
    let tcp = tcp_header(sp, dp, flags);

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(20u16 + tcp.len() as u16).to_be_bytes());
    ip[8] = 64; // ttl
    ip[9] = 6;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    ip.extend_from_slice(&tcp);

    ethernet(0x0800, &ip)
}

/// An IPv6 TCP segment with no payload.
pub fn tcp_frame_v6(src: Ipv6Addr, dst: Ipv6Addr, sp: u16, dp: u16, flags: u8) -> Vec<u8> {
    let tcp = tcp_header(sp, dp, flags);

    let mut ip = vec![0u8; 40];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&(tcp.len() as u16).to_be_bytes());
    ip[6] = 6; // next header
    ip[7] = 64; // hop limit
    ip[8..24].copy_from_slice(&src.octets());
    ip[24..40].copy_from_slice(&dst.octets());
    ip.extend_from_slice(&tcp);

    ethernet(0x86DD, &ip)
}

/// An IPv4 UDP datagram with `payload_len` zero bytes of payload.
pub fn udp_frame_v4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    sp: u16,
    dp: u16,
    payload_len: usize,
) -> Vec<u8> {
    let udp_len = 8 + payload_len;
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&sp.to_be_bytes());
    udp[2..4].copy_from_slice(&dp.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(20 + udp_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());
    ip.extend_from_slice(&udp);

    ethernet(0x0800, &ip)
}

/// A minimal ARP request, which the observer must count as non-IP.
pub fn arp_frame() -> Vec<u8> {
    let mut arp = vec![0u8; 28];
    arp[0..2].copy_from_slice(&1u16.to_be_bytes()); // ethernet
    arp[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&1u16.to_be_bytes()); // request
    ethernet(0x0806, &arp)
}

/// An LLDP frame, also non-IP.
pub fn lldp_frame() -> Vec<u8> {
    ethernet(0x88CC, &[0x02, 0x07, 0x04, 0, 0, 0, 0, 0, 0])
}

pub fn at(seconds: f64, frame: Vec<u8>) -> CapturedPacket {
    CapturedPacket { seconds, frame }
}

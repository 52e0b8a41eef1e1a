//! Capture sources and packet header views.
//!
//! A [`PacketSource`] is a poll-based iterator of timestamped link-layer
//! frames. Polling (rather than blocking reads) lets the observer thread
//! notice a shutdown request without a packet arriving first.

use std::io;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use pnet::datalink::{self, Channel, Config, DataLinkReceiver};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

use crate::error::ObserverError;

/// A raw frame plus its capture timestamp in seconds.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub seconds: f64,
    pub frame: Vec<u8>,
}

/// Outcome of one poll of a [`PacketSource`].
#[derive(Debug)]
pub enum Poll {
    Packet(CapturedPacket),
    /// Nothing arrived within the source's poll interval.
    TimedOut,
    /// The source is exhausted (end of a replayed trace).
    Finished,
}

/// A source of timestamped link-layer frames.
pub trait PacketSource: Send {
    fn poll_packet(&mut self) -> Result<Poll, ObserverError>;
}

/// Live capture from a network interface via `pnet::datalink`.
///
/// The datalink channel does not surface kernel capture timestamps, so
/// frames are stamped at receipt. The observer only ever consumes
/// `seconds`, so replayed traces (which carry their own stamps) stay
/// deterministic.
pub struct DatalinkSource {
    rx: Box<dyn DataLinkReceiver>,
}

impl DatalinkSource {
    const READ_TIMEOUT_MS: u64 = 200;

    pub fn open(interface: &str) -> Result<Self, ObserverError> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface)
            .ok_or_else(|| ObserverError::NoSuchInterface(interface.to_string()))?;

        let config = Config {
            read_timeout: Some(std::time::Duration::from_millis(Self::READ_TIMEOUT_MS)),
            ..Config::default()
        };

        match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => Ok(Self { rx }),
            Ok(_) => Err(ObserverError::UnsupportedChannel(interface.to_string())),
            Err(e) => Err(ObserverError::CaptureRead(e)),
        }
    }
}

impl PacketSource for DatalinkSource {
    fn poll_packet(&mut self) -> Result<Poll, ObserverError> {
        match self.rx.next() {
            Ok(frame) => Ok(Poll::Packet(CapturedPacket {
                seconds: epoch_seconds(),
                frame: frame.to_vec(),
            })),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Poll::TimedOut),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Poll::TimedOut),
            Err(e) => Err(ObserverError::CaptureRead(e)),
        }
    }
}

fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Replays a fixed list of captured packets; used by tests and offline runs.
pub struct TraceSource {
    packets: std::vec::IntoIter<CapturedPacket>,
}

impl TraceSource {
    pub fn new(packets: Vec<CapturedPacket>) -> Self {
        Self {
            packets: packets.into_iter(),
        }
    }
}

impl PacketSource for TraceSource {
    fn poll_packet(&mut self) -> Result<Poll, ObserverError> {
        match self.packets.next() {
            Some(pkt) => Ok(Poll::Packet(pkt)),
            None => Ok(Poll::Finished),
        }
    }
}

/// The IP header of a parsed packet, v4 or v6.
pub enum IpHeader<'p> {
    V4(Ipv4Packet<'p>),
    V6(Ipv6Packet<'p>),
}

impl IpHeader<'_> {
    pub fn src(&self) -> IpAddr {
        match self {
            IpHeader::V4(v4) => IpAddr::V4(v4.get_source()),
            IpHeader::V6(v6) => IpAddr::V6(v6.get_source()),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            IpHeader::V4(v4) => IpAddr::V4(v4.get_destination()),
            IpHeader::V6(v6) => IpAddr::V6(v6.get_destination()),
        }
    }

    pub fn proto(&self) -> u8 {
        match self {
            IpHeader::V4(v4) => v4.get_next_level_protocol().0,
            IpHeader::V6(v6) => v6.get_next_header().0,
        }
    }

    /// Wire length of the IP packet, used for octet counting.
    pub fn size(&self) -> u64 {
        match self {
            IpHeader::V4(v4) => v4.get_total_length() as u64,
            IpHeader::V6(v6) => v6.get_payload_length() as u64 + 40,
        }
    }
}

/// One packet decomposed into the header views the analyzer chains consume.
pub struct ParsedPacket<'p> {
    pub seconds: f64,
    pub ip: Option<IpHeader<'p>>,
    pub tcp: Option<TcpPacket<'p>>,
    pub udp: Option<UdpPacket<'p>>,
    /// Transport header plus payload; empty when the packet is not IP.
    pub l4: &'p [u8],
}

/// Parse an ethernet frame into header views. Anything that is not IPv4 or
/// IPv6 yields `ip: None` and is counted as non-IP by the observer.
pub fn parse_frame(seconds: f64, frame: &[u8]) -> ParsedPacket<'_> {
    let mut parsed = ParsedPacket {
        seconds,
        ip: None,
        tcp: None,
        udp: None,
        l4: &[],
    };

    let Some(eth) = EthernetPacket::new(frame) else {
        return parsed;
    };
    let l3 = &frame[EthernetPacket::minimum_packet_size()..];

    match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let Some(v4) = Ipv4Packet::new(l3) else {
                return parsed;
            };
            let header_len = v4.get_header_length() as usize * 4;
            if header_len >= Ipv4Packet::minimum_packet_size() && l3.len() > header_len {
                parsed.l4 = &l3[header_len..];
            }
            parsed.ip = Some(IpHeader::V4(v4));
        }
        EtherTypes::Ipv6 => {
            let Some(v6) = Ipv6Packet::new(l3) else {
                return parsed;
            };
            let header_len = Ipv6Packet::minimum_packet_size();
            if l3.len() > header_len {
                parsed.l4 = &l3[header_len..];
            }
            parsed.ip = Some(IpHeader::V6(v6));
        }
        _ => return parsed,
    }

    match parsed.ip.as_ref().map(IpHeader::proto) {
        Some(6) => parsed.tcp = TcpPacket::new(parsed.l4),
        Some(17) => parsed.udp = UdpPacket::new(parsed.l4),
        _ => {}
    }

    parsed
}

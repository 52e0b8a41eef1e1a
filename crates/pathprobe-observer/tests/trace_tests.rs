//! Deterministic replayed-trace tests for the observer.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;

use pathprobe_observer::analyzer::{basic_count, AnalyzerChains};
use pathprobe_observer::test_utils::{
    arp_frame, at, lldp_frame, tcp_frame_v4, tcp_frame_v6, udp_frame_v4, TCP_ACK, TCP_FIN,
    TCP_SYN,
};
use pathprobe_observer::packet::parse_frame;
use pathprobe_observer::{FlowRecord, Observer, TraceSource};
use pnet::packet::tcp::TcpFlags;

const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

fn collect(observer: &mut Observer, source: &mut TraceSource) -> Vec<FlowRecord> {
    let interrupted = AtomicBool::new(false);
    let mut out = Vec::new();
    observer
        .run(source, &interrupted, |rec| out.push(rec))
        .unwrap();
    out
}

fn keep_until_fin(
    _rec: &mut FlowRecord,
    tcp: &pnet::packet::tcp::TcpPacket<'_>,
    _rev: bool,
) -> bool {
    tcp.get_flags() & TcpFlags::FIN == 0
}

fn fin_chains() -> AnalyzerChains {
    AnalyzerChains::new()
        .on_ip4(basic_count)
        .on_ip6(basic_count)
        .on_tcp(keep_until_fin)
}

#[test]
fn distinct_conversations_emit_one_record_each() {
    // three flow-distinct bidirectional conversations
    let mut packets = Vec::new();
    let mut ts = 1.0;
    for sp in [40001u16, 40002, 40003] {
        packets.push(at(ts, tcp_frame_v4(CLIENT, SERVER, sp, 80, TCP_SYN)));
        packets.push(at(
            ts + 0.1,
            tcp_frame_v4(SERVER, CLIENT, 80, sp, TCP_SYN | TCP_ACK),
        ));
        packets.push(at(ts + 0.2, tcp_frame_v4(CLIENT, SERVER, sp, 80, TCP_ACK)));
        ts += 1.0;
    }

    let mut observer = Observer::new(fin_chains());
    let records = collect(&mut observer, &mut TraceSource::new(packets));

    assert_eq!(records.len(), 3);
    let mut ports: Vec<u16> = records.iter().filter_map(|r| r.sp).collect();
    ports.sort_unstable();
    assert_eq!(ports, vec![40001, 40002, 40003]);
}

#[test]
fn forward_and_reverse_packets_collide_on_one_record() {
    let packets = vec![
        at(1.0, tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_SYN)),
        at(1.1, tcp_frame_v4(SERVER, CLIENT, 80, 40001, TCP_SYN | TCP_ACK)),
        at(1.2, tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_ACK)),
        at(1.3, tcp_frame_v4(SERVER, CLIENT, 80, 40001, TCP_ACK)),
    ];

    let mut observer = Observer::new(fin_chains());
    let records = collect(&mut observer, &mut TraceSource::new(packets));

    assert_eq!(records.len(), 1);
    let rec = &records[0];
    // the record is keyed on the first packet's direction
    assert_eq!(rec.sip, CLIENT);
    assert_eq!(rec.dip, SERVER);
    assert_eq!(rec.sp, Some(40001));
    assert_eq!(rec.pkt_fwd, 2);
    assert_eq!(rec.pkt_rev, 2);
    assert!(rec.oct_fwd > 0);
    assert!(rec.oct_rev > 0);
}

#[test]
fn fin_completes_flow_and_timer_emits_it() {
    let mut observer = Observer::new(fin_chains());

    let frames = [
        (1.0, tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_SYN)),
        (1.1, tcp_frame_v4(SERVER, CLIENT, 80, 40001, TCP_SYN | TCP_ACK)),
        (1.2, tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_FIN | TCP_ACK)),
    ];
    for (ts, frame) in &frames {
        observer.handle_packet(&parse_frame(*ts, frame));
    }

    // completed but its expiry deadline (1.2 + 5.0) has not passed
    assert!(observer.pop_emitted().is_none());

    // unrelated traffic advances the packet clock past the deadline
    let clock_mover = udp_frame_v4(CLIENT, SERVER, 40009, 53, 12);
    observer.handle_packet(&parse_frame(10.0, &clock_mover));

    let rec = observer.pop_emitted().expect("timer should have fired");
    assert_eq!(rec.sp, Some(40001));
    assert!(observer.pop_emitted().is_none());
}

#[test]
fn nonip_packets_are_counted_and_ignored() {
    let packets = vec![
        at(1.0, arp_frame()),
        at(1.1, tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_SYN)),
        at(1.2, lldp_frame()),
        at(1.3, arp_frame()),
    ];

    let mut observer = Observer::new(fin_chains());
    let records = collect(&mut observer, &mut TraceSource::new(packets));

    assert_eq!(observer.nonip_packets(), 3);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sp, Some(40001));
}

fn veto_udp(
    _rec: &mut FlowRecord,
    ip: &pathprobe_observer::packet::IpHeader<'_>,
) -> bool {
    ip.proto() != 17
}

#[test]
fn truncated_transport_header_counts_as_short_key() {
    // a TCP packet cut off after 2 bytes of transport header cannot be
    // keyed on ports
    let mut frame = tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_SYN);
    frame.truncate(14 + 20 + 2);

    let mut observer = Observer::new(fin_chains());
    observer.handle_packet(&parse_frame(1.0, &frame));

    assert_eq!(observer.short_key_packets(), 1);
    assert_eq!(observer.nonip_packets(), 0);
}

#[test]
fn new_flow_veto_ignores_the_whole_conversation() {
    let chains = AnalyzerChains::new()
        .on_new_flow(veto_udp)
        .on_ip4(basic_count);

    let packets = vec![
        at(1.0, udp_frame_v4(CLIENT, SERVER, 40001, 53, 8)),
        at(1.1, udp_frame_v4(SERVER, CLIENT, 53, 40001, 8)),
        at(1.2, tcp_frame_v4(CLIENT, SERVER, 40002, 80, TCP_SYN)),
    ];

    let mut observer = Observer::new(chains);
    let records = collect(&mut observer, &mut TraceSource::new(packets));

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].proto, 6);
}

#[test]
fn ipv6_conversations_are_keyed_like_ipv4() {
    let c6 = "2001:db8::1".parse().unwrap();
    let s6 = "2001:db8::7".parse().unwrap();

    let packets = vec![
        at(1.0, tcp_frame_v6(c6, s6, 40001, 80, TCP_SYN)),
        at(1.1, tcp_frame_v6(s6, c6, 80, 40001, TCP_SYN | TCP_ACK)),
    ];

    let mut observer = Observer::new(fin_chains());
    let records = collect(&mut observer, &mut TraceSource::new(packets));

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pkt_fwd, 1);
    assert_eq!(records[0].pkt_rev, 1);
    assert_eq!(records[0].oct_fwd, 60); // 40-byte v6 header + 20-byte tcp
}

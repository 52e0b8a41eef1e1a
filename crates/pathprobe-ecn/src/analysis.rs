//! Analyzer chains for the ECN measurement.

use pathprobe_observer::FlowRecord;
use pathprobe_observer::analyzer::{AnalyzerChains, basic_count};
use pnet::packet::tcp::{TcpFlags, TcpPacket};

/// A flow is complete once a FIN is seen in either direction.
pub fn tcp_completed(_rec: &mut FlowRecord, tcp: &TcpPacket<'_>, _rev: bool) -> bool {
    tcp.get_flags() & TcpFlags::FIN == 0
}

/// Record passive ECN negotiation evidence off the SYN exchange: the
/// forward SYN carries ECE+CWR when our stack requested ECN, and the
/// reverse SYN/ACK carries ECE when the peer agreed.
pub fn ecn_flags(rec: &mut FlowRecord, tcp: &TcpPacket<'_>, rev: bool) -> bool {
    let flags = tcp.get_flags();
    if flags & TcpFlags::SYN != 0 {
        if rev {
            rec.set("ecn_synack_ece", flags & TcpFlags::ECE != 0);
        } else {
            rec.set("ecn_syn_ece", flags & TcpFlags::ECE != 0);
            rec.set("ecn_syn_cwr", flags & TcpFlags::CWR != 0);
        }
    }
    true
}

pub fn ecn_chains() -> AnalyzerChains {
    AnalyzerChains::new()
        .on_ip4(basic_count)
        .on_ip6(basic_count)
        .on_tcp(ecn_flags)
        .on_tcp(tcp_completed)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicBool;

    use pathprobe_observer::test_utils::{
        TCP_ACK, TCP_CWR, TCP_ECE, TCP_FIN, TCP_SYN, at, tcp_frame_v4,
    };
    use pathprobe_observer::{Observer, TraceSource};
    use serde_json::Value;

    use super::*;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

    #[test]
    fn ecn_negotiation_is_recorded_from_the_syn_exchange() {
        let packets = vec![
            at(
                1.0,
                tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_SYN | TCP_ECE | TCP_CWR),
            ),
            at(
                1.1,
                tcp_frame_v4(SERVER, CLIENT, 80, 40001, TCP_SYN | TCP_ACK | TCP_ECE),
            ),
            at(1.2, tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_ACK)),
        ];

        let mut observer = Observer::new(ecn_chains());
        let interrupted = AtomicBool::new(false);
        let mut records = Vec::new();
        observer
            .run(
                &mut TraceSource::new(packets),
                &interrupted,
                |rec| records.push(rec),
            )
            .unwrap();

        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.get("ecn_syn_ece"), Some(&Value::Bool(true)));
        assert_eq!(rec.get("ecn_syn_cwr"), Some(&Value::Bool(true)));
        assert_eq!(rec.get("ecn_synack_ece"), Some(&Value::Bool(true)));
    }

    #[test]
    fn fin_completes_the_flow() {
        let mut rec = FlowRecord::new(
            CLIENT.into(),
            SERVER.into(),
            Some(40001),
            Some(80),
            6,
            1.0,
        );

        let fin = tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_FIN | TCP_ACK);
        let parsed = pathprobe_observer::packet::parse_frame(1.0, &fin);
        let keep = tcp_completed(&mut rec, parsed.tcp.as_ref().unwrap(), false);
        assert!(!keep);

        let ack = tcp_frame_v4(CLIENT, SERVER, 40001, 80, TCP_ACK);
        let parsed = pathprobe_observer::packet::parse_frame(1.1, &ack);
        let keep = tcp_completed(&mut rec, parsed.tcp.as_ref().unwrap(), false);
        assert!(keep);
    }
}

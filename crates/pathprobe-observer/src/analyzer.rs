//! Analyzer chains.
//!
//! Each chain is an ordered list of callbacks invoked per packet layer.
//! Every callback returns `keep`; returning `false` from the new-flow
//! chain vetoes the flow entirely, while `false` from a per-packet chain
//! marks the flow complete. The `reverse` argument is true when the packet
//! matched its flow by the reverse ID.

use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;

use crate::packet::IpHeader;
use crate::record::FlowRecord;

pub type NewFlowFn = Box<dyn for<'p> FnMut(&mut FlowRecord, &IpHeader<'p>) -> bool + Send>;
pub type IpFn = Box<dyn for<'p> FnMut(&mut FlowRecord, &IpHeader<'p>, bool) -> bool + Send>;
pub type TcpFn = Box<dyn for<'p> FnMut(&mut FlowRecord, &TcpPacket<'p>, bool) -> bool + Send>;
pub type UdpFn = Box<dyn for<'p> FnMut(&mut FlowRecord, &UdpPacket<'p>, bool) -> bool + Send>;
pub type L4Fn = Box<dyn FnMut(&mut FlowRecord, &[u8], bool) -> bool + Send>;

/// The full set of analyzer chains an [`crate::Observer`] runs.
///
/// The transport chains are mutually exclusive per packet: `tcp` for TCP,
/// `udp` for UDP, and `l4` for everything else.
#[derive(Default)]
pub struct AnalyzerChains {
    pub(crate) new_flow: Vec<NewFlowFn>,
    pub(crate) ip4: Vec<IpFn>,
    pub(crate) ip6: Vec<IpFn>,
    pub(crate) tcp: Vec<TcpFn>,
    pub(crate) udp: Vec<UdpFn>,
    pub(crate) l4: Vec<L4Fn>,
}

impl AnalyzerChains {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_flow(
        mut self,
        f: impl for<'p> FnMut(&mut FlowRecord, &IpHeader<'p>) -> bool + Send + 'static,
    ) -> Self {
        self.new_flow.push(Box::new(f));
        self
    }

    pub fn on_ip4(
        mut self,
        f: impl for<'p> FnMut(&mut FlowRecord, &IpHeader<'p>, bool) -> bool + Send + 'static,
    ) -> Self {
        self.ip4.push(Box::new(f));
        self
    }

    pub fn on_ip6(
        mut self,
        f: impl for<'p> FnMut(&mut FlowRecord, &IpHeader<'p>, bool) -> bool + Send + 'static,
    ) -> Self {
        self.ip6.push(Box::new(f));
        self
    }

    pub fn on_tcp(
        mut self,
        f: impl for<'p> FnMut(&mut FlowRecord, &TcpPacket<'p>, bool) -> bool + Send + 'static,
    ) -> Self {
        self.tcp.push(Box::new(f));
        self
    }

    pub fn on_udp(
        mut self,
        f: impl for<'p> FnMut(&mut FlowRecord, &UdpPacket<'p>, bool) -> bool + Send + 'static,
    ) -> Self {
        self.udp.push(Box::new(f));
        self
    }

    pub fn on_l4(
        mut self,
        f: impl FnMut(&mut FlowRecord, &[u8], bool) -> bool + Send + 'static,
    ) -> Self {
        self.l4.push(Box::new(f));
        self
    }
}

/// Count packets and octets per direction.
pub fn basic_count(rec: &mut FlowRecord, ip: &IpHeader<'_>, rev: bool) -> bool {
    if rev {
        rec.pkt_rev += 1;
        rec.oct_rev += ip.size();
    } else {
        rec.pkt_fwd += 1;
        rec.oct_fwd += ip.size();
    }
    true
}

/// Chains that just count traffic in both address families.
pub fn counting_chains() -> AnalyzerChains {
    AnalyzerChains::new().on_ip4(basic_count).on_ip6(basic_count)
}

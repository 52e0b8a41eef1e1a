//! Flow records and the key used to join them with active results.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::packet::IpHeader;

/// The identity a flow record is joined on: the remote address and the
/// client-side ephemeral port. For an observed flow the remote address is
/// the destination and the local port is the packet-level source port of
/// outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub remote_ip: IpAddr,
    pub local_port: u16,
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.remote_ip, self.local_port)
    }
}

/// One observed flow.
///
/// The base fields are present on every record; analyzer chains and the
/// merge step grow the open-schema `fields` map, which downstream
/// consumers read by name. Reusing a name another analyzer already wrote
/// is a programmer error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub sp: Option<u16>,
    pub dp: Option<u16>,
    pub proto: u8,
    pub first_ts: f64,
    pub last_ts: f64,
    pub pkt_fwd: u64,
    pub pkt_rev: u64,
    pub oct_fwd: u64,
    pub oct_rev: u64,
    #[serde(flatten)]
    fields: BTreeMap<String, Value>,
}

impl FlowRecord {
    pub fn new(sip: IpAddr, dip: IpAddr, sp: Option<u16>, dp: Option<u16>, proto: u8, ts: f64) -> Self {
        Self {
            sip,
            dip,
            sp,
            dp,
            proto,
            first_ts: ts,
            last_ts: ts,
            pkt_fwd: 0,
            pkt_rev: 0,
            oct_fwd: 0,
            oct_rev: 0,
            fields: BTreeMap::new(),
        }
    }

    /// Build a record from the first packet of a flow, taking addresses and
    /// (when the protocol has them) ports off the wire.
    pub fn from_packet(ip: &IpHeader<'_>, l4: &[u8], ts: f64) -> Self {
        let (sp, dp) = match ip.proto() {
            6 | 17 | 132 => ports_of(l4),
            _ => (None, None),
        };
        Self::new(ip.src(), ip.dst(), sp, dp, ip.proto(), ts)
    }

    /// Set an analyzer-populated field.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    /// Read an analyzer-populated field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// The join key of this flow, if the protocol carries ports.
    pub fn flow_key(&self) -> Option<FlowKey> {
        self.sp.map(|sp| FlowKey {
            remote_ip: self.dip,
            local_port: sp,
        })
    }
}

fn ports_of(l4: &[u8]) -> (Option<u16>, Option<u16>) {
    match l4 {
        [s1, s2, d1, d2, ..] => (
            Some(u16::from_be_bytes([*s1, *s2])),
            Some(u16::from_be_bytes([*d1, *d2])),
        ),
        _ => (None, None),
    }
}

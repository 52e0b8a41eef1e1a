//! The flow observer: packet dispatch, flow tables, and the packet-time
//! timer heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

use tracing::debug;

use crate::analyzer::AnalyzerChains;
use crate::error::ObserverError;
use crate::flowid::{self, FlowId};
use crate::packet::{IpHeader, PacketSource, ParsedPacket, Poll, parse_frame};
use crate::record::FlowRecord;

/// Packet time a completed flow waits before emission, so that trailing
/// packets of the conversation still land on the record.
pub const EXPIRY_DELAY: f64 = 5.0;

/// Default idle timeout for [`Observer::purge_idle`].
pub const IDLE_TIMEOUT: f64 = 30.0;

struct TimerEntry {
    deadline: f64,
    seq: u64,
    fid: FlowId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq && self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .total_cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

enum Place {
    Active,
    Expiring,
}

/// Reconstructs bidirectional flows from a packet stream.
///
/// All state is owned by the observer; the driving thread feeds it packets
/// via [`Observer::run`] or [`Observer::handle_packet`] and drains emitted
/// records. The clock only ever advances with packet timestamps, so a
/// replayed trace is fully deterministic.
pub struct Observer {
    chains: AnalyzerChains,

    /// Current packet clock.
    pt: f64,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    timer_seq: u64,
    expiry_delay: f64,

    active: HashMap<FlowId, FlowRecord>,
    expiring: HashMap<FlowId, FlowRecord>,
    ignored: HashSet<FlowId>,

    emitted: VecDeque<FlowRecord>,

    ct_nonip: u64,
    ct_shortkey: u64,
}

impl Observer {
    pub fn new(chains: AnalyzerChains) -> Self {
        Self::with_expiry_delay(chains, EXPIRY_DELAY)
    }

    pub fn with_expiry_delay(chains: AnalyzerChains, expiry_delay: f64) -> Self {
        Self {
            chains,
            pt: 0.0,
            timers: BinaryHeap::new(),
            timer_seq: 0,
            expiry_delay,
            active: HashMap::new(),
            expiring: HashMap::new(),
            ignored: HashSet::new(),
            emitted: VecDeque::new(),
            ct_nonip: 0,
            ct_shortkey: 0,
        }
    }

    /// Read packets until the source finishes or `interrupted` is set,
    /// handing every emitted flow record to `emit`. Flushes all remaining
    /// flows before returning.
    pub fn run<F>(
        &mut self,
        source: &mut dyn PacketSource,
        interrupted: &AtomicBool,
        mut emit: F,
    ) -> Result<(), ObserverError>
    where
        F: FnMut(FlowRecord),
    {
        loop {
            if interrupted.load(Relaxed) {
                break;
            }
            match source.poll_packet()? {
                Poll::Packet(cap) => {
                    let parsed = parse_frame(cap.seconds, &cap.frame);
                    self.handle_packet(&parsed);
                    while let Some(rec) = self.emitted.pop_front() {
                        emit(rec);
                    }
                }
                Poll::TimedOut => continue,
                Poll::Finished => break,
            }
        }

        self.flush();
        while let Some(rec) = self.emitted.pop_front() {
            emit(rec);
        }
        Ok(())
    }

    /// Dispatch one parsed packet.
    pub fn handle_packet(&mut self, pkt: &ParsedPacket<'_>) {
        self.tick(pkt.seconds);

        let Some(ip) = &pkt.ip else {
            self.ct_nonip += 1;
            return;
        };
        let Some((fid, rid)) = flowid::flow_ids(ip, pkt.l4) else {
            self.ct_shortkey += 1;
            return;
        };

        if self.ignored.contains(&fid) || self.ignored.contains(&rid) {
            return;
        }

        let (key, place, rev) = if self.active.contains_key(&fid) {
            (fid, Place::Active, false)
        } else if self.expiring.contains_key(&fid) {
            (fid, Place::Expiring, false)
        } else if self.active.contains_key(&rid) {
            (rid, Place::Active, true)
        } else if self.expiring.contains_key(&rid) {
            (rid, Place::Expiring, true)
        } else {
            let mut rec = FlowRecord::from_packet(ip, pkt.l4, self.pt);
            for f in &mut self.chains.new_flow {
                if !f(&mut rec, ip) {
                    debug!("ignoring flow {:?}", fid.as_bytes());
                    self.ignored.insert(fid);
                    return;
                }
            }
            debug!("new flow {:?}", fid.as_bytes());
            self.active.insert(fid.clone(), rec);
            (fid, Place::Active, false)
        };

        let rec = match place {
            Place::Active => self.active.get_mut(&key),
            Place::Expiring => self.expiring.get_mut(&key),
        };
        let Some(rec) = rec else { return };

        rec.last_ts = self.pt;

        let mut keep = true;
        match ip {
            IpHeader::V4(_) => {
                for f in &mut self.chains.ip4 {
                    keep = keep && f(rec, ip, rev);
                }
            }
            IpHeader::V6(_) => {
                for f in &mut self.chains.ip6 {
                    keep = keep && f(rec, ip, rev);
                }
            }
        }

        if let Some(tcp) = &pkt.tcp {
            for f in &mut self.chains.tcp {
                keep = keep && f(rec, tcp, rev);
            }
        } else if let Some(udp) = &pkt.udp {
            for f in &mut self.chains.udp {
                keep = keep && f(rec, udp, rev);
            }
        } else {
            for f in &mut self.chains.l4 {
                keep = keep && f(rec, pkt.l4, rev);
            }
        }

        if !keep {
            self.flow_complete(&key);
        }
    }

    /// Advance the packet clock and fire every timer whose deadline has
    /// been reached, in deadline order. The clock never moves backwards.
    fn tick(&mut self, pt: f64) {
        if pt > self.pt {
            self.pt = pt;
        }
        let pt = self.pt;

        while self
            .timers
            .peek()
            .is_some_and(|Reverse(t)| t.deadline <= pt)
        {
            if let Some(Reverse(t)) = self.timers.pop()
                && let Some(rec) = self.expiring.remove(&t.fid)
            {
                self.emitted.push_back(rec);
            }
        }
    }

    fn set_timer(&mut self, delay: f64, fid: FlowId) {
        self.timers.push(Reverse(TimerEntry {
            deadline: self.pt + delay,
            seq: self.timer_seq,
            fid,
        }));
        self.timer_seq += 1;
    }

    /// Mark a flow complete: move it to the expiring table and schedule
    /// its emission. Completing an already-expiring flow is a no-op.
    fn flow_complete(&mut self, fid: &FlowId) {
        match self.active.remove(fid) {
            Some(rec) => {
                debug!("moving flow {:?} to expiring", fid.as_bytes());
                self.expiring.insert(fid.clone(), rec);
                self.set_timer(self.expiry_delay, fid.clone());
            }
            None => debug!("tried to expire an already expiring flow"),
        }
    }

    /// Complete every active flow that has seen no traffic for `timeout`
    /// seconds of packet time.
    pub fn purge_idle(&mut self, timeout: f64) {
        let stale: Vec<FlowId> = self
            .active
            .iter()
            .filter(|(_, rec)| self.pt - rec.last_ts > timeout)
            .map(|(fid, _)| fid.clone())
            .collect();

        for fid in stale {
            self.flow_complete(&fid);
        }
    }

    /// Emit everything still held: expiring flows first, then active flows
    /// that never completed (e.g. connections that never saw a FIN).
    pub fn flush(&mut self) {
        for (_, rec) in self.expiring.drain() {
            self.emitted.push_back(rec);
        }
        for (_, rec) in self.active.drain() {
            self.emitted.push_back(rec);
        }
        self.ignored.clear();
        self.timers.clear();
    }

    /// Pop the next emitted flow record, if any.
    pub fn pop_emitted(&mut self) -> Option<FlowRecord> {
        self.emitted.pop_front()
    }

    /// Count of non-IP packets skipped.
    pub fn nonip_packets(&self) -> u64 {
        self.ct_nonip
    }

    /// Count of packets whose transport payload was too short to key.
    pub fn short_key_packets(&self) -> u64 {
        self.ct_shortkey
    }
}

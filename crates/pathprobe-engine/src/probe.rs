//! The capability set a concrete measurement supplies to the engine.

use std::fmt::{Display, Formatter};
use std::net::IpAddr;

use pathprobe_observer::{FlowKey, FlowRecord};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// One measurement target. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub hostname: String,
}

impl Job {
    pub fn new(remote_ip: IpAddr, remote_port: u16, hostname: impl Into<String>) -> Self {
        Self {
            remote_ip,
            remote_port,
            hostname: hostname.into(),
        }
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.remote_ip, self.remote_port, self.hostname)
    }
}

/// Which of the two host configurations a connection ran under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigId {
    Zero,
    One,
}

impl ConfigId {
    pub fn index(self) -> u8 {
        match self {
            ConfigId::Zero => 0,
            ConfigId::One => 1,
        }
    }
}

impl Display for ConfigId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// How a single connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Ok,
    Timeout,
    Failed,
}

impl ConnState {
    pub fn is_ok(self) -> bool {
        matches!(self, ConnState::Ok)
    }
}

/// The outcome of one phase of a paired probe. `local_port` is the
/// ephemeral port the host stack assigned on the client side; it is the
/// key that joins this outcome to the passively observed flow, so it must
/// be present even when the connection timed out or failed.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub local_port: u16,
    pub hostname: String,
    pub config: ConfigId,
    pub ok: bool,
}

impl ProbeResult {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            remote_ip: self.remote_ip,
            local_port: self.local_port,
        }
    }
}

/// The abstract operations of a concrete measurement. An implementation
/// is shared by every engine thread, so anything mutable behind these
/// methods needs its own synchronization.
pub trait Probe: Send + Sync + 'static {
    /// State carried from `pre_connect` through both connection phases.
    type PreConn: Send;

    /// Raw connection outcome handed from `connect` to `post_connect`.
    type Conn: Send;

    /// Put the host into configuration zero. Must be idempotent.
    fn config_zero(&self) -> Result<(), EngineError>;

    /// Put the host into configuration one. Must be idempotent.
    fn config_one(&self) -> Result<(), EngineError>;

    /// Hook run once per job before either connection phase.
    fn pre_connect(&self, job: &Job) -> Self::PreConn;

    /// Perform the network action under the currently active
    /// configuration. Must capture the local ephemeral port in all three
    /// outcome states (ok, timeout, failed).
    fn connect(&self, job: &Job, pcs: &mut Self::PreConn, config: ConfigId) -> Self::Conn;

    /// Shape the raw connection outcome into a result record.
    fn post_connect(
        &self,
        job: &Job,
        conn: Self::Conn,
        pcs: &mut Self::PreConn,
        config: ConfigId,
    ) -> ProbeResult;

    /// Turn an externally produced flow record (ingress deployment) into
    /// a [`FlowRecord`]. Returning `None` discards the record. The
    /// default discards everything; capture deployments never call this.
    fn tupleize_flow(&self, raw: Map<String, Value>) -> Option<FlowRecord> {
        let _ = raw;
        None
    }

    /// Join an observed flow with an active result. A typical
    /// implementation decorates the flow record with fields from the
    /// result.
    fn merge(&self, flow: FlowRecord, res: &ProbeResult) -> FlowRecord;
}

//! The ECN measurement: sysctl configuration hooks, a TCP connect that
//! always learns its ephemeral port, and the merge decoration.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::{Command, Stdio};
use std::time::Duration;

use pathprobe_engine::{ConfigId, ConnState, EngineError, Job, Probe, ProbeResult};
use pathprobe_observer::FlowRecord;
use serde_json::{Map, Value};
use socket2::{Domain, Socket, Type};
use tracing::{debug, info};

pub struct EcnProbe {
    conn_timeout: Duration,
}

impl EcnProbe {
    pub fn new(conn_timeout: Duration) -> Self {
        Self { conn_timeout }
    }
}

pub struct EcnConnection {
    socket: Option<Socket>,
    local_port: u16,
    state: ConnState,
}

fn set_tcp_ecn(value: u8) -> Result<(), EngineError> {
    let status = Command::new("/sbin/sysctl")
        .arg("-w")
        .arg(format!("net.ipv4.tcp_ecn={value}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        Err(EngineError::Configuration(format!(
            "sysctl net.ipv4.tcp_ecn={value} exited with {status}"
        )))
    }
}

/// Bind an ephemeral port first, then connect, so the port is known even
/// when the connect itself times out or is refused.
fn try_connect(remote: SocketAddr, timeout: Duration) -> io::Result<EcnConnection> {
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, None)?;

    let bind_addr = match remote {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    socket.bind(&bind_addr.into())?;

    let local_port = socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .unwrap_or(0);

    let state = match socket.connect_timeout(&remote.into(), timeout) {
        Ok(()) => ConnState::Ok,
        Err(e) if e.kind() == io::ErrorKind::TimedOut => ConnState::Timeout,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => ConnState::Timeout,
        Err(_) => ConnState::Failed,
    };

    Ok(EcnConnection {
        socket: Some(socket),
        local_port,
        state,
    })
}

impl Probe for EcnProbe {
    type PreConn = ();
    type Conn = EcnConnection;

    fn config_zero(&self) -> Result<(), EngineError> {
        set_tcp_ecn(2)?;
        info!("configurator disabled ECN negotiation");
        Ok(())
    }

    fn config_one(&self) -> Result<(), EngineError> {
        set_tcp_ecn(1)?;
        info!("configurator enabled ECN negotiation");
        Ok(())
    }

    fn pre_connect(&self, _job: &Job) {}

    fn connect(&self, job: &Job, _pcs: &mut (), config: ConfigId) -> EcnConnection {
        let remote = SocketAddr::new(job.remote_ip, job.remote_port);
        match try_connect(remote, self.conn_timeout) {
            Ok(conn) => conn,
            Err(e) => {
                // socket creation or bind failed; no port to correlate on
                debug!("connect to {remote} under config {config} failed early: {e}");
                EcnConnection {
                    socket: None,
                    local_port: 0,
                    state: ConnState::Failed,
                }
            }
        }
    }

    fn post_connect(
        &self,
        job: &Job,
        conn: EcnConnection,
        _pcs: &mut (),
        config: ConfigId,
    ) -> ProbeResult {
        if let Some(socket) = &conn.socket {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }

        ProbeResult {
            remote_ip: job.remote_ip,
            remote_port: job.remote_port,
            local_port: conn.local_port,
            hostname: job.hostname.clone(),
            config,
            ok: conn.state.is_ok(),
        }
    }

    fn tupleize_flow(&self, raw: Map<String, Value>) -> Option<FlowRecord> {
        let sip: IpAddr = raw.get("sip")?.as_str()?.parse().ok()?;
        let dip: IpAddr = raw.get("dip")?.as_str()?.parse().ok()?;
        let sp = raw.get("sp").and_then(Value::as_u64).map(|v| v as u16);
        let dp = raw.get("dp").and_then(Value::as_u64).map(|v| v as u16);
        let proto = raw.get("proto").and_then(Value::as_u64).unwrap_or(6) as u8;
        let first_ts = raw.get("first_ts").and_then(Value::as_f64).unwrap_or(0.0);

        let mut rec = FlowRecord::new(sip, dip, sp, dp, proto, first_ts);
        rec.last_ts = raw.get("last_ts").and_then(Value::as_f64).unwrap_or(first_ts);
        rec.pkt_fwd = raw.get("pkt_fwd").and_then(Value::as_u64).unwrap_or(0);
        rec.pkt_rev = raw.get("pkt_rev").and_then(Value::as_u64).unwrap_or(0);
        rec.oct_fwd = raw.get("oct_fwd").and_then(Value::as_u64).unwrap_or(0);
        rec.oct_rev = raw.get("oct_rev").and_then(Value::as_u64).unwrap_or(0);

        // carry any analyzer fields the meter exported
        const BASE: [&str; 11] = [
            "sip", "dip", "sp", "dp", "proto", "first_ts", "last_ts", "pkt_fwd", "pkt_rev",
            "oct_fwd", "oct_rev",
        ];
        for (name, value) in raw {
            if !BASE.contains(&name.as_str()) {
                rec.set(&name, value);
            }
        }
        Some(rec)
    }

    fn merge(&self, mut flow: FlowRecord, res: &ProbeResult) -> FlowRecord {
        flow.set("connstate", res.ok);
        flow.set("ecnstate", res.config.index());
        info!(
            "result: {} port {} ecnstate={} connstate={}",
            res.hostname, res.local_port, res.config, res.ok
        );
        flow
    }
}

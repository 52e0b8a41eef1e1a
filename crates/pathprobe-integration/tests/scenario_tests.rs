//! End-to-end scenarios: a replayed capture trace on one side, a probe
//! with scripted connects on the other, joined by the real engine.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::{Duration, Instant};

use pathprobe_engine::{
    ConfigId, EngineError, FlowSource, Job, Probe, ProbeResult, Spider, SpiderConfig,
};
use pathprobe_observer::analyzer::counting_chains;
use pathprobe_observer::test_utils::{TCP_ACK, TCP_SYN, at, tcp_frame_v4};
use pathprobe_observer::{CapturedPacket, FlowRecord, Observer, TraceSource};
use serde_json::Value;

const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
const SERVER: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

/// A probe with scripted connect outcomes. Local ports are derived from
/// the target port (`remote_port * 2 + config`) so traces can be built
/// ahead of time; `fail_config_one` turns every config-one connect into
/// a timeout.
struct ScriptedProbe {
    fail_config_one: bool,
    connects: Arc<AtomicUsize>,
    results: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    fn new(fail_config_one: bool) -> Self {
        Self {
            fail_config_one,
            connects: Arc::new(AtomicUsize::new(0)),
            results: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn scripted_port(job: &Job, config: ConfigId) -> u16 {
    job.remote_port * 2 + config.index() as u16
}

impl Probe for ScriptedProbe {
    type PreConn = ();
    type Conn = ProbeResult;

    fn config_zero(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn config_one(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn pre_connect(&self, _job: &Job) {}

    fn connect(&self, job: &Job, _pcs: &mut (), config: ConfigId) -> ProbeResult {
        self.connects.fetch_add(1, SeqCst);
        let timed_out = self.fail_config_one && config == ConfigId::One;

        ProbeResult {
            remote_ip: job.remote_ip,
            remote_port: job.remote_port,
            local_port: scripted_port(job, config),
            hostname: job.hostname.clone(),
            config,
            ok: !timed_out,
        }
    }

    fn post_connect(
        &self,
        _job: &Job,
        conn: ProbeResult,
        _pcs: &mut (),
        _config: ConfigId,
    ) -> ProbeResult {
        self.results.fetch_add(1, SeqCst);
        conn
    }

    fn merge(&self, mut flow: FlowRecord, res: &ProbeResult) -> FlowRecord {
        flow.set("connstate", res.ok);
        flow.set("ecnstate", res.config.index());
        flow
    }
}

fn test_config(worker_count: usize) -> SpiderConfig {
    let mut config = SpiderConfig::new(worker_count);
    config.queue_sleep = Duration::from_millis(50);
    config.initial_wait = Duration::from_millis(0);
    config.final_wait = Duration::from_millis(100);
    config.interrupt_poll = Duration::from_millis(200);
    config
}

fn capture_of(packets: Vec<CapturedPacket>) -> FlowSource {
    FlowSource::Capture {
        observer: Observer::new(counting_chains()),
        source: Box::new(TraceSource::new(packets)),
    }
}

/// A full bidirectional handshake from local port `sp`, starting at `ts`.
fn handshake(sp: u16, dp: u16, ts: f64) -> Vec<CapturedPacket> {
    vec![
        at(ts, tcp_frame_v4(CLIENT, SERVER, sp, dp, TCP_SYN)),
        at(ts + 0.1, tcp_frame_v4(SERVER, CLIENT, dp, sp, TCP_SYN | TCP_ACK)),
        at(ts + 0.2, tcp_frame_v4(CLIENT, SERVER, sp, dp, TCP_ACK)),
    ]
}

/// Unanswered SYNs from local port `sp`, the trace a timed-out connect
/// leaves behind.
fn unanswered_syns(sp: u16, dp: u16, ts: f64) -> Vec<CapturedPacket> {
    vec![
        at(ts, tcp_frame_v4(CLIENT, SERVER, sp, dp, TCP_SYN)),
        at(ts + 1.0, tcp_frame_v4(CLIENT, SERVER, sp, dp, TCP_SYN)),
    ]
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn single_job_happy_path() {
    // the job's scripted local ports are 160 and 161
    let job = Job::new(IpAddr::V4(SERVER), 80, "example.test");

    let mut trace = handshake(160, 80, 1.0);
    trace.extend(handshake(161, 80, 2.0));

    let probe = ScriptedProbe::new(false);
    let results = probe.results.clone();
    let mut spider = Spider::new(probe, test_config(2), capture_of(trace));
    let merged = spider.merged();

    spider.run();
    spider.add_job(job);

    assert!(wait_until(Duration::from_secs(10), || {
        results.load(SeqCst) == 2
    }));

    let first = merged.recv_timeout(Duration::from_secs(10)).unwrap();
    let second = merged.recv_timeout(Duration::from_secs(10)).unwrap();
    spider.stop().unwrap();

    assert_eq!(first.sp, Some(160));
    assert_eq!(first.get("ecnstate"), Some(&Value::from(0)));
    assert_eq!(first.get("connstate"), Some(&Value::Bool(true)));
    assert_eq!(first.dip, IpAddr::V4(SERVER));
    assert_eq!(first.pkt_fwd, 2);
    assert_eq!(first.pkt_rev, 1);

    assert_eq!(second.sp, Some(161));
    assert_eq!(second.get("ecnstate"), Some(&Value::from(1)));
    assert_eq!(second.get("connstate"), Some(&Value::Bool(true)));
}

#[test]
fn connect_failure_under_config_one_still_correlates() {
    let job = Job::new(IpAddr::V4(SERVER), 80, "example.test");

    // config zero handshakes; config one only ever sent SYNs
    let mut trace = handshake(160, 80, 1.0);
    trace.extend(unanswered_syns(161, 80, 2.0));

    let probe = ScriptedProbe::new(true);
    let mut spider = Spider::new(probe, test_config(2), capture_of(trace));
    let merged = spider.merged();

    spider.run();
    spider.add_job(job);

    let first = merged.recv_timeout(Duration::from_secs(10)).unwrap();
    let second = merged.recv_timeout(Duration::from_secs(10)).unwrap();
    spider.stop().unwrap();

    assert_eq!(first.get("ecnstate"), Some(&Value::from(0)));
    assert_eq!(first.get("connstate"), Some(&Value::Bool(true)));

    // the failed attempt still merged on its ephemeral port
    assert_eq!(second.sp, Some(161));
    assert_eq!(second.get("ecnstate"), Some(&Value::from(1)));
    assert_eq!(second.get("connstate"), Some(&Value::Bool(false)));
    assert_eq!(second.pkt_rev, 0);
}

#[test]
fn interrupt_drains_the_job_queue_and_stops_cleanly() {
    let probe = ScriptedProbe::new(false);
    let results = probe.results.clone();

    // flows for every target's both phases, delivered up front
    let mut trace = Vec::new();
    let mut ts = 1.0;
    for port in 0..100u16 {
        let dp = 1000 + port;
        trace.extend(handshake(scripted_port(&job_for(dp), ConfigId::Zero), dp, ts));
        trace.extend(handshake(scripted_port(&job_for(dp), ConfigId::One), dp, ts + 0.5));
        ts += 1.0;
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let mut spider = Spider::new(probe, test_config(2), capture_of(trace)).check_interrupt({
        let interrupt = interrupt.clone();
        move || interrupt.load(SeqCst)
    });
    let merged = spider.merged();

    spider.run();
    for port in 0..100u16 {
        spider.add_job(job_for(1000 + port));
    }

    // let roughly ten jobs complete, then interrupt
    assert!(wait_until(Duration::from_secs(30), || {
        results.load(SeqCst) >= 20
    }));
    interrupt.store(true, SeqCst);

    assert!(wait_until(Duration::from_secs(30), || !spider.is_running()));
    spider.stop().unwrap();

    let outcomes = results.load(SeqCst);
    assert_eq!(outcomes % 2, 0, "results must come in pairs");
    assert!(outcomes >= 20);
    assert!(
        outcomes < 200,
        "interrupt did not abort the remaining jobs (got {outcomes} outcomes)"
    );

    // every outcome whose flow arrived was merged
    let merged_count = merged.try_iter().count();
    assert_eq!(merged_count, outcomes);
}

fn job_for(port: u16) -> Job {
    Job::new(IpAddr::V4(SERVER), port, format!("host-{port}"))
}

//!
//! # Operating Model
//!
//! - **Paired probes**: every target is connected to twice, once with ECN
//!   negotiation disabled (`net.ipv4.tcp_ecn=2`) and once with it enabled
//!   (`net.ipv4.tcp_ecn=1`). The configurator flips the sysctl for the
//!   whole worker pool at once, so connects under different settings never
//!   overlap.
//!
//! - **Passive confirmation**: an in-process observer (or an external
//!   meter feeding the ingress listener) reconstructs the flows those
//!   connects produced, including the ECN bits seen on the SYN exchange.
//!
//! - **Correlation**: the merger joins both views on the client's
//!   ephemeral port and the remote address, and the merged records are
//!   printed as JSON lines.
//!
mod analysis;
mod args;
mod ecn;

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::thread;

use clap::Parser;
use pathprobe_engine::jobs::{jobs_from_csv_file, jobs_from_hostname_file};
use pathprobe_engine::{EngineError, FlowSource, Job, MeterCommand, Spider, SpiderConfig};
use pathprobe_observer::{DatalinkSource, Observer, ObserverError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter};

use crate::analysis::ecn_chains;
use crate::args::{Args, TargetFormat};
use crate::ecn::EcnProbe;

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Observer(#[from] ObserverError),
}

fn main() {
    let args = Args::parse();

    enable_logging(&args);
    debug!("command line: {args:?}");

    if let Err(e) = run(&args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), CliError> {
    let jobs = load_jobs(args)?;
    info!("loaded {} targets from {}", jobs.len(), args.targets);
    log_vantage(&jobs);

    let flow_source = make_flow_source(args)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    set_ctrlc_handler(interrupted.clone());

    let probe = EcnProbe::new(args.conn_timeout());
    let mut spider = Spider::new(probe, SpiderConfig::new(args.workers), flow_source)
        .check_interrupt({
            let interrupted = interrupted.clone();
            move || interrupted.load(Relaxed)
        });

    // print merged records as JSON lines while the measurement runs
    let merged = spider.merged();
    let printer = thread::spawn(move || {
        for rec in merged.iter() {
            match serde_json::to_string(&rec) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("cannot serialize merged record: {e}"),
            }
        }
    });

    spider.run();
    for job in jobs {
        spider.add_job(job);
    }

    let result = spider.stop();
    drop(spider); // closes the merged stream so the printer finishes
    let _ = printer.join();

    result?;
    info!("measurement complete");
    Ok(())
}

fn load_jobs(args: &Args) -> Result<Vec<Job>, EngineError> {
    let path = std::path::Path::new(&args.targets);
    match args.format {
        TargetFormat::Hostnames => jobs_from_hostname_file(path, args.port),
        TargetFormat::Csv => jobs_from_csv_file(path),
    }
}

fn make_flow_source(args: &Args) -> Result<FlowSource, ObserverError> {
    if args.listener {
        let meter = args.meter.clone().map(|program| MeterCommand {
            program,
            interface_uri: args.interface.clone(),
            export_port: args.ipfix_port,
            config: meter_config(),
            elevate: args.elevate_meter,
        });
        return Ok(FlowSource::Listener {
            port: args.ipfix_port,
            meter,
        });
    }

    let source = DatalinkSource::open(&args.interface)?;
    Ok(FlowSource::Capture {
        observer: Observer::new(ecn_chains()),
        source: Box::new(source),
    })
}

/// The field template handed to an external meter.
fn meter_config() -> serde_yaml::Value {
    let fields = [
        "sourceIPv4Address",
        "destinationIPv4Address",
        "sourceTransportPort",
        "destinationTransportPort",
        "protocolIdentifier",
        "flowStartMilliseconds",
        "flowEndMilliseconds",
        "packetDeltaCount",
        "reversePacketDeltaCount",
        "octetDeltaCount",
        "reverseOctetDeltaCount",
        "ecnNegotiated",
    ];

    let template: Vec<serde_yaml::Value> =
        fields.iter().map(|f| serde_yaml::Value::from(*f)).collect();

    let mut mapping = serde_yaml::Mapping::new();
    mapping.insert("template".into(), template.into());
    serde_yaml::Value::Mapping(mapping)
}

/// Log the local address used to reach the first target, so runs can be
/// told apart by vantage.
fn log_vantage(jobs: &[Job]) {
    let Some(first) = jobs.first() else { return };
    match local_address(first.remote_ip) {
        Some(local) => info!("measuring from local address {local}"),
        None => debug!("could not determine the local vantage address"),
    }
}

fn local_address(target: IpAddr) -> Option<IpAddr> {
    let socket = match target {
        IpAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").ok()?,
        IpAddr::V6(_) => UdpSocket::bind("[::]:0").ok()?,
    };
    socket.connect((target, 53)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn set_ctrlc_handler(interrupted: Arc<AtomicBool>) {
    ctrlc::set_handler(move || {
        info!("received Ctrl-C, winding down");
        interrupted.store(true, Relaxed);
    })
    .expect("Error setting Ctrl-C handler");
}

fn enable_logging(args: &Args) {
    let verbosity = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };

    let filters = filter::Targets::new().with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}

//! The flow ingress listener: accepts connections from external meter
//! instances and feeds their records into the flow queue.

use std::io::{self, BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::thread;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::probe::Probe;
use crate::spider::Shared;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) fn ingress_loop<P: Probe>(
    shared: &Arc<Shared<P>>,
    port: u16,
) -> Result<(), EngineError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).map_err(EngineError::Ingress)?;
    listener.set_nonblocking(true).map_err(EngineError::Ingress)?;
    info!("flow ingress listening on port {port}");

    let mut handlers = Vec::new();
    while !shared.capture_stop.load(Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("meter connection from {peer}");
                let shared = Arc::clone(shared);
                let handle = thread::Builder::new()
                    .name(format!("ingress-{peer}"))
                    .spawn(move || handle_meter_conn(&shared, stream, peer))
                    .map_err(EngineError::Ingress)?;
                handlers.push(handle);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => return Err(EngineError::Ingress(e)),
        }
    }

    for handle in handlers {
        let _ = handle.join();
    }
    info!("flow ingress stopped");
    Ok(())
}

/// Read newline-delimited flow records until EOF, handing each decoded
/// record to the probe's `tupleize_flow`. An empty return discards the
/// record.
fn handle_meter_conn<P: Probe>(shared: &Shared<P>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        warn!("meter connection {peer}: cannot set read timeout: {e}");
        return;
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        if shared.capture_stop.load(Relaxed) {
            break;
        }
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                take_record(shared, line.trim(), peer);
                line.clear();
            }
            // a timeout mid-record leaves the partial line accumulated
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("meter connection {peer} read error: {e}");
                break;
            }
        }
    }
    info!("meter connection from {peer} terminated");
}

fn take_record<P: Probe>(shared: &Shared<P>, line: &str, peer: SocketAddr) {
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Map<String, Value>>(line) {
        Ok(raw) => {
            if let Some(flow) = shared.probe.tupleize_flow(raw) {
                shared.flowqueue.put(flow);
            }
        }
        Err(e) => warn!("discarding undecodable flow record from {peer}: {e}"),
    }
}

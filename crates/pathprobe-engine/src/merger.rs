//! The merger thread: joins observed flows with probe results on
//! `(remote address, local port)`.

use std::collections::HashMap;
use std::thread;

use pathprobe_observer::{FlowKey, FlowRecord};
use tracing::debug;

use crate::error::EngineError;
use crate::probe::{Probe, ProbeResult};
use crate::spider::Shared;

pub(crate) fn merger_loop<P: Probe>(shared: &Shared<P>) -> Result<(), EngineError> {
    let mut flowtab: HashMap<FlowKey, FlowRecord> = HashMap::new();
    let mut restab: HashMap<FlowKey, ProbeResult> = HashMap::new();

    while shared.is_running() {
        // service the longer queue; a tie goes to the result queue
        if shared.flowqueue.len() > shared.resqueue.len() {
            match shared.flowqueue.try_get() {
                Some(flow) => {
                    take_flow(shared, &mut flowtab, &mut restab, flow);
                    shared.flowqueue.task_done();
                }
                None => thread::sleep(shared.config.queue_sleep),
            }
        } else {
            match shared.resqueue.try_get() {
                Some(res) => {
                    take_result(shared, &mut flowtab, &mut restab, res);
                    shared.resqueue.task_done();
                }
                None => thread::sleep(shared.config.queue_sleep),
            }
        }
    }
    Ok(())
}

fn take_flow<P: Probe>(
    shared: &Shared<P>,
    flowtab: &mut HashMap<FlowKey, FlowRecord>,
    restab: &mut HashMap<FlowKey, ProbeResult>,
    flow: FlowRecord,
) {
    let Some(key) = flow.flow_key() else {
        debug!("dropping flow without a port-based key");
        return;
    };
    debug!("got a flow {key}");

    if let Some(res) = restab.remove(&key) {
        debug!("merging flow {key}");
        shared.emit_merged(shared.probe.merge(flow, &res));
    } else if flowtab.contains_key(&key) {
        debug!("won't merge duplicate flow {key}");
    } else {
        flowtab.insert(key, flow);
    }
}

fn take_result<P: Probe>(
    shared: &Shared<P>,
    flowtab: &mut HashMap<FlowKey, FlowRecord>,
    restab: &mut HashMap<FlowKey, ProbeResult>,
    res: ProbeResult,
) {
    let key = res.flow_key();
    debug!("got a result {key}");

    if let Some(flow) = flowtab.remove(&key) {
        debug!("merging result {key}");
        shared.emit_merged(shared.probe.merge(flow, &res));
    } else if restab.contains_key(&key) {
        debug!("won't merge duplicate result {key}");
    } else {
        restab.insert(key, res);
    }
}

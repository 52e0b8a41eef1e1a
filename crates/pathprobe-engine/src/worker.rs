//! Worker threads: one paired probe per job, gated by the configurator's
//! barriers.

use std::thread;

use tracing::debug;

use crate::error::EngineError;
use crate::probe::{ConfigId, Probe};
use crate::spider::Shared;

pub(crate) fn worker_loop<P: Probe>(shared: &Shared<P>) -> Result<(), EngineError> {
    while shared.is_running() {
        let Some(job) = shared.jobqueue.try_get() else {
            // No job available. Cycle the rendezvous anyway so the
            // configurator is not left waiting on this worker, pausing in
            // each half to avoid spinning the barrier.
            shared.sem_config_zero.acquire();
            thread::sleep(shared.config.queue_sleep);
            shared.sem_config_one_rdy.release();

            shared.sem_config_one.acquire();
            thread::sleep(shared.config.queue_sleep);
            shared.sem_config_zero_rdy.release();
            continue;
        };

        debug!("got a job: {job}");
        let mut pcs = shared.probe.pre_connect(&job);

        // Wait for configuration zero, connect under it
        shared.sem_config_zero.acquire();
        let conn0 = shared.probe.connect(&job, &mut pcs, ConfigId::Zero);

        // Signal readiness for configuration one and wait for it
        shared.sem_config_one_rdy.release();
        shared.sem_config_one.acquire();
        let conn1 = shared.probe.connect(&job, &mut pcs, ConfigId::One);

        // Signal okay to go back to configuration zero
        shared.sem_config_zero_rdy.release();

        // Pass results on for merging, config zero first
        let res0 = shared.probe.post_connect(&job, conn0, &mut pcs, ConfigId::Zero);
        shared.resqueue.put(res0);
        let res1 = shared.probe.post_connect(&job, conn1, &mut pcs, ConfigId::One);
        shared.resqueue.put(res1);

        debug!("job complete: {job}");
        shared.jobqueue.task_done();
    }
    Ok(())
}

//! The configurator thread: alternates the host between the two
//! configurations, rendezvousing with the worker pool through the four
//! barriers.

use std::sync::atomic::Ordering::Relaxed;

use tracing::debug;

use crate::error::EngineError;
use crate::probe::Probe;
use crate::spider::Shared;

pub(crate) fn configurator_loop<P: Probe>(shared: &Shared<P>) -> Result<(), EngineError> {
    let workers = shared.config.worker_count;
    let stopping = || !shared.is_running();
    let mut result = Ok(());

    while shared.is_running() {
        debug!("setting config zero");
        if let Err(e) = shared.probe.config_zero() {
            result = Err(e);
            break;
        }
        debug!("config zero active");
        shared.sem_config_zero.release_n(workers);
        if shared
            .sem_config_one_rdy
            .acquire_n_interruptible(workers, stopping)
            < workers
        {
            break;
        }

        debug!("setting config one");
        if let Err(e) = shared.probe.config_one() {
            result = Err(e);
            break;
        }
        debug!("config one active");
        shared.sem_config_one.release_n(workers);
        if shared
            .sem_config_zero_rdy
            .acquire_n_interruptible(workers, stopping)
            < workers
        {
            break;
        }
    }

    // Workers still blocked on a gate must be able to run through to the
    // running check at their loop head. Stop any new round from starting,
    // then top both gates up to exactly one token per worker.
    shared.running.store(false, Relaxed);
    shared.sem_config_zero.drain();
    shared.sem_config_zero.release_n(workers);
    shared.sem_config_one.drain();
    shared.sem_config_one.release_n(workers);

    result
}

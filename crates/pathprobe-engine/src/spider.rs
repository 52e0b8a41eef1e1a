//! The supervisor: owns every engine thread and the shared state they
//! coordinate through.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use pathprobe_observer::{FlowRecord, Observer, PacketSource};
use tracing::{debug, error, info, warn};

use crate::barrier::SemaphoreN;
use crate::error::EngineError;
use crate::meter::{self, MeterCommand, RunningMeter};
use crate::probe::{Job, Probe, ProbeResult};
use crate::queue::WorkQueue;
use crate::{configurator, ingress, merger, worker};

/// Capacity of the flow and result queues; the job queue is unbounded.
pub const QUEUE_SIZE: usize = 1000;

/// Engine timing knobs. The defaults match a live measurement run; tests
/// shrink them.
#[derive(Debug, Clone)]
pub struct SpiderConfig {
    pub worker_count: usize,
    /// Pause used by idle loops and queue polling.
    pub queue_sleep: Duration,
    /// Settle time between meter start and configurator start.
    pub initial_wait: Duration,
    /// Drain time between meter shutdown and observer shutdown.
    pub final_wait: Duration,
    /// How often the interrupter polls its predicate.
    pub interrupt_poll: Duration,
}

impl SpiderConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            queue_sleep: Duration::from_millis(500),
            initial_wait: Duration::from_secs(3),
            final_wait: Duration::from_secs(3),
            interrupt_poll: Duration::from_secs(5),
        }
    }
}

/// Where passive flow records come from.
pub enum FlowSource {
    /// An in-process observer reading a capture source.
    Capture {
        observer: Observer,
        source: Box<dyn PacketSource>,
    },
    /// A TCP listener fed by one or more external meter instances,
    /// optionally spawning the meter itself.
    Listener {
        port: u16,
        meter: Option<MeterCommand>,
    },
}

pub type InterruptCheck = Box<dyn Fn() -> bool + Send + 'static>;

/// State shared by every engine thread.
pub(crate) struct Shared<P: Probe> {
    pub(crate) probe: P,
    pub(crate) config: SpiderConfig,

    pub(crate) running: AtomicBool,
    pub(crate) stopping: AtomicBool,
    terminating: AtomicBool,
    /// Tells the observer (or ingress listener) to wind down.
    pub(crate) capture_stop: AtomicBool,

    pub(crate) sem_config_zero: SemaphoreN,
    pub(crate) sem_config_zero_rdy: SemaphoreN,
    pub(crate) sem_config_one: SemaphoreN,
    pub(crate) sem_config_one_rdy: SemaphoreN,

    pub(crate) jobqueue: WorkQueue<Job>,
    pub(crate) flowqueue: WorkQueue<FlowRecord>,
    pub(crate) resqueue: WorkQueue<ProbeResult>,
    merged_tx: Sender<FlowRecord>,

    /// First error raised by any thread; later errors are logged only.
    exception: Mutex<Option<EngineError>>,
    pub(crate) meter: Mutex<Option<RunningMeter>>,

    threads: Mutex<Vec<JoinHandle<()>>>,
    capture_thread: Mutex<Option<JoinHandle<()>>>,
    /// Serializes run/stop transitions.
    state_lock: Mutex<()>,
}

impl<P: Probe> Shared<P> {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Relaxed)
    }

    pub(crate) fn emit_merged(&self, rec: FlowRecord) {
        let _ = self.merged_tx.send(rec);
    }

    pub(crate) fn record_error(&self, e: EngineError) {
        let mut slot = self.exception.lock().unwrap();
        match &mut *slot {
            Some(_) => error!("suppressing subsequent error (first one wins): {e}"),
            none => *none = Some(e),
        }
    }

    fn spawn_guarded(
        self: &Arc<Self>,
        name: String,
        body: impl FnOnce(&Arc<Shared<P>>) -> Result<(), EngineError> + Send + 'static,
    ) {
        let handle = self.spawn_wrapped(name, body);
        self.threads.lock().unwrap().push(handle);
    }

    fn spawn_capture(
        self: &Arc<Self>,
        name: String,
        body: impl FnOnce(&Arc<Shared<P>>) -> Result<(), EngineError> + Send + 'static,
    ) {
        let handle = self.spawn_wrapped(name, body);
        *self.capture_thread.lock().unwrap() = Some(handle);
    }

    fn spawn_wrapped(
        self: &Arc<Self>,
        name: String,
        body: impl FnOnce(&Arc<Shared<P>>) -> Result<(), EngineError> + Send + 'static,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        let thread_name = name.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                if let Err(e) = body(&shared) {
                    error!("{thread_name} failed: {e}");
                    shared.record_error(e);
                    shared.terminate();
                }
            })
            .expect("failed to spawn engine thread")
    }

    /// Orderly shutdown: drain the work, then take the engine apart in
    /// dependency order.
    pub(crate) fn stop_inner(&self) -> Result<(), EngineError> {
        info!("stopping spider");
        let _guard = self.state_lock.lock().unwrap();
        self.stopping.store(true, Relaxed);

        self.jobqueue.wait_idle(self.config.queue_sleep);
        self.resqueue.wait_idle(self.config.queue_sleep);
        debug!("job and result queues empty");

        meter::stop_meter(&self.meter);
        thread::sleep(self.config.final_wait);

        self.capture_stop.store(true, Relaxed);
        self.join_capture();
        self.flowqueue.wait_idle(self.config.queue_sleep);
        debug!("flow queue empty");

        self.running.store(false, Relaxed);
        self.stopping.store(false, Relaxed);

        self.join_threads();
        self.take_exception()
    }

    /// Fast-path shutdown after a failure: stop everything, join what can
    /// be joined, and drop whatever work is still queued.
    pub(crate) fn terminate(&self) {
        if self.terminating.swap(true, Relaxed) {
            return;
        }
        error!("terminating spider");

        self.running.store(false, Relaxed);
        self.capture_stop.store(true, Relaxed);
        meter::stop_meter(&self.meter);

        // drain before joining so no thread stays blocked on a full queue
        self.drain_queues();
        self.join_capture();
        self.join_threads();
        let dropped = self.drain_queues();

        error!("termination complete; dropped {dropped} queued items");
    }

    pub(crate) fn take_exception(&self) -> Result<(), EngineError> {
        match self.exception.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn drain_queues(&self) -> usize {
        self.jobqueue.drain() + self.resqueue.drain() + self.flowqueue.drain()
    }

    fn join_capture(&self) {
        let handle = self.capture_thread.lock().unwrap().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            error!("capture thread panicked");
        }
    }

    fn join_threads(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock().unwrap());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("an engine thread panicked");
            }
        }
    }
}

/// The measurement engine. Construct with a [`Probe`] implementation and
/// a [`FlowSource`], call [`Spider::run`], feed jobs, then [`Spider::stop`].
pub struct Spider<P: Probe> {
    shared: Arc<Shared<P>>,
    flow_source: Option<FlowSource>,
    check_interrupt: Option<InterruptCheck>,
    merged_rx: Receiver<FlowRecord>,
}

impl<P: Probe> Spider<P> {
    pub fn new(probe: P, config: SpiderConfig, flow_source: FlowSource) -> Self {
        let (merged_tx, merged_rx) = crossbeam_channel::unbounded();
        let workers = config.worker_count;

        let shared = Arc::new(Shared {
            probe,
            config,
            running: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            capture_stop: AtomicBool::new(false),
            sem_config_zero: SemaphoreN::new(workers),
            sem_config_zero_rdy: SemaphoreN::new(workers),
            sem_config_one: SemaphoreN::new(workers),
            sem_config_one_rdy: SemaphoreN::new(workers),
            jobqueue: WorkQueue::unbounded(),
            flowqueue: WorkQueue::bounded(QUEUE_SIZE),
            resqueue: WorkQueue::bounded(QUEUE_SIZE),
            merged_tx,
            exception: Mutex::new(None),
            meter: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            capture_thread: Mutex::new(None),
            state_lock: Mutex::new(()),
        });

        Self {
            shared,
            flow_source: Some(flow_source),
            check_interrupt: None,
            merged_rx,
        }
    }

    /// Install a predicate the interrupter polls; when it returns true the
    /// job queue is drained and an orderly stop begins.
    pub fn check_interrupt(mut self, check: impl Fn() -> bool + Send + 'static) -> Self {
        self.check_interrupt = Some(Box::new(check));
        self
    }

    /// The stream of merged records.
    pub fn merged(&self) -> Receiver<FlowRecord> {
        self.merged_rx.clone()
    }

    /// The probe implementation driving this engine.
    pub fn probe(&self) -> &P {
        &self.shared.probe
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Enqueue a measurement target. Ignored once shutdown has begun.
    pub fn add_job(&self, job: Job) {
        if self.shared.stopping.load(Relaxed) || self.shared.terminating.load(Relaxed) {
            return;
        }
        self.shared.jobqueue.put(job);
    }

    /// Push an externally produced flow record straight into the merger.
    pub fn add_flow(&self, rec: FlowRecord) {
        self.shared.flowqueue.put(rec);
    }

    /// Start every engine thread: flow source first, then meter, merger,
    /// configurator, workers, and the interrupter.
    pub fn run(&mut self) {
        let Some(flow_source) = self.flow_source.take() else {
            warn!("spider already started");
            return;
        };

        let shared = &self.shared;
        let _guard = shared.state_lock.lock().unwrap();
        info!("starting spider with {} workers", shared.config.worker_count);
        shared.running.store(true, Relaxed);

        let mut meter_started = false;
        match flow_source {
            FlowSource::Capture {
                mut observer,
                mut source,
            } => {
                shared.spawn_capture("observer".to_string(), move |shared| {
                    let flowqueue = shared.flowqueue.clone();
                    observer
                        .run(source.as_mut(), &shared.capture_stop, |rec| {
                            flowqueue.put(rec);
                        })
                        .map_err(EngineError::from)
                });
                debug!("observer up");
            }
            FlowSource::Listener { port, meter } => {
                shared.spawn_capture("flow-listener".to_string(), move |shared| {
                    ingress::ingress_loop(shared, port)
                });
                debug!("listener up");

                if let Some(cmd) = meter {
                    shared.spawn_guarded("meter-owner".to_string(), move |shared| {
                        meter::owner_loop(shared, &cmd)
                    });
                    meter_started = true;
                    debug!("meter owner up");
                }
            }
        }

        if meter_started {
            debug!(
                "waiting {:?} for the meter to start",
                shared.config.initial_wait
            );
            thread::sleep(shared.config.initial_wait);
        }

        shared.spawn_guarded("merger".to_string(), |shared| merger::merger_loop(shared));
        debug!("merger up");

        shared.spawn_guarded("configurator".to_string(), |shared| {
            configurator::configurator_loop(shared)
        });
        debug!("configurator up");

        for i in 0..shared.config.worker_count {
            shared.spawn_guarded(format!("worker-{i}"), |shared| worker::worker_loop(shared));
        }
        debug!("workers up");

        if let Some(check) = self.check_interrupt.take() {
            shared.spawn_guarded("interrupter".to_string(), move |shared| {
                interrupter_loop(shared, check)
            });
            debug!("interrupter up");
        }
    }

    /// Orderly shutdown. Returns the first error any thread raised.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.shared.stop_inner()
    }

    /// Fast-path shutdown. The first captured error, if any, is returned.
    pub fn terminate(&self) -> Result<(), EngineError> {
        self.shared.terminate();
        self.shared.take_exception()
    }
}

fn interrupter_loop<P: Probe>(
    shared: &Arc<Shared<P>>,
    check: InterruptCheck,
) -> Result<(), EngineError> {
    const STEP: Duration = Duration::from_millis(100);

    while shared.is_running() {
        if check() {
            warn!("spider is being interrupted");
            let aborted = shared.jobqueue.drain();
            warn!("aborted {aborted} queued jobs");
            return shared.stop_inner();
        }
        // poll in small steps so shutdown is not held up by a full interval
        let mut waited = Duration::ZERO;
        while waited < shared.config.interrupt_poll && shared.is_running() {
            thread::sleep(STEP);
            waited += STEP;
        }
    }
    Ok(())
}

//! The measurement engine.
//!
//! A [`Spider`] drives a set of worker threads through paired probes of
//! every target, once under each of two host configurations, while a flow
//! source (an in-process [`pathprobe_observer::Observer`] or an external
//! meter feeding the ingress listener) supplies passive flow records. The
//! merger joins both streams on `(remote address, local port)`.

pub mod barrier;
pub mod error;
pub mod jobs;
pub mod meter;
pub mod probe;
pub mod queue;
pub mod spider;

mod configurator;
mod ingress;
mod merger;
mod worker;

pub use barrier::SemaphoreN;
pub use error::EngineError;
pub use meter::MeterCommand;
pub use probe::{ConfigId, ConnState, Job, Probe, ProbeResult};
pub use queue::WorkQueue;
pub use spider::{FlowSource, Spider, SpiderConfig};

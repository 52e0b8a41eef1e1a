//! Passive flow observation for differential path measurements.
//!
//! The [`Observer`] reads packets from a [`PacketSource`], groups them into
//! bidirectional flows keyed by [`FlowId`], and runs per-layer analyzer
//! chains over each packet. Flows are expired on a packet-time timer heap,
//! so a replayed trace always produces the same records in the same order.

pub mod analyzer;
pub mod error;
pub mod flowid;
pub mod observer;
pub mod packet;
pub mod record;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use analyzer::AnalyzerChains;
pub use error::ObserverError;
pub use flowid::FlowId;
pub use observer::Observer;
pub use packet::{CapturedPacket, DatalinkSource, PacketSource, Poll, TraceSource};
pub use record::{FlowKey, FlowRecord};

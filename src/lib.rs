//! Consistency-window fault-injection harness for replicated KV stores.
//!
//! The harness drives a cluster through a fixed fault sequence (write the
//! stale value, stop one replica, write the fresh value, restart the
//! replica), then samples reads at a weak consistency level to estimate how
//! often the stale value still surfaces.

pub mod cluster;
pub mod config;
pub mod detect;
pub mod error;
pub mod runner;
pub mod sequence;
pub mod store;

/// Testing utilities for integration tests.
pub mod testing;

pub use cluster::{Cluster, ComposeCluster, NodeHealth, NodeId, NodeSelector, SettleConfig};
pub use config::HarnessConfig;
pub use detect::{HoleDetector, Probe, RunResult, Verdict};
pub use error::{HarnessError, Result};
pub use runner::{exit_code, run, RunMode};
pub use sequence::{FaultSequencer, SequenceReport, Stage, Timestamp, WriteOp};
pub use store::{ConsistencyLevel, HttpStore, Store, WriteAck};

//! The deterministic failure scenario.
//!
//! Write A, stop one replica, write B while it is down, restart it. Each
//! transition is gated on the success of the previous step; any failure
//! aborts the whole scenario, because a partially executed sequence proves
//! nothing about the recovery window.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info};
use serde::Serialize;
use tokio::time::sleep;

use crate::cluster::{Cluster, NodeId, NodeSelector};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::store::{ConsistencyLevel, Store};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(ms)
    }
}

/// One write issued by the scenario, kept for later comparison.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub value: String,
    /// The level the write was aimed at (acks may report a weaker one).
    pub consistency: ConsistencyLevel,
    pub at: Timestamp,
}

/// Progress of the scenario. Strictly linear; there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    ClusterUp,
    WroteA,
    NodeDown,
    WroteB,
    NodeRestarted,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Init => "INIT",
            Stage::ClusterUp => "CLUSTER_UP",
            Stage::WroteA => "WROTE_A",
            Stage::NodeDown => "NODE_DOWN",
            Stage::WroteB => "WROTE_B",
            Stage::NodeRestarted => "NODE_RESTARTED",
            Stage::Done => "DONE",
        };
        write!(f, "{}", name)
    }
}

/// What a completed scenario did: which node went down and the writes issued.
#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub chosen: NodeId,
    pub writes: Vec<WriteOp>,
}

/// Drives the failure scenario against a store and a cluster.
pub struct FaultSequencer {
    key: String,
    stale_value: String,
    fresh_value: String,
    write_consistency: ConsistencyLevel,
    selector: NodeSelector,
    write_settle: Duration,
    stage: Stage,
    writes: Vec<WriteOp>,
}

impl FaultSequencer {
    pub fn new(config: &HarnessConfig) -> Self {
        FaultSequencer {
            key: config.key.clone(),
            stale_value: config.stale_value.clone(),
            fresh_value: config.fresh_value.clone(),
            write_consistency: config.write_consistency,
            selector: config.selector,
            write_settle: config.settle.after_write,
            stage: Stage::Init,
            writes: Vec::new(),
        }
    }

    /// Stage reached so far; after a failed run this names the last stage
    /// that completed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Gate one transition: enter `next` only when the step succeeded.
    fn advance<T>(&mut self, outcome: Result<T>, next: Stage) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.stage = next;
                info!("stage {}", next);
                Ok(value)
            }
            Err(err) => {
                error!(
                    "fault sequence aborted entering {} (reached {}): {}",
                    next, self.stage, err
                );
                Err(err)
            }
        }
    }

    fn record_write(&mut self, value: &str) {
        self.writes.push(WriteOp {
            value: value.to_string(),
            consistency: self.write_consistency,
            at: Timestamp::now(),
        });
    }

    /// Hold the scenario after a write for the configured `after_write`
    /// settle, giving the value time to spread beyond the acknowledging
    /// replicas.
    async fn settle_after_write(&self) {
        if self.write_settle.is_zero() {
            return;
        }
        info!("settling {:?} after write", self.write_settle);
        sleep(self.write_settle).await;
    }

    /// Run the scenario to completion or first failure.
    pub async fn run<S, C>(&mut self, store: &mut S, cluster: &mut C) -> Result<SequenceReport>
    where
        S: Store,
        C: Cluster,
    {
        if self.stage != Stage::Init {
            return Err(HarnessError::orchestration(
                "fault sequence",
                format!("sequence already ran (stage {})", self.stage),
            ));
        }

        info!(
            "fault sequence starting: key `{}`, `{}` then `{}` at {}",
            self.key, self.stale_value, self.fresh_value, self.write_consistency
        );

        let outcome = cluster.start_cluster().await;
        self.advance(outcome, Stage::ClusterUp)?;

        let outcome = store
            .write(&self.key, &self.stale_value, self.write_consistency)
            .await;
        let ack = self.advance(outcome, Stage::WroteA)?;
        let written = self.stale_value.clone();
        self.record_write(&written);
        info!(
            "wrote `{}` to key `{}` (acknowledged at {})",
            self.stale_value, self.key, ack.consistency
        );
        self.settle_after_write().await;

        let chosen = self.selector.choose(cluster.node_count());
        info!("stopping node {}", chosen);
        let outcome = cluster.stop_node(chosen).await;
        self.advance(outcome, Stage::NodeDown)?;

        let outcome = store
            .write(&self.key, &self.fresh_value, self.write_consistency)
            .await;
        let ack = self.advance(outcome, Stage::WroteB)?;
        let written = self.fresh_value.clone();
        self.record_write(&written);
        info!(
            "wrote `{}` to key `{}` with node {} down (acknowledged at {})",
            self.fresh_value, self.key, chosen, ack.consistency
        );
        self.settle_after_write().await;

        let outcome = cluster.start_node(chosen).await;
        self.advance(outcome, Stage::NodeRestarted)?;

        self.stage = Stage::Done;
        info!("stage {}", Stage::Done);

        Ok(SequenceReport {
            chosen,
            writes: self.writes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_are_ordered() {
        assert!(Stage::Init < Stage::ClusterUp);
        assert!(Stage::ClusterUp < Stage::WroteA);
        assert!(Stage::WroteA < Stage::NodeDown);
        assert!(Stage::NodeDown < Stage::WroteB);
        assert!(Stage::WroteB < Stage::NodeRestarted);
        assert!(Stage::NodeRestarted < Stage::Done);
    }

    #[test]
    fn test_stage_names_match_the_scenario() {
        assert_eq!(Stage::Init.to_string(), "INIT");
        assert_eq!(Stage::NodeDown.to_string(), "NODE_DOWN");
        assert_eq!(Stage::Done.to_string(), "DONE");
    }

    #[test]
    fn test_timestamps_do_not_go_backwards() {
        let first = Timestamp::now();
        let second = Timestamp::now();
        assert!(second >= first);
    }

    #[test]
    fn test_new_sequencer_starts_at_init() {
        let sequencer = FaultSequencer::new(&HarnessConfig::default());
        assert_eq!(sequencer.stage(), Stage::Init);
        assert!(sequencer.writes.is_empty());
    }
}

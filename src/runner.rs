//! Top-level run control.
//!
//! Wires the optional fault sequence into the detector run and owns the
//! session discipline: opened once before anything else, closed exactly
//! once on every exit path.

use log::info;

use crate::cluster::Cluster;
use crate::config::HarnessConfig;
use crate::detect::{HoleDetector, RunResult, Verdict};
use crate::error::Result;
use crate::sequence::FaultSequencer;
use crate::store::Store;

/// What a single invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Probe a cluster already in whatever state it is in.
    DetectOnly,
    /// Inject the failure scenario first, then probe.
    InjectThenDetect,
}

impl RunMode {
    /// One optional positional argument: absent means detect-only, the
    /// literal `make` means inject-then-detect.
    pub fn parse(arg: Option<&str>) -> std::result::Result<RunMode, String> {
        match arg {
            None => Ok(RunMode::DetectOnly),
            Some("make") => Ok(RunMode::InjectThenDetect),
            Some(other) => Err(format!(
                "unknown mode `{}` (run without a mode to detect, or with `make` to inject first)",
                other
            )),
        }
    }
}

/// Execute one run. The store session is closed before this returns, on
/// success and on every failure path alike.
pub async fn run<S, C>(
    store: &mut S,
    cluster: &mut C,
    config: &HarnessConfig,
    mode: RunMode,
) -> Result<RunResult>
where
    S: Store,
    C: Cluster,
{
    let outcome = drive(store, cluster, config, mode).await;
    store.close().await;
    outcome
}

async fn drive<S, C>(
    store: &mut S,
    cluster: &mut C,
    config: &HarnessConfig,
    mode: RunMode,
) -> Result<RunResult>
where
    S: Store,
    C: Cluster,
{
    store.open().await?;
    store
        .ensure_schema(&config.keyspace, &config.table, config.replication_factor)
        .await?;

    if mode == RunMode::InjectThenDetect {
        let mut sequencer = FaultSequencer::new(config);
        let report = sequencer.run(store, cluster).await?;
        if let [stale, fresh] = report.writes.as_slice() {
            info!(
                "fault sequence complete: node {} went down between `{}` and `{}`",
                report.chosen, stale.value, fresh.value
            );
        }
    }

    let detector = HoleDetector::new(config);
    detector
        .detect(store, &config.stale_value, config.attempts)
        .await
}

/// Process exit code: 0 when a hole was proven and 1 when none surfaced;
/// any fatal error maps to 2.
pub fn exit_code(outcome: &Result<RunResult>) -> i32 {
    match outcome {
        Ok(result) => match result.verdict() {
            Verdict::HoleFound => 0,
            Verdict::NoHole => 1,
        },
        Err(_) => 2,
    }
}

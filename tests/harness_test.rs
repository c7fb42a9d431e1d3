//! End-to-end harness behavior against scripted fakes.
//!
//! Every test here asserts on recorded call sequences: what ran in what
//! order, and what was never reached after a failure.

use std::time::{Duration, Instant};

use holecheck::testing::{ScriptedCluster, ScriptedStore};
use holecheck::{
    exit_code, run, ConsistencyLevel, FaultSequencer, HarnessConfig, HarnessError, NodeId,
    NodeSelector, RunMode, SettleConfig, Verdict,
};

fn fixed_node_config(node: u32) -> HarnessConfig {
    HarnessConfig::default()
        .with_selector(NodeSelector::Fixed(NodeId(node)))
        .with_attempts(10)
}

/// The full `make` run executes exactly: up, write A, stop, write B,
/// restart, then probes.
#[tokio::test]
async fn test_make_run_executes_the_scenario_in_order() {
    let config = fixed_node_config(2);
    let mut store = ScriptedStore::new().with_steady_value("5");
    let mut cluster = ScriptedCluster::new(3);

    let result = run(&mut store, &mut cluster, &config, RunMode::InjectThenDetect)
        .await
        .expect("run should succeed");

    assert_eq!(cluster.calls, vec!["up", "stop 2", "start 2"]);
    assert_eq!(store.open_calls, 1);
    assert_eq!(
        store.schema_calls,
        vec![("fedikeyspace".to_string(), "test_table".to_string(), 3)]
    );
    assert_eq!(
        store.writes,
        vec![
            ("testuser".to_string(), "1".to_string(), ConsistencyLevel::One),
            ("testuser".to_string(), "5".to_string(), ConsistencyLevel::One),
        ]
    );
    assert_eq!(store.read_count, 10);
    assert_eq!(result.verdict(), Verdict::NoHole);
    assert_eq!(store.close_calls, 1);
}

/// The sequence report carries the ordered write log: which node went
/// down, and both writes with their requested level and timestamps.
#[tokio::test]
async fn test_sequence_report_records_the_ordered_writes() {
    let config = fixed_node_config(2);
    let mut store = ScriptedStore::new();
    let mut cluster = ScriptedCluster::new(3);

    let report = FaultSequencer::new(&config)
        .run(&mut store, &mut cluster)
        .await
        .expect("scenario should complete");

    assert_eq!(report.chosen, NodeId(2));
    assert_eq!(report.writes.len(), 2);
    assert_eq!(report.writes[0].value, "1");
    assert_eq!(report.writes[1].value, "5");
    assert_eq!(report.writes[0].consistency, ConsistencyLevel::One);
    assert_eq!(report.writes[1].consistency, ConsistencyLevel::One);
    assert!(report.writes[0].at <= report.writes[1].at);
}

/// A write settle pause holds the scenario after each of the two writes.
#[tokio::test]
async fn test_write_settle_paces_the_scenario() {
    let settle = SettleConfig {
        after_write: Duration::from_millis(40),
        ..SettleConfig::default()
    };
    let config = fixed_node_config(1).with_settle(settle);
    let mut store = ScriptedStore::new();
    let mut cluster = ScriptedCluster::new(3);

    let started = Instant::now();
    FaultSequencer::new(&config)
        .run(&mut store, &mut cluster)
        .await
        .expect("scenario should complete");

    assert!(
        started.elapsed() >= Duration::from_millis(80),
        "two writes should each settle for 40ms, elapsed {:?}",
        started.elapsed()
    );
}

/// Without `make` the cluster is never orchestrated; the run only probes.
#[tokio::test]
async fn test_detect_only_never_touches_the_cluster() {
    let config = fixed_node_config(2);
    let mut store = ScriptedStore::new().with_steady_value("5");
    let mut cluster = ScriptedCluster::new(3);

    let result = run(&mut store, &mut cluster, &config, RunMode::DetectOnly)
        .await
        .expect("run should succeed");

    assert!(cluster.calls.is_empty());
    assert!(store.writes.is_empty());
    assert_eq!(store.read_count, 10);
    assert_eq!(result.verdict(), Verdict::NoHole);
    assert_eq!(store.close_calls, 1);
}

/// A failed stop ends the scenario before write B is ever issued, and the
/// session still closes once.
#[tokio::test]
async fn test_stop_failure_short_circuits_the_scenario() {
    let config = fixed_node_config(2);
    let mut store = ScriptedStore::new().with_steady_value("5");
    let mut cluster = ScriptedCluster::new(3).failing_stop_node();

    let err = run(&mut store, &mut cluster, &config, RunMode::InjectThenDetect)
        .await
        .unwrap_err();

    assert!(
        matches!(err, HarnessError::Orchestration { .. }),
        "got {:?}",
        err
    );
    assert_eq!(cluster.calls, vec!["up", "stop 2"]);
    assert_eq!(store.writes.len(), 1, "write B must never be issued");
    assert_eq!(store.writes[0].1, "1");
    assert_eq!(store.read_count, 0, "no probes after an aborted scenario");
    assert_eq!(store.close_calls, 1);
}

/// A failed cluster start stops the scenario before the first write.
#[tokio::test]
async fn test_cluster_start_failure_prevents_any_write() {
    let config = fixed_node_config(2);
    let mut store = ScriptedStore::new();
    let mut cluster = ScriptedCluster::new(3).failing_start_cluster();

    let err = run(&mut store, &mut cluster, &config, RunMode::InjectThenDetect)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Orchestration { .. }));
    assert_eq!(cluster.calls, vec!["up"]);
    assert!(store.writes.is_empty());
    assert_eq!(store.close_calls, 1);
}

/// A failed write B skips the restart; the chosen node stays down.
#[tokio::test]
async fn test_write_b_failure_skips_the_restart() {
    let config = fixed_node_config(1);
    let mut store = ScriptedStore::new().failing_writes_of("5");
    let mut cluster = ScriptedCluster::new(3);

    let err = run(&mut store, &mut cluster, &config, RunMode::InjectThenDetect)
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Write { .. }), "got {:?}", err);
    assert_eq!(cluster.calls, vec!["up", "stop 1"]);
    assert_eq!(store.writes.len(), 2, "both writes were attempted");
    assert_eq!(store.close_calls, 1);
}

/// A failed open still closes the session exactly once.
#[tokio::test]
async fn test_failed_open_still_closes_the_session() {
    let config = fixed_node_config(2);
    let mut store = ScriptedStore::new().failing_open();
    let mut cluster = ScriptedCluster::new(3);

    let outcome = run(&mut store, &mut cluster, &config, RunMode::InjectThenDetect).await;

    assert!(matches!(
        outcome,
        Err(HarnessError::Connection(_))
    ));
    assert!(cluster.calls.is_empty());
    assert_eq!(store.open_calls, 1);
    assert_eq!(store.close_calls, 1);
    assert_eq!(exit_code(&outcome), 2);
}

/// Probes that surface the stale value k times give probability k over
/// attempts, and any single match proves the hole.
#[tokio::test]
async fn test_stale_probes_set_the_probability() {
    let config = HarnessConfig::default()
        .with_selector(NodeSelector::Fixed(NodeId(3)))
        .with_attempts(50);
    let mut store = ScriptedStore::new()
        .with_scripted_reads(&[Some("1"); 8])
        .with_steady_value("5");
    let mut cluster = ScriptedCluster::new(3);

    let outcome = run(&mut store, &mut cluster, &config, RunMode::InjectThenDetect).await;
    assert_eq!(exit_code(&outcome), 0);

    let result = outcome.expect("run should succeed");
    assert_eq!(result.attempts, 50);
    assert_eq!(result.matches, 8);
    assert_eq!(result.probability(), Some(0.16));
    assert_eq!(result.verdict(), Verdict::HoleFound);
    assert_eq!(result.summary(), "Hole found! Probability: 0.16");
}

/// Individual probe failures are tolerated and counted as non-matches.
#[tokio::test]
async fn test_probe_failures_are_tolerated_individually() {
    let config = fixed_node_config(2).with_attempts(10);
    let mut store = ScriptedStore::new()
        .with_scripted_reads(&[Some("1")])
        .with_failing_reads(3)
        .with_scripted_reads(&[Some("1")])
        .with_steady_value("5");
    let mut cluster = ScriptedCluster::new(3);

    let result = run(&mut store, &mut cluster, &config, RunMode::DetectOnly)
        .await
        .expect("scattered probe failures must not abort the run");

    assert_eq!(result.attempts, 10);
    assert_eq!(result.matches, 2);
    assert_eq!(result.failed_probes, 3);
    assert_eq!(result.verdict(), Verdict::HoleFound);
}

/// When every probe fails the run is aborted with a read error.
#[tokio::test]
async fn test_all_probes_failing_aborts_the_run() {
    let config = fixed_node_config(2).with_attempts(10);
    let mut store = ScriptedStore::new().failing_reads();
    let mut cluster = ScriptedCluster::new(3);

    let outcome = run(&mut store, &mut cluster, &config, RunMode::DetectOnly).await;

    assert!(matches!(outcome, Err(HarnessError::Read { .. })));
    assert_eq!(store.read_count, 10, "every probe was still attempted");
    assert_eq!(store.close_calls, 1);
    assert_eq!(exit_code(&outcome), 2);
}

/// The same seed picks the same node on every run.
#[tokio::test]
async fn test_seeded_selection_is_reproducible() {
    let config = HarnessConfig::default()
        .with_selector(NodeSelector::Seeded(42))
        .with_attempts(1);

    let mut first_cluster = ScriptedCluster::new(3);
    let mut store = ScriptedStore::new().with_steady_value("5");
    run(&mut store, &mut first_cluster, &config, RunMode::InjectThenDetect)
        .await
        .expect("first run should succeed");

    let mut second_cluster = ScriptedCluster::new(3);
    let mut store = ScriptedStore::new().with_steady_value("5");
    run(&mut store, &mut second_cluster, &config, RunMode::InjectThenDetect)
        .await
        .expect("second run should succeed");

    assert_eq!(first_cluster.calls, second_cluster.calls);
    assert!(first_cluster.calls[1].starts_with("stop "));
}

/// No hole observed exits 1; a proven hole exits 0.
#[tokio::test]
async fn test_exit_codes_follow_the_verdict() {
    let config = fixed_node_config(2).with_attempts(5);

    let mut store = ScriptedStore::new().with_steady_value("5");
    let mut cluster = ScriptedCluster::new(3);
    let clean = run(&mut store, &mut cluster, &config, RunMode::DetectOnly).await;
    assert_eq!(exit_code(&clean), 1);

    let mut store = ScriptedStore::new().with_steady_value("1");
    let mut cluster = ScriptedCluster::new(3);
    let stale = run(&mut store, &mut cluster, &config, RunMode::DetectOnly).await;
    assert_eq!(exit_code(&stale), 0);
}

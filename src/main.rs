//! Command line entry point for the hole-check harness.
//!
//! ```bash
//! # Probe an already-prepared cluster for the stale value
//! holecheck
//!
//! # Inject the fault sequence first, then probe
//! holecheck make
//!
//! # Reproducible node choice, probes spread over the repair window
//! holecheck make --seed 42 --probe-delay-ms 20
//! ```
//!
//! Exits 0 when a consistency hole was proven and 1 when none surfaced;
//! any fatal error exits 2.

use std::process;
use std::time::Duration;

use clap::Parser;
use log::info;

use holecheck::{
    exit_code, run, ComposeCluster, ConsistencyLevel, HarnessConfig, HttpStore, NodeId,
    NodeSelector, RunMode, SettleConfig,
};

#[derive(Parser)]
#[command(name = "holecheck")]
#[command(about = "Consistency-window fault injection for replicated KV stores")]
#[command(version)]
struct Cli {
    /// Omit to probe the cluster as-is; `make` injects the fault
    /// sequence (write, stop node, write, restart) first.
    mode: Option<String>,

    /// Comma separated store endpoints (host:port), one per node.
    /// Defaults to 127.0.0.1:7101..N for --nodes N.
    #[arg(long, value_delimiter = ',')]
    endpoints: Option<Vec<String>>,

    /// Cluster size used when --endpoints is not given.
    #[arg(long, default_value = "3")]
    nodes: u32,

    /// Compose file driving the cluster.
    #[arg(long, default_value = "docker-compose.yml")]
    compose_file: String,

    /// Compose service name prefix; node N runs as <prefix>N.
    #[arg(long, default_value = "store")]
    service_prefix: String,

    /// Keyspace provisioned before the run.
    #[arg(long, default_value = "fedikeyspace")]
    keyspace: String,

    /// Table holding the tracked key.
    #[arg(long, default_value = "test_table")]
    table: String,

    /// Replication factor requested when provisioning the schema.
    #[arg(long, default_value = "3")]
    replication_factor: u32,

    /// Key written and probed.
    #[arg(long, default_value = "testuser")]
    key: String,

    /// Value written before the chosen node goes down.
    #[arg(long, default_value = "1")]
    stale_value: String,

    /// Value written while the chosen node is down.
    #[arg(long, default_value = "5")]
    fresh_value: String,

    /// Probe reads per run.
    #[arg(long, default_value = "1000")]
    attempts: u32,

    /// Consistency level for probe reads: one, quorum, or all.
    #[arg(long, default_value = "one")]
    read_consistency: String,

    /// Consistency level for scenario writes: one, quorum, or all.
    #[arg(long, default_value = "one")]
    write_consistency: String,

    /// Fail consistency errors instead of retrying one level weaker.
    #[arg(long)]
    no_downgrade: bool,

    /// Take down this node (1-based) instead of picking at random.
    #[arg(long, conflicts_with = "seed")]
    node: Option<u32>,

    /// Seed the node choice for reproducible runs.
    #[arg(long, conflicts_with = "node")]
    seed: Option<u64>,

    /// Seconds to wait for all nodes to report ready after `up`.
    #[arg(long, default_value = "60")]
    settle_start: u64,

    /// Seconds to wait for a node to go quiet after `stop`.
    #[arg(long, default_value = "15")]
    settle_stop: u64,

    /// Seconds to wait for a node to rejoin after `start`.
    #[arg(long, default_value = "60")]
    settle_restart: u64,

    /// Seconds to pause after each scenario write; zero moves on as soon
    /// as the write is acknowledged.
    #[arg(long, default_value = "0")]
    settle_write: u64,

    /// Milliseconds between probes; zero samples the window immediately
    /// after the restart.
    #[arg(long, default_value = "0")]
    probe_delay_ms: u64,

    /// Print every probe observation as a JSON line before the summary.
    #[arg(long)]
    capture_probes: bool,

    /// Per-request timeout in seconds for store operations.
    #[arg(long, default_value = "2")]
    request_timeout: u64,

    /// Seconds allowed for the initial connection sweep.
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Failovers per store operation before giving up.
    #[arg(long, default_value = "10")]
    max_retries: u32,

    /// Milliseconds between failover attempts.
    #[arg(long, default_value = "50")]
    retry_delay_ms: u64,
}

fn parse_level(what: &str, raw: &str) -> ConsistencyLevel {
    match raw.parse() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("error: invalid {} consistency: {}", what, err);
            process::exit(2);
        }
    }
}

/// Assemble the run configuration. Every [`HarnessConfig`] field is
/// covered by a flag.
fn config_from(cli: Cli) -> HarnessConfig {
    let endpoints = cli.endpoints.unwrap_or_else(|| {
        (1..=cli.nodes)
            .map(|n| format!("127.0.0.1:{}", 7100 + n))
            .collect()
    });

    let selector = match (cli.node, cli.seed) {
        (Some(id), _) => NodeSelector::Fixed(NodeId(id)),
        (None, Some(seed)) => NodeSelector::Seeded(seed),
        (None, None) => NodeSelector::Random,
    };

    HarnessConfig {
        endpoints,
        service_prefix: cli.service_prefix,
        compose_file: cli.compose_file,
        keyspace: cli.keyspace,
        table: cli.table,
        key: cli.key,
        replication_factor: cli.replication_factor,
        stale_value: cli.stale_value,
        fresh_value: cli.fresh_value,
        attempts: cli.attempts,
        write_consistency: parse_level("write", &cli.write_consistency),
        read_consistency: parse_level("read", &cli.read_consistency),
        downgrading_retry: !cli.no_downgrade,
        selector,
        settle: SettleConfig {
            after_cluster_start: Duration::from_secs(cli.settle_start),
            after_node_stop: Duration::from_secs(cli.settle_stop),
            after_node_start: Duration::from_secs(cli.settle_restart),
            after_write: Duration::from_secs(cli.settle_write),
        },
        probe_delay: Duration::from_millis(cli.probe_delay_ms),
        capture_probes: cli.capture_probes,
        connect_timeout: Duration::from_secs(cli.connect_timeout),
        request_timeout: Duration::from_secs(cli.request_timeout),
        max_retries: cli.max_retries,
        retry_delay: Duration::from_millis(cli.retry_delay_ms),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let mode = match RunMode::parse(cli.mode.as_deref()) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(2);
        }
    };

    let config = config_from(cli);

    if let Err(err) = config.validate() {
        eprintln!("error: {}", err);
        process::exit(2);
    }

    let mut store = HttpStore::new(config.endpoints.clone(), config.request_timeout)
        .with_connect_timeout(config.connect_timeout)
        .with_max_retries(config.max_retries)
        .with_retry_delay(config.retry_delay)
        .with_downgrading_retry(config.downgrading_retry);

    let mut cluster = match ComposeCluster::new(
        config.compose_file.clone(),
        config.service_prefix.clone(),
        config.endpoints.clone(),
        config.settle,
    ) {
        Ok(cluster) => cluster,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(2);
        }
    };

    info!(
        "{} node cluster, key `{}`, {} probes at {}",
        config.node_count(),
        config.key,
        config.attempts,
        config.read_consistency
    );

    let outcome = run(&mut store, &mut cluster, &config, mode).await;

    match &outcome {
        Ok(result) => {
            if let Some(probes) = &result.probes {
                for probe in probes {
                    if let Ok(line) = serde_json::to_string(probe) {
                        println!("{}", line);
                    }
                }
            }
            println!("{}", result.summary());
        }
        Err(err) => eprintln!("error: {}", err),
    }

    process::exit(exit_code(&outcome));
}

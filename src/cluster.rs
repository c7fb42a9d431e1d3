//! Cluster lifecycle control for fault injection.
//!
//! Provides `ComposeCluster`, which brings the cluster up and stops or
//! restarts single nodes through `docker compose`, blocking on active
//! readiness polling instead of fixed sleeps: after every lifecycle command
//! the affected node is polled until it reports ready (or stops answering),
//! bounded by a per-phase deadline from [`SettleConfig`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::sleep;

use crate::error::{HarnessError, Result};

/// Identifier of one cluster member. Ids are 1-based to line up with the
/// compose service names (`store1..storeN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one cluster member, tracked by the controller and
/// mutated only after a lifecycle command and its readiness barrier succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Up,
    Down,
}

/// Policy for choosing which node the fault sequence takes down.
///
/// `Seeded` makes runs reproducible; `Random` draws from OS entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelector {
    Fixed(NodeId),
    Seeded(u64),
    Random,
}

impl NodeSelector {
    /// Pick a node among `1..=node_count`. `node_count` must be at least 1.
    pub fn choose(&self, node_count: u32) -> NodeId {
        match self {
            NodeSelector::Fixed(id) => *id,
            NodeSelector::Seeded(seed) => {
                let mut rng = StdRng::seed_from_u64(*seed);
                NodeId(rng.random_range(1..=node_count))
            }
            NodeSelector::Random => {
                let mut rng = StdRng::from_os_rng();
                NodeId(rng.random_range(1..=node_count))
            }
        }
    }
}

/// Per-phase bounds on how long the controller waits for the cluster to
/// converge after a lifecycle command, plus the pacing of the scenario's
/// own writes.
///
/// Stopping a node needs time for the cluster to notice the departure;
/// starting one needs time for it to rejoin and begin repair.
/// `after_write` pauses the scenario after each write so the value can
/// spread beyond the acknowledging replicas; zero moves on as soon as the
/// write is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleConfig {
    pub after_cluster_start: Duration,
    pub after_node_stop: Duration,
    pub after_node_start: Duration,
    pub after_write: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        SettleConfig {
            after_cluster_start: Duration::from_secs(60),
            after_node_stop: Duration::from_secs(15),
            after_node_start: Duration::from_secs(60),
            after_write: Duration::ZERO,
        }
    }
}

/// Status response from a store node's /status endpoint
#[derive(Debug, Deserialize)]
struct NodeStatus {
    node_id: u64,
    state: String,
}

/// Lifecycle operations the fault sequence needs from a cluster.
#[async_trait]
pub trait Cluster: Send {
    /// Bring all nodes up and wait until every one of them reports ready.
    async fn start_cluster(&mut self) -> Result<()>;

    /// Stop one node and wait until it stops answering.
    async fn stop_node(&mut self, node: NodeId) -> Result<()>;

    /// Restart a stopped node and wait until it reports ready again.
    async fn start_node(&mut self, node: NodeId) -> Result<()>;

    /// Number of members in the cluster.
    fn node_count(&self) -> u32;
}

const READINESS_BACKOFF: Duration = Duration::from_millis(100);
const READINESS_BACKOFF_CAP: Duration = Duration::from_millis(1600);

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(READINESS_BACKOFF_CAP)
}

/// Controls a docker compose cluster of store nodes.
pub struct ComposeCluster {
    compose_file: String,
    service_prefix: String,
    /// One status endpoint per node, index `id - 1` (format: "host:port")
    endpoints: Vec<String>,
    health: Vec<NodeHealth>,
    started: bool,
    settle: SettleConfig,
    probe: reqwest::Client,
}

impl ComposeCluster {
    pub fn new(
        compose_file: impl Into<String>,
        service_prefix: impl Into<String>,
        endpoints: Vec<String>,
        settle: SettleConfig,
    ) -> Result<Self> {
        let probe = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| {
                HarnessError::connection(format!("failed to build readiness probe client: {}", e))
            })?;

        let health = vec![NodeHealth::Up; endpoints.len()];

        Ok(ComposeCluster {
            compose_file: compose_file.into(),
            service_prefix: service_prefix.into(),
            endpoints,
            health,
            started: false,
            settle,
            probe,
        })
    }

    /// Compose service name for a node, e.g. `store2`.
    pub fn service_name(&self, node: NodeId) -> String {
        format!("{}{}", self.service_prefix, node.0)
    }

    /// Current tracked health of a node, if the id is known.
    pub fn node_health(&self, node: NodeId) -> Option<NodeHealth> {
        self.health.get((node.0 as usize).wrapping_sub(1)).copied()
    }

    fn ensure_started(&self, op: &str) -> Result<()> {
        if !self.started {
            return Err(HarnessError::orchestration(
                op,
                "cluster has not been started",
            ));
        }
        Ok(())
    }

    fn ensure_known(&self, op: &str, node: NodeId) -> Result<()> {
        if node.0 == 0 || node.0 as usize > self.endpoints.len() {
            return Err(HarnessError::orchestration(
                op,
                format!("unknown node {} (cluster has {})", node, self.endpoints.len()),
            ));
        }
        Ok(())
    }

    /// Run one `docker compose` verb; the exit status is the sole success
    /// signal, stderr is folded into the error detail.
    async fn compose(&self, args: &[&str]) -> Result<()> {
        let mut command = vec!["compose", "-f", self.compose_file.as_str()];
        command.extend_from_slice(args);
        let rendered = format!("docker {}", command.join(" "));
        debug!("running `{}`", rendered);

        let output = Command::new("docker")
            .args(&command)
            .output()
            .await
            .map_err(|e| HarnessError::orchestration(&rendered, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HarnessError::orchestration(
                &rendered,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }
        Ok(())
    }

    fn status_url(&self, node: NodeId) -> String {
        format!("http://{}/status", self.endpoints[(node.0 - 1) as usize])
    }

    /// One status probe; `Some(state)` when the node answered coherently.
    async fn probe_state(&self, node: NodeId) -> Option<String> {
        let response = self.probe.get(self.status_url(node)).send().await.ok()?;
        let status = response.json::<NodeStatus>().await.ok()?;
        debug!("node {} (id {}) reports state {}", node, status.node_id, status.state);
        Some(status.state)
    }

    async fn await_node_ready(&self, node: NodeId, bound: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + bound;
        let mut backoff = READINESS_BACKOFF;
        loop {
            if self.probe_state(node).await.as_deref() == Some("ready") {
                return Ok(());
            }
            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(HarnessError::timeout(
                    format!("node {} to report ready", self.service_name(node)),
                    bound,
                ));
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn await_node_gone(&self, node: NodeId, bound: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + bound;
        let mut backoff = READINESS_BACKOFF;
        loop {
            if self.probe.get(self.status_url(node)).send().await.is_err() {
                return Ok(());
            }
            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(HarnessError::timeout(
                    format!("node {} to stop answering", self.service_name(node)),
                    bound,
                ));
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    async fn await_all_ready(&self, bound: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + bound;
        let mut backoff = READINESS_BACKOFF;
        loop {
            let mut all_ready = true;
            for id in 1..=self.node_count() {
                if self.probe_state(NodeId(id)).await.as_deref() != Some("ready") {
                    all_ready = false;
                    break;
                }
            }
            if all_ready {
                return Ok(());
            }
            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(HarnessError::timeout(
                    format!("all {} nodes to report ready", self.node_count()),
                    bound,
                ));
            }
            sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }
}

#[async_trait]
impl Cluster for ComposeCluster {
    async fn start_cluster(&mut self) -> Result<()> {
        self.compose(&["up", "-d"]).await?;
        self.await_all_ready(self.settle.after_cluster_start).await?;
        self.started = true;
        for health in &mut self.health {
            *health = NodeHealth::Up;
        }
        info!("cluster started with {} nodes", self.node_count());
        Ok(())
    }

    async fn stop_node(&mut self, node: NodeId) -> Result<()> {
        let service = self.service_name(node);
        let op = format!("stop {}", service);
        self.ensure_started(&op)?;
        self.ensure_known(&op, node)?;

        self.compose(&["stop", &service]).await?;
        self.await_node_gone(node, self.settle.after_node_stop).await?;
        self.health[(node.0 - 1) as usize] = NodeHealth::Down;
        info!("node {} stopped", service);
        Ok(())
    }

    async fn start_node(&mut self, node: NodeId) -> Result<()> {
        let service = self.service_name(node);
        let op = format!("start {}", service);
        self.ensure_started(&op)?;
        self.ensure_known(&op, node)?;

        self.compose(&["start", &service]).await?;
        self.await_node_ready(node, self.settle.after_node_start).await?;
        self.health[(node.0 - 1) as usize] = NodeHealth::Up;
        info!("node {} started", service);
        Ok(())
    }

    fn node_count(&self) -> u32 {
        self.endpoints.len() as u32
    }
}

//! Run configuration.
//!
//! Everything the harness does is parameterized here and handed to each
//! component's constructor; there is no process-global state. Defaults
//! describe the stock scenario: a three node cluster, key `testuser`,
//! value `1` superseded by `5`, one thousand probes at consistency ONE.

use std::time::Duration;

use crate::cluster::{NodeId, NodeSelector, SettleConfig};
use crate::store::ConsistencyLevel;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Store endpoints, one per node, 1-based node id = index + 1
    /// (format: "host:port").
    pub endpoints: Vec<String>,
    /// Compose service name prefix; node N runs as `<prefix>N`.
    pub service_prefix: String,
    /// Compose file handed to the orchestration command.
    pub compose_file: String,
    pub keyspace: String,
    pub table: String,
    /// The single tracked key the scenario writes and probes.
    pub key: String,
    pub replication_factor: u32,
    /// Value A, written before the chosen node goes down.
    pub stale_value: String,
    /// Value B, written while the chosen node is down.
    pub fresh_value: String,
    /// Number of probe reads per detection run.
    pub attempts: u32,
    pub write_consistency: ConsistencyLevel,
    pub read_consistency: ConsistencyLevel,
    /// Retry consistency failures one level weaker instead of failing.
    pub downgrading_retry: bool,
    /// Which node the fault sequence takes down.
    pub selector: NodeSelector,
    /// Per-phase readiness bounds after lifecycle commands.
    pub settle: SettleConfig,
    /// Spacing between probes; zero samples the window immediately after
    /// the restart, a positive delay stretches sampling across repair.
    pub probe_delay: Duration,
    /// Retain per-probe observations for diagnostics.
    pub capture_probes: bool,
    /// Bound on the initial endpoint sweep when opening the session.
    pub connect_timeout: Duration,
    /// Per-request timeout for store operations.
    pub request_timeout: Duration,
    /// Failovers per store operation before giving up.
    pub max_retries: u32,
    /// Pause between failover attempts.
    pub retry_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            endpoints: vec![
                "127.0.0.1:7101".to_string(),
                "127.0.0.1:7102".to_string(),
                "127.0.0.1:7103".to_string(),
            ],
            service_prefix: "store".to_string(),
            compose_file: "docker-compose.yml".to_string(),
            keyspace: "fedikeyspace".to_string(),
            table: "test_table".to_string(),
            key: "testuser".to_string(),
            replication_factor: 3,
            stale_value: "1".to_string(),
            fresh_value: "5".to_string(),
            attempts: 1000,
            write_consistency: ConsistencyLevel::One,
            read_consistency: ConsistencyLevel::One,
            downgrading_retry: true,
            selector: NodeSelector::Random,
            settle: SettleConfig::default(),
            probe_delay: Duration::ZERO,
            capture_probes: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(2),
            max_retries: 10,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl HarnessConfig {
    pub fn node_count(&self) -> u32 {
        self.endpoints.len() as u32
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_stale_value(mut self, value: impl Into<String>) -> Self {
        self.stale_value = value.into();
        self
    }

    pub fn with_fresh_value(mut self, value: impl Into<String>) -> Self {
        self.fresh_value = value.into();
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_selector(mut self, selector: NodeSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_settle(mut self, settle: SettleConfig) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = delay;
        self
    }

    pub fn with_capture_probes(mut self, capture: bool) -> Self {
        self.capture_probes = capture;
        self
    }

    pub fn with_read_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.read_consistency = level;
        self
    }

    pub fn with_write_consistency(mut self, level: ConsistencyLevel) -> Self {
        self.write_consistency = level;
        self
    }

    pub fn with_downgrading_retry(mut self, enabled: bool) -> Self {
        self.downgrading_retry = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Reject combinations the harness cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("at least one store endpoint is required".to_string());
        }
        if self.key.is_empty() {
            return Err("the tracked key must not be empty".to_string());
        }
        if self.stale_value == self.fresh_value {
            return Err(format!(
                "stale and fresh values must differ (both are `{}`)",
                self.stale_value
            ));
        }
        if self.replication_factor == 0 {
            return Err("replication factor must be at least 1".to_string());
        }
        if self.max_retries == 0 {
            return Err("max retries must be at least 1".to_string());
        }
        if let NodeSelector::Fixed(NodeId(id)) = self.selector {
            if id == 0 || id > self.node_count() {
                return Err(format!(
                    "fixed node {} is out of range (cluster has {} nodes)",
                    id,
                    self.node_count()
                ));
            }
        }
        Ok(())
    }
}

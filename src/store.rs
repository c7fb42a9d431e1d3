//! HTTP client for the replicated KV store under test.
//!
//! Wraps reqwest with endpoint failover and a downgrading consistency retry:
//! when a node refuses an operation because too few replicas are alive, the
//! operation is retried one consistency level weaker instead of failing
//! outright.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};

/// How many replicas must acknowledge an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
}

impl ConsistencyLevel {
    /// Wire form, used as the `consistency` query parameter.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsistencyLevel::One => "one",
            ConsistencyLevel::Quorum => "quorum",
            ConsistencyLevel::All => "all",
        }
    }

    /// The next weaker level, if any. `ONE` has nowhere left to go.
    pub fn downgrade(&self) -> Option<ConsistencyLevel> {
        match self {
            ConsistencyLevel::All => Some(ConsistencyLevel::Quorum),
            ConsistencyLevel::Quorum => Some(ConsistencyLevel::One),
            ConsistencyLevel::One => None,
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::One => "ONE",
            ConsistencyLevel::Quorum => "QUORUM",
            ConsistencyLevel::All => "ALL",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ConsistencyLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "one" => Ok(ConsistencyLevel::One),
            "quorum" => Ok(ConsistencyLevel::Quorum),
            "all" => Ok(ConsistencyLevel::All),
            other => Err(format!(
                "unknown consistency level `{}` (expected one, quorum or all)",
                other
            )),
        }
    }
}

/// Acknowledgement for a write, carrying the level that actually satisfied it
/// (weaker than requested when the downgrading retry kicked in).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub consistency: ConsistencyLevel,
}

/// Response for GET /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvGetResponse {
    key: String,
    value: Option<String>,
    consistency: String,
}

/// Request body for POST /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSetRequest {
    value: String,
}

/// Response for POST /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSetResponse {
    key: String,
    applied: bool,
    consistency: String,
}

/// Request body for POST /schema
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaRequest {
    keyspace: String,
    table: String,
    replication_factor: u32,
}

/// Response for POST /schema
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaResponse {
    created: bool,
}

/// Error response from a store node
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    required: Option<u32>,
    alive: Option<u32>,
}

/// Session abstraction over the replicated store.
///
/// The session is explicit: `open` must succeed before any operation, and
/// `close` releases it. Operations on a closed session fail with a
/// connection error rather than panicking.
#[async_trait]
pub trait Store: Send {
    /// Probe the endpoints and establish the session, bounded by the
    /// configured connect timeout.
    async fn open(&mut self) -> Result<()>;

    /// Create the keyspace/table if absent. Safe to call on every run.
    async fn ensure_schema(&mut self, keyspace: &str, table: &str, replication_factor: u32)
        -> Result<()>;

    /// Upsert `key` to `value` at the given consistency level.
    async fn write(&mut self, key: &str, value: &str, level: ConsistencyLevel)
        -> Result<WriteAck>;

    /// Read the currently visible value of `key`, or `None` if absent.
    async fn read(&mut self, key: &str, level: ConsistencyLevel) -> Result<Option<String>>;

    /// Release the session. Idempotent; safe after a failed `open`.
    async fn close(&mut self);
}

const ENDPOINT_SWEEP_BACKOFF: Duration = Duration::from_millis(100);
const ENDPOINT_SWEEP_BACKOFF_CAP: Duration = Duration::from_millis(1600);

/// HTTP/JSON implementation of [`Store`].
pub struct HttpStore {
    /// Node addresses for failover (format: "host:port")
    targets: Vec<String>,
    /// HTTP client; present only while the session is open
    http: Option<reqwest::Client>,
    /// Round-robin cursor into `targets`
    cursor: usize,
    /// Bound on how long `open` keeps sweeping the endpoints
    connect_timeout: Duration,
    /// Per-request timeout
    request_timeout: Duration,
    /// Maximum failovers per operation before giving up
    max_retries: u32,
    /// Pause between failover attempts
    retry_delay: Duration,
    /// Whether consistency failures downgrade instead of failing outright
    downgrading_retry: bool,
}

impl HttpStore {
    /// Create a closed session for the given endpoints.
    pub fn new(targets: Vec<String>, request_timeout: Duration) -> Self {
        HttpStore {
            targets,
            http: None,
            cursor: 0,
            connect_timeout: Duration::from_secs(10),
            request_timeout,
            max_retries: 10,
            retry_delay: Duration::from_millis(50),
            downgrading_retry: true,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_downgrading_retry(mut self, enabled: bool) -> Self {
        self.downgrading_retry = enabled;
        self
    }

    /// Borrow the live client, or fail when the session is not open.
    fn session(&self) -> Result<reqwest::Client> {
        self.http
            .clone()
            .ok_or_else(|| HarnessError::connection("session not open"))
    }

    /// Current failover target.
    fn target(&self) -> &str {
        &self.targets[self.cursor % self.targets.len()]
    }

    /// Rotate to the next failover target.
    fn rotate(&mut self) {
        self.cursor = (self.cursor + 1) % self.targets.len();
    }

    fn op_context(key: &str, level: ConsistencyLevel) -> String {
        format!("key `{}` at {}", key, level)
    }

    fn unavailable_detail(error: &ErrorResponse) -> String {
        match (error.required, error.alive) {
            (Some(required), Some(alive)) => format!(
                "{} (required {} replicas, {} alive)",
                error.error, required, alive
            ),
            _ => error.error.clone(),
        }
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn open(&mut self) -> Result<()> {
        if self.http.is_some() {
            return Ok(());
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(500))
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| HarnessError::connection(format!("failed to build HTTP client: {}", e)))?;

        let deadline = tokio::time::Instant::now() + self.connect_timeout;
        let mut backoff = ENDPOINT_SWEEP_BACKOFF;

        loop {
            for target in &self.targets {
                let url = format!("http://{}/status", target);
                if let Ok(response) = http.get(&url).send().await {
                    if response.status().is_success() {
                        info!("store session open via {}", target);
                        self.http = Some(http);
                        return Ok(());
                    }
                }
            }

            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(HarnessError::connection(format!(
                    "no endpoint reachable within {:?} (tried {})",
                    self.connect_timeout,
                    self.targets.join(", ")
                )));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(ENDPOINT_SWEEP_BACKOFF_CAP);
        }
    }

    async fn ensure_schema(
        &mut self,
        keyspace: &str,
        table: &str,
        replication_factor: u32,
    ) -> Result<()> {
        let http = self.session()?;
        let context = format!("schema `{}.{}`", keyspace, table);
        let body = SchemaRequest {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            replication_factor,
        };

        let mut retries = 0;
        loop {
            let url = format!("http://{}/schema", self.target());

            match http.post(&url).json(&body).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        let resp: SchemaResponse = response.json().await.map_err(|e| {
                            HarnessError::write(&context, format!("malformed response: {}", e))
                        })?;
                        info!(
                            "schema `{}.{}` ensured (created: {})",
                            keyspace, table, resp.created
                        );
                        return Ok(());
                    } else {
                        return Err(HarnessError::write(
                            &context,
                            format!("unexpected status: {}", response.status()),
                        ));
                    }
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(HarnessError::timeout(context, self.request_timeout));
                    }
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(HarnessError::write(&context, e.to_string()));
                    }
                    self.rotate();
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn write(
        &mut self,
        key: &str,
        value: &str,
        level: ConsistencyLevel,
    ) -> Result<WriteAck> {
        let http = self.session()?;
        let requested = level;
        let mut level = level;
        let mut retries = 0;

        loop {
            let url = format!(
                "http://{}/kv/{}?consistency={}",
                self.target(),
                key,
                level.as_str()
            );
            let body = KvSetRequest {
                value: value.to_string(),
            };

            match http.post(&url).json(&body).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        let resp: KvSetResponse = response.json().await.map_err(|e| {
                            HarnessError::write(
                                Self::op_context(key, level),
                                format!("malformed ack: {}", e),
                            )
                        })?;
                        let satisfied = resp.consistency.parse().unwrap_or(level);
                        if satisfied != requested {
                            warn!(
                                "write of key `{}` requested {} but was satisfied at {}",
                                key, requested, satisfied
                            );
                        }
                        return Ok(WriteAck {
                            consistency: satisfied,
                        });
                    } else if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                        let error: ErrorResponse = response.json().await.map_err(|e| {
                            HarnessError::write(
                                Self::op_context(key, level),
                                format!("malformed error response: {}", e),
                            )
                        })?;

                        // Consistency failure: retry weaker instead of failing outright.
                        if self.downgrading_retry {
                            if let Some(weaker) = level.downgrade() {
                                warn!(
                                    "write of key `{}` unavailable at {}: {}; downgrading to {}",
                                    key,
                                    level,
                                    Self::unavailable_detail(&error),
                                    weaker
                                );
                                level = weaker;
                                continue;
                            }
                        }
                        return Err(HarnessError::write(
                            Self::op_context(key, level),
                            Self::unavailable_detail(&error),
                        ));
                    } else {
                        return Err(HarnessError::write(
                            Self::op_context(key, level),
                            format!("unexpected status: {}", response.status()),
                        ));
                    }
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(HarnessError::timeout(
                            format!("write of key `{}`", key),
                            self.request_timeout,
                        ));
                    }
                    // Network error: fail over to the next node.
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(HarnessError::write(
                            Self::op_context(key, level),
                            e.to_string(),
                        ));
                    }
                    self.rotate();
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn read(&mut self, key: &str, level: ConsistencyLevel) -> Result<Option<String>> {
        let http = self.session()?;
        let mut level = level;
        let mut retries = 0;

        loop {
            let url = format!(
                "http://{}/kv/{}?consistency={}",
                self.target(),
                key,
                level.as_str()
            );

            match http.get(&url).send().await {
                Ok(response) => {
                    if response.status().is_success() {
                        let resp: KvGetResponse = response.json().await.map_err(|e| {
                            HarnessError::read(
                                Self::op_context(key, level),
                                format!("malformed response: {}", e),
                            )
                        })?;
                        debug!(
                            "read key `{}` at {} -> {:?}",
                            key, resp.consistency, resp.value
                        );
                        return Ok(resp.value);
                    } else if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                        let error: ErrorResponse = response.json().await.map_err(|e| {
                            HarnessError::read(
                                Self::op_context(key, level),
                                format!("malformed error response: {}", e),
                            )
                        })?;

                        if self.downgrading_retry {
                            if let Some(weaker) = level.downgrade() {
                                warn!(
                                    "read of key `{}` unavailable at {}: {}; downgrading to {}",
                                    key,
                                    level,
                                    Self::unavailable_detail(&error),
                                    weaker
                                );
                                level = weaker;
                                continue;
                            }
                        }
                        return Err(HarnessError::read(
                            Self::op_context(key, level),
                            Self::unavailable_detail(&error),
                        ));
                    } else {
                        return Err(HarnessError::read(
                            Self::op_context(key, level),
                            format!("unexpected status: {}", response.status()),
                        ));
                    }
                }
                Err(e) => {
                    if e.is_timeout() {
                        return Err(HarnessError::timeout(
                            format!("read of key `{}`", key),
                            self.request_timeout,
                        ));
                    }
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(HarnessError::read(
                            Self::op_context(key, level),
                            e.to_string(),
                        ));
                    }
                    self.rotate();
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.http.take().is_some() {
            info!("store session closed");
        } else {
            debug!("store session already closed");
        }
    }
}

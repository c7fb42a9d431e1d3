//! Test doubles for harness tests.
//!
//! `StubNode` serves the store's HTTP surface in-process so the real client
//! and readiness probing can be exercised without containers.
//! `ScriptedStore` and `ScriptedCluster` record every call and fail on cue,
//! so tests can assert call order and session discipline.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::cluster::{Cluster, NodeId};
use crate::error::{HarnessError, Result};
use crate::store::{ConsistencyLevel, Store, WriteAck};

/// Response for status queries (server-side view of the wire shape)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusBody {
    node_id: u64,
    state: String,
}

/// Response for GET /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvGetBody {
    key: String,
    value: Option<String>,
    consistency: String,
}

/// Request body for POST /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSetBody {
    value: String,
}

/// Response for POST /kv/{key}
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvSetAckBody {
    key: String,
    applied: bool,
    consistency: String,
}

/// Request body for POST /schema
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaBody {
    keyspace: String,
    table: String,
    replication_factor: u32,
}

/// Response for POST /schema
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaAckBody {
    created: bool,
}

/// Error response for unavailable consistency levels
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    required: Option<u32>,
    alive: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LevelParam {
    consistency: Option<String>,
}

/// Scriptable behavior of one stub store node.
pub struct StubState {
    pub node_id: u64,
    /// Reported by /status; anything but "ready" keeps probers waiting.
    pub node_state: String,
    pub kv: HashMap<String, String>,
    /// Consistency levels currently refused with 503.
    pub unavailable_levels: Vec<String>,
    pub required_replicas: u32,
    pub alive_replicas: u32,
    /// Reads served `stale_value` before falling back to `kv`.
    pub stale_reads_remaining: u32,
    pub stale_value: Option<String>,
    /// (keyspace, table) pairs provisioned so far.
    pub schemas: Vec<(String, String)>,
    pub writes_seen: u32,
    pub reads_seen: u32,
}

type SharedStub = Arc<Mutex<StubState>>;

fn unavailable(state: &StubState) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            error: "not enough replicas alive".to_string(),
            required: Some(state.required_replicas),
            alive: Some(state.alive_replicas),
        }),
    )
}

async fn handle_status(State(state): State<SharedStub>) -> Json<StatusBody> {
    let state = state.lock();
    Json(StatusBody {
        node_id: state.node_id,
        state: state.node_state.clone(),
    })
}

async fn handle_schema(
    State(state): State<SharedStub>,
    Json(body): Json<SchemaBody>,
) -> Json<SchemaAckBody> {
    let mut state = state.lock();
    let entry = (body.keyspace, body.table);
    let created = !state.schemas.contains(&entry);
    if created {
        state.schemas.push(entry);
    }
    Json(SchemaAckBody { created })
}

async fn handle_get(
    Path(key): Path<String>,
    Query(params): Query<LevelParam>,
    State(state): State<SharedStub>,
) -> std::result::Result<Json<KvGetBody>, (StatusCode, Json<ErrorBody>)> {
    let mut state = state.lock();
    state.reads_seen += 1;

    let level = params.consistency.unwrap_or_else(|| "one".to_string());
    if state.unavailable_levels.contains(&level) {
        return Err(unavailable(&state));
    }

    let value = if state.stale_reads_remaining > 0 && state.stale_value.is_some() {
        state.stale_reads_remaining -= 1;
        state.stale_value.clone()
    } else {
        state.kv.get(&key).cloned()
    };

    Ok(Json(KvGetBody {
        key,
        value,
        consistency: level,
    }))
}

async fn handle_set(
    Path(key): Path<String>,
    Query(params): Query<LevelParam>,
    State(state): State<SharedStub>,
    Json(body): Json<KvSetBody>,
) -> std::result::Result<Json<KvSetAckBody>, (StatusCode, Json<ErrorBody>)> {
    let mut state = state.lock();
    state.writes_seen += 1;

    let level = params.consistency.unwrap_or_else(|| "one".to_string());
    if state.unavailable_levels.contains(&level) {
        return Err(unavailable(&state));
    }

    state.kv.insert(key.clone(), body.value);
    Ok(Json(KvSetAckBody {
        key,
        applied: true,
        consistency: level,
    }))
}

/// One in-process store node on 127.0.0.1:0.
pub struct StubNode {
    pub addr: SocketAddr,
    state: SharedStub,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl StubNode {
    pub async fn start(node_id: u64) -> StubNode {
        let state: SharedStub = Arc::new(Mutex::new(StubState {
            node_id,
            node_state: "ready".to_string(),
            kv: HashMap::new(),
            unavailable_levels: Vec::new(),
            required_replicas: 2,
            alive_replicas: 1,
            stale_reads_remaining: 0,
            stale_value: None,
            schemas: Vec::new(),
            writes_seen: 0,
            reads_seen: 0,
        }));

        let app = Router::new()
            .route("/status", get(handle_status))
            .route("/schema", post(handle_schema))
            .route("/kv/{key}", get(handle_get).post(handle_set))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        StubNode {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// "host:port" form the harness config wants.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_value(&self, key: &str, value: &str) {
        self.state.lock().kv.insert(key.to_string(), value.to_string());
    }

    pub fn value_of(&self, key: &str) -> Option<String> {
        self.state.lock().kv.get(key).cloned()
    }

    pub fn set_node_state(&self, node_state: &str) {
        self.state.lock().node_state = node_state.to_string();
    }

    /// Refuse the given consistency levels with 503 until changed.
    pub fn refuse_levels(&self, levels: &[&str]) {
        self.state.lock().unavailable_levels =
            levels.iter().map(|level| level.to_string()).collect();
    }

    /// Serve `value` for the next `reads` GETs, regardless of the map.
    pub fn serve_stale(&self, value: &str, reads: u32) {
        let mut state = self.state.lock();
        state.stale_value = Some(value.to_string());
        state.stale_reads_remaining = reads;
    }

    pub fn schema_count(&self) -> usize {
        self.state.lock().schemas.len()
    }

    pub fn writes_seen(&self) -> u32 {
        self.state.lock().writes_seen
    }

    pub fn reads_seen(&self) -> u32 {
        self.state.lock().reads_seen
    }

    /// Shut the server down; the address goes quiet shortly after.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Store fake that records calls and fails on cue.
pub struct ScriptedStore {
    pub open_calls: u32,
    pub close_calls: u32,
    pub schema_calls: Vec<(String, String, u32)>,
    /// Every write attempted, in order: (key, value, level).
    pub writes: Vec<(String, String, ConsistencyLevel)>,
    pub read_count: u32,
    scripted_reads: VecDeque<Result<Option<String>>>,
    steady_value: Option<String>,
    fail_open: bool,
    fail_all_reads: bool,
    fail_writes_of: Option<String>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        ScriptedStore {
            open_calls: 0,
            close_calls: 0,
            schema_calls: Vec::new(),
            writes: Vec::new(),
            read_count: 0,
            scripted_reads: VecDeque::new(),
            steady_value: None,
            fail_open: false,
            fail_all_reads: false,
            fail_writes_of: None,
        }
    }

    /// Value returned once the scripted reads are exhausted.
    pub fn with_steady_value(mut self, value: &str) -> Self {
        self.steady_value = Some(value.to_string());
        self
    }

    /// Queue exact outcomes for the next reads, consumed in order.
    pub fn with_scripted_reads(mut self, values: &[Option<&str>]) -> Self {
        self.scripted_reads
            .extend(values.iter().map(|v| Ok(v.map(|s| s.to_string()))));
        self
    }

    /// Queue `count` reads that fail before the steady value resumes.
    pub fn with_failing_reads(mut self, count: u32) -> Self {
        for _ in 0..count {
            self.scripted_reads.push_back(Err(HarnessError::read(
                "scripted key",
                "scripted read failure",
            )));
        }
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_reads(mut self) -> Self {
        self.fail_all_reads = true;
        self
    }

    /// Fail any write of this exact value (the attempt is still recorded).
    pub fn failing_writes_of(mut self, value: &str) -> Self {
        self.fail_writes_of = Some(value.to_string());
        self
    }
}

impl Default for ScriptedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for ScriptedStore {
    async fn open(&mut self) -> Result<()> {
        self.open_calls += 1;
        if self.fail_open {
            return Err(HarnessError::connection("scripted open failure"));
        }
        Ok(())
    }

    async fn ensure_schema(
        &mut self,
        keyspace: &str,
        table: &str,
        replication_factor: u32,
    ) -> Result<()> {
        self.schema_calls
            .push((keyspace.to_string(), table.to_string(), replication_factor));
        Ok(())
    }

    async fn write(
        &mut self,
        key: &str,
        value: &str,
        level: ConsistencyLevel,
    ) -> Result<WriteAck> {
        self.writes
            .push((key.to_string(), value.to_string(), level));
        if self.fail_writes_of.as_deref() == Some(value) {
            return Err(HarnessError::write(
                format!("key `{}` at {}", key, level),
                "scripted write failure",
            ));
        }
        Ok(WriteAck { consistency: level })
    }

    async fn read(&mut self, key: &str, level: ConsistencyLevel) -> Result<Option<String>> {
        self.read_count += 1;
        if let Some(next) = self.scripted_reads.pop_front() {
            return next;
        }
        if self.fail_all_reads {
            return Err(HarnessError::read(
                format!("key `{}` at {}", key, level),
                "scripted read failure",
            ));
        }
        Ok(self.steady_value.clone())
    }

    async fn close(&mut self) {
        self.close_calls += 1;
    }
}

/// Cluster fake that records lifecycle calls and fails on cue.
pub struct ScriptedCluster {
    /// Calls in order: "up", "stop N", "start N".
    pub calls: Vec<String>,
    node_count: u32,
    fail_start_cluster: bool,
    fail_stop_node: bool,
    fail_start_node: bool,
}

impl ScriptedCluster {
    pub fn new(node_count: u32) -> Self {
        ScriptedCluster {
            calls: Vec::new(),
            node_count,
            fail_start_cluster: false,
            fail_stop_node: false,
            fail_start_node: false,
        }
    }

    pub fn failing_start_cluster(mut self) -> Self {
        self.fail_start_cluster = true;
        self
    }

    pub fn failing_stop_node(mut self) -> Self {
        self.fail_stop_node = true;
        self
    }

    pub fn failing_start_node(mut self) -> Self {
        self.fail_start_node = true;
        self
    }
}

#[async_trait]
impl Cluster for ScriptedCluster {
    async fn start_cluster(&mut self) -> Result<()> {
        self.calls.push("up".to_string());
        if self.fail_start_cluster {
            return Err(HarnessError::orchestration("up", "scripted start failure"));
        }
        Ok(())
    }

    async fn stop_node(&mut self, node: NodeId) -> Result<()> {
        self.calls.push(format!("stop {}", node));
        if self.fail_stop_node {
            return Err(HarnessError::orchestration(
                format!("stop {}", node),
                "scripted stop failure",
            ));
        }
        Ok(())
    }

    async fn start_node(&mut self, node: NodeId) -> Result<()> {
        self.calls.push(format!("start {}", node));
        if self.fail_start_node {
            return Err(HarnessError::orchestration(
                format!("start {}", node),
                "scripted restart failure",
            ));
        }
        Ok(())
    }

    fn node_count(&self) -> u32 {
        self.node_count
    }
}

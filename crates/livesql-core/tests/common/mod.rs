//! Common test doubles for livesql-core integration tests.
#![allow(dead_code)]

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use livesql_core::db::{DbClient, DbTransaction, Notification, NotificationSource, Row};
use livesql_core::error::{DbErrorInfo, Result};
use livesql_core::sync::{
    compare_synced, ChangeSet, SyncInfo, SyncParams, SyncRange, SyncReplica, SyncSource,
};
use livesql_core::{ClientSocket, Column, JoinGraph, Schema, TableInfo};

/// Converts a JSON object literal into a row.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// items(id, name, qty, owner_id -> users.id) and users(id, email).
pub fn schema() -> Schema {
    Schema::from_tables([
        TableInfo::new("items")
            .column(Column::new("id", "int4").pkey().with_default())
            .column(Column::new("name", "text"))
            .column(Column::new("qty", "int4"))
            .column(Column::new("owner_id", "int4").references("users", "id"))
            .column(Column::new("synced", "int8")),
        TableInfo::new("users")
            .column(Column::new("id", "int4").pkey())
            .column(Column::new("email", "text")),
    ])
}

/// Join graph of [`schema`].
pub fn joins() -> JoinGraph {
    JoinGraph::from_foreign_keys(&schema())
}

// ============================================================================
// Database
// ============================================================================

#[derive(Default)]
struct MockState {
    log: Mutex<Vec<(String, Vec<Value>)>>,
    answers: Mutex<Vec<(String, Vec<Row>)>>,
    failures: Mutex<Vec<String>>,
    next_trigger_id: AtomicI64,
}

/// Records every statement and answers queries from canned rows.
///
/// Transactions share the log with the client that opened them, so the log
/// reads `BEGIN`, the statements, then `COMMIT` or `ROLLBACK`.
#[derive(Clone, Default)]
pub struct MockDb {
    state: Arc<MockState>,
}

impl MockDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries whose SQL contains `needle` return `rows`. Earlier
    /// registrations win.
    pub fn answer(&self, needle: &str, rows: Vec<Row>) {
        self.state.answers.lock().push((needle.to_string(), rows));
    }

    /// Statements whose SQL contains `needle` fail.
    pub fn fail_on(&self, needle: &str) {
        self.state.failures.lock().push(needle.to_string());
    }

    /// Every statement seen so far.
    pub fn statements(&self) -> Vec<String> {
        self.state.log.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    /// Parameters of every statement seen so far.
    pub fn params(&self) -> Vec<Vec<Value>> {
        self.state.log.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Number of statements containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.statements().iter().filter(|s| s.contains(needle)).count()
    }

    pub fn clear(&self) {
        self.state.log.lock().clear();
    }

    fn record(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.state.log.lock().push((sql.to_string(), params.to_vec()));
        if self.state.failures.lock().iter().any(|n| sql.contains(n.as_str())) {
            return Err(DbErrorInfo::new("forced failure").with_code("XX000").into());
        }
        Ok(())
    }
}

#[async_trait]
impl DbClient for MockDb {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql, params)?;
        if sql.contains("INSERT INTO livesql.app_triggers") {
            let id = self.state.next_trigger_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
            return Ok(vec![row(json!({ "id": id }))]);
        }
        if sql.contains("AS stale") {
            return Ok(vec![row(json!({ "stale": false }))]);
        }
        let answers = self.state.answers.lock();
        Ok(answers
            .iter()
            .find(|(needle, _)| sql.contains(needle.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.record(sql, params)?;
        Ok(1)
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.record(sql, &[])
    }

    async fn begin(&self) -> Result<Arc<dyn DbTransaction>> {
        self.record("BEGIN", &[])?;
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl DbTransaction for MockDb {
    async fn commit(&self) -> Result<()> {
        self.record("COMMIT", &[])
    }

    async fn rollback(&self) -> Result<()> {
        self.record("ROLLBACK", &[])
    }

    fn as_client(self: Arc<Self>) -> Arc<dyn DbClient> {
        self
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Notification source fed by the test.
#[derive(Default)]
pub struct ChannelSource {
    sender: Mutex<Option<(String, mpsc::UnboundedSender<Notification>)>>,
}

impl ChannelSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `payload` on the listened channel.
    pub fn send(&self, payload: &str) {
        let guard = self.sender.lock();
        let (channel, sender) = guard.as_ref().expect("nobody is listening");
        sender
            .send(Notification {
                channel: channel.clone(),
                payload: payload.to_string(),
            })
            .expect("listener dropped");
    }

    pub fn channel(&self) -> Option<String> {
        self.sender.lock().as_ref().map(|(c, _)| c.clone())
    }
}

#[async_trait]
impl NotificationSource for ChannelSource {
    async fn listen(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<Notification>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some((channel.to_string(), tx));
        Ok(rx)
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Socket whose emits land in a channel; requests are unanswered.
pub struct MockSocket {
    id: String,
    emitted: mpsc::UnboundedSender<(String, Value)>,
}

impl MockSocket {
    pub fn new(id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: id.to_string(),
                emitted: tx,
            }),
            rx,
        )
    }
}

#[async_trait]
impl ClientSocket for MockSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, channel: &str, payload: Value) {
        let _ = self.emitted.send((channel.to_string(), payload));
    }

    async fn request(&self, channel: &str, payload: Value) -> Result<Value> {
        let _ = self.emitted.send((channel.to_string(), payload));
        Ok(Value::Null)
    }
}

// ============================================================================
// Sync sides
// ============================================================================

/// Version-ordered rows held in memory; usable as either sync side.
pub struct MemorySide {
    params: SyncParams,
    rows: Mutex<Vec<Row>>,
}

impl MemorySide {
    pub fn new(params: &SyncParams, rows: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            params: params.clone(),
            rows: Mutex::new(rows.into_iter().map(row).collect()),
        })
    }

    /// Rows sorted by identity, for comparing two sides.
    pub fn snapshot(&self) -> Vec<Row> {
        let mut rows = self.rows.lock().clone();
        rows.sort_by_key(|r| self.params.row_key(r));
        rows
    }

    pub fn get(&self, id: i64) -> Option<Row> {
        self.rows
            .lock()
            .iter()
            .find(|r| r.get("id") == Some(&json!(id)))
            .cloned()
    }

    pub fn insert(&self, value: Value) {
        self.upsert(row(value));
    }

    fn ordered(&self, from: Option<&Value>) -> Vec<Row> {
        let mut rows: Vec<Row> = self
            .rows
            .lock()
            .iter()
            .filter(|r| match from {
                Some(from) => compare_synced(self.params.synced(r), Some(from)) != Ordering::Less,
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            compare_synced(self.params.synced(a), self.params.synced(b))
                .then_with(|| self.params.row_key(a).cmp(&self.params.row_key(b)))
        });
        rows
    }

    fn range(&self, range: &SyncRange) -> Vec<Row> {
        self.ordered(range.from_synced.as_ref())
            .into_iter()
            .skip(usize::try_from(range.offset).unwrap_or(usize::MAX))
            .take(range.limit)
            .collect()
    }

    fn describe(&self, from: Option<&Value>, end_offset: Option<u64>) -> SyncInfo {
        let rows = self.ordered(from);
        let last = match end_offset {
            Some(offset) => rows.get(usize::try_from(offset).unwrap_or(usize::MAX)).cloned(),
            None => rows.last().cloned(),
        };
        SyncInfo {
            first: rows.first().cloned(),
            last,
            count: rows.len() as u64,
        }
    }

    fn upsert(&self, incoming: Row) {
        let key = self.params.row_key(&incoming);
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| self.params.row_key(r) == key) {
            Some(existing) => {
                if compare_synced(self.params.synced(&incoming), self.params.synced(existing))
                    == Ordering::Greater
                {
                    *existing = incoming;
                }
            }
            None => rows.push(incoming),
        }
    }
}

#[async_trait]
impl SyncSource for MemorySide {
    async fn info(&self, from_synced: Option<&Value>, end_offset: Option<u64>) -> Result<SyncInfo> {
        Ok(self.describe(from_synced, end_offset))
    }

    async fn fetch(&self, range: &SyncRange) -> Result<Vec<Row>> {
        Ok(self.range(range))
    }

    async fn fetch_by_ids(&self, ids: &[Row]) -> Result<Vec<Row>> {
        let keys: Vec<String> = ids.iter().map(|r| self.params.row_key(r)).collect();
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| keys.contains(&self.params.row_key(r)))
            .cloned()
            .collect())
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        let deleted: Vec<String> = changes.deletes.iter().map(|r| self.params.row_key(r)).collect();
        self.rows
            .lock()
            .retain(|r| !deleted.contains(&self.params.row_key(r)));
        for incoming in changes.inserts.into_iter().chain(changes.updates) {
            self.upsert(incoming);
        }
        Ok(())
    }
}

#[async_trait]
impl SyncReplica for MemorySide {
    async fn info(&self, from_synced: Option<&Value>, end_offset: Option<u64>) -> Result<SyncInfo> {
        Ok(self.describe(from_synced, end_offset))
    }

    async fn pull(&self, range: &SyncRange) -> Result<Vec<Row>> {
        Ok(self.range(range))
    }

    async fn push(&self, rows: Vec<Row>) -> Result<()> {
        for incoming in rows {
            self.upsert(incoming);
        }
        Ok(())
    }
}

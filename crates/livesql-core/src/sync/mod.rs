//! Two-way sync between a table and a client replica.
//!
//! Rows are identified by the rule's `id_fields` and versioned by its
//! `synced_field`. A pass:
//!
//! 1. finds the watermark, the newest synced value both sides agree on
//!    ([`find_watermark`]),
//! 2. pulls the client's rows from the watermark in batches and writes the
//!    ones the server lacks or holds an older version of,
//! 3. pages through the server's rows from the watermark and pushes those
//!    the client lacks or holds an older version of.
//!
//! Client rows flagged `"$deleted": true` delete the server row only when
//! the rule allows deletes; otherwise they are ignored.

mod session;
mod socket;
mod wal;
mod watermark;

pub use session::{SessionTiming, SyncOutcome, SyncSession};
pub use socket::SocketReplica;
pub use wal::WriteAheadBuffer;
pub use watermark::find_watermark;

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::Row;
use crate::error::{Error, Result};

/// Marker of a client-side deletion.
pub const DELETED_FLAG: &str = "$deleted";

/// Sync parameters of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    /// Columns identifying a row.
    pub id_fields: Vec<String>,
    /// Column holding the row version.
    pub synced_field: String,
    /// Whether client deletions are applied.
    pub allow_delete: bool,
    /// Rows per batch.
    pub batch_size: usize,
}

impl SyncParams {
    /// Checks that the parameters can identify and order rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] on empty id fields, an empty synced
    /// field or a zero batch size.
    pub fn validate(&self) -> Result<()> {
        if self.id_fields.is_empty() {
            return Err(Error::Validation("sync requires at least one id field".into()));
        }
        if self.synced_field.is_empty() {
            return Err(Error::Validation("sync requires a synced field".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Validation("sync batch size must be positive".into()));
        }
        Ok(())
    }

    /// Stable identity key of a row.
    #[must_use]
    pub fn row_key(&self, row: &Row) -> String {
        let parts: Vec<Value> = self
            .id_fields
            .iter()
            .map(|f| row.get(f).cloned().unwrap_or(Value::Null))
            .collect();
        Value::Array(parts).to_string()
    }

    /// Version of a row.
    #[must_use]
    pub fn synced<'r>(&self, row: &'r Row) -> Option<&'r Value> {
        row.get(&self.synced_field).filter(|v| !v.is_null())
    }

    /// Identity columns of a row.
    #[must_use]
    pub fn ids_of(&self, row: &Row) -> Row {
        self.id_fields
            .iter()
            .map(|f| (f.clone(), row.get(f).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    /// Whether both rows are the same version of the same row.
    #[must_use]
    pub fn same_version(&self, a: &Row, b: &Row) -> bool {
        self.row_key(a) == self.row_key(b)
            && compare_synced(self.synced(a), self.synced(b)) == Ordering::Equal
    }
}

/// First row, last row and count of one side, from a starting version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    /// Oldest row.
    pub first: Option<Row>,
    /// Newest row, or the row at the requested end offset.
    pub last: Option<Row>,
    /// Rows from the starting version.
    pub count: u64,
}

/// What to read from one side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRange {
    /// Only rows with a version at or after this one.
    pub from_synced: Option<Value>,
    /// Rows skipped, in version order.
    pub offset: u64,
    /// Row cap.
    pub limit: usize,
}

/// Writes to apply to the server in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Rows the server lacks.
    pub inserts: Vec<Row>,
    /// Newer versions of server rows.
    pub updates: Vec<Row>,
    /// Identity columns of rows to delete.
    pub deletes: Vec<Row>,
}

impl ChangeSet {
    /// Whether there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Server side of a sync session.
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// First/last/count from `from_synced`; with `end_offset`, `last` is the
    /// row at that offset.
    async fn info(&self, from_synced: Option<&Value>, end_offset: Option<u64>) -> Result<SyncInfo>;

    /// Rows in version order.
    async fn fetch(&self, range: &SyncRange) -> Result<Vec<Row>>;

    /// Current server versions of the given identities.
    async fn fetch_by_ids(&self, ids: &[Row]) -> Result<Vec<Row>>;

    /// Applies a change set atomically.
    async fn apply(&self, changes: ChangeSet) -> Result<()>;
}

/// Client side of a sync session.
#[async_trait]
pub trait SyncReplica: Send + Sync {
    /// Same contract as [`SyncSource::info`].
    async fn info(&self, from_synced: Option<&Value>, end_offset: Option<u64>) -> Result<SyncInfo>;

    /// Client rows in version order.
    async fn pull(&self, range: &SyncRange) -> Result<Vec<Row>>;

    /// Sends server rows; the replica keeps the newer version per row.
    async fn push(&self, rows: Vec<Row>) -> Result<()>;
}

/// Orders two versions: numbers numerically, then timestamps, then text.
/// A missing version is older than any other.
#[must_use]
pub fn compare_synced(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            if let (Some(x), Some(y)) = (as_timestamp(a), as_timestamp(b)) {
                return x.cmp(&y);
            }
            as_text(a).cmp(&as_text(b))
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_timestamp(value: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    let text = value.as_str()?;
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&chrono::Utc));
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The older of two versions.
#[must_use]
pub fn min_synced(a: Option<&Value>, b: Option<&Value>) -> Option<Value> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if compare_synced(Some(a), Some(b)) == Ordering::Greater {
            b.clone()
        } else {
            a.clone()
        }),
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (None, None) => None,
    }
}

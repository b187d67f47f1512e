//! Database client seam.
//!
//! The query engine only needs four operations from the database; they are
//! expressed as async traits so the engine runs against PostgreSQL through
//! `sqlx` (feature `postgres`) or against an in-memory double in
//! tests.

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::PgDatabase;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::Result;

/// A result row, keyed by output column name.
pub type Row = Map<String, Value>;

/// Minimal async database client.
///
/// Parameters are referenced in SQL as `$n::text::<type>`; every value is
/// sent as text (see [`crate::sql::param_text`]).
#[async_trait]
pub trait DbClient: Send + Sync {
    /// Runs a row-returning statement.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Runs a statement and returns the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Runs one or more parameterless statements.
    async fn batch_execute(&self, sql: &str) -> Result<()>;

    /// Opens a transaction.
    async fn begin(&self) -> Result<Arc<dyn DbTransaction>>;
}

/// An open transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait DbTransaction: DbClient {
    /// Commits the transaction.
    async fn commit(&self) -> Result<()>;

    /// Rolls the transaction back.
    async fn rollback(&self) -> Result<()>;

    /// Views the transaction as a plain client.
    fn as_client(self: Arc<Self>) -> Arc<dyn DbClient>;
}

/// A raw `NOTIFY` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was sent on.
    pub channel: String,
    /// Payload text.
    pub payload: String,
}

/// Source of `LISTEN` notifications.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Starts listening on `channel`. The receiver closes when the
    /// underlying connection is lost.
    async fn listen(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<Notification>>;
}

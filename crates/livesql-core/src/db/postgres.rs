//! `sqlx` PostgreSQL backend.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgDatabaseError, PgListener, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Executor, PgPool, Postgres, Row as _, Transaction};
use tokio::sync::{mpsc, Mutex};

use super::{DbClient, DbTransaction, Notification, NotificationSource, Row};
use crate::error::{DbErrorInfo, Error, Result};
use crate::sql::param_text;

/// Pool size of one [`PgDatabase`]; `LISTEN` takes one extra connection.
const MAX_CONNECTIONS: u32 = 10;

/// PostgreSQL database reached through a `sqlx` pool.
///
/// Plain statements run on any pooled connection. A transaction holds one
/// connection until it is committed or rolled back.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Connects to `url`, reporting `application_name` to the server.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a malformed URL and [`Error::Database`]
    /// if no connection can be established.
    pub async fn connect(url: &str, application_name: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| Error::Config(format!("invalid database url: {e}")))?
            .application_name(application_name);
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;
        tracing::info!(application_name, "connected to postgres");
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_sqlx_error(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) => {
            let pg = db.try_downcast_ref::<PgDatabaseError>();
            Error::Database(DbErrorInfo {
                code: db.code().map(|c| c.to_string()),
                message: db.message().to_string(),
                column: pg.and_then(PgDatabaseError::column).map(str::to_string),
                table: db.table().map(str::to_string),
                constraint: db.constraint().map(str::to_string),
                detail: pg.and_then(PgDatabaseError::detail).map(str::to_string),
            })
        }
        _ => Error::Database(DbErrorInfo::new(e.to_string())),
    }
}

// Every parameter travels as text and is cast in SQL (`$n::text::type`).
fn bind<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| query.bind(param_text(value)))
}

fn wrap_rows(sql: &str) -> String {
    format!(
        "WITH lsq_res AS (\n{}\n)\nSELECT row_to_json(lsq_res)::text FROM lsq_res",
        sql.trim_end().trim_end_matches(';')
    )
}

fn decode_rows(rows: &[sqlx::postgres::PgRow]) -> Result<Vec<Row>> {
    rows.iter()
        .map(|row| {
            let text: String = row.try_get(0).map_err(map_sqlx_error)?;
            Ok(serde_json::from_str::<Row>(&text)?)
        })
        .collect()
}

#[async_trait]
impl DbClient for PgDatabase {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let wrapped = wrap_rows(sql);
        let rows = bind(&wrapped, params)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        decode_rows(&rows)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let done = bind(sql, params)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(done.rows_affected())
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.pool.execute(sql).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Arc<dyn DbTransaction>> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Arc::new(PgTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

#[async_trait]
impl NotificationSource for PgDatabase {
    async fn listen(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<Notification>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        listener.listen(channel).await.map_err(map_sqlx_error)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(n)) => {
                        let forwarded = Notification {
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if tx.send(forwarded).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        tracing::warn!(channel = %channel_name, "listen connection lost");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(channel = %channel_name, error = %e, "listen connection failed");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// One open transaction; `None` once finished.
struct PgTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn finished() -> Error {
    Error::Closed("transaction already finished".into())
}

#[async_trait]
impl DbClient for PgTransaction {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let wrapped = wrap_rows(sql);
        let rows = bind(&wrapped, params)
            .fetch_all(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        decode_rows(&rows)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let done = bind(sql, params)
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(done.rows_affected())
    }

    async fn batch_execute(&self, sql: &str) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        (&mut **tx).execute(sql).await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Arc<dyn DbTransaction>> {
        Err(Error::Internal("nested transactions are not supported".into()))
    }
}

#[async_trait]
impl DbTransaction for PgTransaction {
    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&self) -> Result<()> {
        match self.tx.lock().await.take() {
            Some(tx) => tx.rollback().await.map_err(map_sqlx_error),
            None => Ok(()),
        }
    }

    fn as_client(self: Arc<Self>) -> Arc<dyn DbClient> {
        self
    }
}

//! Trigger catalog.
//!
//! The catalog lives in the `livesql` schema and is shared by every app
//! instance connected to the database:
//!
//! - `apps`: one row per instance, refreshed by the heartbeat,
//! - `app_triggers`: one row per (app, table, condition),
//! - `table_trigger_fn()`: the statement trigger installed on watched
//!   tables; it evaluates each registered condition against the transition
//!   tables and notifies every app with a match,
//! - `sync_table_triggers()`: keeps the per-table triggers in line with the
//!   catalog rows after each catalog change.
//!
//! Writes to `app_triggers` go through [`with_catalog_lock`], which takes an
//! exclusive table lock with a bounded `lock_timeout` and retries with
//! backoff on contention.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use super::notification::DELIMITER;
use crate::config::PubSubConfig;
use crate::db::{DbClient, DbTransaction};
use crate::error::{Error, Result};
use crate::sql::quote_str;

// Serializes concurrent catalog installs across instances.
const INSTALL_LOCK_KEY: i64 = 0x6c69_7665_7371_6c;

/// DDL installing the catalog. `schema` is the schema of watched tables and
/// `channel_prefix` prefixes each app's LISTEN channel.
///
/// # Errors
///
/// Returns [`Error::Validation`] if either name cannot be quoted.
pub fn install_sql(schema: &str, channel_prefix: &str) -> Result<String> {
    let schema = quote_str(schema)?;
    let prefix = quote_str(channel_prefix)?;
    let delimiter = quote_str(DELIMITER)?;
    Ok(format!(
        r#"SELECT pg_advisory_xact_lock({INSTALL_LOCK_KEY});

CREATE SCHEMA IF NOT EXISTS livesql;

CREATE TABLE IF NOT EXISTS livesql.apps (
  id TEXT PRIMARY KEY,
  added TIMESTAMPTZ NOT NULL DEFAULT now(),
  application_name TEXT,
  last_check TIMESTAMPTZ NOT NULL DEFAULT now(),
  check_frequency_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS livesql.app_triggers (
  id BIGSERIAL PRIMARY KEY,
  app_id TEXT NOT NULL REFERENCES livesql.apps (id) ON DELETE CASCADE,
  table_name TEXT NOT NULL,
  condition TEXT NOT NULL,
  related_view_name TEXT,
  inserted TIMESTAMPTZ NOT NULL DEFAULT now(),
  last_used TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS app_triggers_key
  ON livesql.app_triggers (app_id, table_name, md5(condition));

CREATE OR REPLACE FUNCTION livesql.table_trigger_fn() RETURNS TRIGGER AS $fn$
DECLARE
  app RECORD;
  trg RECORD;
  matched TEXT[];
  found BOOLEAN;
  source_sql TEXT;
BEGIN
  IF TG_OP = 'INSERT' THEN
    source_sql := 'SELECT * FROM lsq_new';
  ELSIF TG_OP = 'DELETE' THEN
    source_sql := 'SELECT * FROM lsq_old';
  ELSE
    source_sql := 'SELECT * FROM lsq_new UNION ALL SELECT * FROM lsq_old';
  END IF;

  FOR app IN
    SELECT DISTINCT app_id FROM livesql.app_triggers WHERE table_name = TG_TABLE_NAME
  LOOP
    matched := ARRAY[]::TEXT[];
    BEGIN
      FOR trg IN
        SELECT id, condition FROM livesql.app_triggers
        WHERE app_id = app.app_id AND table_name = TG_TABLE_NAME
        ORDER BY id
      LOOP
        EXECUTE format(
          'SELECT EXISTS (SELECT 1 FROM (%s) AS %I WHERE %s)',
          source_sql, TG_TABLE_NAME, trg.condition
        ) INTO found;
        IF found THEN
          matched := array_append(matched, trg.id::TEXT);
        END IF;
      END LOOP;
      IF cardinality(matched) > 0 THEN
        PERFORM pg_notify(
          {prefix} || app.app_id,
          concat_ws({delimiter}, 'data_has_changed', TG_TABLE_NAME, TG_OP, array_to_string(matched, ','))
        );
      END IF;
    EXCEPTION WHEN OTHERS THEN
      PERFORM pg_notify(
        {prefix} || app.app_id,
        concat_ws({delimiter}, 'error', TG_TABLE_NAME, TG_OP, SQLERRM)
      );
    END;
  END LOOP;
  RETURN NULL;
END;
$fn$ LANGUAGE plpgsql;

CREATE OR REPLACE FUNCTION livesql.sync_table_triggers() RETURNS TRIGGER AS $fn$
DECLARE
  t RECORD;
BEGIN
  FOR t IN
    SELECT DISTINCT a.table_name
    FROM livesql.app_triggers a
    WHERE to_regclass(format('%I.%I', {schema}, a.table_name)) IS NOT NULL
      AND NOT EXISTS (
        SELECT 1 FROM pg_trigger g
        WHERE g.tgname = 'livesql_trg_insert'
          AND g.tgrelid = to_regclass(format('%I.%I', {schema}, a.table_name))
      )
  LOOP
    EXECUTE format(
      'CREATE TRIGGER livesql_trg_insert AFTER INSERT ON %I.%I REFERENCING NEW TABLE AS lsq_new FOR EACH STATEMENT EXECUTE PROCEDURE livesql.table_trigger_fn()',
      {schema}, t.table_name
    );
    EXECUTE format(
      'CREATE TRIGGER livesql_trg_update AFTER UPDATE ON %I.%I REFERENCING OLD TABLE AS lsq_old NEW TABLE AS lsq_new FOR EACH STATEMENT EXECUTE PROCEDURE livesql.table_trigger_fn()',
      {schema}, t.table_name
    );
    EXECUTE format(
      'CREATE TRIGGER livesql_trg_delete AFTER DELETE ON %I.%I REFERENCING OLD TABLE AS lsq_old FOR EACH STATEMENT EXECUTE PROCEDURE livesql.table_trigger_fn()',
      {schema}, t.table_name
    );
  END LOOP;

  FOR t IN
    SELECT c.relname AS table_name
    FROM pg_trigger g
    JOIN pg_class c ON c.oid = g.tgrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE g.tgname = 'livesql_trg_insert'
      AND n.nspname = {schema}
      AND c.relname NOT IN (SELECT table_name FROM livesql.app_triggers)
  LOOP
    EXECUTE format('DROP TRIGGER IF EXISTS livesql_trg_insert ON %I.%I', {schema}, t.table_name);
    EXECUTE format('DROP TRIGGER IF EXISTS livesql_trg_update ON %I.%I', {schema}, t.table_name);
    EXECUTE format('DROP TRIGGER IF EXISTS livesql_trg_delete ON %I.%I', {schema}, t.table_name);
  END LOOP;
  RETURN NULL;
END;
$fn$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS livesql_catalog_sync ON livesql.app_triggers;
CREATE TRIGGER livesql_catalog_sync
  AFTER INSERT OR DELETE ON livesql.app_triggers
  FOR EACH STATEMENT EXECUTE PROCEDURE livesql.sync_table_triggers();
"#
    ))
}

/// Registers (or refreshes) an app instance row.
pub(crate) const REGISTER_APP_SQL: &str = "INSERT INTO livesql.apps (id, application_name, check_frequency_ms)
VALUES ($1::text::text, $2::text::text, $3::text::int4)
ON CONFLICT (id) DO UPDATE SET last_check = now(), check_frequency_ms = EXCLUDED.check_frequency_ms";

/// Heartbeat of an app instance. Zero affected rows means the instance was
/// pruned by another process.
pub(crate) const HEARTBEAT_SQL: &str =
    "UPDATE livesql.apps SET last_check = now() WHERE id = $1::text::text";

/// Refreshes `last_used` of the triggers still referenced locally.
pub(crate) const TOUCH_TRIGGERS_SQL: &str = "UPDATE livesql.app_triggers SET last_used = now()
WHERE app_id = $1::text::text AND id = ANY($2::text::int8[])";

/// Inserts a trigger row, or refreshes an existing one, returning its id.
pub(crate) const UPSERT_TRIGGER_SQL: &str = "INSERT INTO livesql.app_triggers (app_id, table_name, condition, related_view_name)
VALUES ($1::text::text, $2::text::text, $3::text::text, $4::text::text)
ON CONFLICT (app_id, table_name, md5(condition)) DO UPDATE SET last_used = now()
RETURNING id";

/// Drops every trigger row of an app.
pub(crate) const WIPE_APP_SQL: &str = "DELETE FROM livesql.app_triggers WHERE app_id = $1::text::text";

/// Drops trigger rows of an app that lost their last local reference.
pub(crate) const DROP_TRIGGERS_SQL: &str =
    "DELETE FROM livesql.app_triggers WHERE app_id = $1::text::text AND id = ANY($2::text::int8[])";

/// Whether anything is old enough to prune.
pub(crate) const STALE_CHECK_SQL: &str = "SELECT (
  EXISTS (SELECT 1 FROM livesql.apps WHERE last_check < now() - $1::text::int8 * interval '1 millisecond')
  OR EXISTS (SELECT 1 FROM livesql.app_triggers WHERE last_used < now() - $1::text::int8 * interval '1 millisecond')
) AS stale";

/// Removes dead app instances (their triggers cascade) and unused triggers.
pub(crate) const PRUNE_APPS_SQL: &str =
    "DELETE FROM livesql.apps WHERE last_check < now() - $1::text::int8 * interval '1 millisecond'";

/// Removes triggers not refreshed by their app.
pub(crate) const PRUNE_TRIGGERS_SQL: &str = "DELETE FROM livesql.app_triggers WHERE last_used < now() - $1::text::int8 * interval '1 millisecond'";

/// Runs `op` inside a transaction holding an exclusive lock on
/// `livesql.app_triggers`.
///
/// Lock timeouts (`55P03`) are retried `catalog_lock_retries` times with a
/// doubling backoff; other errors abort immediately.
///
/// # Errors
///
/// Returns [`Error::Internal`] once the retries are exhausted, or the first
/// non-lock error raised by `op`.
pub async fn with_catalog_lock<T, F>(
    db: &dyn DbClient,
    config: &PubSubConfig,
    mut op: F,
) -> Result<T>
where
    T: Send,
    F: FnMut(Arc<dyn DbTransaction>) -> BoxFuture<'static, Result<T>>,
{
    let mut backoff = Duration::from_millis(config.catalog_retry_backoff_ms);
    let attempts = config.catalog_lock_retries.max(1);
    let lock_sql = format!(
        "SET LOCAL lock_timeout = '{}ms';\nLOCK TABLE livesql.app_triggers IN ACCESS EXCLUSIVE MODE;",
        config.catalog_lock_timeout_ms
    );

    for attempt in 1..=attempts {
        let tx = db.begin().await?;
        let outcome = match tx.batch_execute(&lock_sql).await {
            Ok(()) => op(Arc::clone(&tx)).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(value) => {
                tx.commit().await?;
                return Ok(value);
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "trigger catalog rollback failed");
                }
                if !is_lock_timeout(&e) {
                    return Err(e);
                }
                tracing::warn!(attempt, attempts, "trigger catalog is locked, retrying");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }
    Err(Error::Internal(format!(
        "could not lock the trigger catalog after {attempts} attempts"
    )))
}

fn is_lock_timeout(error: &Error) -> bool {
    matches!(error.root(), Error::Database(info) if info.code.as_deref() == Some("55P03"))
}

/// Reads the `id` column of an upsert result.
pub(crate) fn returned_id(rows: &[crate::db::Row]) -> Result<i64> {
    rows.first()
        .and_then(|r| r.get("id"))
        .and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| Error::Internal("trigger upsert returned no id".into()))
}

//! Insert, update, delete and upsert.
//!
//! Payloads are checked against the rule's field allow-list, merged with
//! forced data and passed through the rule's `validate` hook before a
//! statement is built. A `pre_validate` hook sees the raw payload first.
//! Values are bound as `$n::text::<type>` parameters.
//! When a `post_validate` hook is configured the statement runs inside a
//! transaction and every affected row is handed to the hook before commit.

mod delete;
mod insert;
mod update;

pub use delete::delete;
pub use insert::insert;
pub use update::{update, upsert};

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::db::{DbClient, DbTransaction, Row};
use crate::error::{Error, Result};
use crate::query::QueryContext;
use crate::rules::{FieldFilter, Permit, PostValidateHook, RowHook, SyncRule};
use crate::schema::{Column, TableInfo, UdtType};
use crate::select::{parse_user_select, SelectEnv, SelectItem};
use crate::sql::{pg_array_literal, quote_ident};

/// Column holding the full affected row for `post_validate` hooks.
const FULL_ROW: &str = "lsq_full";

/// Options of `insert`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsertParams {
    /// Projection of the returned rows; nothing is returned when absent.
    pub returning: Option<Value>,
    /// Adds `ON CONFLICT DO NOTHING`.
    pub on_conflict_do_nothing: bool,
    /// Drops unknown and disallowed keys instead of failing.
    pub fix_issues: bool,
}

/// Options of `update`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateParams {
    /// Projection of the returned rows; nothing is returned when absent.
    pub returning: Option<Value>,
    /// When false the update fails if more than one row matches.
    pub multi: bool,
    /// Swallows unique violations.
    pub on_conflict_do_nothing: bool,
    /// Drops unknown and disallowed keys instead of failing.
    pub fix_issues: bool,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            returning: None,
            multi: true,
            on_conflict_do_nothing: false,
            fix_issues: false,
        }
    }
}

/// Options of `delete`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteParams {
    /// Projection of the returned rows; nothing is returned when absent.
    pub returning: Option<Value>,
}

/// Outcome of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationResult {
    /// No RETURNING requested, or nothing affected by a single-row call.
    None,
    /// Single-row call.
    One(Row),
    /// Multi-row call.
    Many(Vec<Row>),
}

impl MutationResult {
    /// JSON shape: null, an object or an array.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::One(row) => Value::Object(row),
            Self::Many(rows) => Value::Array(rows.into_iter().map(Value::Object).collect()),
        }
    }

    /// Rows, whatever the shape.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::None => Vec::new(),
            Self::One(row) => vec![row],
            Self::Many(rows) => rows,
        }
    }
}

/// A statement and its bind parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statement {
    /// SQL text with `$n` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<Value>,
}

impl Statement {
    /// Binds `value` for `column` and returns its placeholder.
    fn bind(&mut self, column: &Column, value: &Value) -> Result<String> {
        let bound = match (column.udt, value) {
            (_, Value::Null) => Value::Null,
            (UdtType::Json, v) => Value::String(v.to_string()),
            (UdtType::Array, Value::Array(items)) => Value::String(pg_array_literal(items)?),
            (_, v) => v.clone(),
        };
        self.params.push(bound);
        Ok(format!("${}::text::{}", self.params.len(), column.cast_type))
    }
}

/// Everything a mutation needs.
#[derive(Clone, Copy)]
pub struct MutationContext<'a> {
    /// Schema, joins, access and limits.
    pub query: QueryContext<'a>,
    /// Client the statements run on.
    pub db: &'a dyn DbClient,
    /// Enclosing transaction, when the caller already runs in one.
    pub tx: Option<&'a Arc<dyn DbTransaction>>,
}

impl std::fmt::Debug for MutationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationContext")
            .field("query", &self.query)
            .field("in_transaction", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}

fn resolve_fields(filter: Option<&FieldFilter>, table: &TableInfo) -> Result<Vec<String>> {
    match filter {
        Some(f) => f.resolve(table),
        None => Ok(table.column_names().map(str::to_string).collect()),
    }
}

/// Validation hooks of one mutation rule.
#[derive(Clone, Copy, Default)]
pub(crate) struct RowHooks<'a> {
    /// Sees the payload exactly as the client sent it.
    pub pre_validate: Option<&'a RowHook>,
    /// Sees the checked row with forced data merged.
    pub validate: Option<&'a RowHook>,
}

/// Runs the pre-validate hook on the raw payload, checks the result against
/// `allowed`, merges `forced` and runs the validate hook.
pub(crate) async fn prepare_row(
    table: &TableInfo,
    data: &Row,
    allowed: &[String],
    forced: Option<&Row>,
    fix_issues: bool,
    hooks: RowHooks<'_>,
) -> Result<Row> {
    let pre_validated;
    let data = match hooks.pre_validate {
        Some(hook) => {
            pre_validated = hook(data.clone()).await?;
            &pre_validated
        }
        None => data,
    };
    let mut row = Row::new();
    for (key, value) in data {
        if !table.has_column(key) {
            if fix_issues {
                tracing::debug!(table = %table.name, field = %key, "dropping unknown field");
                continue;
            }
            return Err(Error::Validation(format!(
                "column '{key}' does not exist in table '{}'",
                table.name
            )));
        }
        if !allowed.iter().any(|a| a == key) {
            if fix_issues {
                tracing::debug!(table = %table.name, field = %key, "dropping disallowed field");
                continue;
            }
            return Err(Error::Forbidden(format!(
                "field '{key}' of table '{}' cannot be written",
                table.name
            )));
        }
        row.insert(key.clone(), value.clone());
    }
    if let Some(forced) = forced {
        for (key, value) in forced {
            row.insert(key.clone(), value.clone());
        }
    }
    let row = match hooks.validate {
        Some(hook) => hook(row).await?,
        None => row,
    };
    if let Some(unknown) = row.keys().find(|k| !table.has_column(k)) {
        return Err(Error::Validation(format!(
            "validated row has unknown column '{unknown}' for table '{}'",
            table.name
        )));
    }
    Ok(row)
}

/// Sets the sync rule's `synced_field` to the current time when absent.
pub(crate) fn stamp_synced(row: &mut Row, table: &TableInfo, sync: Option<&SyncRule>) {
    let Some(field) = sync.map(|s| s.synced_field.as_str()).filter(|f| !f.is_empty()) else {
        return;
    };
    if row.contains_key(field) {
        return;
    }
    let now = chrono::Utc::now();
    let value = match table.get_column(field).map(|c| c.udt) {
        Some(UdtType::Number) => Value::from(now.timestamp_millis()),
        Some(UdtType::Date) => Value::String(now.to_rfc3339()),
        _ => return,
    };
    row.insert(field.to_string(), value);
}

/// Compiles a RETURNING projection.
pub(crate) fn returning_items(
    table: &TableInfo,
    query: QueryContext<'_>,
    permit: &Permit,
    returning_fields: Option<&FieldFilter>,
    returning: Option<&Value>,
) -> Result<Vec<SelectItem>> {
    let Some(returning) = returning else {
        return Ok(Vec::new());
    };
    let allowed = match returning_fields {
        Some(fields) => fields.resolve(table)?,
        None => permit.select_fields(table)?,
    };
    let env = SelectEnv {
        table,
        allowed: &allowed,
        schema: query.schema,
        allow_joins: false,
    };
    let parsed = parse_user_select(returning, &env)?;
    if parsed.items.iter().any(SelectItem::is_aggregate) {
        return Err(Error::Validation("aggregates are not allowed in returning".into()));
    }
    Ok(parsed.items)
}

/// `RETURNING ...` clause, empty when nothing is returned.
pub(crate) fn returning_clause(table: &TableInfo, items: &[SelectItem], full_row: bool) -> String {
    let mut parts: Vec<String> = items.iter().map(|i| i.sql_as(None)).collect();
    if full_row {
        parts.push(format!(
            "row_to_json({}.*) AS {}",
            quote_ident(&table.name),
            quote_ident(FULL_ROW)
        ));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("\nRETURNING {}", parts.join(", "))
    }
}

/// Runs a mutation statement. With a `post_validate` hook the statement
/// runs in a transaction and each full row is validated before commit.
pub(crate) async fn run_statement(
    ctx: MutationContext<'_>,
    statement: &Statement,
    returns_rows: bool,
    post_validate: Option<&PostValidateHook>,
) -> Result<Vec<Row>> {
    let Some(hook) = post_validate else {
        if returns_rows {
            return ctx.db.query(&statement.sql, &statement.params).await;
        }
        ctx.db.execute(&statement.sql, &statement.params).await?;
        return Ok(Vec::new());
    };

    let (tx, owned) = match ctx.tx {
        Some(tx) => (Arc::clone(tx), false),
        None => (ctx.db.begin().await?, true),
    };
    let outcome = validate_in(&tx, statement, hook).await;
    match outcome {
        Ok(rows) => {
            if owned {
                tx.commit().await?;
            }
            Ok(rows)
        }
        Err(e) => {
            if owned {
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(error = %rollback, "rollback after failed post validation");
                }
            }
            Err(e)
        }
    }
}

async fn validate_in(
    tx: &Arc<dyn DbTransaction>,
    statement: &Statement,
    hook: &PostValidateHook,
) -> Result<Vec<Row>> {
    let rows = tx.query(&statement.sql, &statement.params).await?;
    let mut out = Vec::with_capacity(rows.len());
    for mut row in rows {
        let full = match row.remove(FULL_ROW) {
            Some(Value::Object(full)) => full,
            _ => return Err(Error::Internal("post validation row missing".into())),
        };
        hook(full, Arc::clone(tx)).await?;
        out.push(row);
    }
    Ok(out)
}

fn payload_rows(data: &Value) -> Result<(Vec<&Row>, bool)> {
    match data {
        Value::Object(row) => Ok((vec![row], false)),
        Value::Array(items) if items.is_empty() => {
            Err(Error::Validation("no rows to insert".into()))
        }
        Value::Array(items) => {
            let rows = items
                .iter()
                .map(|item| {
                    item.as_object()
                        .ok_or_else(|| Error::Validation("inserted rows must be objects".into()))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((rows, true))
        }
        other => Err(Error::Validation(format!(
            "data must be an object or an array of objects, got {other}"
        ))),
    }
}

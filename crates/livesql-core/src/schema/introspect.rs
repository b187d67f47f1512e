//! Schema discovery from `pg_catalog`.

use serde_json::{json, Value};

use super::{Column, Schema, TableInfo};
use crate::db::{DbClient, Row};
use crate::error::{Error, Result};

/// One row per column of every table and view in schema `$1`.
pub const INTROSPECT_COLUMNS_SQL: &str = r"
SELECT
  c.relname AS table_name,
  (c.relkind IN ('v', 'm')) AS is_view,
  a.attname AS column_name,
  t.typname AS udt_name,
  NOT a.attnotnull AS is_nullable,
  a.atthasdef AS has_default,
  EXISTS (
    SELECT 1 FROM pg_constraint pk
    WHERE pk.conrelid = c.oid AND pk.contype = 'p' AND a.attnum = ANY (pk.conkey)
  ) AS is_pkey,
  fk.ref_table,
  fk.ref_column,
  COALESCE((
    SELECT json_agg(DISTINCT pc.relname ORDER BY pc.relname)
    FROM pg_depend d
    JOIN pg_rewrite r ON r.oid = d.objid
    JOIN pg_class pc ON pc.oid = d.refobjid
    WHERE r.ev_class = c.oid AND pc.oid <> c.oid AND pc.relkind IN ('r', 'p')
  ), '[]'::json) AS parent_tables
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum > 0 AND NOT a.attisdropped
JOIN pg_type t ON t.oid = a.atttypid
LEFT JOIN LATERAL (
  SELECT rc.relname AS ref_table, ra.attname AS ref_column
  FROM pg_constraint f
  JOIN pg_class rc ON rc.oid = f.confrelid
  JOIN pg_attribute ra ON ra.attrelid = f.confrelid
    AND ra.attnum = f.confkey[array_position(f.conkey, a.attnum)]
  WHERE f.conrelid = c.oid AND f.contype = 'f' AND a.attnum = ANY (f.conkey)
  ORDER BY f.conname
  LIMIT 1
) fk ON TRUE
WHERE n.nspname = $1::text::name
  AND c.relkind IN ('r', 'p', 'v', 'm')
ORDER BY c.relname, a.attnum
";

/// Reads every table and view of `schema_name`.
///
/// # Errors
///
/// Returns [`Error::Database`] if the catalog query fails and
/// [`Error::Internal`] if a row has an unexpected shape.
pub async fn introspect(db: &dyn DbClient, schema_name: &str) -> Result<Schema> {
    let rows = db
        .query(INTROSPECT_COLUMNS_SQL, &[json!(schema_name)])
        .await?;
    let schema = schema_from_rows(schema_name, &rows)?;
    tracing::debug!(schema = %schema_name, tables = schema.len(), "schema introspected");
    Ok(schema)
}

pub(crate) fn schema_from_rows(schema_name: &str, rows: &[Row]) -> Result<Schema> {
    let mut schema = Schema::new();
    let mut current: Option<TableInfo> = None;

    for row in rows {
        let table_name = text(row, "table_name")?;
        if current.as_ref().map_or(true, |t| t.name != table_name) {
            if let Some(done) = current.take() {
                schema.insert(done);
            }
            let mut table = TableInfo::new(table_name);
            table.schema = schema_name.to_string();
            table.is_view = flag(row, "is_view");
            if let Some(Value::Array(parents)) = row.get("parent_tables") {
                table.parent_tables = parents
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect();
            }
            current = Some(table);
        }

        let mut column = Column::new(text(row, "column_name")?, text(row, "udt_name")?);
        column.nullable = flag(row, "is_nullable");
        column.has_default = flag(row, "has_default");
        column.is_pkey = flag(row, "is_pkey");
        if let (Some(Value::String(t)), Some(Value::String(c))) =
            (row.get("ref_table"), row.get("ref_column"))
        {
            column = column.references(t.clone(), c.clone());
        }
        if let Some(table) = current.as_mut() {
            table.columns.push(column);
        }
    }
    if let Some(done) = current {
        schema.insert(done);
    }
    Ok(schema)
}

fn text<'a>(row: &'a Row, key: &str) -> Result<&'a str> {
    row.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Internal(format!("introspection row is missing '{key}'")))
}

fn flag(row: &Row, key: &str) -> bool {
    row.get(key).and_then(Value::as_bool).unwrap_or(false)
}

use serde_json::Value;

use super::{
    payload_rows, prepare_row, resolve_fields, returning_clause, returning_items, run_statement,
    stamp_synced, InsertParams, MutationContext, MutationResult, RowHooks, Statement,
};
use crate::db::Row;
use crate::error::{Error, Result};
use crate::rules::Command;
use crate::schema::TableInfo;
use crate::select::SelectItem;
use crate::sql::quote_ident;

/// Builds an INSERT for already prepared rows.
///
/// The column list is the union of the rows' keys in table order; cells
/// missing from a row become `DEFAULT`.
pub(crate) fn build_insert(
    table: &TableInfo,
    rows: &[Row],
    returning: &[SelectItem],
    on_conflict_do_nothing: bool,
    full_row: bool,
) -> Result<Statement> {
    let columns: Vec<_> = table
        .columns
        .iter()
        .filter(|c| rows.iter().any(|r| r.contains_key(&c.name)))
        .collect();

    let mut statement = Statement::default();
    let mut sql = format!("INSERT INTO {}", table.escaped_name());
    if columns.is_empty() {
        if rows.len() == 1 {
            sql.push_str(" DEFAULT VALUES");
        } else {
            let first = table.columns.first().ok_or_else(|| {
                Error::Validation(format!("table '{}' has no columns", table.name))
            })?;
            let defaults = vec!["(DEFAULT)"; rows.len()].join(", ");
            sql.push_str(&format!(" ({}) VALUES {defaults}", quote_ident(&first.name)));
        }
    } else {
        let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = Vec::with_capacity(columns.len());
            for column in &columns {
                match row.get(&column.name) {
                    Some(value) => cells.push(statement.bind(column, value)?),
                    None => cells.push("DEFAULT".to_string()),
                }
            }
            tuples.push(format!("({})", cells.join(", ")));
        }
        sql.push_str(&format!(" ({})\nVALUES {}", names.join(", "), tuples.join(",\n  ")));
    }
    if on_conflict_do_nothing {
        sql.push_str("\nON CONFLICT DO NOTHING");
    }
    sql.push_str(&returning_clause(table, returning, full_row));
    statement.sql = sql;
    Ok(statement)
}

/// Inserts one row (object) or several (array of objects).
///
/// # Errors
///
/// Permission and validation errors before any SQL runs, database errors
/// after.
pub async fn insert(
    ctx: MutationContext<'_>,
    table: &str,
    data: &Value,
    params: &InsertParams,
) -> Result<MutationResult> {
    let info = ctx.query.schema.require(table)?;
    let permit = ctx.query.access.permit(table, Command::Insert).await?;
    let rule = permit.insert(table)?;
    let allowed = resolve_fields(rule.map(|r| &r.fields), info)?;
    let (payload, multi) = payload_rows(data)?;

    let mut rows = Vec::with_capacity(payload.len());
    for raw in payload {
        let mut row = prepare_row(
            info,
            raw,
            &allowed,
            rule.and_then(|r| r.forced_data.as_ref()),
            params.fix_issues,
            RowHooks {
                pre_validate: rule.and_then(|r| r.pre_validate.as_ref()),
                validate: rule.and_then(|r| r.validate.as_ref()),
            },
        )
        .await?;
        stamp_synced(&mut row, info, permit.sync_rule());
        rows.push(row);
    }

    let returning = returning_items(
        info,
        ctx.query,
        &permit,
        rule.and_then(|r| r.returning_fields.as_ref()),
        params.returning.as_ref(),
    )?;
    let post_validate = rule.and_then(|r| r.post_validate.as_ref());
    let statement = build_insert(
        info,
        &rows,
        &returning,
        params.on_conflict_do_nothing,
        post_validate.is_some(),
    )?;
    tracing::debug!(table = %table, rows = rows.len(), "insert");

    let returns_rows = !returning.is_empty() || post_validate.is_some();
    let result = run_statement(ctx, &statement, returns_rows, post_validate).await?;
    if params.returning.is_none() {
        return Ok(MutationResult::None);
    }
    Ok(if multi {
        MutationResult::Many(result)
    } else {
        result
            .into_iter()
            .next()
            .map_or(MutationResult::None, MutationResult::One)
    })
}

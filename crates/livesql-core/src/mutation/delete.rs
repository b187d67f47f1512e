use serde_json::Value;

use super::{
    resolve_fields, returning_clause, returning_items, run_statement, DeleteParams,
    MutationContext, MutationResult, Statement,
};
use crate::error::{Error, Result};
use crate::query::build_filter;
use crate::rules::Command;

/// Deletes the rows matching `filter`.
///
/// # Errors
///
/// Permission and validation errors before any SQL runs, database errors
/// after.
pub async fn delete(
    ctx: MutationContext<'_>,
    table: &str,
    filter: &Value,
    params: &DeleteParams,
) -> Result<MutationResult> {
    let info = ctx.query.schema.require(table)?;
    let permit = ctx.query.access.permit(table, Command::Delete).await?;
    let rule = permit.delete(table)?;
    let filter_allowed = resolve_fields(rule.map(|r| &r.filter_fields), info)?;
    let compiled = build_filter(
        ctx.query,
        info,
        filter,
        &filter_allowed,
        rule.and_then(|r| r.forced_filter.as_ref()),
        &[],
    )
    .await?;
    if !compiled.having_sql.is_empty() {
        return Err(Error::Validation("aggregate filters are not allowed in delete".into()));
    }

    let returning = returning_items(
        info,
        ctx.query,
        &permit,
        rule.and_then(|r| r.returning_fields.as_ref()),
        params.returning.as_ref(),
    )?;
    let mut sql = format!("DELETE FROM {}", info.escaped_name());
    if !compiled.where_sql.is_empty() {
        sql.push_str(&format!("\nWHERE {}", compiled.where_sql));
    }
    sql.push_str(&returning_clause(info, &returning, false));
    let statement = Statement {
        sql,
        params: Vec::new(),
    };

    tracing::debug!(table = %table, condition = %compiled.condition(), "delete");
    let rows = run_statement(ctx, &statement, !returning.is_empty(), None).await?;
    Ok(if params.returning.is_none() {
        MutationResult::None
    } else {
        MutationResult::Many(rows)
    })
}

use serde_json::{Map, Value};

use super::{
    insert, prepare_row, resolve_fields, returning_clause, returning_items, run_statement,
    stamp_synced, InsertParams, MutationContext, MutationResult, RowHooks, Statement,
    UpdateParams,
};
use crate::db::Row;
use crate::error::{Error, Result};
use crate::query::{build_filter, count_sql};
use crate::rules::Command;
use crate::schema::TableInfo;
use crate::select::SelectItem;
use crate::sql::quote_ident;

/// Top-level field names of a filter, looking through `$and`.
fn pinned_fields(filter: &Value, out: &mut Vec<String>) {
    let Some(map) = filter.as_object() else {
        return;
    };
    for (key, value) in map {
        if key == "$and" {
            for item in value.as_array().into_iter().flatten() {
                pinned_fields(item, out);
            }
        } else if !key.starts_with('$') {
            let base = key.split("->").next().unwrap_or(key);
            let base = base.split(".$").next().unwrap_or(base);
            out.push(base.to_string());
        }
    }
}

/// Builds `UPDATE ... SET ... WHERE ... RETURNING ...`.
pub(crate) fn build_update(
    table: &TableInfo,
    data: &Row,
    where_sql: &str,
    returning: &[SelectItem],
    full_row: bool,
) -> Result<Statement> {
    let mut statement = Statement::default();
    let mut assignments = Vec::with_capacity(data.len());
    for column in table.columns.iter().filter(|c| data.contains_key(&c.name)) {
        let value = data.get(&column.name).unwrap_or(&Value::Null);
        let placeholder = statement.bind(column, value)?;
        assignments.push(format!("{} = {placeholder}", quote_ident(&column.name)));
    }
    if assignments.is_empty() {
        return Err(Error::Validation("no data to update".into()));
    }
    let mut sql = format!(
        "UPDATE {}\nSET {}",
        table.escaped_name(),
        assignments.join(", ")
    );
    if !where_sql.is_empty() {
        sql.push_str(&format!("\nWHERE {where_sql}"));
    }
    sql.push_str(&returning_clause(table, returning, full_row));
    statement.sql = sql;
    Ok(statement)
}

/// Updates the rows matching `filter` with `data`.
///
/// Client values for fields pinned by the rule's forced filter are dropped
/// before the rule's forced data is merged.
///
/// # Errors
///
/// Permission and validation errors before any SQL runs, database errors
/// after. Unique violations are swallowed with `onConflictDoNothing`.
pub async fn update(
    ctx: MutationContext<'_>,
    table: &str,
    filter: &Value,
    data: &Value,
    params: &UpdateParams,
) -> Result<MutationResult> {
    let info = ctx.query.schema.require(table)?;
    let permit = ctx.query.access.permit(table, Command::Update).await?;
    let rule = permit.update(table)?;
    let allowed = resolve_fields(rule.map(|r| &r.fields), info)?;
    let filter_allowed = match rule {
        Some(r) => r.filter_fields.as_ref().unwrap_or(&r.fields).resolve(info)?,
        None => allowed.clone(),
    };
    let forced_filter = rule.and_then(|r| r.forced_filter.as_ref());

    let data = data
        .as_object()
        .ok_or_else(|| Error::Validation("update data must be an object".into()))?;
    // The raw payload goes to pre-validation before pinned fields are dropped.
    let mut data = match rule.and_then(|r| r.pre_validate.as_ref()) {
        Some(hook) => hook(data.clone()).await?,
        None => data.clone(),
    };
    if let Some(forced) = forced_filter {
        let mut pinned = Vec::new();
        pinned_fields(forced, &mut pinned);
        for field in pinned {
            data.remove(&field);
        }
    }
    let mut row = prepare_row(
        info,
        &data,
        &allowed,
        rule.and_then(|r| r.forced_data.as_ref()),
        params.fix_issues,
        RowHooks {
            pre_validate: None,
            validate: rule.and_then(|r| r.validate.as_ref()),
        },
    )
    .await?;
    stamp_synced(&mut row, info, permit.sync_rule());

    let compiled = build_filter(ctx.query, info, filter, &filter_allowed, forced_filter, &[]).await?;
    if !compiled.having_sql.is_empty() {
        return Err(Error::Validation("aggregate filters are not allowed in update".into()));
    }

    let returning = returning_items(
        info,
        ctx.query,
        &permit,
        rule.and_then(|r| r.returning_fields.as_ref()),
        params.returning.as_ref(),
    )?;
    let post_validate = rule.and_then(|r| r.post_validate.as_ref());
    let statement = build_update(info, &row, &compiled.where_sql, &returning, post_validate.is_some())?;

    if !params.multi {
        let counted = ctx.db.query(&count_sql(info, &compiled.where_sql), &[]).await?;
        let count = counted
            .first()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if count > 1 {
            return Err(Error::Validation(format!(
                "update would affect {count} rows; set multi to update several rows"
            )));
        }
    }

    tracing::debug!(table = %table, condition = %compiled.condition(), "update");
    let returns_rows = !returning.is_empty() || post_validate.is_some();
    let rows = match run_statement(ctx, &statement, returns_rows, post_validate).await {
        Ok(rows) => rows,
        Err(Error::Database(info)) if params.on_conflict_do_nothing && info.code.as_deref() == Some("23505") => {
            tracing::debug!(table = %table, "update conflict ignored");
            return Ok(MutationResult::None);
        }
        Err(e) => return Err(e),
    };

    if params.returning.is_none() {
        return Ok(MutationResult::None);
    }
    Ok(if params.multi {
        MutationResult::Many(rows)
    } else {
        rows.into_iter()
            .next()
            .map_or(MutationResult::None, MutationResult::One)
    })
}

// Scalar equality conditions of a filter, usable as insert values.
fn equality_values(filter: &Value) -> Row {
    let mut out = Map::new();
    let Some(map) = filter.as_object() else {
        return out;
    };
    for (key, value) in map {
        if key.starts_with('$') || key.contains("->") || key.contains(".$") {
            continue;
        }
        match value {
            Value::Object(ops) => {
                if let (1, Some(v)) = (ops.len(), ops.get("$eq").or_else(|| ops.get("="))) {
                    if !v.is_object() {
                        out.insert(key.clone(), v.clone());
                    }
                }
            }
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }
    out
}

/// Updates the rows matching `filter`, or inserts `data` merged with the
/// filter's equality values when none match.
///
/// The existence check and the write are separate statements, so two
/// concurrent upserts of the same key can both insert.
///
/// # Errors
///
/// Same as [`update`] and [`insert`].
pub async fn upsert(
    ctx: MutationContext<'_>,
    table: &str,
    filter: &Value,
    data: &Value,
    params: &UpdateParams,
) -> Result<MutationResult> {
    let info = ctx.query.schema.require(table)?;
    let permit = ctx.query.access.permit(table, Command::Update).await?;
    let rule = permit.update(table)?;
    let filter_allowed = match rule {
        Some(r) => r.filter_fields.as_ref().unwrap_or(&r.fields).resolve(info)?,
        None => info.column_names().map(str::to_string).collect(),
    };
    let compiled = build_filter(
        ctx.query,
        info,
        filter,
        &filter_allowed,
        rule.and_then(|r| r.forced_filter.as_ref()),
        &[],
    )
    .await?;

    let mut lookup = format!("SELECT 1 AS found\nFROM {}", info.escaped_name());
    if !compiled.where_sql.is_empty() {
        lookup.push_str(&format!("\nWHERE {}", compiled.where_sql));
    }
    lookup.push_str("\nLIMIT 1");
    let exists = !ctx.db.query(&lookup, &[]).await?.is_empty();

    if exists {
        return update(ctx, table, filter, data, params).await;
    }

    let data = data
        .as_object()
        .ok_or_else(|| Error::Validation("upsert data must be an object".into()))?;
    let mut row = equality_values(filter);
    for (key, value) in data {
        row.insert(key.clone(), value.clone());
    }
    let insert_params = InsertParams {
        returning: params.returning.clone(),
        on_conflict_do_nothing: params.on_conflict_do_nothing,
        fix_issues: params.fix_issues,
    };
    insert(ctx, table, &Value::Object(row), &insert_params).await
}

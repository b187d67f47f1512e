//! Builds the query tree of a find request.

use futures::future::BoxFuture;
use serde_json::Value;

use super::order::parse_order_by;
use super::{NodeJoin, QueryNode};
use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::filter::{
    compile_filter, exists_scopes, referenced_tables, CompiledFilter, FilterEnv, FilterParams,
};
use crate::joins::JoinGraph;
use crate::rules::{Access, Command, FieldFilter};
use crate::schema::{Schema, TableInfo};
use crate::select::{parse_user_select, JoinType, SelectEnv, SelectItem};

/// Shared inputs of a query build.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    /// Current schema.
    pub schema: &'a Schema,
    /// Current join graph.
    pub joins: &'a JoinGraph,
    /// Caller authorization.
    pub access: &'a Access,
    /// Limit defaults and caps.
    pub config: &'a QueryConfig,
    /// Receives filter operands; filters are inlined without it.
    pub params: Option<&'a FilterParams>,
}

/// Client-facing find request.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Filter object.
    pub filter: Value,
    /// Projection.
    pub select: Value,
    /// Sort spec.
    pub order_by: Option<Value>,
    /// Row cap.
    pub limit: Option<u64>,
    /// Rows skipped.
    pub offset: Option<u64>,
}

struct NodeSpec {
    table: String,
    alias: String,
    select: Value,
    filter: Value,
    order_by: Option<Value>,
    limit: Option<u64>,
    offset: Option<u64>,
    join_type: JoinType,
    depth: usize,
    // Columns the parent joins on.
    required: Vec<String>,
}

/// Resolves permissions, filters and joins of a find request into a tree.
///
/// Filter operands of every node are bound into the root's
/// [`QueryNode::params`].
///
/// # Errors
///
/// Permission, validation and join resolution errors, all raised before
/// any SQL runs.
pub async fn build_query(ctx: QueryContext<'_>, table: &str, request: &QueryRequest) -> Result<QueryNode> {
    let params = FilterParams::new();
    let ctx = QueryContext {
        params: Some(&params),
        ..ctx
    };
    let spec = NodeSpec {
        table: table.to_string(),
        alias: table.to_string(),
        select: request.select.clone(),
        filter: request.filter.clone(),
        order_by: request.order_by.clone(),
        limit: request.limit,
        offset: request.offset,
        join_type: JoinType::Left,
        depth: 0,
        required: Vec::new(),
    };
    let mut node = build_node(ctx, spec).await?;
    node.params = params.take();
    Ok(node)
}

/// Compiles a client filter plus an optional forced filter for `table`.
///
/// The forced filter comes from a rule and may use any column; the client
/// filter is limited to `allowed`.
///
/// # Errors
///
/// Same as [`compile_filter`], plus permission errors of exists targets.
pub async fn build_filter(
    ctx: QueryContext<'_>,
    table: &TableInfo,
    filter: &Value,
    allowed: &[String],
    forced: Option<&Value>,
    items: &[SelectItem],
) -> Result<CompiledFilter> {
    let mut tables = referenced_tables(filter, ctx.joins, &table.name)?;
    if let Some(forced) = forced {
        for t in referenced_tables(forced, ctx.joins, &table.name)? {
            if !tables.contains(&t) {
                tables.push(t);
            }
        }
    }
    let scopes = exists_scopes(ctx.access, ctx.schema, &tables).await?;

    let mut env = FilterEnv::new(ctx.schema, ctx.joins, table, allowed)
        .with_items(items)
        .with_exists(&scopes);
    if let Some(params) = ctx.params {
        env = env.with_params(params);
    }
    let user = compile_filter(&env, filter)?;

    let Some(forced) = forced else {
        return Ok(user);
    };
    let all_columns: Vec<String> = table.column_names().map(str::to_string).collect();
    let forced_env = FilterEnv {
        allowed: &all_columns,
        ..env
    };
    let forced = compile_filter(&forced_env, forced)?;
    Ok(CompiledFilter {
        where_sql: and_sql(&user.where_sql, &forced.where_sql),
        having_sql: and_sql(&user.having_sql, &forced.having_sql),
    })
}

fn and_sql(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a} AND {b}"),
    }
}

fn allowed_by(filter: Option<&FieldFilter>, table: &TableInfo, fallback: &[String]) -> Result<Vec<String>> {
    match filter {
        Some(f) => f.resolve(table),
        None => Ok(fallback.to_vec()),
    }
}

fn resolve_limit(config: &QueryConfig, rule_max: Option<u64>, requested: Option<u64>) -> Result<Option<u64>> {
    let cap = rule_max.map_or(config.max_limit, |m| m.min(config.max_limit));
    match requested {
        Some(limit) if limit > cap => Err(Error::Validation(format!(
            "limit {limit} exceeds the maximum of {cap}"
        ))),
        Some(limit) => Ok(Some(limit)),
        None => Ok(config.default_limit.or(rule_max)),
    }
}

// Adds `column` as a hidden item unless an item already exposes it.
fn ensure_hidden(items: &mut Vec<SelectItem>, table: &TableInfo, column: &str) -> Result<()> {
    if let Some(existing) = items.iter().find(|i| i.alias == column) {
        if existing.column_name() == Some(column) {
            return Ok(());
        }
        return Err(Error::Validation(format!(
            "column '{column}' of '{}' is needed internally but its name is used by another select item",
            table.name
        )));
    }
    let col = table.get_column(column).ok_or_else(|| {
        Error::Validation(format!("column '{column}' does not exist in table '{}'", table.name))
    })?;
    items.push(SelectItem::column(col, false));
    Ok(())
}

fn build_node<'a>(ctx: QueryContext<'a>, spec: NodeSpec) -> BoxFuture<'a, Result<QueryNode>> {
    Box::pin(async move {
        let info = ctx.schema.require(&spec.table)?;
        let permit = ctx.access.permit(&spec.table, Command::Select).await?;
        let rule = permit.select(&spec.table)?.cloned();
        let allowed = permit.select_fields(info)?;
        let filter_allowed = allowed_by(
            rule.as_ref().and_then(|r| r.filter_fields.as_ref()),
            info,
            &allowed,
        )?;
        let order_allowed = allowed_by(
            rule.as_ref().and_then(|r| r.order_by_fields.as_ref()),
            info,
            &allowed,
        )?;

        let select_env = SelectEnv {
            table: info,
            allowed: &allowed,
            schema: ctx.schema,
            allow_joins: true,
        };
        let parsed = parse_user_select(&spec.select, &select_env)?;
        let mut items = parsed.items;
        if items.iter().any(SelectItem::is_aggregate) && !parsed.joins.is_empty() {
            return Err(Error::Validation("Joins within aggregates disallowed".into()));
        }

        for column in &spec.required {
            if !allowed.contains(column) {
                return Err(Error::Forbidden(format!(
                    "join column '{column}' of table '{}' is not allowed",
                    spec.table
                )));
            }
            ensure_hidden(&mut items, info, column)?;
        }

        let order_by = parse_order_by(
            spec.order_by.as_ref().unwrap_or(&Value::Null),
            &items,
            info,
            &order_allowed,
        )?;
        if spec.depth > 0 {
            // Joined rows are sorted from the node's output, by alias.
            for key in order_by.iter().map(|o| o.key.clone()).collect::<Vec<_>>() {
                if !items.iter().any(|i| i.alias == key) {
                    ensure_hidden(&mut items, info, &key)?;
                }
            }
        }

        let filter = build_filter(
            ctx,
            info,
            &spec.filter,
            &filter_allowed,
            rule.as_ref().and_then(|r| r.forced_filter.as_ref()),
            &items,
        )
        .await?;

        let limit = if spec.depth == 0 {
            resolve_limit(ctx.config, rule.as_ref().and_then(|r| r.max_limit), spec.limit)?
        } else {
            spec.limit
        };

        let mut joins = Vec::with_capacity(parsed.joins.len());
        for request in parsed.joins {
            let hops = ctx
                .joins
                .resolve(&spec.table, &request.table, request.path.as_deref())?;
            let (Some(first), Some(last)) = (hops.first(), hops.last()) else {
                return Err(Error::JoinResolution(format!(
                    "empty join path {} -> {}",
                    spec.table, request.table
                )));
            };
            if let Some(column) = first.source_columns().find(|c| !allowed.iter().any(|a| a == *c)) {
                return Err(Error::Forbidden(format!(
                    "join column '{column}' of table '{}' is not allowed",
                    spec.table
                )));
            }
            let required = last.target_columns().map(str::to_string).collect();
            for hop in &hops[..hops.len() - 1] {
                ctx.access
                    .permit(&hop.table, Command::Select)
                    .await?
                    .select(&hop.table)?;
            }
            let relations = hops
                .iter()
                .map(|hop| ctx.schema.require(&hop.table).map(TableInfo::escaped_name))
                .collect::<Result<Vec<_>>>()?;

            let child_spec = NodeSpec {
                table: request.table,
                alias: request.alias,
                select: request.select,
                filter: request.filter,
                order_by: request.order_by,
                limit: request.limit,
                offset: request.offset,
                join_type: request.join_type,
                depth: spec.depth + 1,
                required,
            };
            let node = build_node(ctx, child_spec).await?;
            joins.push(NodeJoin {
                hops,
                relations,
                node,
            });
        }
        if joins.iter().filter(|j| j.node.has_aggregates()).count() > 1 {
            return Err(Error::Validation("Cannot join two aggregates".into()));
        }

        tracing::trace!(table = %spec.table, depth = spec.depth, joins = joins.len(), "query node built");
        Ok(QueryNode {
            relation: info.escaped_name(),
            table: spec.table,
            alias: spec.alias,
            items,
            filter,
            order_by,
            limit,
            offset: spec.offset.unwrap_or(0),
            join_type: spec.join_type,
            joins,
            depth: spec.depth,
            params: Vec::new(),
        })
    })
}

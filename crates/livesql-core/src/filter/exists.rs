//! `$exists`, `$notExists`, `$existsJoined`, `$notExistsJoined`.
//!
//! `$exists` is an uncorrelated subquery over another table. The joined
//! variants correlate with the filtered row through the join path named by
//! the key (`"t1.t2"` or just the target `"t2"`).

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use super::{and_filters, compile_where, FilterEnv};
use crate::error::{Error, Result};
use crate::joins::{JoinGraph, JoinHop};
use crate::rules::{Access, Command};
use crate::schema::Schema;
use crate::sql::quote_ident;

/// Filter permissions of a table referenced by an exists operator.
#[derive(Debug, Clone, Default)]
pub struct ExistsScope {
    /// Columns that may be filtered on.
    pub allowed: Vec<String>,
    /// Forced filter of the table's select rule.
    pub forced_filter: Option<Value>,
}

fn is_exists_key(key: &str) -> bool {
    matches!(
        key,
        "$exists" | "$notExists" | "$existsJoined" | "$notExistsJoined"
    )
}

fn is_joined(key: &str) -> bool {
    key.ends_with("Joined")
}

/// Tables read by the exists operators of `filter`, including the
/// intermediate tables of joined paths, in first-seen order.
///
/// # Errors
///
/// Returns [`Error::JoinResolution`] when a joined path cannot be resolved.
pub fn referenced_tables(filter: &Value, joins: &JoinGraph, source: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    collect(filter, joins, source, &mut out)?;
    Ok(out)
}

fn collect(filter: &Value, joins: &JoinGraph, source: &str, out: &mut Vec<String>) -> Result<()> {
    let Some(map) = filter.as_object() else {
        return Ok(());
    };
    for (key, value) in map {
        match key.as_str() {
            "$and" | "$or" => {
                for item in value.as_array().into_iter().flatten() {
                    collect(item, joins, source, out)?;
                }
            }
            "$not" => collect(value, joins, source, out)?,
            k if is_exists_key(k) => {
                for target in value.as_object().into_iter().flat_map(Map::keys) {
                    let tables = if is_joined(k) {
                        resolve_hops(joins, source, target)?
                            .into_iter()
                            .map(|h| h.table)
                            .collect()
                    } else {
                        vec![target.clone()]
                    };
                    for table in tables {
                        if !out.contains(&table) {
                            out.push(table);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Loads the select permissions of `tables`.
///
/// # Errors
///
/// Returns [`Error::Forbidden`] when a table cannot be selected and
/// [`Error::TableNotFound`] for unknown tables.
pub async fn exists_scopes(
    access: &Access,
    schema: &Schema,
    tables: &[String],
) -> Result<FxHashMap<String, ExistsScope>> {
    let mut scopes = FxHashMap::default();
    for name in tables {
        let table = schema.require(name)?;
        let permit = access.permit(name, Command::Select).await?;
        let scope = match permit.select(name)? {
            None => ExistsScope {
                allowed: table.column_names().map(str::to_string).collect(),
                forced_filter: None,
            },
            Some(rule) => ExistsScope {
                allowed: rule.filter_fields.as_ref().unwrap_or(&rule.fields).resolve(table)?,
                forced_filter: rule.forced_filter.clone(),
            },
        };
        scopes.insert(name.clone(), scope);
    }
    Ok(scopes)
}

fn resolve_hops(joins: &JoinGraph, source: &str, key: &str) -> Result<Vec<JoinHop>> {
    let segments: Vec<String> = key.split('.').map(str::to_string).collect();
    match segments.as_slice() {
        [target] => joins.resolve(source, target, None),
        [.., target] => joins.resolve(source, target, Some(segments.as_slice())),
        [] => Err(Error::Validation("empty exists target".into())),
    }
}

/// Compiles one exists operator. `Ok(None)` when it has no targets.
pub(super) fn compile(env: &FilterEnv<'_>, op: &str, value: &Value) -> Result<Option<String>> {
    if env.nested_in_exists {
        return Err(Error::Validation("Nested exists are not allowed".into()));
    }
    let targets = value
        .as_object()
        .ok_or_else(|| Error::Validation(format!("{op} expects {{table: filter}}")))?;

    let mut parts = Vec::with_capacity(targets.len());
    for (target, filter) in targets {
        let body = if is_joined(op) {
            joined_subquery(env, target, filter)?
        } else {
            plain_subquery(env, target, filter)?
        };
        let negate = if op.starts_with("$not") { "NOT " } else { "" };
        parts.push(format!("{negate}EXISTS ({body})"));
    }
    parts.sort();
    Ok(match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(format!("({})", parts.join(" AND "))),
    })
}

fn scope<'e>(env: &FilterEnv<'e>, table: &str) -> Result<&'e ExistsScope> {
    env.exists
        .and_then(|scopes| scopes.get(table))
        .ok_or_else(|| Error::Forbidden(format!("select not allowed on table '{table}'")))
}

// Inner condition on `table` under `alias`, forced filter included.
fn inner_condition(
    env: &FilterEnv<'_>,
    table: &str,
    alias: &str,
    filter: Option<&Value>,
) -> Result<String> {
    let info = env.schema.require(table)?;
    let scope = scope(env, table)?;
    let filter = filter.cloned().unwrap_or(Value::Null);
    let merged = and_filters(&filter, scope.forced_filter.as_ref());
    let inner = FilterEnv {
        table: info,
        alias: Some(alias),
        allowed: &scope.allowed,
        items: &[],
        nested_in_exists: true,
        ..*env
    };
    compile_where(&inner, &merged)
}

fn plain_subquery(env: &FilterEnv<'_>, table: &str, filter: &Value) -> Result<String> {
    let info = env.schema.require(table)?;
    let condition = inner_condition(env, table, &info.name, Some(filter))?;
    let from = info.escaped_name();
    Ok(if condition.is_empty() {
        format!("SELECT 1 FROM {from}")
    } else {
        format!("SELECT 1 FROM {from} WHERE {condition}")
    })
}

fn joined_subquery(env: &FilterEnv<'_>, key: &str, filter: &Value) -> Result<String> {
    let hops = resolve_hops(env.joins, &env.table.name, key)?;
    let outer = match env.alias {
        Some(alias) => quote_ident(alias),
        None => quote_ident(&env.table.name),
    };

    let mut from = String::new();
    let mut conditions = Vec::new();
    let mut prev = outer;
    let last = hops.len();
    for (idx, hop) in hops.iter().enumerate() {
        let alias = format!("lsq_ex{}", idx + 1);
        let quoted = quote_ident(&alias);
        let on = hop.condition(&prev, &quoted);
        let relation = format!("{} AS {quoted}", env.schema.require(&hop.table)?.escaped_name());
        if idx == 0 {
            from = relation;
            conditions.push(format!("({on})"));
        } else {
            from.push_str(&format!(" INNER JOIN {relation} ON ({on})"));
        }
        let own_filter = (idx + 1 == last).then_some(filter);
        let condition = inner_condition(env, &hop.table, &alias, own_filter)?;
        if !condition.is_empty() {
            conditions.push(condition);
        }
        prev = quoted;
    }
    Ok(format!("SELECT 1 FROM {from} WHERE {}", conditions.join(" AND ")))
}

//! Filter compiler: client filter objects to SQL conditions.
//!
//! The output is deterministic for a given filter regardless of key order:
//! the clauses of an object are sorted before being ANDed. The compiled
//! WHERE text doubles as the subscription key stored in the trigger catalog,
//! so two clients sending the same filter share one trigger row.
//!
//! Filters reference plain columns, select-item aliases (functions and
//! aggregates of the same query), JSON paths (`col->a->>b`) and operator
//! suffixes (`col.$gt`). Conditions on aggregate aliases go to HAVING.
//!
//! With [`FilterParams`] attached, operands of a known type are bound as
//! `$n::text::<type>` parameters instead of being inlined. Trigger
//! conditions are compiled without them since the catalog stores their text.

mod exists;
mod json_path;
mod operators;

pub use exists::{exists_scopes, referenced_tables, ExistsScope};
pub use json_path::{parse_suffix, KeySuffix, PathSeg};
pub use operators::is_operator;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::joins::JoinGraph;
use crate::schema::{Column, Schema, TableInfo, UdtType};
use crate::select::SelectItem;
use crate::sql::qualified;
use operators::Target;

/// Operand values bound while compiling, in placeholder order.
#[derive(Debug, Default)]
pub struct FilterParams {
    values: Mutex<Vec<Value>>,
}

impl FilterParams {
    /// Empty parameter list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `value` and returns its `$n::text::<cast>` placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for strings holding NUL characters.
    pub fn bind(&self, value: Value, cast: &str) -> Result<String> {
        if value.as_str().is_some_and(|s| s.contains('\0')) {
            return Err(Error::Validation(
                "string values cannot contain NUL characters".into(),
            ));
        }
        let mut values = self.values.lock();
        values.push(value);
        Ok(format!("${}::text::{cast}", values.len()))
    }

    /// Number of bound values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Whether nothing was bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the bound values out, in placeholder order.
    #[must_use]
    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.values.lock())
    }
}

/// Context a filter is compiled in.
#[derive(Debug, Clone, Copy)]
pub struct FilterEnv<'a> {
    /// Full schema, for exists targets.
    pub schema: &'a Schema,
    /// Join graph, for `$existsJoined`.
    pub joins: &'a JoinGraph,
    /// Filtered table.
    pub table: &'a TableInfo,
    /// Relation alias columns are qualified with.
    pub alias: Option<&'a str>,
    /// Columns that may be filtered on.
    pub allowed: &'a [String],
    /// Select items of the same query, addressable by alias.
    pub items: &'a [SelectItem],
    /// Permissions of tables referenced through exists operators.
    pub exists: Option<&'a FxHashMap<String, ExistsScope>>,
    /// Set while compiling the inner filter of an exists.
    pub nested_in_exists: bool,
    /// Receives bound operands; operands are inlined without it.
    pub params: Option<&'a FilterParams>,
}

impl<'a> FilterEnv<'a> {
    /// Environment for `table` with no select items, no alias and no exists
    /// permissions.
    #[must_use]
    pub fn new(
        schema: &'a Schema,
        joins: &'a JoinGraph,
        table: &'a TableInfo,
        allowed: &'a [String],
    ) -> Self {
        Self {
            schema,
            joins,
            table,
            alias: None,
            allowed,
            items: &[],
            exists: None,
            nested_in_exists: false,
            params: None,
        }
    }

    /// Qualifies columns with `alias`.
    #[must_use]
    pub fn with_alias(mut self, alias: &'a str) -> Self {
        self.alias = Some(alias);
        self
    }

    /// Makes select-item aliases usable as filter keys.
    #[must_use]
    pub fn with_items(mut self, items: &'a [SelectItem]) -> Self {
        self.items = items;
        self
    }

    /// Permissions for exists targets.
    #[must_use]
    pub fn with_exists(mut self, scopes: &'a FxHashMap<String, ExistsScope>) -> Self {
        self.exists = Some(scopes);
        self
    }

    /// Binds operands into `params`.
    #[must_use]
    pub fn with_params(mut self, params: &'a FilterParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// Compiled filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    /// WHERE condition, empty when the filter matches every row.
    pub where_sql: String,
    /// HAVING condition on aggregate aliases, usually empty.
    pub having_sql: String,
}

impl CompiledFilter {
    /// The WHERE condition, `TRUE` when empty.
    #[must_use]
    pub fn condition(&self) -> &str {
        if self.where_sql.is_empty() {
            "TRUE"
        } else {
            &self.where_sql
        }
    }
}

struct Clause {
    sql: String,
    having: bool,
}

/// Compiles `filter` into WHERE and HAVING conditions.
///
/// # Errors
///
/// Returns [`Error::Forbidden`] for fields outside `env.allowed`,
/// [`Error::Validation`] for unknown fields, operators or malformed operands.
pub fn compile_filter(env: &FilterEnv<'_>, filter: &Value) -> Result<CompiledFilter> {
    let map = match filter {
        Value::Null => return Ok(CompiledFilter::default()),
        Value::Object(map) => map,
        _ => return Err(Error::Validation("filter must be an object".into())),
    };
    let clauses = compile_object(env, map, true)?;
    let (having, plain): (Vec<Clause>, Vec<Clause>) = clauses.into_iter().partition(|c| c.having);
    Ok(CompiledFilter {
        where_sql: join_sorted(plain, " AND "),
        having_sql: join_sorted(having, " AND "),
    })
}

/// Compiles a filter that may not reference aggregates.
///
/// # Errors
///
/// Same as [`compile_filter`], plus [`Error::Validation`] when an aggregate
/// alias is used.
pub fn compile_where(env: &FilterEnv<'_>, filter: &Value) -> Result<String> {
    let compiled = compile_filter(env, filter)?;
    if !compiled.having_sql.is_empty() {
        return Err(Error::Validation(
            "aggregate fields cannot be filtered here".into(),
        ));
    }
    Ok(compiled.where_sql)
}

/// `{$and: [a, b]}`, or whichever side is non-empty.
#[must_use]
pub fn and_filters(a: &Value, b: Option<&Value>) -> Value {
    let is_empty = |v: &Value| match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    };
    match b {
        None => a.clone(),
        Some(b) if is_empty(b) => a.clone(),
        Some(b) if is_empty(a) => b.clone(),
        Some(b) => serde_json::json!({ "$and": [a, b] }),
    }
}

fn join_sorted(clauses: Vec<Clause>, separator: &str) -> String {
    let mut parts: Vec<String> = clauses.into_iter().map(|c| c.sql).collect();
    parts.sort();
    parts.join(separator)
}

fn compile_object(env: &FilterEnv<'_>, map: &Map<String, Value>, top: bool) -> Result<Vec<Clause>> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        if let Some(clause) = compile_key(env, key, value, top)? {
            clauses.push(clause);
        }
    }
    Ok(clauses)
}

// Compiles a nested filter: the ANDed clauses and how many there are.
fn compile_nested(env: &FilterEnv<'_>, filter: &Value, op: &str) -> Result<(String, usize)> {
    let map = filter
        .as_object()
        .ok_or_else(|| Error::Validation(format!("{op} expects filter objects")))?;
    let clauses = compile_object(env, map, false)?;
    let count = clauses.len();
    Ok((join_sorted(clauses, " AND "), count))
}

fn compile_key(env: &FilterEnv<'_>, key: &str, value: &Value, top: bool) -> Result<Option<Clause>> {
    let plain = |sql: String| Some(Clause { sql, having: false });
    match key {
        "$and" | "$or" => {
            let items = value
                .as_array()
                .ok_or_else(|| Error::Validation(format!("{key} expects an array")))?;
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match compile_nested(env, item, key)? {
                    // An empty alternative matches everything.
                    (_, 0) if key == "$or" => return Ok(None),
                    (_, 0) => {}
                    (sql, 1) => parts.push(sql),
                    (sql, _) => parts.push(format!("({sql})")),
                }
            }
            let separator = if key == "$and" { " AND " } else { " OR " };
            Ok(match parts.len() {
                0 => None,
                1 => plain(parts.remove(0)),
                _ => plain(format!("({})", parts.join(separator))),
            })
        }
        "$not" => Ok(match compile_nested(env, value, key)? {
            (_, 0) => plain("FALSE".to_string()),
            (sql, _) => plain(format!("NOT ({sql})")),
        }),
        "$exists" | "$notExists" | "$existsJoined" | "$notExistsJoined" => {
            Ok(exists::compile(env, key, value)?.and_then(plain))
        }
        k if k.starts_with('$') => Err(Error::Validation(format!("unknown filter operator '{k}'"))),
        field => compile_field(env, field, value, top).map(Some),
    }
}

/// A filter key resolved against the environment.
struct ResolvedKey {
    target: Target,
    path: Vec<PathSeg>,
    op: Option<String>,
    having: bool,
}

fn compile_field(env: &FilterEnv<'_>, key: &str, value: &Value, top: bool) -> Result<Clause> {
    let resolved = resolve_key(env, key, top)?;

    let conditions: Vec<(&str, &Value)> = match (&resolved.op, value) {
        (Some(op), _) => vec![(op.as_str(), value)],
        (None, Value::Object(map)) if !map.is_empty() && map.keys().all(|k| is_operator(k)) => {
            map.iter().map(|(k, v)| (k.as_str(), v)).collect()
        }
        (None, _) => vec![("=", value)],
    };

    let mut parts = Vec::with_capacity(conditions.len());
    for (op, operand) in conditions {
        let target = path_target(&resolved, op, operand)?;
        parts.push(operators::render(&target, op, operand, env.params)?);
    }
    parts.sort();
    let sql = if parts.len() == 1 {
        parts.remove(0)
    } else {
        format!("({})", parts.join(" AND "))
    };
    Ok(Clause {
        sql,
        having: resolved.having,
    })
}

fn resolve_key(env: &FilterEnv<'_>, key: &str, top: bool) -> Result<ResolvedKey> {
    if let Some(base) = resolve_base(env, key, top)? {
        return Ok(ResolvedKey {
            target: base.0,
            path: Vec::new(),
            op: None,
            having: base.1,
        });
    }

    // Longest known base followed by a path or operator suffix.
    let candidates = env
        .items
        .iter()
        .filter(|i| !i.is_joined())
        .map(|i| i.alias.as_str())
        .chain(env.table.column_names());
    let base_name = candidates
        .filter(|name| {
            key.strip_prefix(name)
                .is_some_and(|rest| rest.starts_with("->") || rest.starts_with(".$"))
        })
        .max_by_key(|name| name.len());

    let Some(base_name) = base_name else {
        return Err(Error::Validation(format!("unknown filter field '{key}'")));
    };
    let suffix = parse_suffix(&key[base_name.len()..])?;
    let (target, having) = resolve_base(env, base_name, top)?
        .ok_or_else(|| Error::Validation(format!("unknown filter field '{key}'")))?;
    if !suffix.path.is_empty() && target.udt != Some(UdtType::Json) {
        return Err(Error::Validation(format!(
            "json path used on non-json field '{base_name}'"
        )));
    }
    Ok(ResolvedKey {
        target,
        path: suffix.path,
        op: suffix.op,
        having,
    })
}

// Exact item alias or column. `Ok(None)` when the name is unknown.
fn resolve_base(env: &FilterEnv<'_>, name: &str, top: bool) -> Result<Option<(Target, bool)>> {
    if let Some(item) = env.items.iter().find(|i| i.alias == name && !i.is_joined()) {
        if let Some(denied) = item.fields.iter().find(|f| !env.allowed.contains(f)) {
            return Err(Error::Forbidden(format!(
                "filtering on '{denied}' is not allowed for table '{}'",
                env.table.name
            )));
        }
        if item.is_aggregate() && !top {
            return Err(Error::Validation(format!(
                "aggregate field '{name}' can only be filtered at the top level"
            )));
        }
        let column = item.column_name().and_then(|c| env.table.get_column(c));
        let target = match column {
            Some(col) => column_target(env, col),
            None => Target {
                expr: item.sql(env.alias),
                udt: item.udt,
                cast_type: None,
                udt_name: None,
            },
        };
        return Ok(Some((target, item.is_aggregate())));
    }

    match env.table.get_column(name) {
        Some(col) if env.allowed.iter().any(|a| a == name) => Ok(Some((column_target(env, col), false))),
        Some(_) => Err(Error::Forbidden(format!(
            "filtering on '{name}' is not allowed for table '{}'",
            env.table.name
        ))),
        None => Ok(None),
    }
}

fn column_target(env: &FilterEnv<'_>, col: &Column) -> Target {
    Target {
        expr: qualified(env.alias, &col.name),
        udt: Some(col.udt),
        cast_type: Some(col.cast_type.clone()),
        udt_name: Some(col.udt_name.clone()),
    }
}

// Applies the JSON path to the target for the given operator. Containment
// keeps jsonb; everything else compares the extracted text, cast to match
// the operand.
fn path_target(resolved: &ResolvedKey, op: &str, operand: &Value) -> Result<Target> {
    if resolved.path.is_empty() {
        return Ok(resolved.target.clone());
    }
    let base = &resolved.target.expr;
    if matches!(op, "$contains" | "@>" | "$containedBy" | "<@") {
        let json_path: Vec<PathSeg> = resolved
            .path
            .iter()
            .map(|s| match s {
                PathSeg::Json(k) | PathSeg::Text(k) => PathSeg::Json(k.clone()),
            })
            .collect();
        return Ok(Target {
            expr: json_path::render_path(base, &json_path)?,
            udt: Some(UdtType::Json),
            cast_type: Some("jsonb".to_string()),
            udt_name: Some("jsonb".to_string()),
        });
    }

    let text = json_path::render_path(base, &json_path::as_text_path(&resolved.path))?;
    let sample = match operand {
        Value::Array(items) => items.iter().find(|v| !v.is_null()).unwrap_or(&Value::Null),
        other => other,
    };
    let (expr, udt) = match sample {
        Value::Number(_) => (format!("({text})::numeric"), UdtType::Number),
        Value::Bool(_) => (format!("({text})::boolean"), UdtType::Boolean),
        _ => (text, UdtType::String),
    };
    Ok(Target {
        expr,
        udt: Some(udt),
        cast_type: None,
        udt_name: None,
    })
}

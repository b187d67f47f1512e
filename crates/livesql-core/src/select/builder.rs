//! Projection parsing.

use serde_json::{Map, Value};

use super::functions::{lookup, ArgKind, FunctionDef, FunctionKind};
use super::{FuncArg, ItemKind, SelectItem};
use crate::error::{Error, Result};
use crate::schema::{Schema, TableInfo, UdtType};
use crate::sql::literal;

/// Inputs of [`parse_user_select`].
#[derive(Debug, Clone, Copy)]
pub struct SelectEnv<'a> {
    /// Table being selected from.
    pub table: &'a TableInfo,
    /// Columns the caller may read, in column order.
    pub allowed: &'a [String],
    /// Whole schema, to recognize join targets.
    pub schema: &'a Schema,
    /// Whether nested joins may appear (false for RETURNING).
    pub allow_joins: bool,
}

/// Join flavor of a nested join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// Parent rows are kept without matches.
    Left,
    /// Parent rows without matches are dropped.
    Inner,
}

/// A nested join found in a projection.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    /// Output name of the joined rows.
    pub alias: String,
    /// Target table.
    pub table: String,
    /// Join flavor.
    pub join_type: JoinType,
    /// Explicit route, excluding the source table.
    pub path: Option<Vec<String>>,
    /// Projection on the target.
    pub select: Value,
    /// Filter on the target.
    pub filter: Value,
    /// Ordering of the joined rows.
    pub order_by: Option<Value>,
    /// Cap on joined rows per parent row.
    pub limit: Option<u64>,
    /// Joined rows skipped per parent row.
    pub offset: Option<u64>,
}

/// Output of [`parse_user_select`].
#[derive(Debug, Clone, Default)]
pub struct ParsedSelect {
    /// Items in output order (join results included as `Joined` items).
    pub items: Vec<SelectItem>,
    /// Nested joins, in output order.
    pub joins: Vec<JoinRequest>,
}

impl ParsedSelect {
    fn add_item(&mut self, env: &SelectEnv<'_>, item: SelectItem) -> Result<()> {
        if self.items.iter().any(|i| i.alias == item.alias) {
            return Err(Error::Validation(format!(
                "duplicate select alias '{}'",
                item.alias
            )));
        }
        for field in &item.fields {
            check_field(env, field)?;
        }
        self.items.push(item);
        Ok(())
    }
}

fn check_field(env: &SelectEnv<'_>, field: &str) -> Result<()> {
    if env.allowed.iter().any(|a| a == field) {
        Ok(())
    } else if env.table.has_column(field) {
        Err(Error::Forbidden(format!(
            "field '{field}' of table '{}' is not allowed",
            env.table.name
        )))
    } else {
        Err(Error::Validation(format!(
            "field '{field}' does not exist in table '{}'",
            env.table.name
        )))
    }
}

fn column_item(env: &SelectEnv<'_>, name: &str) -> Result<SelectItem> {
    check_field(env, name)?;
    let column = env.table.get_column(name).ok_or_else(|| {
        Error::Validation(format!(
            "field '{name}' does not exist in table '{}'",
            env.table.name
        ))
    })?;
    Ok(SelectItem::column(column, true))
}

/// Compiles a client projection.
///
/// Accepted forms: `"*"` / null (all allowed columns), `""` (nothing), an
/// array of column names, or an object mapping each alias to `1`/`true`,
/// `0`/`false`, a function name, `{"$fn": [args]}` or a join spec.
///
/// # Errors
///
/// [`Error::Forbidden`] when a column (including a function argument) is not
/// allowed, [`Error::Validation`] for malformed projections, unknown
/// functions and duplicate aliases.
pub fn parse_user_select(select: &Value, env: &SelectEnv<'_>) -> Result<ParsedSelect> {
    let mut parsed = ParsedSelect::default();
    match select {
        Value::Null => add_all(&mut parsed, env, &[])?,
        Value::String(s) if s == "*" => add_all(&mut parsed, env, &[])?,
        Value::String(s) if s.is_empty() => {}
        Value::String(s) => {
            let item = column_item(env, s)?;
            parsed.add_item(env, item)?;
        }
        Value::Array(names) => {
            for name in names {
                let name = name.as_str().ok_or_else(|| {
                    Error::Validation(format!("select entries must be strings, got {name}"))
                })?;
                let item = column_item(env, name)?;
                parsed.add_item(env, item)?;
            }
        }
        Value::Object(map) => parse_object(&mut parsed, env, map)?,
        other => {
            return Err(Error::Validation(format!("invalid select: {other}")));
        }
    }
    Ok(parsed)
}

fn add_all(parsed: &mut ParsedSelect, env: &SelectEnv<'_>, excluded: &[String]) -> Result<()> {
    for name in env.allowed.iter().filter(|a| !excluded.contains(a)) {
        let item = column_item(env, name)?;
        parsed.add_item(env, item)?;
    }
    Ok(())
}

enum Entry<'v> {
    Include(String),
    Exclude(String),
    Item(SelectItem),
    Join(JoinRequest),
    Deferred(&'v str),
}

fn parse_object(parsed: &mut ParsedSelect, env: &SelectEnv<'_>, map: &Map<String, Value>) -> Result<()> {
    let mut entries = Vec::with_capacity(map.len());
    for (key, value) in map {
        entries.push(classify(env, key, value)?);
    }

    let has_include = entries.iter().any(|e| matches!(e, Entry::Include(_)));
    let excluded: Vec<String> = entries
        .iter()
        .filter_map(|e| match e {
            Entry::Exclude(name) => Some(name.clone()),
            _ => None,
        })
        .collect();
    if has_include && !excluded.is_empty() {
        return Err(Error::Validation(
            "cannot mix included and excluded fields in select".into(),
        ));
    }
    for name in &excluded {
        if !env.table.has_column(name) {
            return Err(Error::Validation(format!(
                "excluded field '{name}' does not exist in table '{}'",
                env.table.name
            )));
        }
    }
    if !excluded.is_empty() {
        add_all(parsed, env, &excluded)?;
    }

    for entry in entries {
        match entry {
            Entry::Include(name) => {
                let item = column_item(env, &name)?;
                parsed.add_item(env, item)?;
            }
            Entry::Exclude(_) => {}
            Entry::Item(item) => parsed.add_item(env, item)?,
            Entry::Join(join) => {
                parsed.add_item(env, SelectItem::joined(&join.alias, &join.table))?;
                parsed.joins.push(join);
            }
            Entry::Deferred(key) => {
                return Err(Error::Validation(format!("invalid select entry '{key}'")));
            }
        }
    }
    Ok(())
}

fn is_truthy_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn classify<'v>(env: &SelectEnv<'_>, key: &'v str, value: &Value) -> Result<Entry<'v>> {
    let is_column = env.table.has_column(key);
    let is_table = !is_column && env.schema.get(key).is_some();

    if let Some(include) = is_truthy_flag(value) {
        if is_column {
            return Ok(if include {
                Entry::Include(key.to_string())
            } else {
                Entry::Exclude(key.to_string())
            });
        }
        if is_table && include {
            return join_entry(env, key, key, &Value::String("*".into()), JoinType::Left, None);
        }
        return Err(Error::Validation(format!(
            "field '{key}' does not exist in table '{}'",
            env.table.name
        )));
    }

    match value {
        // Shorthand: {"name": "$upper"} applies the function to column `name`.
        Value::String(func) if func.starts_with('$') => {
            let def = lookup(func)
                .ok_or_else(|| Error::Validation(format!("unknown function '{func}'")))?;
            let item = function_item(env, key, def, &[Value::String(key.to_string())])?;
            Ok(Entry::Item(item))
        }
        Value::String(s) if s == "*" && is_table => {
            join_entry(env, key, key, value, JoinType::Left, None)
        }
        Value::Object(obj) if obj.contains_key("$leftJoin") || obj.contains_key("$innerJoin") => {
            parse_join_spec(env, key, obj)
        }
        Value::Object(obj) if obj.len() == 1 && obj.keys().all(|k| k.starts_with('$')) => {
            let (func, args) = obj.iter().next().ok_or_else(|| {
                Error::Validation(format!("empty function call for '{key}'"))
            })?;
            let def = lookup(func)
                .ok_or_else(|| Error::Validation(format!("unknown function '{func}'")))?;
            let args: Vec<Value> = match args {
                Value::Array(a) => a.clone(),
                Value::Null => Vec::new(),
                single => vec![single.clone()],
            };
            Ok(Entry::Item(function_item(env, key, def, &args)?))
        }
        Value::Object(_) if is_table => join_entry(env, key, key, value, JoinType::Left, None),
        _ => Ok(Entry::Deferred(key)),
    }
}

fn join_entry<'v>(
    env: &SelectEnv<'_>,
    alias: &str,
    table: &str,
    select: &Value,
    join_type: JoinType,
    path: Option<Vec<String>>,
) -> Result<Entry<'v>> {
    if !env.allow_joins {
        return Err(Error::Validation(format!(
            "joins are not allowed here ('{alias}')"
        )));
    }
    Ok(Entry::Join(JoinRequest {
        alias: alias.to_string(),
        table: table.to_string(),
        join_type,
        path,
        select: select.clone(),
        filter: Value::Object(Map::new()),
        order_by: None,
        limit: None,
        offset: None,
    }))
}

fn parse_join_spec<'v>(env: &SelectEnv<'_>, alias: &str, obj: &Map<String, Value>) -> Result<Entry<'v>> {
    let (join_type, target) = match (obj.get("$leftJoin"), obj.get("$innerJoin")) {
        (Some(t), None) => (JoinType::Left, t),
        (None, Some(t)) => (JoinType::Inner, t),
        _ => {
            return Err(Error::Validation(format!(
                "join '{alias}' must have exactly one of $leftJoin / $innerJoin"
            )))
        }
    };

    // The target is a table name or a path whose last element is the table.
    let (table, mut path) = match target {
        Value::String(t) => (t.clone(), None),
        Value::Array(parts) if !parts.is_empty() => {
            let parts = string_list(parts, "join path")?;
            let table = parts.last().cloned().unwrap_or_default();
            let path = if parts.len() > 1 { Some(parts) } else { None };
            (table, path)
        }
        other => {
            return Err(Error::Validation(format!(
                "invalid join target for '{alias}': {other}"
            )))
        }
    };
    if env.schema.get(&table).is_none() {
        return Err(Error::TableNotFound(table));
    }

    let mut request = match join_entry(
        env,
        alias,
        &table,
        obj.get("select").unwrap_or(&Value::String("*".into())),
        join_type,
        None,
    )? {
        Entry::Join(j) => j,
        _ => return Err(Error::Internal("join entry expected".into())),
    };

    for (key, value) in obj {
        match key.as_str() {
            "$leftJoin" | "$innerJoin" | "select" => {}
            "filter" => request.filter = value.clone(),
            "orderBy" => request.order_by = Some(value.clone()),
            "limit" => request.limit = Some(non_negative(value, "limit")?),
            "offset" => request.offset = Some(non_negative(value, "offset")?),
            "$path" => match value {
                Value::Array(parts) => path = Some(string_list(parts, "$path")?),
                other => {
                    return Err(Error::Validation(format!(
                        "$path must be an array of table names, got {other}"
                    )))
                }
            },
            other => {
                return Err(Error::Validation(format!(
                    "unexpected key '{other}' in join '{alias}'"
                )))
            }
        }
    }
    request.path = path;
    Ok(Entry::Join(request))
}

fn string_list(parts: &[Value], what: &str) -> Result<Vec<String>> {
    parts
        .iter()
        .map(|p| {
            p.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::Validation(format!("{what} entries must be strings")))
        })
        .collect()
}

fn non_negative(value: &Value, what: &str) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| Error::Validation(format!("{what} must be a non-negative integer, got {value}")))
}

fn function_item(
    env: &SelectEnv<'_>,
    alias: &str,
    def: &'static FunctionDef,
    raw_args: &[Value],
) -> Result<SelectItem> {
    let raw_args: Vec<Value> = if def.kind == FunctionKind::Computed && raw_args.is_empty() {
        env.allowed.iter().map(|a| Value::String(a.clone())).collect()
    } else {
        raw_args.to_vec()
    };
    if raw_args.len() < def.min_args || raw_args.len() > def.max_args() {
        return Err(Error::Validation(format!(
            "function {} expects {} argument(s), got {}",
            def.name,
            def.min_args,
            raw_args.len()
        )));
    }

    let mut args = Vec::with_capacity(raw_args.len());
    let mut fields = Vec::new();
    for (idx, raw) in raw_args.iter().enumerate() {
        let kind = def.arg_kind(idx).ok_or_else(|| {
            Error::Validation(format!("too many arguments for {}", def.name))
        })?;
        let name = raw.as_str();
        let as_column = match kind {
            ArgKind::Column => {
                let name = name.ok_or_else(|| {
                    Error::Validation(format!(
                        "argument {} of {} must be a column name",
                        idx + 1,
                        def.name
                    ))
                })?;
                check_field(env, name)?;
                true
            }
            ArgKind::Literal => false,
            ArgKind::ColumnOrLiteral => name.is_some_and(|n| env.table.has_column(n)),
        };
        match (as_column, name) {
            (true, Some(column)) => {
                if !fields.iter().any(|f| f == column) {
                    fields.push(column.to_string());
                }
                args.push(FuncArg::Column(column.to_string()));
            }
            _ => args.push(FuncArg::Literal(literal(raw)?)),
        }
    }

    let first_column_udt = fields
        .first()
        .and_then(|f| env.table.get_column(f))
        .map(|c| c.udt);
    let groupable = match def.returns {
        Some(UdtType::Json) => false,
        Some(_) => true,
        None => fields
            .first()
            .and_then(|f| env.table.get_column(f))
            .map_or(true, |c| c.is_groupable()),
    };
    let kind = match def.kind {
        FunctionKind::Scalar => ItemKind::Function { def, args },
        FunctionKind::Aggregate => ItemKind::Aggregation { def, args },
        FunctionKind::Computed => ItemKind::Computed { def, args },
    };
    Ok(SelectItem {
        alias: alias.to_string(),
        kind,
        fields,
        selected: true,
        udt: def.returns.or(first_column_udt),
        groupable,
    })
}

//! Operator table: `(target, operator, operand) -> condition`.

use serde_json::Value;

use super::FilterParams;
use crate::error::{Error, Result};
use crate::schema::UdtType;
use crate::sql::{literal, pg_array_literal, quote_str, typed_literal};

/// The left-hand side of a condition.
#[derive(Debug, Clone)]
pub struct Target {
    /// Rendered SQL expression.
    pub expr: String,
    /// Normalized type of the expression, when known.
    pub udt: Option<UdtType>,
    /// Cast used for typed operands (`integer[]`, `jsonb`, ...).
    pub cast_type: Option<String>,
    /// Raw type name, used to detect `tsvector`.
    pub udt_name: Option<String>,
}

const GEO_OPERATORS: &[&str] = &[
    "&&", "&&&", "&<", "&<|", "&>", "<<", "<<|", ">>", "@", "|&>", "|>>", "~", "~=",
];

const TS_QUERY_FUNCTIONS: &[&str] = &[
    "to_tsquery",
    "plainto_tsquery",
    "phraseto_tsquery",
    "websearch_to_tsquery",
];

const GEO_CONSTRUCTORS: &[&str] = &["ST_MakeEnvelope", "ST_MakePoint"];

/// Whether `key` is an operator rather than a nested field.
#[must_use]
pub fn is_operator(key: &str) -> bool {
    key.starts_with('$')
        || matches!(key, "=" | "<>" | ">" | ">=" | "<" | "<=" | "@>" | "<@" | "@@")
        || GEO_OPERATORS.contains(&key)
}

// Binds `value` when the SQL type of `target` is known. `Ok(None)` leaves
// the operand inline.
fn bind(target: &Target, value: &Value, params: Option<&FilterParams>) -> Result<Option<String>> {
    let Some(params) = params else {
        return Ok(None);
    };
    let cast = match (target.cast_type.as_deref(), target.udt) {
        (Some(cast), _) => cast,
        (None, Some(UdtType::Number)) => "numeric",
        (None, Some(UdtType::Boolean)) => "boolean",
        (None, Some(UdtType::String)) => "text",
        _ => return Ok(None),
    };
    let text = match (target.udt, value) {
        (_, Value::Null) => return Ok(None),
        (Some(UdtType::Json), v) => Value::String(v.to_string()),
        (_, Value::Object(_)) => return Ok(None),
        (_, Value::Array(items)) if cast.ends_with("[]") => Value::String(pg_array_literal(items)?),
        (_, Value::Array(_)) => return Ok(None),
        (_, v) => v.clone(),
    };
    params.bind(text, cast).map(Some)
}

fn text_operand(text: &str, params: Option<&FilterParams>) -> Result<String> {
    match params {
        Some(params) => params.bind(Value::from(text), "text"),
        None => quote_str(text),
    }
}

/// Encodes a scalar operand against `target`.
fn operand(target: &Target, value: &Value, params: Option<&FilterParams>) -> Result<String> {
    if let Some(placeholder) = bind(target, value, params)? {
        return Ok(placeholder);
    }
    match (target.udt, value) {
        (_, Value::Null) => Ok("NULL".to_string()),
        (Some(UdtType::Json), _) => Ok(format!("{}::jsonb", quote_str(&value.to_string())?)),
        (Some(UdtType::Array), Value::Array(_)) => match &target.cast_type {
            Some(cast) => typed_literal(value, cast),
            None => literal(value),
        },
        (Some(UdtType::String | UdtType::Date), Value::Number(_) | Value::Bool(_)) => {
            quote_str(&value.to_string())
        }
        (_, Value::Object(_)) => Err(Error::Validation(format!(
            "unexpected object operand for {}",
            target.expr
        ))),
        _ => literal(value),
    }
}

/// Encodes an operand for containment operators.
fn typed_operand(target: &Target, value: &Value, params: Option<&FilterParams>) -> Result<String> {
    match &target.cast_type {
        Some(cast) if !matches!(value, Value::Null) => match bind(target, value, params)? {
            Some(placeholder) => Ok(placeholder),
            None => typed_literal(value, cast),
        },
        _ => operand(target, value, params),
    }
}

fn array_operand<'v>(op: &str, value: &'v Value) -> Result<&'v [Value]> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| Error::Validation(format!("{op} expects an array")))
}

fn string_operand<'v>(op: &str, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| Error::Validation(format!("{op} expects a string")))
}

/// Renders one condition.
///
/// # Errors
///
/// Returns [`Error::Validation`] for unknown operators and operand shape
/// mismatches.
pub fn render(target: &Target, op: &str, value: &Value, params: Option<&FilterParams>) -> Result<String> {
    let e = &target.expr;
    match op {
        "=" | "$eq" => match value {
            Value::Null => Ok(format!("{e} IS NULL")),
            _ => Ok(format!("{e} = {}", operand(target, value, params)?)),
        },
        "<>" | "$ne" => match value {
            Value::Null => Ok(format!("{e} IS NOT NULL")),
            _ => Ok(format!("{e} <> {}", operand(target, value, params)?)),
        },
        ">" | "$gt" => comparison(target, ">", value, params),
        ">=" | "$gte" => comparison(target, ">=", value, params),
        "<" | "$lt" => comparison(target, "<", value, params),
        "<=" | "$lte" => comparison(target, "<=", value, params),
        "$in" => render_in(target, array_operand(op, value)?, false, params),
        "$nin" => render_in(target, array_operand(op, value)?, true, params),
        "$between" | "$notBetween" => {
            let bounds = array_operand(op, value)?;
            let [low, high] = bounds else {
                return Err(Error::Validation(format!("{op} expects [low, high]")));
            };
            if low.is_null() || high.is_null() {
                return Err(Error::Validation(format!("{op} bounds cannot be null")));
            }
            let not = if op == "$notBetween" { "NOT " } else { "" };
            Ok(format!(
                "{e} {not}BETWEEN {} AND {}",
                operand(target, low, params)?,
                operand(target, high, params)?
            ))
        }
        "$like" | "$ilike" | "$nlike" | "$nilike" => {
            let pattern = text_operand(string_operand(op, value)?, params)?;
            let keyword = match op {
                "$like" => "LIKE",
                "$ilike" => "ILIKE",
                "$nlike" => "NOT LIKE",
                _ => "NOT ILIKE",
            };
            Ok(format!("{e}::text {keyword} {pattern}"))
        }
        "$isNull" => match value {
            Value::Bool(true) => Ok(format!("{e} IS NULL")),
            Value::Bool(false) => Ok(format!("{e} IS NOT NULL")),
            _ => Err(Error::Validation("$isNull expects a boolean".into())),
        },
        "$contains" | "@>" => Ok(format!("{e} @> {}", typed_operand(target, value, params)?)),
        "$containedBy" | "<@" => Ok(format!("{e} <@ {}", typed_operand(target, value, params)?)),
        "$overlaps" | "&&" if target.udt != Some(UdtType::Geometry) => {
            Ok(format!("{e} && {}", typed_operand(target, value, params)?))
        }
        "$tsQuery" | "@@" => render_ts_query(target, value, params),
        geo if GEO_OPERATORS.contains(&geo) || geo == "$overlaps" => {
            if target.udt != Some(UdtType::Geometry) {
                return Err(Error::Validation(format!(
                    "operator {geo} requires a geometry column"
                )));
            }
            let geo = if geo == "$overlaps" { "&&" } else { geo };
            Ok(format!("{e} {geo} {}", geometry_operand(value)?))
        }
        other => Err(Error::Validation(format!("unknown filter operator '{other}'"))),
    }
}

fn comparison(target: &Target, sql_op: &str, value: &Value, params: Option<&FilterParams>) -> Result<String> {
    if value.is_null() {
        return Err(Error::Validation(format!(
            "cannot compare {} {sql_op} NULL",
            target.expr
        )));
    }
    Ok(format!("{} {sql_op} {}", target.expr, operand(target, value, params)?))
}

fn render_in(
    target: &Target,
    items: &[Value],
    negated: bool,
    params: Option<&FilterParams>,
) -> Result<String> {
    let e = &target.expr;
    let has_null = items.iter().any(Value::is_null);
    let values = items
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| operand(target, v, params))
        .collect::<Result<Vec<_>>>()?;
    let list = values.join(", ");

    Ok(match (negated, values.is_empty(), has_null) {
        (false, true, false) => "FALSE".to_string(),
        (false, true, true) => format!("{e} IS NULL"),
        (false, false, false) => format!("{e} IN ({list})"),
        (false, false, true) => format!("({e} IN ({list}) OR {e} IS NULL)"),
        (true, true, false) => "TRUE".to_string(),
        (true, true, true) => format!("{e} IS NOT NULL"),
        // NOT IN drops NULL rows; keep them unless NULL was excluded.
        (true, false, false) => format!("({e} NOT IN ({list}) OR {e} IS NULL)"),
        (true, false, true) => format!("{e} NOT IN ({list})"),
    })
}

fn render_ts_query(target: &Target, value: &Value, params: Option<&FilterParams>) -> Result<String> {
    let vector = if target.udt_name.as_deref() == Some("tsvector") {
        target.expr.clone()
    } else {
        format!("to_tsvector({}::text)", target.expr)
    };
    let query = match value {
        Value::String(s) => format!("to_tsquery({})", text_operand(s, params)?),
        Value::Object(map) if map.len() == 1 => {
            let (func, args) = map.iter().next().ok_or_else(|| {
                Error::Validation("$tsQuery expects {function: [args]}".into())
            })?;
            if !TS_QUERY_FUNCTIONS.contains(&func.as_str()) {
                return Err(Error::Validation(format!(
                    "unsupported text search function '{func}'"
                )));
            }
            let args = args
                .as_array()
                .ok_or_else(|| Error::Validation(format!("{func} expects an array of arguments")))?;
            let rendered = args
                .iter()
                .map(|a| match a {
                    Value::String(s) => text_operand(s, params),
                    _ => Err(Error::Validation(format!("{func} arguments must be strings"))),
                })
                .collect::<Result<Vec<_>>>()?;
            format!("{func}({})", rendered.join(", "))
        }
        _ => {
            return Err(Error::Validation(
                "$tsQuery expects a string or {function: [args]}".into(),
            ))
        }
    };
    Ok(format!("{vector} @@ {query}"))
}

fn geometry_operand(value: &Value) -> Result<String> {
    let shape = || {
        Error::Validation("geometry operators expect {ST_MakeEnvelope|ST_MakePoint: [numbers]}".into())
    };
    let map = value.as_object().filter(|m| m.len() == 1).ok_or_else(shape)?;
    let (func, args) = map.iter().next().ok_or_else(shape)?;
    if !GEO_CONSTRUCTORS.contains(&func.as_str()) {
        return Err(shape());
    }
    let args = args.as_array().ok_or_else(shape)?;
    let numbers = args
        .iter()
        .map(|a| match a {
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(shape()),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("{func}({})", numbers.join(", ")))
}

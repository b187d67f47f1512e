//! ORDER BY parsing.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::schema::TableInfo;
use crate::select::SelectItem;

/// Placement of NULLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nulls {
    /// `NULLS FIRST`.
    First,
    /// `NULLS LAST`.
    Last,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    /// Select-item alias or column name.
    pub key: String,
    /// Ascending when true.
    pub asc: bool,
    /// Explicit NULL placement.
    pub nulls: Option<Nulls>,
    /// Sort empty strings as NULL.
    pub null_empty: bool,
}

impl OrderItem {
    fn new(key: &str, asc: bool) -> Self {
        Self {
            key: key.to_string(),
            asc,
            nulls: None,
            null_empty: false,
        }
    }

    /// `<expr> ASC|DESC [NULLS ...]`, wrapping `expr` when `null_empty`.
    #[must_use]
    pub fn render(&self, expr: &str) -> String {
        let expr = if self.null_empty {
            format!("nullif(trim({expr}::text), '')")
        } else {
            expr.to_string()
        };
        let direction = if self.asc { "ASC" } else { "DESC" };
        match self.nulls {
            Some(Nulls::First) => format!("{expr} {direction} NULLS FIRST"),
            Some(Nulls::Last) => format!("{expr} {direction} NULLS LAST"),
            None => format!("{expr} {direction}"),
        }
    }
}

fn direction(key: &str, value: &Value) -> Result<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
        Value::Number(n) if n.as_i64() == Some(-1) => Ok(false),
        Value::String(s) if s.eq_ignore_ascii_case("asc") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("desc") => Ok(false),
        other => Err(Error::Validation(format!(
            "invalid order direction for '{key}': {other}"
        ))),
    }
}

fn detailed(obj: &Map<String, Value>) -> Result<OrderItem> {
    let key = obj
        .get("key")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation("orderBy entry is missing 'key'".into()))?;
    let mut item = OrderItem::new(key, true);
    for (name, value) in obj {
        match name.as_str() {
            "key" => {}
            "asc" => item.asc = direction(key, value)?,
            "nulls" => {
                item.nulls = match value.as_str() {
                    Some("first") => Some(Nulls::First),
                    Some("last") => Some(Nulls::Last),
                    _ => {
                        return Err(Error::Validation(
                            "orderBy nulls must be 'first' or 'last'".into(),
                        ))
                    }
                }
            }
            "nullEmpty" => {
                item.null_empty = value
                    .as_bool()
                    .ok_or_else(|| Error::Validation("orderBy nullEmpty must be a boolean".into()))?;
            }
            other => {
                return Err(Error::Validation(format!(
                    "unexpected key '{other}' in orderBy entry"
                )))
            }
        }
    }
    Ok(item)
}

fn push_object(out: &mut Vec<OrderItem>, obj: &Map<String, Value>) -> Result<()> {
    if obj.contains_key("key") {
        out.push(detailed(obj)?);
        return Ok(());
    }
    for (key, value) in obj {
        out.push(OrderItem::new(key, direction(key, value)?));
    }
    Ok(())
}

fn raw_items(value: &Value) -> Result<Vec<OrderItem>> {
    let mut out = Vec::new();
    match value {
        Value::Null => {}
        Value::String(key) => out.push(OrderItem::new(key, true)),
        Value::Object(obj) => push_object(&mut out, obj)?,
        Value::Array(entries) => {
            for entry in entries {
                match entry {
                    Value::String(key) => out.push(OrderItem::new(key, true)),
                    Value::Object(obj) => push_object(&mut out, obj)?,
                    other => {
                        return Err(Error::Validation(format!("invalid orderBy entry: {other}")))
                    }
                }
            }
        }
        other => return Err(Error::Validation(format!("invalid orderBy: {other}"))),
    }
    Ok(out)
}

/// Parses an ORDER BY spec and checks every key.
///
/// Accepted: `"col"`, `["a", "b"]`, `{"a": 1, "b": -1}` (also `true`/`false`,
/// `"asc"`/`"desc"`) and `[{key, asc, nulls, nullEmpty}]`. Keys are select
/// item aliases or columns in `allowed`.
///
/// # Errors
///
/// [`Error::Forbidden`] for columns outside `allowed`, [`Error::Validation`]
/// for malformed specs and unknown keys.
pub fn parse_order_by(
    value: &Value,
    items: &[SelectItem],
    table: &TableInfo,
    allowed: &[String],
) -> Result<Vec<OrderItem>> {
    let parsed = raw_items(value)?;
    for item in &parsed {
        if items.iter().any(|i| i.alias == item.key && !i.is_joined()) {
            continue;
        }
        if allowed.contains(&item.key) {
            continue;
        }
        return Err(if table.has_column(&item.key) {
            Error::Forbidden(format!(
                "ordering by '{}' is not allowed for table '{}'",
                item.key, table.name
            ))
        } else {
            Error::Validation(format!("cannot order by unknown field '{}'", item.key))
        });
    }
    Ok(parsed)
}

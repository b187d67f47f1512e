//! SQL text helpers: identifier quoting, literal encoding, indentation.
//!
//! Filters compile to condition strings that are stored in the trigger
//! catalog and evaluated inside triggers, so every operand is inlined through
//! [`literal`] / [`typed_literal`] rather than bound. Both encoders are the
//! only place where client values become SQL text.

use serde_json::Value;

use crate::error::{Error, Result};

/// Double-quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// `"alias"."column"` or `"column"` when no alias is given.
#[must_use]
pub fn qualified(alias: Option<&str>, column: &str) -> String {
    match alias {
        Some(a) => format!("{}.{}", quote_ident(a), quote_ident(column)),
        None => quote_ident(column),
    }
}

/// Single-quotes a string literal, doubling embedded quotes.
///
/// NUL bytes cannot be stored in PostgreSQL text and are rejected.
pub fn quote_str(s: &str) -> Result<String> {
    if s.contains('\0') {
        return Err(Error::Validation(
            "string values cannot contain NUL characters".into(),
        ));
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    Ok(out)
}

/// Encodes a JSON value as an untyped SQL literal.
///
/// Strings stay untyped so PostgreSQL coerces them to the other operand's
/// type. Objects become `jsonb`, arrays become `ARRAY[...]`.
pub fn literal(value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("TRUE".to_string()),
        Value::Bool(false) => Ok("FALSE".to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => quote_str(s),
        Value::Array(items) => {
            let parts = items.iter().map(literal).collect::<Result<Vec<_>>>()?;
            Ok(format!("ARRAY[{}]", parts.join(", ")))
        }
        Value::Object(_) => Ok(format!("{}::jsonb", quote_str(&value.to_string())?)),
    }
}

/// Encodes a value as a literal cast to `cast_type`.
///
/// Arrays targeting array types go through the `{...}` text form, JSON
/// targets get the serialized document.
pub fn typed_literal(value: &Value, cast_type: &str) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Array(items) if cast_type.ends_with("[]") => Ok(format!(
            "{}::{cast_type}",
            quote_str(&pg_array_literal(items)?)?
        )),
        Value::Array(_) | Value::Object(_) => {
            Ok(format!("{}::{cast_type}", quote_str(&value.to_string())?))
        }
        Value::String(s) => Ok(format!("{}::{cast_type}", quote_str(s)?)),
        Value::Bool(_) | Value::Number(_) => {
            Ok(format!("{}::{cast_type}", quote_str(&value.to_string())?))
        }
    }
}

/// Renders a JSON array as PostgreSQL array text (`{"a","b",NULL}`).
pub fn pg_array_literal(items: &[Value]) -> Result<String> {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            Value::Null => out.push_str("NULL"),
            Value::Array(inner) => out.push_str(&pg_array_literal(inner)?),
            Value::String(s) => push_array_element(&mut out, s)?,
            other => push_array_element(&mut out, &other.to_string())?,
        }
    }
    out.push('}');
    Ok(out)
}

fn push_array_element(out: &mut String, s: &str) -> Result<()> {
    if s.contains('\0') {
        return Err(Error::Validation(
            "array values cannot contain NUL characters".into(),
        ));
    }
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    Ok(())
}

/// Converts a value to the text sent for a `$n::text::<type>` bind parameter.
///
/// Returns `None` for SQL NULL.
#[must_use]
pub fn param_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Indents every line of `sql` by `depth` levels of two spaces.
#[must_use]
pub fn indent(sql: &str, depth: usize) -> String {
    if depth == 0 {
        return sql.to_string();
    }
    let pad = "  ".repeat(depth);
    sql.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{pad}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wraps an expression in parentheses.
#[must_use]
pub fn parens(expr: &str) -> String {
    format!("({expr})")
}

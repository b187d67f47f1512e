//! Compound filter keys: `col->key`, `col->>key`, `col.$op`.

use crate::error::{Error, Result};
use crate::sql::quote_str;

/// One JSON path step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    /// `->key`, yields json.
    Json(String),
    /// `->>key`, yields text.
    Text(String),
}

impl PathSeg {
    fn key(&self) -> &str {
        match self {
            Self::Json(k) | Self::Text(k) => k,
        }
    }
}

/// The part of a compound key after the base field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySuffix {
    /// JSON path steps.
    pub path: Vec<PathSeg>,
    /// Trailing `.$op`, if any.
    pub op: Option<String>,
}

/// Parses the remainder of a key after its base field.
///
/// The remainder must start with `->`, `->>` or `.$`.
pub fn parse_suffix(rest: &str) -> Result<KeySuffix> {
    let (path_part, op) = match rest.rfind(".$") {
        Some(idx) => (&rest[..idx], Some(rest[idx + 1..].to_string())),
        None => (rest, None),
    };

    let mut path = Vec::new();
    let mut remaining = path_part;
    while !remaining.is_empty() {
        let (text, after) = if let Some(r) = remaining.strip_prefix("->>") {
            (true, r)
        } else if let Some(r) = remaining.strip_prefix("->") {
            (false, r)
        } else {
            return Err(Error::Validation(format!("invalid json path segment '{remaining}'")));
        };
        let end = after.find("->").unwrap_or(after.len());
        let key = &after[..end];
        if key.is_empty() {
            return Err(Error::Validation("empty json path segment".into()));
        }
        path.push(if text {
            PathSeg::Text(key.to_string())
        } else {
            PathSeg::Json(key.to_string())
        });
        remaining = &after[end..];
    }

    if path
        .iter()
        .take(path.len().saturating_sub(1))
        .any(|s| matches!(s, PathSeg::Text(_)))
    {
        return Err(Error::Validation(
            "->> can only be used on the last json path segment".into(),
        ));
    }
    if path.is_empty() && op.is_none() {
        return Err(Error::Validation(format!("invalid filter key suffix '{rest}'")));
    }
    Ok(KeySuffix { path, op })
}

/// Applies `path` to `expr`. Integer keys index arrays.
pub fn render_path(expr: &str, path: &[PathSeg]) -> Result<String> {
    let mut out = expr.to_string();
    for seg in path {
        let arrow = match seg {
            PathSeg::Json(_) => "->",
            PathSeg::Text(_) => "->>",
        };
        let key = seg.key();
        if key.parse::<i64>().is_ok() {
            out = format!("{out}{arrow}{key}");
        } else {
            out = format!("{out}{arrow}{}", quote_str(key)?);
        }
    }
    Ok(out)
}

/// Turns the last step into a text extraction.
#[must_use]
pub fn as_text_path(path: &[PathSeg]) -> Vec<PathSeg> {
    let mut out = path.to_vec();
    if let Some(last) = out.pop() {
        out.push(PathSeg::Text(last.key().to_string()));
    }
    out
}

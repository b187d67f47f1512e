//! Breadth-first shortest path over the join graph.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use super::JoinGraph;
use crate::error::{Error, Result};

/// Safety cap on path length.
pub const MAX_JOIN_DEPTH: usize = 16;

struct Visit {
    depth: usize,
    parent: Option<String>,
    // Number of distinct shortest paths reaching this table, saturating at 2.
    paths: u8,
}

/// Shortest path `from -> to`, excluding `from`.
///
/// Fails when no path exists or when several shortest paths exist, since the
/// caller must then pick one with `$path`.
pub(super) fn shortest_path(graph: &JoinGraph, from: &str, to: &str) -> Result<Vec<String>> {
    let mut visits: FxHashMap<String, Visit> = FxHashMap::default();
    let mut queue = VecDeque::new();
    visits.insert(
        from.to_string(),
        Visit {
            depth: 0,
            parent: None,
            paths: 1,
        },
    );
    queue.push_back(from.to_string());

    while let Some(current) = queue.pop_front() {
        let (depth, paths) = match visits.get(&current) {
            Some(v) => (v.depth, v.paths),
            None => continue,
        };
        if current == to || depth >= MAX_JOIN_DEPTH {
            continue;
        }
        for neighbor in graph.neighbors(&current) {
            if let Some(v) = visits.get_mut(neighbor) {
                if v.depth == depth + 1 {
                    v.paths = v.paths.saturating_add(paths).min(2);
                }
                continue;
            }
            visits.insert(
                neighbor.to_string(),
                Visit {
                    depth: depth + 1,
                    parent: Some(current.clone()),
                    paths,
                },
            );
            queue.push_back(neighbor.to_string());
        }
    }

    let target = visits.get(to).ok_or_else(|| {
        Error::JoinResolution(format!("disallowed or missing join: {from} -> {to}"))
    })?;
    if target.paths > 1 {
        return Err(Error::JoinResolution(format!(
            "multiple join paths found between {from} and {to}; specify $path"
        )));
    }

    let mut path = Vec::with_capacity(target.depth);
    let mut cursor = Some(to.to_string());
    while let Some(table) = cursor {
        if table == from {
            break;
        }
        cursor = visits.get(&table).and_then(|v| v.parent.clone());
        path.push(table);
    }
    path.reverse();
    Ok(path)
}

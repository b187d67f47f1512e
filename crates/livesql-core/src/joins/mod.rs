//! Join inventory and join path resolution.
//!
//! Joins come from explicit configuration or are inferred from foreign keys.
//! They form an undirected graph keyed by table name; `resolve` returns the
//! hops from a source table to a target table with the column pairs already
//! oriented for the direction of travel.

mod path;

use dashmap::DashMap;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::sql::quote_ident;

/// Relationship cardinality between the two tables of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JoinKind {
    /// `one-one`.
    #[serde(rename = "one-one")]
    OneToOne,
    /// `one-many`.
    #[serde(rename = "one-many")]
    OneToMany,
    /// `many-one`.
    #[default]
    #[serde(rename = "many-one")]
    ManyToOne,
    /// `many-many`.
    #[serde(rename = "many-many")]
    ManyToMany,
}

impl JoinKind {
    /// The same relationship seen from the other table.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::OneToMany => Self::ManyToOne,
            Self::ManyToOne => Self::OneToMany,
            other => other,
        }
    }
}

/// A join between two tables.
///
/// Each condition group maps a column of `tables[0]` to a column of
/// `tables[1]`; groups are alternatives (ORed), pairs within a group are
/// ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// The two joined tables.
    pub tables: [String; 2],
    /// Condition groups.
    pub on: Vec<IndexMap<String, String>>,
    /// Cardinality tag.
    #[serde(rename = "type", default)]
    pub kind: JoinKind,
}

impl Join {
    /// Single-pair join `left.left_col = right.right_col`.
    #[must_use]
    pub fn new(left: &str, left_col: &str, right: &str, right_col: &str, kind: JoinKind) -> Self {
        let mut on = IndexMap::new();
        on.insert(left_col.to_string(), right_col.to_string());
        Self {
            tables: [left.to_string(), right.to_string()],
            on: vec![on],
            kind,
        }
    }

    /// Parses the `[{tables, on, type}]` configuration form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the value does not match.
    pub fn parse_config(value: &Value) -> Result<Vec<Self>> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("invalid joins config: {e}")))
    }

    /// Condition groups oriented so the first column belongs to `from`.
    fn oriented(&self, from: &str) -> Vec<Vec<(String, String)>> {
        let forward = self.tables[0] == from;
        self.on
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|(l, r)| {
                        if forward {
                            (l.clone(), r.clone())
                        } else {
                            (r.clone(), l.clone())
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

/// One step of a join path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinHop {
    /// Table reached by this hop.
    pub table: String,
    /// Condition groups as `(previous_table_column, table_column)` pairs.
    pub on: Vec<Vec<(String, String)>>,
}

impl JoinHop {
    /// Columns of the previous table used by this hop.
    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.on.iter().flatten().map(|(l, _)| l.as_str())
    }

    /// Columns of `self.table` used by this hop.
    pub fn target_columns(&self) -> impl Iterator<Item = &str> {
        self.on.iter().flatten().map(|(_, r)| r.as_str())
    }

    /// ON condition between the quoted `source` and `target` relation
    /// aliases.
    #[must_use]
    pub fn condition(&self, source: &str, target: &str) -> String {
        let groups: Vec<String> = self
            .on
            .iter()
            .map(|group| {
                group
                    .iter()
                    .map(|(l, r)| format!("{source}.{} = {target}.{}", quote_ident(l), quote_ident(r)))
                    .collect::<Vec<_>>()
                    .join(" AND ")
            })
            .collect();
        if groups.len() == 1 {
            groups.into_iter().next().unwrap_or_default()
        } else {
            groups
                .iter()
                .map(|g| format!("({g})"))
                .collect::<Vec<_>>()
                .join(" OR ")
        }
    }
}

/// Undirected join graph with cached shortest paths.
#[derive(Debug, Default)]
pub struct JoinGraph {
    joins: Vec<Join>,
    // table -> (neighbor, index into `joins`)
    adjacency: FxHashMap<String, Vec<(String, usize)>>,
    paths: DashMap<(String, String), Vec<String>>,
}

impl JoinGraph {
    /// Builds a graph from explicit joins, validating them against `schema`.
    ///
    /// Joins between the same pair of tables are merged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JoinResolution`] for self joins, unknown tables or
    /// unknown join columns.
    pub fn new(joins: Vec<Join>, schema: &Schema) -> Result<Self> {
        let mut graph = Self::default();
        for join in joins {
            graph.validate(&join, schema)?;
            graph.add(join);
        }
        Ok(graph)
    }

    /// Infers joins from foreign keys. Self-referencing keys are skipped.
    #[must_use]
    pub fn from_foreign_keys(schema: &Schema) -> Self {
        let mut graph = Self::default();
        for table in schema.tables().filter(|t| !t.is_view) {
            for column in &table.columns {
                let Some(target) = &column.references else {
                    continue;
                };
                if target.table == table.name {
                    tracing::debug!(table = %table.name, column = %column.name, "skipping self-referencing foreign key");
                    continue;
                }
                if schema.get(&target.table).is_none() {
                    continue;
                }
                graph.add(Join::new(
                    &table.name,
                    &column.name,
                    &target.table,
                    &target.column,
                    JoinKind::ManyToOne,
                ));
            }
        }
        graph
    }

    fn validate(&self, join: &Join, schema: &Schema) -> Result<()> {
        let [left, right] = &join.tables;
        if left == right {
            return Err(Error::JoinResolution(
                "Self referencing not supported yet".into(),
            ));
        }
        if join.on.is_empty() || join.on.iter().any(IndexMap::is_empty) {
            return Err(Error::JoinResolution(format!(
                "join {left} <-> {right} has an empty condition"
            )));
        }
        let left_info = schema
            .get(left)
            .ok_or_else(|| Error::JoinResolution(format!("join table '{left}' not found")))?;
        let right_info = schema
            .get(right)
            .ok_or_else(|| Error::JoinResolution(format!("join table '{right}' not found")))?;
        for (l, r) in join.on.iter().flatten() {
            if !left_info.has_column(l) {
                return Err(Error::JoinResolution(format!(
                    "join column '{left}.{l}' does not exist"
                )));
            }
            if !right_info.has_column(r) {
                return Err(Error::JoinResolution(format!(
                    "join column '{right}.{r}' does not exist"
                )));
            }
        }
        Ok(())
    }

    fn add(&mut self, join: Join) {
        let [left, right] = join.tables.clone();
        if let Some(&(_, idx)) = self
            .adjacency
            .get(&left)
            .and_then(|edges| edges.iter().find(|(n, _)| *n == right))
        {
            // Same pair already known: merge condition groups.
            let existing = &mut self.joins[idx];
            let flip = existing.tables[0] != left;
            for group in join.on {
                let group: IndexMap<String, String> = if flip {
                    group.into_iter().map(|(l, r)| (r, l)).collect()
                } else {
                    group
                };
                if !existing.on.contains(&group) {
                    existing.on.push(group);
                }
            }
            return;
        }
        let idx = self.joins.len();
        self.joins.push(join);
        self.adjacency
            .entry(left.clone())
            .or_default()
            .push((right.clone(), idx));
        self.adjacency.entry(right).or_default().push((left, idx));
    }

    /// All joins.
    #[must_use]
    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    /// Tables directly joined to `table`.
    pub fn neighbors(&self, table: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(table)
            .into_iter()
            .flatten()
            .map(|(n, _)| n.as_str())
    }

    /// The direct hop `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JoinResolution`] when the tables are not joined.
    pub fn hop(&self, from: &str, to: &str) -> Result<JoinHop> {
        let idx = self
            .adjacency
            .get(from)
            .and_then(|edges| edges.iter().find(|(n, _)| n == to))
            .map(|(_, idx)| *idx)
            .ok_or_else(|| {
                Error::JoinResolution(format!("disallowed or missing join: {from} -> {to}"))
            })?;
        Ok(JoinHop {
            table: to.to_string(),
            on: self.joins[idx].oriented(from),
        })
    }

    /// Resolves the hops from `from` to `to`.
    ///
    /// With `explicit_path` the given tables are followed (a leading `from`
    /// is ignored, the last entry must be `to`); otherwise the unique
    /// shortest path is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JoinResolution`] for self joins, missing or
    /// ambiguous paths and invalid explicit paths.
    pub fn resolve(
        &self,
        from: &str,
        to: &str,
        explicit_path: Option<&[String]>,
    ) -> Result<Vec<JoinHop>> {
        if from == to {
            return Err(Error::JoinResolution(
                "Self referencing not supported yet".into(),
            ));
        }
        let tables: Vec<String> = match explicit_path {
            Some(path) => {
                let path = match path.first() {
                    Some(first) if first == from => &path[1..],
                    _ => path,
                };
                if path.last().map(String::as_str) != Some(to) {
                    return Err(Error::JoinResolution(format!(
                        "$path must end with the joined table '{to}'"
                    )));
                }
                path.to_vec()
            }
            None => self.cached_path(from, to)?,
        };

        let mut hops = Vec::with_capacity(tables.len());
        let mut prev = from;
        for table in &tables {
            hops.push(self.hop(prev, table)?);
            prev = table;
        }
        Ok(hops)
    }

    fn cached_path(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let key = (from.to_string(), to.to_string());
        if let Some(hit) = self.paths.get(&key) {
            return Ok(hit.clone());
        }
        let path = path::shortest_path(self, from, to)?;
        self.paths.insert(key, path.clone());
        Ok(path)
    }
}

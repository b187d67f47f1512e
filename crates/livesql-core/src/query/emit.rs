//! SQL emission for query trees.
//!
//! A node without joins is a plain grouped/filtered SELECT. A node with
//! joins is emitted as four nested layers so that each parent row collects
//! its joined rows as a JSON array, capped and ordered per parent, in one
//! statement and without LATERAL:
//!
//! 3. parent rows with a synthetic `lsq_ctid` row number,
//! 2. LEFT JOIN of every join path; each joined row carries its JSON and
//!    a global sort position, duplicates from fan-out are numbered,
//! 1. `dense_rank` of joined rows within each parent row,
//! 0. GROUP BY parent row with `json_agg ... FILTER` on rank and duplicates.

use super::{NodeJoin, QueryNode};
use crate::schema::TableInfo;
use crate::select::{JoinType, SelectItem};
use crate::sql::{indent, qualified, quote_ident};

const T3: &str = "lsq_t3";
const T2: &str = "lsq_t2";
const T1: &str = "lsq_t1";
const T0: &str = "lsq_t0";

/// Renders the statement of a query tree.
#[must_use]
pub fn emit(node: &QueryNode) -> String {
    if node.joins.is_empty() {
        emit_leaf(node)
    } else {
        emit_joined(node)
    }
}

/// `SELECT COUNT(*)` over the filtered table.
#[must_use]
pub fn count_sql(table: &TableInfo, where_sql: &str) -> String {
    format!(
        "SELECT COUNT(*)::int8 AS count\nFROM {}{}",
        table.escaped_name(),
        where_clause(where_sql)
    )
}

/// Total byte size of the allowed columns of the filtered rows.
#[must_use]
pub fn size_sql(table: &TableInfo, columns: &[String], where_sql: &str) -> String {
    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT COALESCE(SUM(pg_column_size(lsq_size.*)), 0)::int8 AS size\nFROM (\n{}\n) lsq_size",
        indent(
            &format!(
                "SELECT {}\nFROM {}{}",
                cols.join(", "),
                table.escaped_name(),
                where_clause(where_sql)
            ),
            1
        )
    )
}

fn where_clause(where_sql: &str) -> String {
    if where_sql.is_empty() {
        String::new()
    } else {
        format!("\nWHERE {where_sql}")
    }
}

fn limit_clause(limit: Option<u64>, offset: u64) -> String {
    let mut out = String::new();
    if let Some(limit) = limit {
        out.push_str(&format!("\nLIMIT {limit}"));
    }
    if offset > 0 {
        out.push_str(&format!("\nOFFSET {offset}"));
    }
    out
}

fn subquery(sql: &str, alias: &str) -> String {
    format!("(\n{}\n) {alias}", indent(sql, 1))
}

// Item expression inside a grouped query.
fn grouped_item(item: &SelectItem, alias: Option<&str>, grouped: bool) -> String {
    if grouped && !item.is_aggregate() && !item.groupable {
        format!("(array_agg({}))[1] AS {}", item.sql(alias), quote_ident(&item.alias))
    } else {
        item.sql_as(alias)
    }
}

fn order_expr(node: &QueryNode, key: &str, alias: Option<&str>) -> String {
    node.items
        .iter()
        .find(|i| i.alias == key && !i.is_joined())
        .map_or_else(|| qualified(alias, key), |i| i.sql(alias))
}

fn emit_leaf(node: &QueryNode) -> String {
    let grouped = node.has_aggregates();
    let select: Vec<String> = node
        .items
        .iter()
        .map(|i| grouped_item(i, None, grouped))
        .collect();

    let mut sql = format!("SELECT {}\nFROM {}", select.join(", "), node.relation);
    sql.push_str(&where_clause(&node.filter.where_sql));

    if grouped {
        let positions: Vec<String> = node
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| !i.is_aggregate() && i.groupable)
            .map(|(idx, _)| (idx + 1).to_string())
            .collect();
        if !positions.is_empty() {
            sql.push_str(&format!("\nGROUP BY {}", positions.join(", ")));
        }
    }
    if !node.filter.having_sql.is_empty() {
        sql.push_str(&format!("\nHAVING {}", node.filter.having_sql));
    }

    if node.depth == 0 {
        if !node.order_by.is_empty() {
            let order: Vec<String> = node
                .order_by
                .iter()
                .map(|o| {
                    let position = node.items.iter().position(|i| i.alias == o.key);
                    match position {
                        Some(idx) if !o.null_empty => o.render(&(idx + 1).to_string()),
                        _ => o.render(&order_expr(node, &o.key, None)),
                    }
                })
                .collect();
            sql.push_str(&format!("\nORDER BY {}", order.join(", ")));
        }
        sql.push_str(&limit_clause(node.limit, node.offset));
    }
    sql
}

fn emit_joined(node: &QueryNode) -> String {
    let is_root = node.depth == 0;
    let inner_joins = node.has_inner_joins();

    // Layer 3: parent rows.
    let order: Vec<String> = node
        .order_by
        .iter()
        .map(|o| o.render(&order_expr(node, &o.key, None)))
        .collect();
    let ctid_order = if order.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", order.join(", "))
    };
    let mut layer3 = format!(
        "SELECT *, row_number() over({ctid_order}) AS lsq_ctid\nFROM {}{}",
        node.relation,
        where_clause(&node.filter.where_sql)
    );
    if is_root && !inner_joins {
        if !order.is_empty() {
            layer3.push_str(&format!("\nORDER BY {}", order.join(", ")));
        }
        layer3.push_str(&limit_clause(node.limit, node.offset));
    }

    // Layer 2: joined rows.
    let mut columns = vec![format!("{T3}.*")];
    let mut from = subquery(&layer3, T3);
    for (idx, join) in node.joins.iter().enumerate() {
        let target = format!("lsq_j{idx}");
        columns.push(format!("{target}.lsq_json AS lsq_json_{idx}"));
        columns.push(format!("{target}.lsq_rowid_sorted AS lsq_rowid_sorted_{idx}"));
        columns.push(format!(
            "row_number() over(partition by {target}.lsq_rowid_sorted, {T3}.lsq_ctid) AS lsq_dupes_rowid_{idx}"
        ));
        from.push_str(&join_path_sql(idx, join, &target));
    }
    let layer2 = format!("SELECT {}\nFROM {from}", columns.join(",\n  "));

    // Layer 1: rank per parent row.
    let mut ranks = vec![format!("{T2}.*")];
    for idx in 0..node.joins.len() {
        ranks.push(format!(
            "dense_rank() over(partition by {T2}.lsq_ctid order by {T2}.lsq_rowid_sorted_{idx}) AS lsq_rank_{idx}"
        ));
    }
    let layer1 = format!("SELECT {}\nFROM {}", ranks.join(",\n  "), subquery(&layer2, T2));

    // Root: one row per parent row.
    let mut select = Vec::with_capacity(node.items.len());
    let mut positions = Vec::new();
    for (pos, item) in node.items.iter().enumerate() {
        if item.is_joined() {
            let idx = node
                .joins
                .iter()
                .position(|j| j.node.alias == item.alias);
            match idx {
                Some(idx) => select.push(format!(
                    "{} AS {}",
                    json_agg(idx, &node.joins[idx].node),
                    quote_ident(&item.alias)
                )),
                None => select.push(format!("NULL AS {}", quote_ident(&item.alias))),
            }
        } else {
            if item.groupable {
                positions.push((pos + 1).to_string());
            }
            select.push(grouped_item(item, Some(T1), true));
        }
    }
    positions.push(format!("{T1}.lsq_ctid"));

    let mut sql = format!(
        "SELECT {}\nFROM {}\nGROUP BY {}",
        select.join(",\n  "),
        subquery(&layer1, T1),
        positions.join(", ")
    );
    let required: Vec<String> = node
        .joins
        .iter()
        .enumerate()
        .filter(|(_, j)| j.node.join_type == JoinType::Inner)
        .map(|(idx, _)| format!("bool_or({T1}.lsq_json_{idx} IS NOT NULL)"))
        .collect();
    if !required.is_empty() {
        sql.push_str(&format!("\nHAVING {}", required.join(" AND ")));
    }
    if is_root {
        sql.push_str(&format!("\nORDER BY {T1}.lsq_ctid"));
        if inner_joins {
            sql.push_str(&limit_clause(node.limit, node.offset));
        }
    }
    sql
}

// LEFT JOINs through the intermediate hops and onto the target subquery.
fn join_path_sql(idx: usize, join: &NodeJoin, target: &str) -> String {
    let mut out = String::new();
    let mut prev = T3.to_string();
    let last = join.hops.len().saturating_sub(1);
    for (hop_idx, hop) in join.hops.iter().enumerate() {
        if hop_idx == last {
            out.push_str(&format!(
                "\nLEFT JOIN {} ON ({})",
                subquery(&target_sql(&join.node), target),
                hop.condition(&prev, target)
            ));
        } else {
            let alias = format!("lsq_j{idx}_h{hop_idx}");
            out.push_str(&format!(
                "\nLEFT JOIN {} AS {alias} ON ({})",
                join.relations.get(hop_idx).map_or("", String::as_str),
                hop.condition(&prev, &alias)
            ));
            prev = alias;
        }
    }
    out
}

// Joined node output with a sort position and a JSON document per row.
fn target_sql(child: &QueryNode) -> String {
    let order: Vec<String> = child
        .order_by
        .iter()
        .map(|o| o.render(&qualified(Some(T0), &o.key)))
        .collect();
    let window = if order.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", order.join(", "))
    };
    let fields: Vec<String> = child
        .selected_aliases()
        .map(|a| qualified(Some(T0), a))
        .collect();
    format!(
        "SELECT {T0}.*,\n  row_number() over({window}) AS lsq_rowid_sorted,\n  row_to_json((SELECT lsq_x FROM (SELECT {}) lsq_x)) AS lsq_json\nFROM {}",
        fields.join(", "),
        subquery(&emit(child), T0)
    )
}

fn json_agg(idx: usize, child: &QueryNode) -> String {
    let mut conditions = Vec::new();
    if child.offset > 0 {
        conditions.push(format!("{T1}.lsq_rank_{idx} > {}", child.offset));
    }
    if let Some(limit) = child.limit {
        conditions.push(format!(
            "{T1}.lsq_rank_{idx} <= {}",
            child.offset.saturating_add(limit)
        ));
    }
    conditions.push(format!("{T1}.lsq_dupes_rowid_{idx} = 1"));
    conditions.push(format!("{T1}.lsq_json_{idx} IS NOT NULL"));
    let agg = format!(
        "json_agg({T1}.lsq_json_{idx} ORDER BY {T1}.lsq_rowid_sorted_{idx}) FILTER (WHERE {})",
        conditions.join(" AND ")
    );
    if child.limit == Some(1) {
        format!("({agg})->0")
    } else {
        format!("COALESCE({agg}, '[]')")
    }
}

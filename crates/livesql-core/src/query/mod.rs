//! Query tree builder and SQL emitter.
//!
//! A find request is turned into a [`QueryNode`] tree (one node per joined
//! table) by [`build_query`], with every permission lookup, filter compile
//! and join resolution done up front. [`emit`] then renders the tree into a
//! single statement.

mod emit;
mod order;
mod tree;

pub use emit::{count_sql, emit, size_sql};
pub use order::{parse_order_by, Nulls, OrderItem};
pub use tree::{build_filter, build_query, QueryContext, QueryRequest};

use serde_json::Value;

use crate::filter::CompiledFilter;
use crate::joins::JoinHop;
use crate::select::{JoinType, SelectItem};

/// One table of a query.
#[derive(Debug, Clone)]
pub struct QueryNode {
    /// Table or view name.
    pub table: String,
    /// Quoted, possibly schema-qualified relation of `table`.
    pub relation: String,
    /// Output name: the table for the root, the join alias otherwise.
    pub alias: String,
    /// Items, hidden ones included.
    pub items: Vec<SelectItem>,
    /// Compiled filter, forced filter included.
    pub filter: CompiledFilter,
    /// Sort keys.
    pub order_by: Vec<OrderItem>,
    /// Row cap (per parent row for joined nodes).
    pub limit: Option<u64>,
    /// Rows skipped (per parent row for joined nodes).
    pub offset: u64,
    /// How the node is joined to its parent.
    pub join_type: JoinType,
    /// Nested joins.
    pub joins: Vec<NodeJoin>,
    /// Nesting level, 0 for the root.
    pub depth: usize,
    /// Bound filter operands of the whole tree, set on the root.
    pub params: Vec<Value>,
}

/// A child node with the hops leading to it.
#[derive(Debug, Clone)]
pub struct NodeJoin {
    /// Hops from the parent table; the last one reaches `node.table`.
    pub hops: Vec<JoinHop>,
    /// Quoted relations of the hops, in hop order.
    pub relations: Vec<String>,
    /// Joined node.
    pub node: QueryNode,
}

impl QueryNode {
    /// Whether any item is an aggregate.
    #[must_use]
    pub fn has_aggregates(&self) -> bool {
        self.items.iter().any(SelectItem::is_aggregate)
    }

    /// Whether any nested join is an inner join.
    #[must_use]
    pub fn has_inner_joins(&self) -> bool {
        self.joins
            .iter()
            .any(|j| j.node.join_type == JoinType::Inner)
    }

    /// Aliases present in the output rows.
    pub fn selected_aliases(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|i| i.selected)
            .map(|i| i.alias.as_str())
    }
}

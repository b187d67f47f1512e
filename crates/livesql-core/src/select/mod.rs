//! Select items: the typed projection of a query.
//!
//! A client projection is compiled by [`parse_user_select`] into an ordered
//! list of [`SelectItem`]s plus the nested join requests it contains. Every
//! item knows the columns it reads, which is what permission checks and
//! GROUP BY are computed from.

mod builder;
pub mod functions;

pub use builder::{parse_user_select, JoinRequest, JoinType, ParsedSelect, SelectEnv};
pub use functions::{lookup as lookup_function, FunctionDef, FunctionKind};

use crate::schema::{Column, UdtType};
use crate::sql::{qualified, quote_ident};

/// An argument of a function item.
#[derive(Debug, Clone, PartialEq)]
pub enum FuncArg {
    /// Column reference.
    Column(String),
    /// Already encoded SQL literal.
    Literal(String),
}

/// Variant of a select item.
#[derive(Debug, Clone)]
pub enum ItemKind {
    /// Plain column.
    Column,
    /// Row-level function.
    Function {
        /// Registry entry.
        def: &'static FunctionDef,
        /// Arguments.
        args: Vec<FuncArg>,
    },
    /// Aggregate function.
    Aggregation {
        /// Registry entry.
        def: &'static FunctionDef,
        /// Arguments.
        args: Vec<FuncArg>,
    },
    /// Computed field.
    Computed {
        /// Registry entry.
        def: &'static FunctionDef,
        /// Arguments.
        args: Vec<FuncArg>,
    },
    /// Result of a nested join, produced by the emitter.
    Joined {
        /// Joined table.
        table: String,
    },
}

/// One projected output.
#[derive(Debug, Clone)]
pub struct SelectItem {
    /// Output name, unique within a query.
    pub alias: String,
    /// Variant.
    pub kind: ItemKind,
    /// Columns read by the item.
    pub fields: Vec<String>,
    /// Present in the final output (false for items only needed by joins,
    /// ordering or grouping).
    pub selected: bool,
    /// Normalized result type, when known.
    pub udt: Option<UdtType>,
    /// Result type can be grouped on.
    pub groupable: bool,
}

impl SelectItem {
    /// A column item.
    #[must_use]
    pub fn column(column: &Column, selected: bool) -> Self {
        Self {
            alias: column.name.clone(),
            kind: ItemKind::Column,
            fields: vec![column.name.clone()],
            selected,
            udt: Some(column.udt),
            groupable: column.is_groupable(),
        }
    }

    /// A join result item.
    #[must_use]
    pub fn joined(alias: &str, table: &str) -> Self {
        Self {
            alias: alias.to_string(),
            kind: ItemKind::Joined {
                table: table.to_string(),
            },
            fields: Vec::new(),
            selected: true,
            udt: Some(UdtType::Json),
            groupable: false,
        }
    }

    /// Whether the item is an aggregate.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, ItemKind::Aggregation { .. })
    }

    /// Whether the item is a nested join result.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        matches!(self.kind, ItemKind::Joined { .. })
    }

    /// Column name for plain column items.
    #[must_use]
    pub fn column_name(&self) -> Option<&str> {
        match self.kind {
            ItemKind::Column => self.fields.first().map(String::as_str),
            _ => None,
        }
    }

    /// SQL expression of the item, with columns qualified by `table_alias`.
    #[must_use]
    pub fn sql(&self, table_alias: Option<&str>) -> String {
        match &self.kind {
            ItemKind::Column => qualified(table_alias, &self.fields[0]),
            ItemKind::Function { def, args }
            | ItemKind::Aggregation { def, args }
            | ItemKind::Computed { def, args } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|a| match a {
                        FuncArg::Column(c) => qualified(table_alias, c),
                        FuncArg::Literal(l) => l.clone(),
                    })
                    .collect();
                (def.render)(&rendered)
            }
            ItemKind::Joined { .. } => quote_ident(&self.alias),
        }
    }

    /// `<sql> AS "alias"`.
    #[must_use]
    pub fn sql_as(&self, table_alias: Option<&str>) -> String {
        format!("{} AS {}", self.sql(table_alias), quote_ident(&self.alias))
    }
}

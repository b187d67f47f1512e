//! Introspected table and view metadata.
//!
//! A [`Schema`] is immutable once built. Schema changes are handled by
//! building a new one and swapping it in (see `Dbo::refresh_schema`).

mod introspect;

pub use introspect::{introspect, INTROSPECT_COLUMNS_SQL};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sql::quote_ident;

/// Schema whose tables are emitted unqualified.
pub const DEFAULT_SCHEMA: &str = "public";

/// Normalized column type as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdtType {
    /// Text-like types, uuid, enums.
    String,
    /// Integer, floating point and numeric types.
    Number,
    /// `boolean`.
    Boolean,
    /// Dates, times, timestamps and intervals.
    Date,
    /// `json` and `jsonb`.
    Json,
    /// Any array type.
    Array,
    /// PostGIS `geometry` / `geography`.
    Geometry,
    /// Anything else (bytea, ranges, custom composites).
    Other,
}

impl UdtType {
    /// Maps a `pg_type.typname` / `udt_name` to its normalized type.
    #[must_use]
    pub fn from_udt_name(udt_name: &str) -> Self {
        if udt_name.starts_with('_') {
            return Self::Array;
        }
        match udt_name {
            "int2" | "int4" | "int8" | "float4" | "float8" | "numeric" | "money" | "oid" => {
                Self::Number
            }
            "bool" => Self::Boolean,
            "date" | "timestamp" | "timestamptz" | "time" | "timetz" | "interval" => Self::Date,
            "json" | "jsonb" => Self::Json,
            "geometry" | "geography" => Self::Geometry,
            "text" | "varchar" | "bpchar" | "char" | "name" | "uuid" | "citext" | "inet"
            | "cidr" | "macaddr" | "tsvector" | "xml" => Self::String,
            _ => Self::Other,
        }
    }
}

/// Foreign key target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
}

/// A table or view column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Raw `pg_type` name (`int4`, `_text`, `timestamptz`, ...).
    pub udt_name: String,
    /// Type usable in a `::cast` (`integer[]` style for arrays).
    pub cast_type: String,
    /// Normalized type.
    pub udt: UdtType,
    /// Element type name for arrays.
    pub element_type: Option<String>,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// Part of the primary key.
    pub is_pkey: bool,
    /// Has a column default (serial, `now()`, ...).
    pub has_default: bool,
    /// Foreign key target, if any.
    pub references: Option<ColumnRef>,
}

impl Column {
    /// Creates a nullable, non-key column of the given `udt_name`.
    #[must_use]
    pub fn new(name: impl Into<String>, udt_name: impl Into<String>) -> Self {
        let udt_name = udt_name.into();
        let udt = UdtType::from_udt_name(&udt_name);
        let element_type = udt_name.strip_prefix('_').map(str::to_string);
        let cast_type = match &element_type {
            Some(elem) => format!("{}[]", cast_name(elem)),
            None => cast_name(&udt_name),
        };
        Self {
            name: name.into(),
            udt_name,
            cast_type,
            udt,
            element_type,
            nullable: true,
            is_pkey: false,
            has_default: false,
            references: None,
        }
    }

    /// Marks the column as (part of) the primary key.
    #[must_use]
    pub fn pkey(mut self) -> Self {
        self.is_pkey = true;
        self.nullable = false;
        self
    }

    /// Marks the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Marks the column as having a default.
    #[must_use]
    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    /// Adds a foreign key reference.
    #[must_use]
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ColumnRef {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// Whether values of this type have an equality operator usable in GROUP BY.
    #[must_use]
    pub fn is_groupable(&self) -> bool {
        !matches!(
            self.udt_name.as_str(),
            "json" | "xml" | "point" | "polygon" | "box" | "line" | "lseg" | "path" | "circle"
        )
    }
}

// Builtin type names are plain identifiers; anything else (enums, domains in
// mixed case) needs quoting to be usable in a cast.
fn cast_name(type_name: &str) -> String {
    if type_name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        type_name.to_string()
    } else {
        quote_ident(type_name)
    }
}

/// Metadata for one table or view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Schema name.
    pub schema: String,
    /// Table or view name.
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<Column>,
    /// True for views.
    pub is_view: bool,
    /// Base tables a view reads from.
    pub parent_tables: Vec<String>,
}

impl TableInfo {
    /// Creates an empty table in the `public` schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            name: name.into(),
            columns: Vec::new(),
            is_view: false,
            parent_tables: Vec::new(),
        }
    }

    /// Creates an empty view over `parents`.
    #[must_use]
    pub fn view(name: impl Into<String>, parents: &[&str]) -> Self {
        Self {
            is_view: true,
            parent_tables: parents.iter().map(|p| (*p).to_string()).collect(),
            ..Self::new(name)
        }
    }

    /// Moves the table to `schema`.
    #[must_use]
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the column exists.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.get_column(name).is_some()
    }

    /// Column names in ordinal order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Primary key columns.
    pub fn pkey_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_pkey)
    }

    /// Quoted relation name, schema-qualified outside of `public`.
    ///
    /// Column references keep using the bare table name, which Postgres
    /// resolves against a qualified `FROM` entry as well.
    #[must_use]
    pub fn escaped_name(&self) -> String {
        if self.schema.is_empty() || self.schema == DEFAULT_SCHEMA {
            quote_ident(&self.name)
        } else {
            format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
        }
    }
}

/// All tables and views of the application schema, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    tables: IndexMap<String, TableInfo>,
}

impl Schema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a schema from a list of tables.
    #[must_use]
    pub fn from_tables(tables: impl IntoIterator<Item = TableInfo>) -> Self {
        let mut schema = Self::new();
        for t in tables {
            schema.insert(t);
        }
        schema
    }

    /// Adds or replaces a table.
    pub fn insert(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Looks up a table or view.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    /// Looks up a table or view, failing with [`Error::TableNotFound`].
    pub fn require(&self, name: &str) -> Result<&TableInfo> {
        self.get(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Iterates tables in introspection order.
    pub fn tables(&self) -> impl Iterator<Item = &TableInfo> {
        self.tables.values()
    }

    /// Number of tables and views.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// True when no tables were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

//! Registry of select functions, aggregates and computed fields.
//!
//! Every entry declares its argument shape and renders its SQL from
//! already-rendered arguments (qualified columns or encoded literals).

use crate::schema::UdtType;

/// Role of a function in the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Row-level expression.
    Scalar,
    /// Aggregate, forces GROUP BY.
    Aggregate,
    /// Row-level expression over every allowed column when called without
    /// arguments.
    Computed,
}

/// Expected argument kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Must name an allowed column.
    Column,
    /// Literal value.
    Literal,
    /// Column when the string names an allowed column, literal otherwise.
    ColumnOrLiteral,
}

/// A registered function.
pub struct FunctionDef {
    /// Client-facing name, `$`-prefixed.
    pub name: &'static str,
    /// Role.
    pub kind: FunctionKind,
    /// Argument kinds; the last one repeats when `variadic`.
    pub args: &'static [ArgKind],
    /// Minimum argument count.
    pub min_args: usize,
    /// Whether the last argument kind repeats.
    pub variadic: bool,
    /// Result type, `None` when it follows the first column argument.
    pub returns: Option<UdtType>,
    /// SQL generator.
    pub render: fn(&[String]) -> String,
}

impl std::fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl FunctionDef {
    /// Whether the function is an aggregate.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        self.kind == FunctionKind::Aggregate
    }

    /// Largest accepted argument count.
    #[must_use]
    pub fn max_args(&self) -> usize {
        if self.variadic {
            usize::MAX
        } else {
            self.args.len()
        }
    }

    /// Kind expected at position `idx`.
    #[must_use]
    pub fn arg_kind(&self, idx: usize) -> Option<ArgKind> {
        match self.args.get(idx) {
            Some(kind) => Some(*kind),
            None if self.variadic => self.args.last().copied(),
            None => None,
        }
    }
}

fn arg(args: &[String], idx: usize) -> &str {
    args.get(idx).map_or("NULL", String::as_str)
}

macro_rules! unary {
    ($fn_name:ident, $template:literal) => {
        fn $fn_name(args: &[String]) -> String {
            format!($template, arg(args, 0))
        }
    };
}

macro_rules! binary {
    ($fn_name:ident, $template:literal) => {
        fn $fn_name(args: &[String]) -> String {
            format!($template, arg(args, 0), arg(args, 1))
        }
    };
}

unary!(render_max, "max({})");
unary!(render_min, "min({})");
unary!(render_avg, "avg({})");
unary!(render_sum, "sum({})");
unary!(render_count, "count({})");
unary!(render_array_agg, "array_agg({})");
binary!(render_string_agg, "string_agg({}::text, {})");
unary!(render_upper, "upper({}::text)");
unary!(render_lower, "lower({}::text)");
unary!(render_length, "length({}::text)");
unary!(render_trim, "trim({}::text)");
unary!(render_md5, "md5({}::text)");
binary!(render_left, "left({}::text, {})");
binary!(render_right, "right({}::text, {})");
binary!(render_to_char, "to_char({}, {})");
binary!(render_date_trunc, "date_trunc({}, {})");
binary!(render_date_part, "date_part({}, {})");
unary!(render_date, "({})::date");
unary!(render_st_as_geojson, "ST_AsGeoJSON({})::json");
unary!(render_st_as_text, "ST_AsText({})");

fn render_count_all(_args: &[String]) -> String {
    "count(*)".to_string()
}

fn render_concat(args: &[String]) -> String {
    format!("concat({})", args.join(", "))
}

fn render_age(args: &[String]) -> String {
    format!("age({})", args.join(", "))
}

fn render_rowhash(args: &[String]) -> String {
    format!("md5(json_build_array({})::text)", args.join(", "))
}

const COL: &[ArgKind] = &[ArgKind::Column];
const COL_LIT: &[ArgKind] = &[ArgKind::Column, ArgKind::Literal];
const LIT_COL: &[ArgKind] = &[ArgKind::Literal, ArgKind::Column];
const COL_COL: &[ArgKind] = &[ArgKind::Column, ArgKind::Column];
const ANY: &[ArgKind] = &[ArgKind::ColumnOrLiteral];

const fn def(
    name: &'static str,
    kind: FunctionKind,
    args: &'static [ArgKind],
    returns: Option<UdtType>,
    render: fn(&[String]) -> String,
) -> FunctionDef {
    FunctionDef {
        name,
        kind,
        args,
        min_args: args.len(),
        variadic: false,
        returns,
        render,
    }
}

use FunctionKind::{Aggregate, Computed, Scalar};

/// All functions known to the select compiler.
pub static FUNCTIONS: &[FunctionDef] = &[
    // Aggregates
    def("$max", Aggregate, COL, None, render_max),
    def("$min", Aggregate, COL, None, render_min),
    def("$avg", Aggregate, COL, Some(UdtType::Number), render_avg),
    def("$sum", Aggregate, COL, Some(UdtType::Number), render_sum),
    def("$count", Aggregate, COL, Some(UdtType::Number), render_count),
    def("$countAll", Aggregate, &[], Some(UdtType::Number), render_count_all),
    def("$string_agg", Aggregate, COL_LIT, Some(UdtType::String), render_string_agg),
    def("$array_agg", Aggregate, COL, Some(UdtType::Array), render_array_agg),
    // Strings
    def("$upper", Scalar, COL, Some(UdtType::String), render_upper),
    def("$lower", Scalar, COL, Some(UdtType::String), render_lower),
    def("$length", Scalar, COL, Some(UdtType::Number), render_length),
    def("$trim", Scalar, COL, Some(UdtType::String), render_trim),
    def("$md5", Scalar, COL, Some(UdtType::String), render_md5),
    def("$left", Scalar, COL_LIT, Some(UdtType::String), render_left),
    def("$right", Scalar, COL_LIT, Some(UdtType::String), render_right),
    FunctionDef {
        name: "$concat",
        kind: Scalar,
        args: ANY,
        min_args: 1,
        variadic: true,
        returns: Some(UdtType::String),
        render: render_concat,
    },
    // Dates
    def("$to_char", Scalar, COL_LIT, Some(UdtType::String), render_to_char),
    def("$date_trunc", Scalar, LIT_COL, Some(UdtType::Date), render_date_trunc),
    def("$date_part", Scalar, LIT_COL, Some(UdtType::Number), render_date_part),
    def("$date", Scalar, COL, Some(UdtType::Date), render_date),
    FunctionDef {
        name: "$age",
        kind: Scalar,
        args: COL_COL,
        min_args: 1,
        variadic: false,
        returns: Some(UdtType::Date),
        render: render_age,
    },
    // PostGIS
    def("$ST_AsGeoJSON", Scalar, COL, Some(UdtType::Json), render_st_as_geojson),
    def("$ST_AsText", Scalar, COL, Some(UdtType::String), render_st_as_text),
    // Computed
    FunctionDef {
        name: "$rowhash",
        kind: Computed,
        args: COL,
        min_args: 0,
        variadic: true,
        returns: Some(UdtType::String),
        render: render_rowhash,
    },
];

/// Looks up a function by its `$`-prefixed name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    FUNCTIONS.iter().find(|f| f.name == name)
}

//! Property tests for filter compilation and literal quoting.

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use livesql_core::schema::{Column, Schema, TableInfo};
use livesql_core::sql::{literal, quote_ident};
use livesql_core::{compile_filter, FilterEnv, FilterParams, JoinGraph};

fn schema() -> Schema {
    Schema::from_tables([TableInfo::new("items")
        .column(Column::new("id", "int4").pkey())
        .column(Column::new("name", "text"))
        .column(Column::new("status", "text"))
        .column(Column::new("qty", "int4"))])
}

fn where_sql(filter: &Value) -> String {
    let schema = schema();
    let joins = JoinGraph::from_foreign_keys(&schema);
    let table = schema.require("items").unwrap();
    let allowed: Vec<String> = table.column_names().map(str::to_string).collect();
    compile_filter(&FilterEnv::new(&schema, &joins, table, &allowed), filter)
        .unwrap()
        .where_sql
}

fn bound_sql(filter: &Value) -> (String, Vec<Value>) {
    let schema = schema();
    let joins = JoinGraph::from_foreign_keys(&schema);
    let table = schema.require("items").unwrap();
    let allowed: Vec<String> = table.column_names().map(str::to_string).collect();
    let params = FilterParams::new();
    let env = FilterEnv::new(&schema, &joins, table, &allowed).with_params(&params);
    let sql = compile_filter(&env, filter).unwrap().where_sql;
    (sql, params.take())
}

fn conditions() -> Vec<(&'static str, Value)> {
    vec![
        ("id", json!(3)),
        ("name", json!("a")),
        ("status", json!({ "$in": ["open", "done"] })),
        ("qty", json!({ "$gte": 1, "$lt": 9 })),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: key order of the filter object never changes the SQL
    #[test]
    fn prop_filter_sql_ignores_key_order(order in Just(conditions()).prop_shuffle()) {
        let shuffled: Map<String, Value> = order
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let canonical: Map<String, Value> = conditions()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        prop_assert_eq!(
            where_sql(&Value::Object(shuffled)),
            where_sql(&Value::Object(canonical))
        );
    }

    /// Property: a quoted string literal always decodes back to its input
    #[test]
    fn prop_string_literal_round_trips(text in "[ -~]{0,40}") {
        let quoted = literal(&Value::String(text.clone())).unwrap();

        prop_assert!(quoted.starts_with('\'') && quoted.ends_with('\''));
        let inner = &quoted[1..quoted.len() - 1];
        prop_assert_eq!(inner.replace("''", "'"), text);
    }

    /// Property: bound string operands never reach the SQL text
    #[test]
    fn prop_bound_strings_stay_out_of_sql(text in "[ -~]{1,40}") {
        let (sql, params) = bound_sql(&json!({ "name": { "$like": text.clone() } }));

        prop_assert_eq!(sql, "\"name\"::text LIKE $1::text::text");
        prop_assert_eq!(params, vec![Value::String(text)]);
    }

    /// Property: identifiers are always wrapped and inner quotes doubled
    #[test]
    fn prop_identifier_quoting(name in "[a-z\"]{1,20}") {
        let quoted = quote_ident(&name);
        let inner = &quoted[1..quoted.len() - 1];
        prop_assert_eq!(inner.replace("\"\"", "\""), name);
    }
}

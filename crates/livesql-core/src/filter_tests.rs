//! Tests for filter module

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::filter::*;
    use crate::joins::JoinGraph;
    use crate::schema::{Column, Schema, TableInfo};
    use rustc_hash::FxHashMap;
    use serde_json::{json, Value};

    fn schema() -> Schema {
        Schema::from_tables([
            TableInfo::new("items")
                .column(Column::new("id", "int4").pkey())
                .column(Column::new("name", "text"))
                .column(Column::new("status", "text"))
                .column(Column::new("qty", "int4"))
                .column(Column::new("tags", "_text"))
                .column(Column::new("data", "jsonb"))
                .column(Column::new("geom", "geometry"))
                .column(Column::new("doc", "tsvector"))
                .column(Column::new("body", "text"))
                .column(Column::new("owner_id", "int4").references("users", "id")),
            TableInfo::new("users")
                .column(Column::new("id", "int4").pkey())
                .column(Column::new("name", "text"))
                .column(Column::new("active", "bool")),
        ])
    }

    fn all_columns(table: &TableInfo) -> Vec<String> {
        table.column_names().map(str::to_string).collect()
    }

    fn compile(filter: &Value) -> Result<CompiledFilter, Error> {
        let schema = schema();
        let joins = JoinGraph::from_foreign_keys(&schema);
        let table = schema.require("items")?;
        let allowed = all_columns(table);
        compile_filter(&FilterEnv::new(&schema, &joins, table, &allowed), filter)
    }

    fn where_of(filter: Value) -> String {
        compile(&filter).map(|c| c.where_sql).unwrap_or_else(|e| panic!("{e}"))
    }

    fn users_scope(forced_filter: Option<Value>) -> FxHashMap<String, ExistsScope> {
        let mut scopes = FxHashMap::default();
        scopes.insert(
            "users".to_string(),
            ExistsScope {
                allowed: vec!["id".into(), "name".into(), "active".into()],
                forced_filter,
            },
        );
        scopes
    }

    fn compile_with_users(filter: &Value, forced_filter: Option<Value>) -> Result<String, Error> {
        let schema = schema();
        let joins = JoinGraph::from_foreign_keys(&schema);
        let table = schema.require("items")?;
        let allowed = all_columns(table);
        let scopes = users_scope(forced_filter);
        let env = FilterEnv::new(&schema, &joins, table, &allowed).with_exists(&scopes);
        compile_filter(&env, filter).map(|c| c.where_sql)
    }

    // ========================================================================
    // Equality and comparisons
    // ========================================================================

    #[test]
    fn test_equality_inlines_quoted_literal() {
        // Arrange & Act
        let sql = where_of(json!({ "name": "O'Brien" }));

        // Assert
        assert_eq!(sql, r#""name" = 'O''Brien'"#);
    }

    #[test]
    fn test_null_equality_becomes_is_null() {
        assert_eq!(where_of(json!({ "name": null })), r#""name" IS NULL"#);
        assert_eq!(
            where_of(json!({ "name": { "$ne": null } })),
            r#""name" IS NOT NULL"#
        );
    }

    #[test]
    fn test_multiple_operators_on_one_field_are_sorted() {
        // Arrange & Act
        let sql = where_of(json!({ "qty": { "$gt": 1, "$lt": 5 } }));

        // Assert
        assert_eq!(sql, r#"("qty" < 5 AND "qty" > 1)"#);
    }

    #[test]
    fn test_comparison_with_null_is_rejected() {
        let err = compile(&json!({ "qty": { "$gt": null } })).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_between_and_not_between() {
        assert_eq!(
            where_of(json!({ "qty": { "$between": [1, 3] } })),
            r#""qty" BETWEEN 1 AND 3"#
        );
        assert_eq!(
            where_of(json!({ "qty": { "$notBetween": [1, 3] } })),
            r#""qty" NOT BETWEEN 1 AND 3"#
        );
    }

    #[test]
    fn test_like_family_casts_to_text() {
        assert_eq!(
            where_of(json!({ "name": { "$ilike": "%ab%" } })),
            r#""name"::text ILIKE '%ab%'"#
        );
        assert_eq!(
            where_of(json!({ "name": { "$nlike": "x%" } })),
            r#""name"::text NOT LIKE 'x%'"#
        );
    }

    #[test]
    fn test_is_null_operator() {
        assert_eq!(
            where_of(json!({ "status": { "$isNull": false } })),
            r#""status" IS NOT NULL"#
        );
    }

    // ========================================================================
    // $in / $nin
    // ========================================================================

    #[test]
    fn test_in_with_null_adds_is_null() {
        assert_eq!(
            where_of(json!({ "status": { "$in": ["a", null] } })),
            r#"("status" IN ('a') OR "status" IS NULL)"#
        );
    }

    #[test]
    fn test_nin_without_null_keeps_null_rows() {
        assert_eq!(
            where_of(json!({ "status": { "$nin": ["a", "b"] } })),
            r#"("status" NOT IN ('a', 'b') OR "status" IS NULL)"#
        );
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        assert_eq!(where_of(json!({ "status": { "$in": [] } })), "FALSE");
        assert_eq!(where_of(json!({ "status": { "$nin": [] } })), "TRUE");
    }

    // ========================================================================
    // Logical operators
    // ========================================================================

    #[test]
    fn test_or_of_two_alternatives() {
        assert_eq!(
            where_of(json!({ "$or": [{ "name": "a" }, { "name": "b" }] })),
            r#"("name" = 'a' OR "name" = 'b')"#
        );
    }

    #[test]
    fn test_or_with_empty_alternative_matches_everything() {
        // Arrange & Act
        let compiled = compile(&json!({ "$or": [{}, { "name": "a" }] })).unwrap();

        // Assert
        assert!(compiled.where_sql.is_empty());
        assert_eq!(compiled.condition(), "TRUE");
    }

    #[test]
    fn test_not_wraps_and_empty_not_is_false() {
        assert_eq!(
            where_of(json!({ "$not": { "name": "a" } })),
            r#"NOT ("name" = 'a')"#
        );
        assert_eq!(where_of(json!({ "$not": {} })), "FALSE");
    }

    #[test]
    fn test_key_order_does_not_change_output() {
        // Arrange
        let a = json!({ "qty": 1, "name": "a" });
        let b = json!({ "name": "a", "qty": 1 });

        // Act & Assert
        assert_eq!(where_of(a), where_of(b));
        assert_eq!(
            where_of(json!({ "qty": 1, "name": "a" })),
            r#""name" = 'a' AND "qty" = 1"#
        );
    }

    #[test]
    fn test_null_filter_matches_everything() {
        let compiled = compile(&Value::Null).unwrap();
        assert_eq!(compiled, CompiledFilter::default());
        assert_eq!(compiled.condition(), "TRUE");
    }

    // ========================================================================
    // Arrays and errors
    // ========================================================================

    #[test]
    fn test_array_containment_uses_typed_literal() {
        assert_eq!(
            where_of(json!({ "tags": { "$contains": ["x"] } })),
            r#""tags" @> '{"x"}'::text[]"#
        );
    }

    #[test]
    fn test_field_outside_allow_list_is_forbidden() {
        // Arrange
        let schema = schema();
        let joins = JoinGraph::from_foreign_keys(&schema);
        let table = schema.require("items").unwrap();
        let allowed = vec!["name".to_string()];
        let env = FilterEnv::new(&schema, &joins, table, &allowed);

        // Act
        let err = compile_filter(&env, &json!({ "qty": 1 })).unwrap_err();

        // Assert
        assert!(err.is_forbidden());
    }

    #[test]
    fn test_unknown_field_and_operator_are_rejected() {
        assert!(matches!(
            compile(&json!({ "nope": 1 })).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            compile(&json!({ "$foo": 1 })).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            compile(&json!({ "qty": { "$between": [1] } })).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_non_object_filter_is_rejected() {
        assert!(compile(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_nul_in_string_is_rejected() {
        assert!(compile(&json!({ "name": "a\u{0}b" })).is_err());
    }

    // ========================================================================
    // and_filters
    // ========================================================================

    #[test]
    fn test_and_filters_skips_empty_sides() {
        let a = json!({ "name": "a" });
        assert_eq!(and_filters(&a, None), a);
        assert_eq!(and_filters(&a, Some(&json!({}))), a);
        assert_eq!(and_filters(&json!({}), Some(&a)), a);
        assert_eq!(
            and_filters(&a, Some(&json!({ "qty": 1 }))),
            json!({ "$and": [{ "name": "a" }, { "qty": 1 }] })
        );
    }

    // ========================================================================
    // Bound operands
    // ========================================================================

    fn compile_bound(filter: &Value) -> (String, Vec<Value>) {
        let schema = schema();
        let joins = JoinGraph::from_foreign_keys(&schema);
        let table = schema.require("items").unwrap();
        let allowed = all_columns(table);
        let params = FilterParams::new();
        let env = FilterEnv::new(&schema, &joins, table, &allowed).with_params(&params);
        let sql = compile_filter(&env, filter).unwrap_or_else(|e| panic!("{e}")).where_sql;
        (sql, params.take())
    }

    #[test]
    fn test_bound_operands_use_typed_placeholders() {
        // Arrange & Act
        let (sql, params) = compile_bound(&json!({
            "name": "O'Brien",
            "qty": { "$in": [1, 2, null] },
            "tags": { "$contains": ["x"] }
        }));

        // Assert
        assert_eq!(
            sql,
            r#""name" = $1::text::text AND "tags" @> $4::text::text[] AND ("qty" IN ($2::text::int4, $3::text::int4) OR "qty" IS NULL)"#
        );
        assert_eq!(params, vec![json!("O'Brien"), json!(1), json!(2), json!("{\"x\"}")]);
    }

    #[test]
    fn test_bound_json_path_and_text_search() {
        // Arrange & Act
        let (sql, params) = compile_bound(&json!({
            "data->size": { "$gte": 3 },
            "doc": { "$tsQuery": "cat" }
        }));

        // Assert
        assert_eq!(
            sql,
            r#""doc" @@ to_tsquery($2::text::text) AND ("data"->>'size')::numeric >= $1::text::numeric"#
        );
        assert_eq!(params, vec![json!(3), json!("cat")]);
    }

    #[test]
    fn test_null_and_geometry_operands_stay_inline() {
        let (sql, params) = compile_bound(&json!({
            "name": null,
            "geom": { "&&": { "ST_MakeEnvelope": [0, 0, 1, 1] } }
        }));
        assert_eq!(sql, r#""geom" && ST_MakeEnvelope(0, 0, 1, 1) AND "name" IS NULL"#);
        assert!(params.is_empty());
    }

    #[test]
    fn test_bound_string_with_nul_is_rejected() {
        let params = FilterParams::new();
        assert!(params.bind(json!("a\u{0}b"), "text").is_err());
        assert!(params.is_empty());
    }

    // ========================================================================
    // JSON paths
    // ========================================================================

    #[test]
    fn test_json_path_compares_extracted_text() {
        assert_eq!(
            where_of(json!({ "data->owner->>name": "ann" })),
            r#""data"->'owner'->>'name' = 'ann'"#
        );
    }

    #[test]
    fn test_json_path_casts_for_numeric_operand() {
        // Arrange & Act
        let sql = where_of(json!({ "data->size": { "$gt": 3 } }));

        // Assert
        assert_eq!(sql, r#"("data"->>'size')::numeric > 3"#);
    }

    #[test]
    fn test_json_path_integer_segment_indexes_array() {
        assert_eq!(
            where_of(json!({ "data->items->0->>sku": "x" })),
            r#""data"->'items'->0->>'sku' = 'x'"#
        );
    }

    #[test]
    fn test_json_path_containment_keeps_jsonb() {
        assert_eq!(
            where_of(json!({ "data->tags": { "$contains": ["a"] } })),
            r#""data"->'tags' @> '["a"]'::jsonb"#
        );
    }

    #[test]
    fn test_operator_suffix_on_key() {
        assert_eq!(where_of(json!({ "data.$isNull": true })), r#""data" IS NULL"#);
    }

    #[test]
    fn test_invalid_json_paths_are_rejected() {
        // Path on a non-json column
        assert!(matches!(
            compile(&json!({ "name->x": 1 })).unwrap_err(),
            Error::Validation(_)
        ));
        // Text extraction before the last segment
        assert!(matches!(
            compile(&json!({ "data->>a->b": 1 })).unwrap_err(),
            Error::Validation(_)
        ));
    }

    // ========================================================================
    // Geometry and text search
    // ========================================================================

    #[test]
    fn test_geometry_bounding_box_operators() {
        // Arrange
        let envelope = json!({ "ST_MakeEnvelope": [0, 0, 10, 10] });

        // Act
        let overlaps = where_of(json!({ "geom": { "&&": envelope.clone() } }));
        let named = where_of(json!({ "geom": { "$overlaps": envelope } }));
        let left = where_of(json!({ "geom": { "<<": { "ST_MakePoint": [1.5, 2] } } }));

        // Assert
        assert_eq!(overlaps, r#""geom" && ST_MakeEnvelope(0, 0, 10, 10)"#);
        assert_eq!(named, overlaps);
        assert_eq!(left, r#""geom" << ST_MakePoint(1.5, 2)"#);
    }

    #[test]
    fn test_geometry_operator_rejects_bad_column_or_constructor() {
        assert!(matches!(
            compile(&json!({ "name": { "<<": { "ST_MakePoint": [1, 2] } } })).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            compile(&json!({ "geom": { "~": { "ST_Buffer": [1] } } })).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            compile(&json!({ "geom": { "~": { "ST_MakePoint": ["1"] } } })).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn test_ts_query_on_tsvector_column() {
        assert_eq!(
            where_of(json!({ "doc": { "$tsQuery": "cat & dog" } })),
            r#""doc" @@ to_tsquery('cat & dog')"#
        );
    }

    #[test]
    fn test_ts_query_function_on_text_column() {
        // Arrange & Act
        let sql = where_of(json!({
            "body": { "$tsQuery": { "websearch_to_tsquery": ["english", "cat -dog"] } }
        }));

        // Assert
        assert_eq!(
            sql,
            r#"to_tsvector("body"::text) @@ websearch_to_tsquery('english', 'cat -dog')"#
        );
    }

    #[test]
    fn test_ts_query_rejects_unknown_function() {
        let err = compile(&json!({ "body": { "$tsQuery": { "ts_debug": ["x"] } } })).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    // ========================================================================
    // Exists
    // ========================================================================

    #[test]
    fn test_exists_adds_forced_filter_of_target() {
        // Arrange
        let filter = json!({ "$exists": { "users": { "name": "ann" } } });

        // Act
        let sql = compile_with_users(&filter, Some(json!({ "active": true }))).unwrap();

        // Assert
        assert_eq!(
            sql,
            r#"EXISTS (SELECT 1 FROM "users" WHERE ("users"."name" = 'ann' AND "users"."active" = TRUE))"#
        );
    }

    #[test]
    fn test_not_exists_with_empty_filter() {
        let sql = compile_with_users(&json!({ "$notExists": { "users": {} } }), None).unwrap();
        assert_eq!(sql, r#"NOT EXISTS (SELECT 1 FROM "users")"#);
    }

    #[test]
    fn test_exists_joined_correlates_through_foreign_key() {
        // Arrange
        let filter = json!({ "$existsJoined": { "users": { "name": "ann" } } });

        // Act
        let sql = compile_with_users(&filter, None).unwrap();

        // Assert
        assert_eq!(
            sql,
            r#"EXISTS (SELECT 1 FROM "users" AS "lsq_ex1" WHERE ("items"."owner_id" = "lsq_ex1"."id") AND "lsq_ex1"."name" = 'ann')"#
        );
    }

    #[test]
    fn test_not_exists_joined_keeps_only_join_condition() {
        let sql =
            compile_with_users(&json!({ "$notExistsJoined": { "users": {} } }), None).unwrap();
        assert_eq!(
            sql,
            r#"NOT EXISTS (SELECT 1 FROM "users" AS "lsq_ex1" WHERE ("items"."owner_id" = "lsq_ex1"."id"))"#
        );
    }

    #[test]
    fn test_exists_respects_target_allow_list() {
        // "active" is filterable, "id" is not in this narrowed scope
        let schema = schema();
        let joins = JoinGraph::from_foreign_keys(&schema);
        let table = schema.require("items").unwrap();
        let allowed = all_columns(table);
        let mut scopes = users_scope(None);
        scopes.get_mut("users").unwrap().allowed = vec!["active".into()];
        let env = FilterEnv::new(&schema, &joins, table, &allowed).with_exists(&scopes);

        let err = compile_filter(&env, &json!({ "$exists": { "users": { "id": 1 } } })).unwrap_err();

        assert!(err.is_forbidden());
    }

    #[test]
    fn test_exists_without_permission_is_forbidden() {
        let err = compile(&json!({ "$exists": { "users": {} } })).unwrap_err();
        assert!(err.is_forbidden());
    }

    #[test]
    fn test_nested_exists_is_rejected() {
        // Arrange
        let filter = json!({
            "$exists": { "users": { "$notExists": { "users": { "name": "bob" } } } }
        });

        // Act
        let err = compile_with_users(&filter, None).unwrap_err();

        // Assert
        assert!(matches!(err, Error::Validation(ref m) if m.contains("exists")));
    }

    #[test]
    fn test_referenced_tables_include_join_path() {
        let schema = schema();
        let joins = JoinGraph::from_foreign_keys(&schema);
        let filter = json!({ "$or": [{ "$existsJoined": { "users": {} } }, { "name": "x" }] });

        let tables = referenced_tables(&filter, &joins, "items").unwrap();

        assert_eq!(tables, vec!["users".to_string()]);
    }
}

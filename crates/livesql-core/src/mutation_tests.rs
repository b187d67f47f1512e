//! Tests for mutation module

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use crate::config::QueryConfig;
    use crate::db::{DbClient, DbTransaction, Row};
    use crate::error::{Error, Result};
    use crate::joins::JoinGraph;
    use crate::mutation::*;
    use crate::query::QueryContext;
    use crate::rules::{Access, FieldFilter, InsertRule, RowHook, StaticRules, TableRule, UpdateRule};
    use crate::schema::{Column, Schema, TableInfo};

    /// Records statements and replays queued result sets.
    #[derive(Default, Clone)]
    struct RecordingDb {
        log: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
        responses: Arc<Mutex<VecDeque<Vec<Row>>>>,
    }

    impl RecordingDb {
        fn respond(&self, rows: Value) {
            let rows = serde_json::from_value(rows).unwrap();
            self.responses.lock().push_back(rows);
        }

        fn statements(&self) -> Vec<String> {
            self.log.lock().iter().map(|(sql, _)| sql.clone()).collect()
        }

        fn params(&self, idx: usize) -> Vec<Value> {
            self.log.lock()[idx].1.clone()
        }
    }

    #[async_trait]
    impl DbClient for RecordingDb {
        async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
            self.log.lock().push((sql.to_string(), params.to_vec()));
            Ok(self.responses.lock().pop_front().unwrap_or_default())
        }

        async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            self.log.lock().push((sql.to_string(), params.to_vec()));
            Ok(1)
        }

        async fn batch_execute(&self, sql: &str) -> Result<()> {
            self.log.lock().push((sql.to_string(), Vec::new()));
            Ok(())
        }

        async fn begin(&self) -> Result<Arc<dyn DbTransaction>> {
            self.log.lock().push(("BEGIN".to_string(), Vec::new()));
            Ok(Arc::new(self.clone()))
        }
    }

    #[async_trait]
    impl DbTransaction for RecordingDb {
        async fn commit(&self) -> Result<()> {
            self.log.lock().push(("COMMIT".to_string(), Vec::new()));
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.log.lock().push(("ROLLBACK".to_string(), Vec::new()));
            Ok(())
        }

        fn as_client(self: Arc<Self>) -> Arc<dyn DbClient> {
            self
        }
    }

    struct Fixture {
        schema: Schema,
        joins: JoinGraph,
        config: QueryConfig,
        db: RecordingDb,
    }

    impl Fixture {
        fn new() -> Self {
            let schema = Schema::from_tables([TableInfo::new("items")
                .column(Column::new("id", "int4").pkey().with_default())
                .column(Column::new("name", "text"))
                .column(Column::new("qty", "int4"))
                .column(Column::new("tags", "_text"))
                .column(Column::new("owner_id", "int4"))]);
            let joins = JoinGraph::from_foreign_keys(&schema);
            Self {
                schema,
                joins,
                config: QueryConfig::default(),
                db: RecordingDb::default(),
            }
        }

        fn ctx<'a>(&'a self, access: &'a Access) -> MutationContext<'a> {
            MutationContext {
                query: QueryContext {
                    schema: &self.schema,
                    joins: &self.joins,
                    access,
                    config: &self.config,
                    params: None,
                },
                db: &self.db,
                tx: None,
            }
        }
    }

    fn rules(value: Value) -> Access {
        Access::with_rules(StaticRules::from_json(&value).unwrap(), Value::Null)
    }

    fn with_table_rule(rule: TableRule) -> Access {
        Access::with_rules(StaticRules::new().table("items", rule), Value::Null)
    }

    /// Hook recording the keys it was given, rejecting rows that carry `reject`.
    fn key_recorder(seen: Arc<Mutex<Vec<String>>>, reject: &'static str) -> RowHook {
        Arc::new(move |row: Row| -> BoxFuture<'static, Result<Row>> {
            seen.lock().extend(row.keys().cloned());
            Box::pin(async move {
                if row.contains_key(reject) {
                    return Err(Error::Validation(format!("'{reject}' is not accepted")));
                }
                Ok(row)
            })
        })
    }

    // ========================================================================
    // Insert
    // ========================================================================

    #[tokio::test]
    async fn test_insert_binds_typed_params() {
        // Arrange
        let fx = Fixture::new();
        let access = Access::Trusted;

        // Act
        let result = insert(
            fx.ctx(&access),
            "items",
            &json!({ "qty": 2, "name": "a", "tags": ["x", "y"] }),
            &InsertParams::default(),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(result, MutationResult::None);
        assert_eq!(
            fx.db.statements(),
            vec!["INSERT INTO \"items\" (\"name\", \"qty\", \"tags\")\nVALUES ($1::text::text, $2::text::int4, $3::text::text[])"]
        );
        assert_eq!(fx.db.params(0), vec![json!("a"), json!(2), json!("{\"x\",\"y\"}")]);
    }

    #[tokio::test]
    async fn test_insert_many_fills_missing_cells_with_default() {
        let fx = Fixture::new();
        let access = Access::Trusted;
        insert(
            fx.ctx(&access),
            "items",
            &json!([{ "name": "a" }, { "qty": 1 }]),
            &InsertParams {
                on_conflict_do_nothing: true,
                ..InsertParams::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            fx.db.statements()[0],
            "INSERT INTO \"items\" (\"name\", \"qty\")\nVALUES ($1::text::text, DEFAULT),\n  (DEFAULT, $2::text::int4)\nON CONFLICT DO NOTHING"
        );
    }

    #[tokio::test]
    async fn test_insert_empty_row_uses_default_values() {
        let fx = Fixture::new();
        let access = Access::Trusted;
        insert(fx.ctx(&access), "items", &json!({}), &InsertParams::default())
            .await
            .unwrap();
        assert_eq!(fx.db.statements()[0], "INSERT INTO \"items\" DEFAULT VALUES");
    }

    #[tokio::test]
    async fn test_insert_returning_single_row() {
        // Arrange
        let fx = Fixture::new();
        let access = Access::Trusted;
        fx.db.respond(json!([{ "id": 9 }]));

        // Act
        let result = insert(
            fx.ctx(&access),
            "items",
            &json!({ "name": "a" }),
            &InsertParams {
                returning: Some(json!(["id"])),
                ..InsertParams::default()
            },
        )
        .await
        .unwrap();

        // Assert
        assert!(fx.db.statements()[0].ends_with("\nRETURNING \"id\" AS \"id\""));
        assert_eq!(result.into_value(), json!({ "id": 9 }));
    }

    #[tokio::test]
    async fn test_disallowed_field_fails_before_sql() {
        // Arrange
        let fx = Fixture::new();
        let access = rules(json!({ "items": { "insert": { "fields": ["name"] } } }));

        // Act
        let err = insert(fx.ctx(&access), "items", &json!({ "qty": 1 }), &InsertParams::default())
            .await
            .unwrap_err();

        // Assert
        assert!(err.is_forbidden());
        assert!(fx.db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_fix_issues_drops_bad_fields_and_applies_forced_data() {
        let fx = Fixture::new();
        let access = rules(json!({
            "items": { "insert": { "fields": ["name"], "forcedData": { "owner_id": 7 } } }
        }));
        insert(
            fx.ctx(&access),
            "items",
            &json!({ "name": "a", "qty": 1, "ghost": true }),
            &InsertParams {
                fix_issues: true,
                ..InsertParams::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            fx.db.statements()[0],
            "INSERT INTO \"items\" (\"name\", \"owner_id\")\nVALUES ($1::text::text, $2::text::int4)"
        );
    }

    #[tokio::test]
    async fn test_post_validate_failure_rolls_back() {
        // Arrange
        let fx = Fixture::new();
        let rule = InsertRule {
            fields: FieldFilter::All,
            post_validate: Some(Arc::new(
                |_row: Row, _tx: Arc<dyn DbTransaction>| -> BoxFuture<'static, Result<()>> {
                    Box::pin(async { Err(Error::Validation("rejected".into())) })
                },
            )),
            ..InsertRule::default()
        };
        let access = Access::with_rules(
            StaticRules::new().table(
                "items",
                TableRule {
                    insert: Some(rule),
                    ..TableRule::default()
                },
            ),
            Value::Null,
        );
        fx.db.respond(json!([{ "lsq_full": { "id": 1, "name": "a" } }]));

        // Act
        let err = insert(fx.ctx(&access), "items", &json!({ "name": "a" }), &InsertParams::default())
            .await
            .unwrap_err();

        // Assert
        assert!(matches!(err, Error::Validation(_)));
        let log = fx.db.statements();
        assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
        assert!(log[1].contains("row_to_json(\"items\".*) AS \"lsq_full\""));
        assert_eq!(log.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn test_pre_validate_sees_unfiltered_payload_and_can_reject() {
        // Arrange
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let access = with_table_rule(TableRule {
            insert: Some(InsertRule {
                fields: FieldFilter::Include(vec!["name".into()]),
                pre_validate: Some(key_recorder(seen.clone(), "qty")),
                ..InsertRule::default()
            }),
            ..TableRule::default()
        });

        // Act
        let err = insert(
            fx.ctx(&access),
            "items",
            &json!({ "name": "a", "qty": 1 }),
            &InsertParams {
                fix_issues: true,
                ..InsertParams::default()
            },
        )
        .await
        .unwrap_err();

        // Assert
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(*seen.lock(), vec!["name".to_string(), "qty".to_string()]);
        assert!(fx.db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_pre_validate_output_goes_through_field_checks() {
        // Arrange
        let fx = Fixture::new();
        let strip_qty: RowHook = Arc::new(|mut row: Row| -> BoxFuture<'static, Result<Row>> {
            row.remove("qty");
            Box::pin(async move { Ok(row) })
        });
        let access = with_table_rule(TableRule {
            insert: Some(InsertRule {
                fields: FieldFilter::Include(vec!["name".into()]),
                pre_validate: Some(strip_qty),
                ..InsertRule::default()
            }),
            ..TableRule::default()
        });

        // Act
        insert(
            fx.ctx(&access),
            "items",
            &json!({ "name": "a", "qty": 1 }),
            &InsertParams::default(),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(
            fx.db.statements()[0],
            "INSERT INTO \"items\" (\"name\")\nVALUES ($1::text::text)"
        );
    }

    // ========================================================================
    // Update and upsert
    // ========================================================================

    #[tokio::test]
    async fn test_update_pre_validate_sees_pinned_fields() {
        // Arrange
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let access = with_table_rule(TableRule {
            update: Some(UpdateRule {
                forced_filter: Some(json!({ "owner_id": 7 })),
                pre_validate: Some(key_recorder(seen.clone(), "owner_id")),
                ..UpdateRule::default()
            }),
            ..TableRule::default()
        });

        // Act
        let err = update(
            fx.ctx(&access),
            "items",
            &json!({ "id": 1 }),
            &json!({ "name": "b", "owner_id": 9 }),
            &UpdateParams::default(),
        )
        .await
        .unwrap_err();

        // Assert
        assert!(matches!(err, Error::Validation(_)));
        assert!(seen.lock().contains(&"owner_id".to_string()));
        assert!(fx.db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_update_statement_shape() {
        let fx = Fixture::new();
        let access = Access::Trusted;
        update(
            fx.ctx(&access),
            "items",
            &json!({ "id": 1 }),
            &json!({ "name": "b" }),
            &UpdateParams::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            fx.db.statements(),
            vec!["UPDATE \"items\"\nSET \"name\" = $1::text::text\nWHERE \"id\" = 1"]
        );
    }

    #[tokio::test]
    async fn test_update_drops_fields_pinned_by_forced_filter() {
        // Arrange
        let fx = Fixture::new();
        let access = rules(json!({
            "items": { "update": { "fields": "*", "forcedFilter": { "owner_id": 7 } } }
        }));

        // Act
        update(
            fx.ctx(&access),
            "items",
            &json!({ "id": 1 }),
            &json!({ "name": "b", "owner_id": 9 }),
            &UpdateParams::default(),
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(
            fx.db.statements()[0],
            "UPDATE \"items\"\nSET \"name\" = $1::text::text\nWHERE \"id\" = 1 AND \"owner_id\" = 7"
        );
    }

    #[tokio::test]
    async fn test_single_row_update_refuses_many_matches() {
        // Arrange
        let fx = Fixture::new();
        let access = Access::Trusted;
        fx.db.respond(json!([{ "count": 2 }]));

        // Act
        let err = update(
            fx.ctx(&access),
            "items",
            &json!({ "qty": 1 }),
            &json!({ "name": "b" }),
            &UpdateParams {
                multi: false,
                ..UpdateParams::default()
            },
        )
        .await
        .unwrap_err();

        // Assert
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(fx.db.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_update_without_data_is_rejected() {
        let fx = Fixture::new();
        let access = Access::Trusted;
        let err = update(fx.ctx(&access), "items", &json!({}), &json!({}), &UpdateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_upsert_inserts_filter_values_when_missing() {
        // Arrange
        let fx = Fixture::new();
        let access = Access::Trusted;

        // Act
        upsert(
            fx.ctx(&access),
            "items",
            &json!({ "id": 5 }),
            &json!({ "name": "x" }),
            &UpdateParams::default(),
        )
        .await
        .unwrap();

        // Assert
        let log = fx.db.statements();
        assert_eq!(log[0], "SELECT 1 AS found\nFROM \"items\"\nWHERE \"id\" = 5\nLIMIT 1");
        assert_eq!(
            log[1],
            "INSERT INTO \"items\" (\"id\", \"name\")\nVALUES ($1::text::int4, $2::text::text)"
        );
    }

    #[tokio::test]
    async fn test_upsert_updates_existing_rows() {
        let fx = Fixture::new();
        let access = Access::Trusted;
        fx.db.respond(json!([{ "found": 1 }]));
        upsert(
            fx.ctx(&access),
            "items",
            &json!({ "id": 5 }),
            &json!({ "name": "x" }),
            &UpdateParams::default(),
        )
        .await
        .unwrap();
        assert!(fx.db.statements()[1].starts_with("UPDATE \"items\""));
    }

    #[tokio::test]
    async fn test_upsert_twice_inserts_once() {
        // Arrange
        let fx = Fixture::new();
        let access = Access::Trusted;
        let filter = json!({ "id": 5 });
        let data = json!({ "name": "x" });

        // Act
        upsert(fx.ctx(&access), "items", &filter, &data, &UpdateParams::default())
            .await
            .unwrap();
        // The row written by the first call is now found by the existence check.
        fx.db.respond(json!([{ "found": 1 }]));
        upsert(fx.ctx(&access), "items", &filter, &data, &UpdateParams::default())
            .await
            .unwrap();

        // Assert
        let log = fx.db.statements();
        let inserts = log.iter().filter(|s| s.starts_with("INSERT INTO")).count();
        assert_eq!(inserts, 1);
        assert_eq!(log.len(), 4);
        assert!(log[2].starts_with("SELECT 1 AS found"));
        assert_eq!(log[3], "UPDATE \"items\"\nSET \"name\" = $1::text::text\nWHERE \"id\" = 5");
    }

    // ========================================================================
    // Delete
    // ========================================================================

    #[tokio::test]
    async fn test_delete_with_returning() {
        // Arrange
        let fx = Fixture::new();
        let access = Access::Trusted;
        fx.db.respond(json!([{ "id": 1 }, { "id": 2 }]));

        // Act
        let result = delete(
            fx.ctx(&access),
            "items",
            &json!({ "qty": { "$gt": 3 } }),
            &DeleteParams {
                returning: Some(json!(["id"])),
            },
        )
        .await
        .unwrap();

        // Assert
        assert_eq!(
            fx.db.statements()[0],
            "DELETE FROM \"items\"\nWHERE \"qty\" > 3\nRETURNING \"id\" AS \"id\""
        );
        assert_eq!(result.into_rows().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_needs_a_rule() {
        let fx = Fixture::new();
        let access = rules(json!({ "items": { "select": { "fields": "*" } } }));
        let err = delete(fx.ctx(&access), "items", &json!({}), &DeleteParams::default())
            .await
            .unwrap_err();
        assert!(err.is_forbidden());
    }
}

//! Tests for rules module

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::rules::*;
    use crate::schema::{Column, TableInfo};
    use serde_json::{json, Value};

    fn items() -> TableInfo {
        TableInfo::new("items")
            .column(Column::new("id", "int4").pkey())
            .column(Column::new("name", "text"))
            .column(Column::new("secret", "text"))
    }

    // ========================================================================
    // FieldFilter
    // ========================================================================

    #[test]
    fn test_field_filter_forms() {
        assert_eq!(FieldFilter::parse(&json!("*")).unwrap(), FieldFilter::All);
        assert_eq!(FieldFilter::parse(&json!("")).unwrap(), FieldFilter::None);
        assert_eq!(FieldFilter::parse(&json!([])).unwrap(), FieldFilter::None);
        assert_eq!(
            FieldFilter::parse(&json!(["id", "name"])).unwrap(),
            FieldFilter::Include(vec!["id".into(), "name".into()])
        );
        assert_eq!(
            FieldFilter::parse(&json!({ "secret": 0 })).unwrap(),
            FieldFilter::Exclude(vec!["secret".into()])
        );
        assert_eq!(
            FieldFilter::parse(&json!({ "id": true })).unwrap(),
            FieldFilter::Include(vec!["id".into()])
        );
    }

    #[test]
    fn test_field_filter_rejects_mixed_and_bad_entries() {
        assert!(matches!(
            FieldFilter::parse(&json!({ "id": 1, "secret": 0 })),
            Err(Error::Validation(_))
        ));
        assert!(FieldFilter::parse(&json!({ "id": 2 })).is_err());
        assert!(FieldFilter::parse(&json!([1])).is_err());
        assert!(FieldFilter::parse(&json!(5)).is_err());
    }

    #[test]
    fn test_field_filter_resolves_in_column_order() {
        // Arrange
        let table = items();
        let include = FieldFilter::Include(vec!["name".into(), "id".into()]);
        let exclude = FieldFilter::Exclude(vec!["secret".into()]);

        // Act & Assert
        assert_eq!(include.resolve(&table).unwrap(), vec!["id", "name"]);
        assert_eq!(exclude.resolve(&table).unwrap(), vec!["id", "name"]);
        assert!(FieldFilter::None.resolve(&table).unwrap().is_empty());
        assert!(FieldFilter::Include(vec!["nope".into()]).resolve(&table).is_err());
    }

    #[test]
    fn test_field_filter_allows() {
        assert!(FieldFilter::All.allows("x"));
        assert!(!FieldFilter::None.allows("x"));
        assert!(!FieldFilter::Exclude(vec!["x".into()]).allows("x"));
    }

    // ========================================================================
    // Rule lookup
    // ========================================================================

    #[tokio::test]
    async fn test_trusted_access_is_unrestricted() {
        let permit = Access::Trusted.permit("anything", Command::Delete).await.unwrap();
        assert!(permit.is_unrestricted());
        assert!(permit.delete("anything").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_rule_denies() {
        let access = Access::with_rules(StaticRules::new(), Value::Null);
        let err = access.permit("items", Command::Select).await.unwrap_err();
        assert!(err.is_forbidden());
    }

    #[tokio::test]
    async fn test_missing_section_denies_that_command_only() {
        // Arrange
        let rules = StaticRules::from_json(&json!({
            "items": { "select": { "fields": { "secret": 0 } } }
        }))
        .unwrap();
        let access = Access::with_rules(rules, json!({ "user": 1 }));

        // Act
        let permit = access.permit("items", Command::Update).await.unwrap();

        // Assert
        assert!(permit.update("items").unwrap_err().is_forbidden());
        assert!(permit.select("items").unwrap().is_some());
        assert_eq!(permit.select_fields(&items()).unwrap(), vec!["id", "name"]);
        assert!(permit.subscribe().is_none());
    }

    #[test]
    fn test_rules_from_json_parse_all_sections() {
        // Arrange
        let value = json!({
            "items": {
                "insert": { "fields": ["name"], "forcedData": { "owner": 1 } },
                "update": { "fields": "*", "forcedFilter": { "owner": 1 } },
                "delete": { "filterFields": "*" },
                "sync": { "id_fields": ["id"], "synced_field": "synced", "allow_delete": true },
                "subscribe": { "throttle_ms": 500 }
            }
        });

        // Act
        let rules = StaticRules::from_json(&value);

        // Assert
        assert!(rules.is_ok());
    }

    #[test]
    fn test_rules_from_json_rejects_bad_field_list() {
        let err = StaticRules::from_json(&json!({ "items": { "select": { "fields": 3 } } }))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

//! Tests for joins module

#[cfg(test)]
mod tests {
    use crate::error::Error;
    use crate::joins::*;
    use crate::schema::{Column, Schema, TableInfo};
    use serde_json::json;

    fn shop() -> Schema {
        Schema::from_tables([
            TableInfo::new("regions").column(Column::new("id", "int4").pkey()),
            TableInfo::new("customers")
                .column(Column::new("id", "int4").pkey())
                .column(Column::new("region_id", "int4").references("regions", "id"))
                .column(Column::new("referrer_id", "int4").references("customers", "id")),
            TableInfo::new("orders")
                .column(Column::new("id", "int4").pkey())
                .column(Column::new("customer_id", "int4").references("customers", "id")),
            TableInfo::new("lines")
                .column(Column::new("id", "int4").pkey())
                .column(Column::new("order_id", "int4").references("orders", "id")),
        ])
    }

    fn diamond() -> Schema {
        Schema::from_tables(["a", "b", "c", "d"].map(|name| {
            TableInfo::new(name)
                .column(Column::new("id", "int4").pkey())
                .column(Column::new("ref", "int4"))
        }))
    }

    fn hop_tables(hops: &[JoinHop]) -> Vec<&str> {
        hops.iter().map(|h| h.table.as_str()).collect()
    }

    // ========================================================================
    // Foreign key inference
    // ========================================================================

    #[test]
    fn test_foreign_keys_form_a_graph() {
        // Arrange
        let graph = JoinGraph::from_foreign_keys(&shop());

        // Act
        let hops = graph.resolve("lines", "regions", None).unwrap();

        // Assert
        assert_eq!(hop_tables(&hops), vec!["orders", "customers", "regions"]);
        assert_eq!(graph.joins().len(), 3);
    }

    #[test]
    fn test_self_referencing_foreign_key_is_skipped() {
        let graph = JoinGraph::from_foreign_keys(&shop());
        assert!(graph.neighbors("customers").all(|n| n != "customers"));
    }

    #[test]
    fn test_hop_orients_columns_for_direction_of_travel() {
        // Arrange
        let graph = JoinGraph::from_foreign_keys(&shop());

        // Act
        let forward = graph.hop("orders", "customers").unwrap();
        let backward = graph.hop("customers", "orders").unwrap();

        // Assert
        assert_eq!(forward.on, vec![vec![("customer_id".to_string(), "id".to_string())]]);
        assert_eq!(backward.on, vec![vec![("id".to_string(), "customer_id".to_string())]]);
        assert_eq!(
            forward.condition("\"o\"", "\"c\""),
            r#""o"."customer_id" = "c"."id""#
        );
    }

    // ========================================================================
    // Resolution errors
    // ========================================================================

    #[test]
    fn test_self_join_is_rejected() {
        let graph = JoinGraph::from_foreign_keys(&shop());
        let err = graph.resolve("orders", "orders", None).unwrap_err();
        assert!(matches!(err, Error::JoinResolution(_)));
    }

    #[test]
    fn test_missing_path_is_rejected() {
        let schema = shop();
        let graph = JoinGraph::new(Vec::new(), &schema).unwrap();
        let err = graph.resolve("orders", "regions", None).unwrap_err();
        assert!(matches!(err, Error::JoinResolution(_)));
    }

    #[test]
    fn test_ambiguous_path_needs_explicit_path() {
        // Arrange
        let schema = diamond();
        let joins = vec![
            Join::new("a", "id", "b", "ref", JoinKind::OneToMany),
            Join::new("a", "id", "c", "ref", JoinKind::OneToMany),
            Join::new("b", "id", "d", "ref", JoinKind::OneToMany),
            Join::new("c", "id", "d", "ref", JoinKind::OneToMany),
        ];
        let graph = JoinGraph::new(joins, &schema).unwrap();

        // Act
        let ambiguous = graph.resolve("a", "d", None);
        let explicit = graph.resolve("a", "d", Some(["c".to_string(), "d".to_string()].as_slice()));

        // Assert
        assert!(matches!(ambiguous, Err(Error::JoinResolution(_))));
        assert_eq!(hop_tables(&explicit.unwrap()), vec!["c", "d"]);
    }

    #[test]
    fn test_explicit_path_must_end_with_target() {
        let graph = JoinGraph::from_foreign_keys(&shop());
        let path = vec!["orders".to_string()];
        assert!(graph.resolve("lines", "customers", Some(path.as_slice())).is_err());
    }

    #[test]
    fn test_explicit_path_may_start_with_source() {
        let graph = JoinGraph::from_foreign_keys(&shop());
        let path = vec!["lines".to_string(), "orders".to_string()];
        let hops = graph.resolve("lines", "orders", Some(path.as_slice())).unwrap();
        assert_eq!(hop_tables(&hops), vec!["orders"]);
    }

    // ========================================================================
    // Explicit configuration
    // ========================================================================

    #[test]
    fn test_parse_config_and_validate() {
        // Arrange
        let config = json!([
            { "tables": ["orders", "lines"], "on": [{ "id": "order_id" }], "type": "one-many" }
        ]);

        // Act
        let joins = Join::parse_config(&config).unwrap();
        let graph = JoinGraph::new(joins, &shop()).unwrap();

        // Assert
        assert_eq!(graph.joins()[0].kind, JoinKind::OneToMany);
        assert_eq!(graph.neighbors("lines").collect::<Vec<_>>(), vec!["orders"]);
    }

    #[test]
    fn test_config_with_unknown_column_is_rejected() {
        let joins = vec![Join::new("orders", "nope", "lines", "order_id", JoinKind::OneToMany)];
        let err = JoinGraph::new(joins, &shop()).unwrap_err();
        assert!(matches!(err, Error::JoinResolution(_)));
    }

    #[test]
    fn test_config_self_join_is_rejected() {
        let joins = vec![Join::new("orders", "id", "orders", "id", JoinKind::OneToOne)];
        assert!(JoinGraph::new(joins, &shop()).is_err());
    }

    #[test]
    fn test_same_pair_joins_are_merged() {
        // Arrange
        let joins = vec![
            Join::new("orders", "id", "lines", "order_id", JoinKind::OneToMany),
            Join::new("lines", "id", "orders", "id", JoinKind::ManyToOne),
        ];

        // Act
        let graph = JoinGraph::new(joins, &shop()).unwrap();
        let hop = graph.hop("orders", "lines").unwrap();

        // Assert
        assert_eq!(graph.joins().len(), 1);
        assert_eq!(hop.on.len(), 2);
        assert!(hop.condition("\"p\"", "\"c\"").contains(" OR "));
    }

    #[test]
    fn test_join_kind_reversed() {
        assert_eq!(JoinKind::OneToMany.reversed(), JoinKind::ManyToOne);
        assert_eq!(JoinKind::ManyToMany.reversed(), JoinKind::ManyToMany);
    }
}

//! Tests for error module

#[cfg(test)]
mod tests {
    use crate::error::*;
    use crate::sqlstate;
    use std::collections::HashSet;

    fn all_variants() -> Vec<Error> {
        vec![
            Error::Forbidden("f".into()),
            Error::Validation("v".into()),
            Error::JoinResolution("j".into()),
            Error::Database(DbErrorInfo::new("d")),
            Error::ExpectedOne(2),
            Error::TableNotFound("t".into()),
            Error::Config("c".into()),
            Error::Internal("i".into()),
            Error::Closed("x".into()),
        ]
    }

    // ========================================================================
    // Codes and messages
    // ========================================================================

    #[test]
    fn test_codes_are_unique() {
        let codes: HashSet<&str> = all_variants().iter().map(Error::code).collect();
        assert_eq!(codes.len(), all_variants().len());
    }

    #[test]
    fn test_display_carries_code() {
        for err in all_variants() {
            assert!(err.to_string().contains(err.code()), "{err}");
        }
    }

    #[test]
    fn test_serialization_error_converts() {
        // Arrange
        let parse: Result<serde_json::Value> = serde_json::from_str("{").map_err(Error::from);

        // Act
        let err = parse.unwrap_err();

        // Assert
        assert_eq!(err.code(), "LSQ-008");
    }

    // ========================================================================
    // Operation wrapping
    // ========================================================================

    #[test]
    fn test_within_prefixes_operation() {
        // Arrange & Act
        let err = Error::Forbidden("no".into()).within("items", "find");

        // Assert
        assert!(err.to_string().starts_with("Issue with dbo.items.find(): "));
        assert_eq!(err.code(), "LSQ-001");
        assert!(err.is_forbidden());
        assert!(matches!(err.root(), Error::Forbidden(_)));
    }

    #[test]
    fn test_within_does_not_wrap_twice() {
        let err = Error::Validation("bad".into())
            .within("items", "insert")
            .within("items", "upsert");
        match err {
            Error::Operation { op, source, .. } => {
                assert_eq!(op, "insert");
                assert!(matches!(*source, Error::Validation(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_retryable_database_codes() {
        let serialization = Error::from(DbErrorInfo::new("conflict").with_code("40001"));
        let lock = Error::from(DbErrorInfo::new("lock").with_code("55P03")).within("t", "update");
        let unique = Error::from(DbErrorInfo::new("dup").with_code("23505"));

        assert!(serialization.is_retryable());
        assert!(lock.is_retryable());
        assert!(!unique.is_retryable());
        assert!(!Error::Internal("x".into()).is_retryable());
    }

    // ========================================================================
    // Client payload
    // ========================================================================

    #[test]
    fn test_database_payload_has_details() {
        // Arrange
        let info = DbErrorInfo {
            constraint: Some("items_pkey".into()),
            ..DbErrorInfo::new("duplicate key").with_code("23505")
        };

        // Act
        let payload = Error::Database(info).within("items", "insert").to_payload();

        // Assert
        assert_eq!(payload.err["code"], "23505");
        assert_eq!(payload.err["constraint"], "items_pkey");
        assert_eq!(payload.err["code_info"], "unique_violation");
        assert!(payload.err.get("column").is_none());
        assert!(payload.msg.starts_with("Issue with dbo.items.insert()"));
    }

    #[test]
    fn test_payload_of_plain_error() {
        let payload = Error::Validation("bad limit".into()).to_payload();
        assert_eq!(payload.err["code"], "LSQ-002");
        assert_eq!(payload.err["message"], payload.msg);
    }

    #[test]
    fn test_db_error_display() {
        assert_eq!(
            DbErrorInfo::new("boom").with_code("40001").to_string(),
            "boom (40001: serialization_failure)"
        );
        assert_eq!(DbErrorInfo::new("boom").with_code("ZZ999").to_string(), "boom (ZZ999)");
        assert_eq!(DbErrorInfo::new("boom").to_string(), "boom");
    }

    #[test]
    fn test_sqlstate_lookup() {
        assert_eq!(sqlstate::describe("23505"), Some("unique_violation"));
        assert_eq!(sqlstate::describe("nope"), None);
        assert_eq!(sqlstate::class_of("23505"), Some("integrity_constraint_violation"));
    }
}

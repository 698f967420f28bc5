#[cfg(test)]
mod tests {
    use crate::table::{Column, ColumnType, Schema, TableError};

    #[test]
    fn test_valid_schema() {
        let schema = Schema::new(
            "users",
            vec![
                Column::primary_key("id", ColumnType::Integer),
                Column::required("name", ColumnType::Text),
                Column::new("bio", ColumnType::Text),
            ],
        )
        .unwrap();

        assert_eq!(schema.name(), "users");
        assert_eq!(schema.columns().len(), 3);
        assert_eq!(schema.primary_key_column().name, "id");
        assert!(!schema.primary_key_column().nullable);
    }

    #[test]
    fn test_schema_without_primary_key_rejected() {
        let err = Schema::new("t", vec![Column::new("a", ColumnType::Integer)]).unwrap_err();
        assert!(matches!(err, TableError::InvalidSchema(_)));
    }

    #[test]
    fn test_schema_with_two_primary_keys_rejected() {
        let err = Schema::new(
            "t",
            vec![
                Column::primary_key("a", ColumnType::Integer),
                Column::primary_key("b", ColumnType::Integer),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, TableError::InvalidSchema(_)));
    }

    #[test]
    fn test_schema_with_duplicate_column_rejected() {
        let err = Schema::new(
            "t",
            vec![
                Column::primary_key("a", ColumnType::Integer),
                Column::new("a", ColumnType::Text),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, TableError::InvalidSchema(_)));
    }

    #[test]
    fn test_nullable_primary_key_rejected() {
        let mut pk = Column::primary_key("id", ColumnType::Integer);
        pk.nullable = true;
        let err = Schema::new("t", vec![pk]).unwrap_err();
        assert!(matches!(err, TableError::InvalidSchema(_)));
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{Db, DbConfig};
    use crate::table::{Column, ColumnType, Row, Schema, Table, TableError, Value};
    use tempfile::TempDir;

    fn schema() -> Schema {
        Schema::new(
            "items",
            vec![
                Column::primary_key("id", ColumnType::Integer),
                Column::required("label", ColumnType::Text),
                Column::new("note", ColumnType::Text),
            ],
        )
        .unwrap()
    }

    fn open_table(tmp: &TempDir) -> (Db, Table) {
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let table = Table::open(db.clone(), schema()).unwrap();
        (db, table)
    }

    #[test]
    fn test_unknown_column_rejected() {
        let tmp = TempDir::new().unwrap();
        let (db, table) = open_table(&tmp);

        let err = table
            .insert(
                Row::new()
                    .with("id", Value::Integer(1))
                    .with("label", Value::Text("x".into()))
                    .with("bogus", Value::Integer(7)),
            )
            .unwrap_err();
        assert!(matches!(err, TableError::UnknownColumn(c) if c == "bogus"));

        // The reject happened before the engine saw anything.
        assert_eq!(db.scan(None, None).unwrap().count(), 0);
        db.close().unwrap();
    }

    #[test]
    fn test_null_in_required_column_rejected() {
        let tmp = TempDir::new().unwrap();
        let (db, table) = open_table(&tmp);

        // Explicit null.
        let err = table
            .insert(
                Row::new()
                    .with("id", Value::Integer(1))
                    .with("label", Value::Null),
            )
            .unwrap_err();
        assert!(matches!(err, TableError::NullViolation(c) if c == "label"));

        // Absent column counts as null too.
        let err = table
            .insert(Row::new().with("id", Value::Integer(1)))
            .unwrap_err();
        assert!(matches!(err, TableError::NullViolation(_)));

        // Nullable column may be absent.
        table
            .insert(
                Row::new()
                    .with("id", Value::Integer(1))
                    .with("label", Value::Text("ok".into())),
            )
            .unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let (db, table) = open_table(&tmp);

        let err = table
            .insert(Row::new().with("label", Value::Text("x".into())))
            .unwrap_err();
        assert!(matches!(err, TableError::MissingPrimaryKey(_)));
        db.close().unwrap();
    }

    #[test]
    fn test_duplicate_primary_key_rejected() {
        let tmp = TempDir::new().unwrap();
        let (db, table) = open_table(&tmp);

        let row = Row::new()
            .with("id", Value::Integer(1))
            .with("label", Value::Text("first".into()));
        table.insert(row.clone()).unwrap();

        let err = table.insert(row).unwrap_err();
        assert!(matches!(err, TableError::DuplicatePrimaryKey));

        // The original row is untouched.
        let stored = table.get(&Value::Integer(1)).unwrap().unwrap();
        assert_eq!(stored.get("label"), Some(&Value::Text("first".into())));
        db.close().unwrap();
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let tmp = TempDir::new().unwrap();
        let (db, table) = open_table(&tmp);

        let err = table
            .insert(
                Row::new()
                    .with("id", Value::Text("not-a-number".into()))
                    .with("label", Value::Text("x".into())),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TableError::TypeMismatch { column, .. } if column == "id"
        ));
        db.close().unwrap();
    }
}

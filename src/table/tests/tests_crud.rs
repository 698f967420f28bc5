#[cfg(test)]
mod tests {
    use crate::engine::{Db, DbConfig};
    use crate::table::{Column, ColumnType, Row, Schema, Table, Value};
    use tempfile::TempDir;

    fn users_schema() -> Schema {
        Schema::new(
            "users",
            vec![
                Column::primary_key("id", ColumnType::Integer),
                Column::required("name", ColumnType::Text),
                Column::new("active", ColumnType::Boolean),
            ],
        )
        .unwrap()
    }

    fn user(id: i64, name: &str) -> Row {
        Row::new()
            .with("id", Value::Integer(id))
            .with("name", Value::Text(name.to_string()))
            .with("active", Value::Boolean(true))
    }

    #[test]
    fn test_insert_and_get() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let table = Table::open(db.clone(), users_schema()).unwrap();

        table.insert(user(1, "ada")).unwrap();
        table.insert(user(2, "grace")).unwrap();

        let row = table.get(&Value::Integer(1)).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("ada".into())));
        assert_eq!(table.get(&Value::Integer(99)).unwrap(), None);
        assert_eq!(table.len().unwrap(), 2);
        db.close().unwrap();
    }

    #[test]
    fn test_range_in_pk_order_with_negative_ids() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let table = Table::open(db.clone(), users_schema()).unwrap();

        // Insertion order is scrambled; negative ids check the
        // order-preserving integer encoding.
        for id in [5i64, -3, 0, 12, -10] {
            table.insert(user(id, &format!("u{id}"))).unwrap();
        }

        let rows = table.range(None, None).unwrap();
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| match r.get("id") {
                Some(Value::Integer(i)) => *i,
                other => panic!("bad id cell: {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![-10, -3, 0, 5, 12]);

        let bounded = table
            .range(Some(&Value::Integer(-3)), Some(&Value::Integer(5)))
            .unwrap();
        assert_eq!(bounded.len(), 3);
        db.close().unwrap();
    }

    #[test]
    fn test_delete_row() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let table = Table::open(db.clone(), users_schema()).unwrap();

        table.insert(user(1, "ada")).unwrap();
        assert!(table.delete(&Value::Integer(1)).unwrap());
        assert_eq!(table.get(&Value::Integer(1)).unwrap(), None);
        assert!(!table.delete(&Value::Integer(1)).unwrap());

        // Deleted rows must be gone from the underlying store too.
        assert_eq!(db.scan(None, None).unwrap().count(), 0);
        db.close().unwrap();
    }

    #[test]
    fn test_insert_after_delete_reuses_pk() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let table = Table::open(db.clone(), users_schema()).unwrap();

        table.insert(user(1, "first")).unwrap();
        table.delete(&Value::Integer(1)).unwrap();
        table.insert(user(1, "second")).unwrap();

        let row = table.get(&Value::Integer(1)).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("second".into())));
        db.close().unwrap();
    }

    #[test]
    fn test_index_rebuilt_from_engine_on_open() {
        let tmp = TempDir::new().unwrap();

        {
            let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
            let table = Table::open(db.clone(), users_schema()).unwrap();
            for id in 0..50i64 {
                table.insert(user(id, &format!("user-{id}"))).unwrap();
            }
            db.close().unwrap();
        }

        // Fresh process: the table replays the engine scan to rebuild
        // its B+ tree index.
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let table = Table::open(db.clone(), users_schema()).unwrap();
        assert_eq!(table.len().unwrap(), 50);
        let row = table.get(&Value::Integer(25)).unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("user-25".into())));
        db.close().unwrap();
    }

    #[test]
    fn test_text_primary_key() {
        let tmp = TempDir::new().unwrap();
        let db = Db::open(tmp.path(), DbConfig::default()).unwrap();
        let schema = Schema::new(
            "tags",
            vec![
                Column::primary_key("slug", ColumnType::Text),
                Column::new("count", ColumnType::Integer),
            ],
        )
        .unwrap();
        let table = Table::open(db.clone(), schema).unwrap();

        for slug in ["rust", "db", "lsm"] {
            table
                .insert(
                    Row::new()
                        .with("slug", Value::Text(slug.into()))
                        .with("count", Value::Integer(1)),
                )
                .unwrap();
        }

        let rows = table.range(None, None).unwrap();
        let slugs: Vec<&Value> = rows.iter().map(|r| r.get("slug").unwrap()).collect();
        assert_eq!(
            slugs,
            vec![
                &Value::Text("db".into()),
                &Value::Text("lsm".into()),
                &Value::Text("rust".into())
            ]
        );
        db.close().unwrap();
    }
}

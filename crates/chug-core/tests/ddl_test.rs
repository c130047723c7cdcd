//! Tests for destination DDL synthesis and type mapping

use chug_core::prelude::*;

#[test]
fn test_plain_table_matches_contract() {
    let columns = vec![Column::new("id", "integer"), Column::new("name", "text")];
    let ddl = build_create_table("t", &columns, None).unwrap();
    assert_eq!(
        ddl,
        "CREATE TABLE IF NOT EXISTS \"t\" (\"id\" Int32, \"name\" String) \
         ENGINE = MergeTree() ORDER BY tuple();"
    );
}

#[test]
fn test_cdc_table_has_dedup_key_and_replacing_engine() {
    let columns = vec![
        Column::new("id", "integer"),
        Column::new("ts", "timestamp"),
    ];
    let cdc = CdcKey {
        delta_column: "ts".into(),
        primary_key_columns: vec!["id".into()],
    };
    let ddl = build_create_table("evt", &columns, Some(&cdc)).unwrap();

    assert!(ddl.contains(DEDUP_COLUMN));
    assert!(ddl.contains("ReplacingMergeTree(\"ts\")"));
    assert!(ddl.contains("ORDER BY _dedup_key"));
    assert!(ddl.contains("cityHash64(tuple(\"id\"))"));
    // The source columns are untouched by the CDC decoration.
    assert!(ddl.contains("\"id\" Int32, \"ts\" DateTime"));
}

#[test]
fn test_cdc_without_primary_key_hashes_all_columns() {
    let columns = vec![
        Column::new("a", "integer"),
        Column::new("b", "text"),
        Column::new("ts", "timestamp with time zone"),
    ];
    let cdc = CdcKey {
        delta_column: "ts".into(),
        primary_key_columns: vec![],
    };
    let ddl = build_create_table("t", &columns, Some(&cdc)).unwrap();
    assert!(ddl.contains("cityHash64(tuple(\"a\", \"b\", \"ts\"))"));
}

#[test]
fn test_every_column_appears_once_in_ordinal_order() {
    let columns = vec![
        Column::new("c3", "text"),
        Column::new("c1", "bigint"),
        Column::new("c2", "boolean"),
    ];
    let ddl = build_create_table("t", &columns, None).unwrap();

    for col in &columns {
        assert_eq!(ddl.matches(&format!("\"{}\"", col.name)).count(), 1);
    }
    let p3 = ddl.find("\"c3\"").unwrap();
    let p1 = ddl.find("\"c1\"").unwrap();
    let p2 = ddl.find("\"c2\"").unwrap();
    assert!(p3 < p1 && p1 < p2);
}

#[test]
fn test_type_coverage() {
    assert_eq!(destination_type("integer"), Some("Int32"));
    assert_eq!(destination_type("bigserial"), Some("Int64"));
    assert_eq!(destination_type("boolean"), Some("Bool"));
    assert_eq!(destination_type("character varying"), Some("String"));
    assert_eq!(destination_type("timestamp with time zone"), Some("DateTime"));
    assert_eq!(destination_type("numeric"), Some("Float64"));
    assert_eq!(destination_type("real"), Some("Float32"));
    assert_eq!(destination_type("jsonb"), Some("String"));
    assert_eq!(destination_type("uuid"), Some("UUID"));
    assert_eq!(destination_type("bytea"), Some("UUID"));
    assert_eq!(destination_type("inet"), Some("String"));
    assert_eq!(destination_type("tsvector"), None);
}

#[test]
fn test_unknown_type_carries_column_context() {
    let columns = vec![Column::new("doc", "tsvector")];
    match build_create_table("t", &columns, None).unwrap_err() {
        Error::UnsupportedType {
            column,
            source_type,
        } => {
            assert_eq!(column, "doc");
            assert_eq!(source_type, "tsvector");
        }
        other => panic!("expected UnsupportedType, got {other}"),
    }
}

#[test]
fn test_empty_column_list_fails() {
    assert!(matches!(
        build_create_table("t", &[], None).unwrap_err(),
        Error::EmptyColumnList { .. }
    ));
}

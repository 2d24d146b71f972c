use memdex_core::{Item, Memdex, MemdexContext, StorageOpts};
use memdex_index::{IndexDef, IndexType};
use memdex_query::{CondType, JoinType, JoinedQuery, OpType, Query, QueryJoinEntry};
use memdex_types::{IndexOpts, KeyValueKind, Variant};

fn setup() -> (Memdex, MemdexContext) {
    let db = Memdex::new();
    let ctx = MemdexContext::new();
    db.open_namespace("items", StorageOpts::enabled(), &ctx)
        .unwrap();
    db.add_index(
        "items",
        IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
        &ctx,
    )
    .unwrap();
    db.add_index(
        "items",
        IndexDef::new("year", IndexType::Tree, KeyValueKind::Int, IndexOpts::new()),
        &ctx,
    )
    .unwrap();
    db.add_index(
        "items",
        IndexDef::new("name", IndexType::Tree, KeyValueKind::String, IndexOpts::new()),
        &ctx,
    )
    .unwrap();
    (db, ctx)
}

fn item_json(id: i64, name: &str, year: i64) -> String {
    let mut item = Item::new();
    item.set("id", id).set("name", name).set("year", year);
    item.to_json()
}

#[test]
fn test_insert_then_select_by_pk_returns_identical_fields() {
    let (db, ctx) = setup();
    db.insert("items", &item_json(7, "widget", 2020), &ctx).unwrap();

    let result = db
        .select(
            &Query::new("items").where_cond("id", CondType::Eq, [Variant::Int(7)]),
            &ctx,
        )
        .unwrap();
    assert_eq!(result.count(), 1);
    let item = &result.items[0];
    let value = item.value.as_ref().unwrap();
    let json = memdex_core::doc_to_json(value.doc(), &result.namespaces[0].tags_matcher);
    assert_eq!(json["id"], 7);
    assert_eq!(json["name"], "widget");
    assert_eq!(json["year"], 2020);
}

#[test]
fn test_cjson_roundtrip_of_selected_item() {
    let (db, ctx) = setup();
    db.insert(
        "items",
        r#"{"id": 1, "name": "x", "year": 2001, "nested": {"a": [1, 2, 3]}, "flag": true}"#,
        &ctx,
    )
    .unwrap();
    let result = db
        .select(&Query::new("items").where_cond("id", CondType::Eq, [Variant::Int(1)]), &ctx)
        .unwrap();
    let tm = result.namespaces[0].tags_matcher.clone();
    let doc = result.items[0].value.as_ref().unwrap().doc();
    let encoded = memdex_core::cjson_encode(doc, &tm);
    let mut tm2 = tm.clone();
    let decoded = memdex_core::cjson_decode(&encoded, &mut tm2).unwrap();
    assert_eq!(
        memdex_core::doc_to_json(&decoded, &tm2),
        memdex_core::doc_to_json(doc, &tm)
    );
}

#[test]
fn test_case_insensitive_index_name_conflicts() {
    let (db, ctx) = setup();
    db.add_index(
        "items",
        IndexDef::new(
            "IdEnTiFiCaToR",
            IndexType::Hash,
            KeyValueKind::String,
            IndexOpts::new(),
        ),
        &ctx,
    )
    .unwrap();
    for name in ["identificator", "IDENTIFICATOR"] {
        let err = db
            .add_index(
                "items",
                IndexDef::new(name, IndexType::Hash, KeyValueKind::String, IndexOpts::new()),
                &ctx,
            )
            .unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::Exists, "{name}");
    }
}

#[test]
fn test_insert_conflict_update_missing_delete() {
    let (db, ctx) = setup();
    db.insert("items", &item_json(1, "a", 2000), &ctx).unwrap();
    let err = db.insert("items", &item_json(1, "b", 2000), &ctx).unwrap_err();
    assert_eq!(err.code(), memdex_error::ErrorCode::Exists);

    // Updating a missing item is a no-op.
    db.update("items", &item_json(2, "c", 2000), &ctx).unwrap();
    let result = db.select(&Query::new("items"), &ctx).unwrap();
    assert_eq!(result.count(), 1);

    db.delete("items", &item_json(1, "a", 2000), &ctx).unwrap();
    let result = db.select(&Query::new("items"), &ctx).unwrap();
    assert_eq!(result.count(), 0);
}

#[test]
fn test_row_id_reuse_after_delete() {
    let (db, ctx) = setup();
    for id in 0..5 {
        db.insert("items", &item_json(id, "x", 2000), &ctx).unwrap();
    }
    db.delete("items", &item_json(2, "x", 2000), &ctx).unwrap();
    db.insert("items", &item_json(99, "y", 2001), &ctx).unwrap();
    let result = db.select(&Query::new("items"), &ctx).unwrap();
    // Freed slot was reused: still 5 rows backing 5 live items.
    assert_eq!(result.count(), 5);
}

#[test]
fn test_select_sql_end_to_end() {
    let (db, ctx) = setup();
    for id in 0..20 {
        db.insert("items", &item_json(id, if id % 2 == 0 { "even" } else { "odd" }, 2000 + id), &ctx)
            .unwrap();
    }
    let result = db
        .select_sql(
            "SELECT * FROM items WHERE name = 'even' AND year >= 2010 ORDER BY year DESC LIMIT 3",
            &ctx,
        )
        .unwrap();
    assert_eq!(result.count(), 3);
    let years: Vec<i64> = result
        .items
        .iter()
        .map(|item| {
            let json = memdex_core::doc_to_json(
                item.value.as_ref().unwrap().doc(),
                &result.namespaces[0].tags_matcher,
            );
            json["year"].as_i64().unwrap()
        })
        .collect();
    assert_eq!(years, vec![2018, 2016, 2014]);
}

#[test]
fn test_update_and_delete_by_query() {
    let (db, ctx) = setup();
    for id in 0..10 {
        db.insert("items", &item_json(id, "x", 2000 + id), &ctx).unwrap();
    }
    let updated = db
        .update_by_query(
            Query::new("items")
                .where_cond("year", CondType::Ge, [Variant::Int(2005)])
                .set("name", [Variant::string("new")]),
            &ctx,
        )
        .unwrap();
    assert_eq!(updated, 5);
    let result = db
        .select(
            &Query::new("items").where_cond("name", CondType::Eq, [Variant::string("new")]),
            &ctx,
        )
        .unwrap();
    assert_eq!(result.count(), 5);

    let deleted = db
        .delete_by_query(
            Query::new("items").where_cond("name", CondType::Eq, [Variant::string("new")]),
            &ctx,
        )
        .unwrap();
    assert_eq!(deleted, 5);
    let result = db.select(&Query::new("items"), &ctx).unwrap();
    assert_eq!(result.count(), 5);
}

#[test]
fn test_inner_and_left_joins() {
    let (db, ctx) = setup();
    db.open_namespace("users", StorageOpts::default(), &ctx).unwrap();
    db.add_index(
        "users",
        IndexDef::new("uid", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
        &ctx,
    )
    .unwrap();
    db.upsert("users", r#"{"uid": 1, "login": "ann"}"#, &ctx).unwrap();
    db.upsert("users", r#"{"uid": 2, "login": "bob"}"#, &ctx).unwrap();

    db.insert("items", r#"{"id": 10, "name": "a", "year": 2000, "owner": 1}"#, &ctx)
        .unwrap();
    db.insert("items", r#"{"id": 11, "name": "b", "year": 2001, "owner": 3}"#, &ctx)
        .unwrap();

    let inner = Query::new("items").join(JoinedQuery {
        join_type: JoinType::Inner,
        query: Query::new("users"),
        on: vec![QueryJoinEntry {
            op: OpType::And,
            condition: CondType::Eq,
            left_field: "owner".to_owned(),
            right_field: "uid".to_owned(),
        }],
    });
    let result = db.select(&inner, &ctx).unwrap();
    // Only the item whose owner exists joins.
    assert_eq!(result.count(), 1);
    let joined = result.joined_rows(0, result.items[0].row_id);
    assert_eq!(joined.len(), 1);

    let left = Query::new("items").join(JoinedQuery {
        join_type: JoinType::Left,
        query: Query::new("users"),
        on: vec![QueryJoinEntry {
            op: OpType::And,
            condition: CondType::Eq,
            left_field: "owner".to_owned(),
            right_field: "uid".to_owned(),
        }],
    });
    let result = db.select(&left, &ctx).unwrap();
    // Left join keeps every left row.
    assert_eq!(result.count(), 2);
}

#[test]
fn test_merge_queries() {
    let (db, ctx) = setup();
    db.open_namespace("archive", StorageOpts::default(), &ctx).unwrap();
    db.add_index(
        "archive",
        IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
        &ctx,
    )
    .unwrap();
    db.insert("items", &item_json(1, "live", 2020), &ctx).unwrap();
    db.upsert("archive", r#"{"id": 100, "name": "old"}"#, &ctx).unwrap();

    let q = Query::new("items").merge(Query::new("archive"));
    let result = db.select(&q, &ctx).unwrap();
    assert_eq!(result.count(), 2);
    assert_eq!(result.namespaces.len(), 2);
    // Merged rows carry their namespace id.
    assert_eq!(result.items[1].ns_id, 1);
}

#[test]
fn test_meta_roundtrip() {
    let (db, ctx) = setup();
    db.put_meta("items", "version", "7", &ctx).unwrap();
    db.put_meta("items", "owner", "tests", &ctx).unwrap();
    assert_eq!(db.get_meta("items", "version").unwrap(), Some("7".to_owned()));
    assert_eq!(db.get_meta("items", "missing").unwrap(), None);
    assert_eq!(
        db.enum_meta("items").unwrap(),
        vec!["owner".to_owned(), "version".to_owned()]
    );
}

#[test]
fn test_namespace_lifecycle() {
    let (db, ctx) = setup();
    db.insert("items", &item_json(1, "x", 2000), &ctx).unwrap();

    db.rename_namespace("items", "stock", &ctx).unwrap();
    assert_eq!(db.enum_namespaces(None), vec!["stock".to_owned()]);
    let result = db.select(&Query::new("stock"), &ctx).unwrap();
    assert_eq!(result.count(), 1);

    db.truncate_namespace("stock", &ctx).unwrap();
    assert_eq!(db.select(&Query::new("stock"), &ctx).unwrap().count(), 0);

    db.drop_namespace("stock", &ctx).unwrap();
    assert!(db.select(&Query::new("stock"), &ctx).is_err());
    assert!(db.enum_namespaces(None).is_empty());
}

#[test]
fn test_invalid_namespace_name_rejected() {
    let db = Memdex::new();
    let ctx = MemdexContext::new();
    let err = db
        .open_namespace("no/slashes", StorageOpts::default(), &ctx)
        .unwrap_err();
    assert_eq!(err.code(), memdex_error::ErrorCode::Params);
}

#[test]
fn test_sql_suggestions_include_catalog() {
    let (db, _ctx) = setup();
    let got = db.sql_suggestions("SELECT * FROM it", 16);
    assert!(got.contains(&"items".to_owned()));
    let got = db.sql_suggestions("SELECT * FROM items WHERE ye", 28);
    assert!(got.contains(&"year".to_owned()));
}

#[test]
fn test_fulltext_search_through_sql() {
    let (db, ctx) = setup();
    db.add_index(
        "items",
        IndexDef::new("descr", IndexType::Text, KeyValueKind::String, IndexOpts::new()),
        &ctx,
    )
    .unwrap();
    db.insert(
        "items",
        r#"{"id": 1, "name": "a", "year": 2000, "descr": "quick brown fox"}"#,
        &ctx,
    )
    .unwrap();
    db.insert(
        "items",
        r#"{"id": 2, "name": "b", "year": 2001, "descr": "lazy dog sleeps"}"#,
        &ctx,
    )
    .unwrap();
    let result = db
        .select_sql("SELECT *, RANK() FROM items WHERE descr = 'fox'", &ctx)
        .unwrap();
    assert_eq!(result.count(), 1);
    assert!(result.have_rank);
    assert!(result.items[0].rank > 0);
}

use memdex_core::{Memdex, MemdexContext, StorageOpts};
use memdex_index::{IndexDef, IndexType};
use memdex_query::Query;
use memdex_types::{IndexOpts, KeyValueKind, Variant};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Reference model of the forced-sort algorithm: rows whose first-column
/// value is in the forced list come ordered by list position (descending
/// order reverses the whole arrangement), ties and the remainder ordered by
/// the second column, then offset/limit applies.
fn reference_order(
    rows: &[(i64, i64, i64)], // (id, hash_col, tree_col)
    forced: &[i64],
    desc_first: bool,
    offset: usize,
    limit: usize,
) -> Vec<i64> {
    let pos = |v: i64| forced.iter().position(|&f| f == v);
    let mut in_set: Vec<&(i64, i64, i64)> =
        rows.iter().filter(|(_, h, _)| pos(*h).is_some()).collect();
    let mut rest: Vec<&(i64, i64, i64)> =
        rows.iter().filter(|(_, h, _)| pos(*h).is_none()).collect();
    in_set.sort_by(|a, b| {
        let (p, q) = (pos(a.1), pos(b.1));
        if p == q {
            // Ties break by the second entry, which stays ascending.
            a.2.cmp(&b.2)
        } else if desc_first {
            q.cmp(&p)
        } else {
            p.cmp(&q)
        }
    });
    // The remainder sorts by the full comparator: first column, then second.
    rest.sort_by(|a, b| {
        let first = if desc_first {
            b.1.cmp(&a.1)
        } else {
            a.1.cmp(&b.1)
        };
        first.then_with(|| a.2.cmp(&b.2))
    });
    let ordered: Vec<i64> = if desc_first {
        rest.into_iter().chain(in_set).map(|r| r.0).collect()
    } else {
        in_set.into_iter().chain(rest).map(|r| r.0).collect()
    };
    ordered.into_iter().skip(offset).take(limit).collect()
}

#[test]
fn test_forced_sort_with_offset_matches_reference() {
    let db = Memdex::new();
    let ctx = MemdexContext::new();
    db.open_namespace("rows", StorageOpts::default(), &ctx)
        .unwrap();
    db.add_index(
        "rows",
        IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
        &ctx,
    )
    .unwrap();
    db.add_index(
        "rows",
        IndexDef::new("column_hash", IndexType::Hash, KeyValueKind::Int, IndexOpts::new()),
        &ctx,
    )
    .unwrap();
    db.add_index(
        "rows",
        IndexDef::new("column_tree", IndexType::Tree, KeyValueKind::Int, IndexOpts::new()),
        &ctx,
    )
    .unwrap();

    let mut rng = SmallRng::seed_from_u64(42);
    let mut rows = Vec::new();
    for id in 0..1000i64 {
        let hash_col = rng.gen_range(0..20);
        let tree_col = rng.gen_range(0..1_000_000);
        rows.push((id, hash_col, tree_col));
        db.upsert(
            "rows",
            &format!(
                r#"{{"id": {id}, "column_hash": {hash_col}, "column_tree": {tree_col}}}"#
            ),
            &ctx,
        )
        .unwrap();
    }

    let forced = [7i64, 3];
    for desc in [true, false] {
        let query = Query::new("rows")
            .sort("column_hash", desc)
            .sort("column_tree", false)
            .forced_sort(forced.iter().map(|&v| Variant::Int64(v)))
            .offset(10)
            .limit(40);
        let result = db.select(&query, &ctx).unwrap();
        let got: Vec<i64> = result
            .items
            .iter()
            .map(|item| {
                let json = memdex_core::doc_to_json(
                    item.value.as_ref().unwrap().doc(),
                    &result.namespaces[0].tags_matcher,
                );
                json["id"].as_i64().unwrap()
            })
            .collect();
        let expected = reference_order(&rows, &forced, desc, 10, 40);
        assert_eq!(got, expected, "desc={desc}");
    }
}

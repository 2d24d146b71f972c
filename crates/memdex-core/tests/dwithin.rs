use memdex_core::{Memdex, MemdexContext, StorageOpts};
use memdex_index::{IndexDef, IndexType};
use memdex_query::{CondType, Query};
use memdex_types::{IndexOpts, KeyValueKind, Variant};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

fn setup(linear: bool) -> (Memdex, MemdexContext) {
    let db = Memdex::new();
    let ctx = MemdexContext::new();
    db.open_namespace("points", StorageOpts::default(), &ctx)
        .unwrap();
    db.add_index(
        "points",
        IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
        &ctx,
    )
    .unwrap();
    db.add_index(
        "points",
        IndexDef::new(
            "location",
            IndexType::RTree,
            KeyValueKind::Double,
            IndexOpts::new().rtree_linear(linear),
        ),
        &ctx,
    )
    .unwrap();
    (db, ctx)
}

/// Randomized points; the rtree visitor set must exactly match a linear
/// distance scan.
#[test]
fn test_dwithin_matches_reference_scan() {
    for linear in [false, true] {
        let (db, ctx) = setup(linear);
        let mut rng = SmallRng::seed_from_u64(0xd317);
        let mut points = Vec::new();
        for id in 0..20_000u32 {
            let x: f64 = rng.gen_range(-1000.0..1000.0);
            let y: f64 = rng.gen_range(-1000.0..1000.0);
            points.push((id, x, y));
            db.upsert(
                "points",
                &format!(r#"{{"id": {id}, "location": [{x}, {y}]}}"#),
                &ctx,
            )
            .unwrap();
        }

        for _ in 0..10 {
            let cx: f64 = rng.gen_range(-1000.0..1000.0);
            let cy: f64 = rng.gen_range(-1000.0..1000.0);
            let dist: f64 = rng.gen_range(10.0..300.0);

            let result = db
                .select(
                    &Query::new("points").where_cond(
                        "location",
                        CondType::DWithin,
                        [
                            Variant::Tuple(vec![Variant::Double(cx), Variant::Double(cy)]),
                            Variant::Double(dist),
                        ],
                    ),
                    &ctx,
                )
                .unwrap();
            let mut got: Vec<i64> = result
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
            got.sort_unstable();
            let mut expected: Vec<i64> = points
                .iter()
                .filter(|(_, x, y)| (x - cx).hypot(y - cy) <= dist)
                .map(|(id, _, _)| i64::from(*id))
                .collect();
            expected.sort_unstable();
            assert_eq!(got, expected, "linear={linear} center=({cx},{cy}) d={dist}");
        }
    }
}

#[test]
fn test_dwithin_through_sql() {
    let (db, ctx) = setup(false);
    db.upsert("points", r#"{"id": 1, "location": [3.0, 4.0]}"#, &ctx)
        .unwrap();
    db.upsert("points", r#"{"id": 2, "location": [50.0, 50.0]}"#, &ctx)
        .unwrap();
    let result = db
        .select_sql(
            "SELECT * FROM points WHERE DWITHIN(location, POINT(0.0, 0.0), 6.0)",
            &ctx,
        )
        .unwrap();
    assert_eq!(result.count(), 1);
}

#[test]
fn test_rtree_survives_updates_and_deletes() {
    let (db, ctx) = setup(true);
    for id in 0..500 {
        let v = f64::from(id);
        db.upsert(
            "points",
            &format!(r#"{{"id": {id}, "location": [{v}, {v}]}}"#),
            &ctx,
        )
        .unwrap();
    }
    // Move the first hundred points far away.
    for id in 0..100 {
        db.upsert(
            "points",
            &format!(r#"{{"id": {id}, "location": [9000.0, 9000.0]}}"#),
            &ctx,
        )
        .unwrap();
    }
    for id in 100..200 {
        db.delete("points", &format!(r#"{{"id": {id}}}"#), &ctx)
            .unwrap();
    }
    let result = db
        .select(
            &Query::new("points").where_cond(
                "location",
                CondType::DWithin,
                [
                    Variant::Tuple(vec![Variant::Double(0.0), Variant::Double(0.0)]),
                    Variant::Double(10_000.0),
                ],
            ),
            &ctx,
        )
        .unwrap();
    assert_eq!(result.count(), 400);
}

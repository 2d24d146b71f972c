use memdex_index::{Index, IndexDef, IndexType};
use memdex_query::{AggType, AggregateEntry, CalcTotalMode, CondType, OpType, Query, StrictMode};
use memdex_select::{NeverCanceled, NsView, QueryCountCache, QueryResults, Selector};
use memdex_types::{
    ConstPayload, FieldsSet, IndexOpts, KeyValueKind, Payload, PayloadFieldType, PayloadType,
    PayloadValue, RowId, TagsMatcher, Variant,
};

// ---------------------------------------------------------------------------
// Fixture: an in-memory namespace fed by hand
// ---------------------------------------------------------------------------

struct TestNs {
    ptype: PayloadType,
    tm: TagsMatcher,
    items: Vec<PayloadValue>,
    indexes: Vec<Index>,
    cache: QueryCountCache,
    generation: u64,
    sort_orders_built: bool,
}

impl TestNs {
    fn new() -> Self {
        let mut ptype = PayloadType::new("items");
        for (name, kind) in [
            ("id", KeyValueKind::Int),
            ("group", KeyValueKind::String),
            ("year", KeyValueKind::Int),
        ] {
            ptype
                .add_field(PayloadFieldType::new(name, kind, false))
                .unwrap();
        }
        let indexes = vec![
            Index::create(
                IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new().pk(true)),
                &ptype,
                FieldsSet::from_fields([0]),
                None,
            )
            .unwrap(),
            Index::create(
                IndexDef::new("group", IndexType::Tree, KeyValueKind::String, IndexOpts::new()),
                &ptype,
                FieldsSet::from_fields([1]),
                None,
            )
            .unwrap(),
            Index::create(
                IndexDef::new("year", IndexType::Tree, KeyValueKind::Int, IndexOpts::new()),
                &ptype,
                FieldsSet::from_fields([2]),
                None,
            )
            .unwrap(),
        ];
        Self {
            ptype,
            tm: TagsMatcher::new(),
            items: Vec::new(),
            indexes,
            cache: QueryCountCache::new(),
            generation: 0,
            sort_orders_built: false,
        }
    }

    fn upsert(&mut self, id: i32, group: &str, year: i32) {
        let mut pv = PayloadValue::new(self.ptype.num_fields());
        {
            let mut pl = Payload::new(&self.ptype, &mut pv);
            pl.set_one(0, Variant::Int(id)).unwrap();
            pl.set_one(1, Variant::string(group)).unwrap();
            pl.set_one(2, Variant::Int(year)).unwrap();
        }
        let row_id = self.items.len() as RowId;
        for index in &mut self.indexes {
            index
                .upsert(&ConstPayload::new(&self.ptype, &pv), &self.tm, row_id)
                .unwrap();
        }
        self.items.push(pv);
        self.generation += 1;
    }

    fn commit(&mut self) {
        for index in &mut self.indexes {
            index.commit();
        }
        self.sort_orders_built = true;
    }

    fn view(&self) -> NsView<'_> {
        NsView {
            name: "items",
            payload_type: &self.ptype,
            tags_matcher: &self.tm,
            items: &self.items,
            free_count: 0,
            indexes: &self.indexes,
            sort_orders_built: self.sort_orders_built,
            strict_mode: StrictMode::None,
            query_cache: Some(&self.cache),
            generation: self.generation,
        }
    }

    fn select(&self, query: Query) -> QueryResults {
        let mut result = QueryResults::new();
        let view = self.view();
        let selector = Selector {
            ns: &view,
            joined: &[],
            cancel: &NeverCanceled,
        };
        selector.select(query, &mut result).unwrap();
        result
    }
}

fn field_ints(ns: &TestNs, result: &QueryResults, field: usize) -> Vec<i32> {
    result
        .items
        .iter()
        .map(|item| {
            let pv = item.value.as_ref().unwrap();
            match ConstPayload::new(&ns.ptype, pv).get(field)[0] {
                Variant::Int(v) => v,
                ref other => panic!("expected int, got {other:?}"),
            }
        })
        .collect()
}

fn multi_column_ns() -> TestNs {
    // group in {A, B, C}, year in 1..=7, all combinations.
    let mut ns = TestNs::new();
    let mut id = 0;
    for group in ["A", "B", "C"] {
        for year in 1..=7 {
            ns.upsert(id, group, year);
            id += 1;
        }
    }
    ns
}

// ---------------------------------------------------------------------------
// Basic conditions
// ---------------------------------------------------------------------------

#[test]
fn test_select_by_pk() {
    let mut ns = TestNs::new();
    ns.upsert(1, "A", 2001);
    ns.upsert(2, "B", 2002);
    let result = ns.select(Query::new("items").where_cond("id", CondType::Eq, [Variant::Int(2)]));
    assert_eq!(result.count(), 1);
    assert_eq!(field_ints(&ns, &result, 0), vec![2]);
}

#[test]
fn test_select_or_and_not() {
    let mut ns = TestNs::new();
    for (id, year) in [(1, 2000), (2, 2001), (3, 2002), (4, 2003)] {
        ns.upsert(id, "A", year);
    }
    let q = Query::new("items")
        .where_cond("year", CondType::Ge, [Variant::Int(2002)])
        .op_where(OpType::Or, "id", CondType::Eq, [Variant::Int(1)])
        .op_where(OpType::Not, "id", CondType::Eq, [Variant::Int(4)]);
    let result = ns.select(q);
    let mut ids = field_ints(&ns, &result, 0);
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn test_select_range_through_tree() {
    let mut ns = TestNs::new();
    for id in 0..50 {
        ns.upsert(id, "A", 1990 + id);
    }
    let q = Query::new("items").where_cond(
        "year",
        CondType::Range,
        [Variant::Int(2000), Variant::Int(2004)],
    );
    let result = ns.select(q);
    assert_eq!(result.count(), 5);
}

#[test]
fn test_index_miss_matches_nothing() {
    let mut ns = TestNs::new();
    ns.upsert(1, "A", 2001);
    let result = ns.select(Query::new("items").where_cond("id", CondType::Eq, [Variant::Int(999)]));
    assert_eq!(result.count(), 0);
    // A miss anded with a hit still matches nothing.
    let q = Query::new("items")
        .where_cond("year", CondType::Eq, [Variant::Int(2001)])
        .where_cond("id", CondType::Eq, [Variant::Int(999)]);
    assert_eq!(ns.select(q).count(), 0);
}

#[test]
fn test_unindexed_field_falls_back_to_scan() {
    let mut ns = TestNs::new();
    ns.upsert(1, "A", 2001);
    // "year" is indexed but query an unknown json path: no rows carry it.
    let q = Query::new("items").where_cond("missing", CondType::Eq, [Variant::Int(1)]);
    let result = ns.select(q);
    assert_eq!(result.count(), 0);
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

#[test]
fn test_sort_by_tree_index_both_directions() {
    let mut ns = TestNs::new();
    for (id, year) in [(1, 2003), (2, 2001), (3, 2002)] {
        ns.upsert(id, "A", year);
    }
    ns.commit();
    let asc = ns.select(Query::new("items").sort("year", false));
    assert_eq!(field_ints(&ns, &asc, 2), vec![2001, 2002, 2003]);
    let desc = ns.select(Query::new("items").sort("year", true));
    assert_eq!(field_ints(&ns, &desc, 2), vec![2003, 2002, 2001]);
}

#[test]
fn test_multi_column_sort_with_offset_and_limit() {
    let ns = multi_column_ns();
    let q = Query::new("items")
        .sort("group", false)
        .sort("year", false)
        .offset(4)
        .limit(3);
    let result = ns.select(q);
    // Group "A" holds years 1..=7; rows 4..7 of it are years 5, 6, 7.
    assert_eq!(field_ints(&ns, &result, 2), vec![5, 6, 7]);
}

#[test]
fn test_sort_by_expression() {
    let mut ns = TestNs::new();
    ns.upsert(1, "A", 10); // year + id*5 = 15
    ns.upsert(7, "A", 1); // 36
    ns.upsert(2, "A", 20); // 30
    let q = Query::new("items").sort("year + id * 5", false);
    let result = ns.select(q);
    assert_eq!(field_ints(&ns, &result, 0), vec![1, 2, 7]);
}

#[test]
fn test_forced_sort_order() {
    let mut ns = TestNs::new();
    for (id, year) in [(1, 2001), (2, 2002), (3, 2003), (4, 2004)] {
        ns.upsert(id, "A", year);
    }
    let q = Query::new("items")
        .sort("id", false)
        .forced_sort([Variant::Int(3), Variant::Int(1)]);
    let result = ns.select(q);
    // Forced prefix [3, 1], remainder by id ascending.
    assert_eq!(field_ints(&ns, &result, 0), vec![3, 1, 2, 4]);
}

#[test]
fn test_forced_sort_desc_puts_forced_values_last_reversed() {
    let mut ns = TestNs::new();
    for id in 1..=4 {
        ns.upsert(id, "A", 2000 + id);
    }
    let q = Query::new("items")
        .sort("id", true)
        .forced_sort([Variant::Int(3), Variant::Int(1)]);
    let result = ns.select(q);
    // Desc: non-forced rows first (by id desc), then the forced list
    // reversed.
    assert_eq!(field_ints(&ns, &result, 0), vec![4, 2, 1, 3]);
}

#[test]
fn test_forced_sort_with_offset_and_second_column() {
    // Rows: (hash-ish group value, tree year), forced on group.
    let mut ns = TestNs::new();
    let mut id = 0;
    for group in ["g1", "g2", "g3", "g4"] {
        for year in [3, 1, 2] {
            ns.upsert(id, group, year);
            id += 1;
        }
    }
    let q = Query::new("items")
        .sort("group", false)
        .sort("year", false)
        .forced_sort([Variant::string("g3"), Variant::string("g1")])
        .offset(2)
        .limit(6);
    let result = ns.select(q);
    // Full order: g3(years 1,2,3), g1(1,2,3), then g2, g4 by group asc.
    // Offset 2 drops g3:1, g3:2.
    let years = field_ints(&ns, &result, 2);
    assert_eq!(years, vec![3, 1, 2, 3, 1, 2]);
    let groups: Vec<String> = result
        .items
        .iter()
        .map(|item| {
            ConstPayload::new(&ns.ptype, item.value.as_ref().unwrap()).get(1)[0].to_string()
        })
        .collect();
    assert_eq!(groups, vec!["g3", "g1", "g1", "g1", "g2", "g2"]);
}

// ---------------------------------------------------------------------------
// Aggregations and distinct
// ---------------------------------------------------------------------------

#[test]
fn test_sum_and_facet() {
    let mut ns = TestNs::new();
    for (id, group) in [(1, "a"), (2, "a"), (3, "b")] {
        ns.upsert(id, group, 2000);
    }
    let q = Query::new("items")
        .aggregate(AggregateEntry::new(AggType::Sum, ["id".to_owned()]))
        .aggregate(AggregateEntry::new(AggType::Facet, ["group".to_owned()]));
    let result = ns.select(q);
    assert_eq!(result.aggregation_results.len(), 2);
    assert_eq!(result.aggregation_results[0].value, Some(6.0));
    let facets = &result.aggregation_results[1].facets;
    assert_eq!(facets.len(), 2);
    // Aggregation-only query returns no rows.
    assert_eq!(result.count(), 0);
}

#[test]
fn test_distinct_filters_duplicate_values() {
    let mut ns = TestNs::new();
    for (id, group) in [(1, "x"), (2, "x"), (3, "y"), (4, "y"), (5, "z")] {
        ns.upsert(id, group, 2000);
    }
    let q = Query::new("items").aggregate(AggregateEntry::new(
        AggType::Distinct,
        ["group".to_owned()],
    ));
    let result = ns.select(q);
    // One row per distinct group value.
    assert_eq!(result.count(), 3);
    assert_eq!(result.aggregation_results[0].distincts.len(), 3);
}

// ---------------------------------------------------------------------------
// Totals and cache
// ---------------------------------------------------------------------------

#[test]
fn test_accurate_total_with_limit() {
    let mut ns = TestNs::new();
    for id in 0..30 {
        ns.upsert(id, "A", 2000);
    }
    let mut q = Query::new("items").limit(5);
    q.calc_total = CalcTotalMode::AccurateTotal;
    let result = ns.select(q);
    assert_eq!(result.count(), 5);
    assert_eq!(result.total_count, 30);
}

#[test]
fn test_cached_total_is_reused() {
    let mut ns = TestNs::new();
    for id in 0..10 {
        ns.upsert(id, "A", 2000);
    }
    let mut q = Query::new("items").limit(2);
    q.calc_total = CalcTotalMode::CachedTotal;
    let first = ns.select(q.clone());
    assert_eq!(first.total_count, 10);
    // Second run hits the cache (same generation).
    let second = ns.select(q.clone());
    assert_eq!(second.total_count, 10);
    // A mutation bumps the generation and invalidates the entry.
    ns.upsert(100, "A", 2000);
    let third = ns.select(q);
    assert_eq!(third.total_count, 11);
}

// ---------------------------------------------------------------------------
// Explain and rank
// ---------------------------------------------------------------------------

#[test]
fn test_explain_blob_present() {
    let mut ns = TestNs::new();
    ns.upsert(1, "A", 2000);
    let mut q = Query::new("items").where_cond("id", CondType::Eq, [Variant::Int(1)]);
    q.explain = true;
    let result = ns.select(q);
    let blob = result.explain.unwrap();
    assert!(blob.contains("\"namespace\":\"items\""));
    assert!(blob.contains("selectors"));
}

#[test]
fn test_rank_outside_fulltext_is_logic_error() {
    let mut ns = TestNs::new();
    ns.upsert(1, "A", 2000);
    let mut q = Query::new("items");
    q.with_rank = true;
    let view = ns.view();
    let selector = Selector {
        ns: &view,
        joined: &[],
        cancel: &NeverCanceled,
    };
    let err = selector.select(q, &mut QueryResults::new()).unwrap_err();
    assert_eq!(err.code(), memdex_error::ErrorCode::Logic);
}

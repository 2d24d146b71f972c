use std::collections::HashMap;

use memdex_error::Result;
use memdex_index::ComparatorField;
use memdex_query::AggType;
use memdex_types::{ConstPayload, KeyValueKind, TagsMatcher, Variant};

use crate::results::{AggregationResult, FacetResult};

/// How one facet sort entry orders buckets.
#[derive(Debug, Clone, Copy)]
pub enum FacetSortKey {
    Count,
    /// Position within the facet's field list.
    Field(usize),
}

/// Accumulates one aggregation over the matched rows.
#[derive(Debug)]
pub struct Aggregator {
    agg_type: AggType,
    names: Vec<String>,
    fields: Vec<ComparatorField>,
    sorting: Vec<(FacetSortKey, bool)>,
    limit: usize,
    offset: usize,

    sum: f64,
    count: usize,
    min: Option<f64>,
    max: Option<f64>,
    facets: HashMap<Vec<Variant>, usize>,
    distinct_seen: Vec<Variant>,
}

impl Aggregator {
    #[must_use]
    pub fn new(
        agg_type: AggType,
        names: Vec<String>,
        fields: Vec<ComparatorField>,
        sorting: Vec<(FacetSortKey, bool)>,
        limit: usize,
        offset: usize,
    ) -> Self {
        Self {
            agg_type,
            names,
            fields,
            sorting,
            limit,
            offset,
            sum: 0.0,
            count: 0,
            min: None,
            max: None,
            facets: HashMap::new(),
            distinct_seen: Vec::new(),
        }
    }

    #[must_use]
    pub const fn agg_type(&self) -> AggType {
        self.agg_type
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    fn read(
        pl: &ConstPayload<'_>,
        tm: &TagsMatcher,
        field: &ComparatorField,
    ) -> Result<memdex_types::VariantArray> {
        Ok(match field {
            ComparatorField::Index(idx) => pl.get(*idx),
            ComparatorField::JsonPath(path) => {
                pl.get_by_json_path(path, tm, KeyValueKind::Undefined)?
            }
            ComparatorField::TagsPath(path) => pl.get_by_tags_path(path),
            ComparatorField::Composite(_) => memdex_types::VariantArray::new(),
        })
    }

    /// Feed one matched row.
    pub fn aggregate(&mut self, pl: &ConstPayload<'_>, tm: &TagsMatcher) -> Result<()> {
        match self.agg_type {
            AggType::Sum | AggType::Avg | AggType::Min | AggType::Max => {
                let values = Self::read(pl, tm, &self.fields[0])?;
                for v in values.iter().filter_map(Variant::as_double) {
                    self.sum += v;
                    self.count += 1;
                    self.min = Some(self.min.map_or(v, |m| m.min(v)));
                    self.max = Some(self.max.map_or(v, |m| m.max(v)));
                }
            }
            AggType::Facet => {
                let mut bucket = Vec::with_capacity(self.fields.len());
                for field in &self.fields {
                    let values = Self::read(pl, tm, field)?;
                    bucket.push(values.first().cloned().unwrap_or(Variant::Null));
                }
                *self.facets.entry(bucket).or_insert(0) += 1;
            }
            AggType::Distinct => {
                for v in Self::read(pl, tm, &self.fields[0])? {
                    if !v.is_null() && !self.distinct_seen.contains(&v) {
                        self.distinct_seen.push(v);
                    }
                }
            }
        }
        Ok(())
    }

    /// Finish and produce the output record.
    #[must_use]
    pub fn result(self) -> AggregationResult {
        let mut out = AggregationResult {
            agg_type: self.agg_type.as_str().to_ascii_lowercase(),
            fields: self.names,
            value: None,
            facets: Vec::new(),
            distincts: Vec::new(),
        };
        match self.agg_type {
            AggType::Sum => out.value = Some(self.sum),
            AggType::Avg => {
                out.value = Some(if self.count == 0 {
                    0.0
                } else {
                    self.sum / self.count as f64
                });
            }
            AggType::Min => out.value = self.min.or(Some(0.0)),
            AggType::Max => out.value = self.max.or(Some(0.0)),
            AggType::Facet => {
                let mut buckets: Vec<(Vec<Variant>, usize)> = self.facets.into_iter().collect();
                let sorting = self.sorting;
                buckets.sort_by(|a, b| {
                    for (key, desc) in &sorting {
                        let ord = match key {
                            FacetSortKey::Count => a.1.cmp(&b.1),
                            FacetSortKey::Field(i) => a.0[*i]
                                .relax_cmp(&b.0[*i], &memdex_types::CollateOpts::default()),
                        };
                        let ord = if *desc { ord.reverse() } else { ord };
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                    // Deterministic fallback for unsorted facets.
                    format!("{:?}", a.0).cmp(&format!("{:?}", b.0))
                });
                out.facets = buckets
                    .into_iter()
                    .skip(self.offset)
                    .take(self.limit)
                    .map(|(values, count)| FacetResult {
                        values: values.iter().map(ToString::to_string).collect(),
                        count,
                    })
                    .collect();
            }
            AggType::Distinct => {
                out.distincts = self.distinct_seen.iter().map(ToString::to_string).collect();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdex_types::{Payload, PayloadFieldType, PayloadType, PayloadValue};

    fn setup() -> (PayloadType, TagsMatcher) {
        let mut pt = PayloadType::new("t");
        pt.add_field(PayloadFieldType::new("price", KeyValueKind::Double, false))
            .unwrap();
        pt.add_field(PayloadFieldType::new("brand", KeyValueKind::String, false))
            .unwrap();
        (pt, TagsMatcher::new())
    }

    fn row(pt: &PayloadType, price: f64, brand: &str) -> PayloadValue {
        let mut pv = PayloadValue::new(pt.num_fields());
        let mut pl = Payload::new(pt, &mut pv);
        pl.set_one(0, Variant::Double(price)).unwrap();
        pl.set_one(1, Variant::string(brand)).unwrap();
        pv
    }

    #[test]
    fn test_sum_avg_min_max() {
        let (pt, tm) = setup();
        for agg_type in [AggType::Sum, AggType::Avg, AggType::Min, AggType::Max] {
            let mut agg = Aggregator::new(
                agg_type,
                vec!["price".to_owned()],
                vec![ComparatorField::Index(0)],
                Vec::new(),
                usize::MAX,
                0,
            );
            for price in [1.0, 2.0, 6.0] {
                let pv = row(&pt, price, "x");
                agg.aggregate(&ConstPayload::new(&pt, &pv), &tm).unwrap();
            }
            let expected = match agg_type {
                AggType::Sum => 9.0,
                AggType::Avg => 3.0,
                AggType::Min => 1.0,
                AggType::Max => 6.0,
                _ => unreachable!(),
            };
            assert_eq!(agg.result().value, Some(expected));
        }
    }

    #[test]
    fn test_facet_sort_by_count_desc_with_limit() {
        let (pt, tm) = setup();
        let mut agg = Aggregator::new(
            AggType::Facet,
            vec!["brand".to_owned()],
            vec![ComparatorField::Index(1)],
            vec![(FacetSortKey::Count, true)],
            2,
            0,
        );
        for brand in ["a", "b", "b", "c", "c", "c"] {
            let pv = row(&pt, 0.0, brand);
            agg.aggregate(&ConstPayload::new(&pt, &pv), &tm).unwrap();
        }
        let result = agg.result();
        assert_eq!(result.facets.len(), 2);
        assert_eq!(result.facets[0].values, vec!["c"]);
        assert_eq!(result.facets[0].count, 3);
        assert_eq!(result.facets[1].values, vec!["b"]);
    }

    #[test]
    fn test_distinct_preserves_first_seen_order() {
        let (pt, tm) = setup();
        let mut agg = Aggregator::new(
            AggType::Distinct,
            vec!["brand".to_owned()],
            vec![ComparatorField::Index(1)],
            Vec::new(),
            usize::MAX,
            0,
        );
        for brand in ["b", "a", "b", "c"] {
            let pv = row(&pt, 0.0, brand);
            agg.aggregate(&ConstPayload::new(&pt, &pv), &tm).unwrap();
        }
        assert_eq!(agg.result().distincts, vec!["b", "a", "c"]);
    }
}

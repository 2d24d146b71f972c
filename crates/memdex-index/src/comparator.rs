use memdex_error::{MemdexError, Result};
use memdex_query::CondType;
use memdex_types::{
    CollateOpts, ConstPayload, FieldsSet, KeyValueKind, TagsMatcher, TagsPath, Variant,
    VariantArray,
};

use std::cmp::Ordering;

/// Where a comparator reads its field from.
#[derive(Debug, Clone, PartialEq)]
pub enum ComparatorField {
    /// A fixed payload slot.
    Index(usize),
    /// A json path resolved through the tagsmatcher at match time.
    JsonPath(String),
    /// A pre-resolved tag path (sparse indexes).
    TagsPath(TagsPath),
    /// A composite index's field mask; conditions reduce to multi-field
    /// comparison against synthesized payload values.
    Composite(FieldsSet),
}

/// A predicate evaluated against whole payloads.
///
/// Comparators are the fallback when no id-set can drive a condition: plain
/// ("-") indexes, non-indexed json paths and conditions an index cannot
/// answer. The iterator container runs them last, against rows the id-set
/// iterators already located.
#[derive(Debug, Clone, PartialEq)]
pub struct Comparator {
    pub field: ComparatorField,
    pub condition: CondType,
    pub values: VariantArray,
    pub collate: CollateOpts,
}

impl Comparator {
    #[must_use]
    pub fn new(
        field: ComparatorField,
        condition: CondType,
        values: VariantArray,
        collate: CollateOpts,
    ) -> Self {
        Self {
            field,
            condition,
            values,
            collate,
        }
    }

    /// Evaluate the predicate for one row.
    pub fn matches(&self, payload: &ConstPayload<'_>, tm: &TagsMatcher) -> Result<bool> {
        let field_values = match &self.field {
            ComparatorField::Index(idx) => payload.get(*idx),
            ComparatorField::JsonPath(path) => {
                payload.get_by_json_path(path, tm, KeyValueKind::Undefined)?
            }
            ComparatorField::TagsPath(path) => payload.get_by_tags_path(path),
            ComparatorField::Composite(fields) => {
                return self.matches_composite(payload, fields);
            }
        };
        self.match_values(&field_values)
    }

    /// Multi-field comparison against synthesized composite keys.
    fn matches_composite(&self, payload: &ConstPayload<'_>, fields: &FieldsSet) -> Result<bool> {
        let mut ords = self.values.iter().filter_map(|v| match v {
            Variant::Composite(pv) => Some(
                payload.compare(
                    &ConstPayload::new(payload.payload_type(), pv),
                    fields,
                    &self.collate,
                ),
            ),
            _ => None,
        });
        Ok(match self.condition {
            CondType::Eq | CondType::Set => ords.any(|ord| ord == Ordering::Equal),
            CondType::Lt => ords.next().is_some_and(|ord| ord == Ordering::Less),
            CondType::Le => ords.next().is_some_and(|ord| ord != Ordering::Greater),
            CondType::Gt => ords.next().is_some_and(|ord| ord == Ordering::Greater),
            CondType::Ge => ords.next().is_some_and(|ord| ord != Ordering::Less),
            CondType::Range => {
                let mut collected = ords;
                let lo = collected.next();
                let hi = collected.next();
                matches!((lo, hi), (Some(l), Some(h))
                    if l != Ordering::Less && h != Ordering::Greater)
            }
            _ => {
                return Err(MemdexError::query_exec(format!(
                    "composite index does not support condition {}",
                    self.condition.as_str()
                )))
            }
        })
    }

    /// Evaluate against already-extracted field values.
    pub fn match_values(&self, field_values: &VariantArray) -> Result<bool> {
        match self.condition {
            CondType::Any => Ok(field_values.iter().any(|v| !v.is_null())),
            CondType::Empty => Ok(field_values.iter().all(Variant::is_null)),
            CondType::Eq | CondType::Set => Ok(field_values.iter().any(|fv| {
                self.values
                    .iter()
                    .any(|qv| fv.relax_cmp(qv, &self.collate) == Ordering::Equal)
            })),
            CondType::AllSet => Ok(self.values.iter().all(|qv| {
                field_values
                    .iter()
                    .any(|fv| fv.relax_cmp(qv, &self.collate) == Ordering::Equal)
            })),
            CondType::Lt => self.ordered(field_values, |ord| ord == Ordering::Less),
            CondType::Le => self.ordered(field_values, |ord| ord != Ordering::Greater),
            CondType::Gt => self.ordered(field_values, |ord| ord == Ordering::Greater),
            CondType::Ge => self.ordered(field_values, |ord| ord != Ordering::Less),
            CondType::Range => {
                if self.values.len() != 2 {
                    return Err(MemdexError::query_exec(
                        "RANGE condition requires exactly 2 values",
                    ));
                }
                Ok(field_values.iter().any(|fv| {
                    fv.relax_cmp(&self.values[0], &self.collate) != Ordering::Less
                        && fv.relax_cmp(&self.values[1], &self.collate) != Ordering::Greater
                }))
            }
            CondType::Like => {
                let pattern = self
                    .values
                    .first()
                    .and_then(Variant::as_str)
                    .ok_or_else(|| {
                        MemdexError::query_exec("LIKE condition requires a string pattern")
                    })?;
                Ok(field_values
                    .iter()
                    .filter_map(Variant::as_str)
                    .any(|s| like_match(s, pattern)))
            }
            CondType::DWithin => {
                let (px, py, dist) = dwithin_args(&self.values)?;
                if field_values.len() < 2 {
                    return Ok(false);
                }
                let (x, y) = match (field_values[0].as_double(), field_values[1].as_double()) {
                    (Some(x), Some(y)) => (x, y),
                    _ => return Ok(false),
                };
                Ok((x - px).hypot(y - py) <= dist)
            }
        }
    }

    fn ordered(
        &self,
        field_values: &VariantArray,
        accept: impl Fn(Ordering) -> bool,
    ) -> Result<bool> {
        let bound = self
            .values
            .first()
            .ok_or_else(|| MemdexError::query_exec("comparison condition requires a value"))?;
        Ok(field_values
            .iter()
            .any(|fv| accept(fv.relax_cmp(bound, &self.collate))))
    }
}

/// Extract `(x, y, distance)` from DWITHIN arguments: either
/// `[point_tuple, distance]` or `[x, y, distance]`.
pub fn dwithin_args(values: &VariantArray) -> Result<(f64, f64, f64)> {
    let fail = || MemdexError::query_exec("DWITHIN expects a point and a distance");
    match values.len() {
        2 => match &values[0] {
            Variant::Tuple(point) if point.len() == 2 => {
                let x = point[0].as_double().ok_or_else(fail)?;
                let y = point[1].as_double().ok_or_else(fail)?;
                let d = values[1].as_double().ok_or_else(fail)?;
                Ok((x, y, d))
            }
            _ => Err(fail()),
        },
        3 => {
            let x = values[0].as_double().ok_or_else(fail)?;
            let y = values[1].as_double().ok_or_else(fail)?;
            let d = values[2].as_double().ok_or_else(fail)?;
            Ok((x, y, d))
        }
        _ => Err(fail()),
    }
}

/// SQL LIKE matching: `%` matches any run, `_` a single character.
#[must_use]
pub fn like_match(text: &str, pattern: &str) -> bool {
    fn rec(t: &[char], p: &[char]) -> bool {
        match p.split_first() {
            None => t.is_empty(),
            Some(('%', rest)) => {
                (0..=t.len()).any(|skip| rec(&t[skip..], rest))
            }
            Some(('_', rest)) => !t.is_empty() && rec(&t[1..], rest),
            Some((&c, rest)) => t.first() == Some(&c) && rec(&t[1..], rest),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    rec(&t, &p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn cmp(cond: CondType, values: VariantArray) -> Comparator {
        Comparator::new(
            ComparatorField::Index(0),
            cond,
            values,
            CollateOpts::default(),
        )
    }

    #[test]
    fn test_eq_and_set() {
        let c = cmp(CondType::Set, smallvec![Variant::Int(1), Variant::Int(3)]);
        assert!(c.match_values(&smallvec![Variant::Int(3)]).unwrap());
        assert!(!c.match_values(&smallvec![Variant::Int(2)]).unwrap());
    }

    #[test]
    fn test_allset_requires_every_value() {
        let c = cmp(CondType::AllSet, smallvec![Variant::Int(1), Variant::Int(2)]);
        assert!(c
            .match_values(&smallvec![Variant::Int(2), Variant::Int(1), Variant::Int(9)])
            .unwrap());
        assert!(!c.match_values(&smallvec![Variant::Int(1)]).unwrap());
    }

    #[test]
    fn test_range_inclusive() {
        let c = cmp(CondType::Range, smallvec![Variant::Int(2), Variant::Int(4)]);
        assert!(c.match_values(&smallvec![Variant::Int(2)]).unwrap());
        assert!(c.match_values(&smallvec![Variant::Int(4)]).unwrap());
        assert!(!c.match_values(&smallvec![Variant::Int(5)]).unwrap());
    }

    #[test]
    fn test_relaxed_numeric_comparison() {
        let c = cmp(CondType::Gt, smallvec![Variant::Int(10)]);
        assert!(c.match_values(&smallvec![Variant::Double(10.5)]).unwrap());
    }

    #[test]
    fn test_any_and_empty() {
        let any = cmp(CondType::Any, smallvec![]);
        let empty = cmp(CondType::Empty, smallvec![]);
        assert!(any.match_values(&smallvec![Variant::Int(1)]).unwrap());
        assert!(!any.match_values(&smallvec![]).unwrap());
        assert!(empty.match_values(&smallvec![]).unwrap());
        assert!(!empty.match_values(&smallvec![Variant::Int(1)]).unwrap());
    }

    #[test]
    fn test_like_wildcards() {
        assert!(like_match("hello", "h%o"));
        assert!(like_match("hello", "_ello"));
        assert!(like_match("hello", "%"));
        assert!(!like_match("hello", "h_o"));
        assert!(like_match("a", "_"));
        assert!(!like_match("", "_"));
    }

    #[test]
    fn test_dwithin_on_point_field() {
        let c = cmp(
            CondType::DWithin,
            smallvec![
                Variant::Tuple(vec![Variant::Double(0.0), Variant::Double(0.0)]),
                Variant::Double(5.0)
            ],
        );
        assert!(c
            .match_values(&smallvec![Variant::Double(3.0), Variant::Double(4.0)])
            .unwrap());
        assert!(!c
            .match_values(&smallvec![Variant::Double(4.0), Variant::Double(4.0)])
            .unwrap());
    }
}

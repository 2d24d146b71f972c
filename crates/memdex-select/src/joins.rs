use std::cmp::Ordering;

use memdex_error::{MemdexError, Result};
use memdex_query::{CondType, JoinType, OpType, QueryJoinEntry};
use memdex_types::{
    CollateOpts, ConstPayload, ItemRef, KeyValueKind, PayloadType, PayloadValue, RowId,
    TagsMatcher, Variant, VariantArray,
};

/// Right rows above this bound stop being copied into the preresult and
/// stay referenced by id.
pub const MAX_ITERATIONS_FOR_PRERESULT_STORE_VALUES: usize = 200;

/// The cached output of a join's right side, reused across outer rows.
#[derive(Debug)]
pub enum PreResultData<'a> {
    /// Small right side: payload values stored inline.
    Values(Vec<(RowId, PayloadValue)>),
    /// Large right side: ids referencing the right namespace's items, which
    /// stay read-locked for the outer select.
    Ids {
        ids: memdex_index::IdSet,
        right_items: &'a [PayloadValue],
    },
}

impl PreResultData<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Values(v) => v.len(),
            Self::Ids { ids, .. } => ids.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One join of the outer query: kind, ON conditions and the preresult.
pub struct JoinedSelector<'a> {
    pub join_type: JoinType,
    pub right_ns: String,
    pub on: Vec<QueryJoinEntry>,
    pub right_payload_type: PayloadType,
    pub right_tags_matcher: TagsMatcher,
    pub preresult: PreResultData<'a>,
    /// Sort-orders flag the right query ran with; must match the outer
    /// query's.
    pub enable_sort_orders: bool,
    pub ns_id: u8,
}

impl JoinedSelector<'_> {
    fn left_values(
        &self,
        left: &ConstPayload<'_>,
        left_tm: &TagsMatcher,
        field: &str,
        left_field_pos: Option<usize>,
    ) -> Result<VariantArray> {
        match left_field_pos {
            Some(pos) => Ok(left.get(pos)),
            None => left.get_by_json_path(field, left_tm, KeyValueKind::Undefined),
        }
    }

    fn right_values(&self, right: &ConstPayload<'_>, field: &str) -> Result<VariantArray> {
        match self.right_payload_type.field_by_name(field) {
            Some(pos) => Ok(right.get(pos)),
            None => right.get_by_json_path(field, &self.right_tags_matcher, KeyValueKind::Undefined),
        }
    }

    fn on_conditions_hold(
        &self,
        left: &ConstPayload<'_>,
        left_tm: &TagsMatcher,
        left_fields: &[Option<usize>],
        right: &ConstPayload<'_>,
    ) -> Result<bool> {
        let mut acc = true;
        for (i, entry) in self.on.iter().enumerate() {
            let holds = {
                let lvals =
                    self.left_values(left, left_tm, &entry.left_field, left_fields[i])?;
                let rvals = self.right_values(right, &entry.right_field)?;
                Self::any_pair_matches(&lvals, &rvals, entry.condition)
            };
            if i == 0 {
                acc = holds;
            } else {
                match entry.op {
                    OpType::And => acc = acc && holds,
                    OpType::Or => acc = acc || holds,
                    OpType::Not => acc = acc && !holds,
                }
            }
        }
        Ok(acc)
    }

    fn any_pair_matches(lvals: &VariantArray, rvals: &VariantArray, condition: CondType) -> bool {
        let collate = CollateOpts::default();
        lvals.iter().any(|l| {
            rvals.iter().any(|r| {
                let ord = l.relax_cmp(r, &collate);
                match condition {
                    CondType::Eq | CondType::Set => ord == Ordering::Equal,
                    CondType::Lt => ord == Ordering::Less,
                    CondType::Le => ord != Ordering::Greater,
                    CondType::Gt => ord == Ordering::Greater,
                    CondType::Ge => ord != Ordering::Less,
                    _ => false,
                }
            })
        })
    }

    fn for_each_right_row<T>(
        &self,
        mut f: impl FnMut(RowId, &PayloadValue) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        match &self.preresult {
            PreResultData::Values(rows) => {
                for (id, value) in rows {
                    if let Some(out) = f(*id, value)? {
                        return Ok(Some(out));
                    }
                }
            }
            PreResultData::Ids { ids, right_items } => {
                for id in ids.iter() {
                    let Some(value) = right_items.get(id as usize) else {
                        continue;
                    };
                    if value.is_free() {
                        continue;
                    }
                    if let Some(out) = f(id, value)? {
                        return Ok(Some(out));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Whether any right row joins with the left row.
    pub fn matches(
        &self,
        left: &ConstPayload<'_>,
        left_tm: &TagsMatcher,
        left_fields: &[Option<usize>],
    ) -> Result<bool> {
        if self.on.is_empty() {
            return Err(MemdexError::query_exec(format!(
                "join with '{}' has no ON conditions",
                self.right_ns
            )));
        }
        Ok(self
            .for_each_right_row(|_, value| {
                let right = ConstPayload::new(&self.right_payload_type, value);
                if self.on_conditions_hold(left, left_tm, left_fields, &right)? {
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            })?
            .is_some())
    }

    /// All right rows joining with the left row, for attachment to results.
    pub fn matching_rows(
        &self,
        left: &ConstPayload<'_>,
        left_tm: &TagsMatcher,
        left_fields: &[Option<usize>],
    ) -> Result<Vec<ItemRef>> {
        let mut out = Vec::new();
        self.for_each_right_row(|id, value| {
            let right = ConstPayload::new(&self.right_payload_type, value);
            if self.on_conditions_hold(left, left_tm, left_fields, &right)? {
                out.push(ItemRef::with_value(id, value.clone(), 0, self.ns_id));
            }
            Ok(None::<()>)
        })?;
        Ok(out)
    }

    /// Values of one right-side field across the whole preresult; feeds the
    /// joined-index id-set optimization.
    pub fn right_field_values(&self, field: &str) -> Result<Vec<Variant>> {
        let mut out = Vec::new();
        self.for_each_right_row(|_, value| {
            let right = ConstPayload::new(&self.right_payload_type, value);
            for v in self.right_values(&right, field)? {
                if !v.is_null() {
                    out.push(v);
                }
            }
            Ok(None::<()>)
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdex_types::{Payload, PayloadFieldType};

    fn right_type() -> PayloadType {
        let mut pt = PayloadType::new("right");
        pt.add_field(PayloadFieldType::new("id", KeyValueKind::Int, false))
            .unwrap();
        pt
    }

    fn left_type() -> PayloadType {
        let mut pt = PayloadType::new("left");
        pt.add_field(PayloadFieldType::new("user_id", KeyValueKind::Int, false))
            .unwrap();
        pt
    }

    fn row(pt: &PayloadType, v: i32) -> PayloadValue {
        let mut pv = PayloadValue::new(pt.num_fields());
        Payload::new(pt, &mut pv).set_one(0, Variant::Int(v)).unwrap();
        pv
    }

    fn selector(rows: Vec<(RowId, PayloadValue)>) -> JoinedSelector<'static> {
        JoinedSelector {
            join_type: JoinType::Inner,
            right_ns: "right".to_owned(),
            on: vec![QueryJoinEntry {
                op: OpType::And,
                condition: CondType::Eq,
                left_field: "user_id".to_owned(),
                right_field: "id".to_owned(),
            }],
            right_payload_type: right_type(),
            right_tags_matcher: TagsMatcher::new(),
            preresult: PreResultData::Values(rows),
            enable_sort_orders: false,
            ns_id: 1,
        }
    }

    #[test]
    fn test_join_matches_and_attaches() {
        let rt = right_type();
        let lt = left_type();
        let js = selector(vec![(0, row(&rt, 7)), (1, row(&rt, 9))]);
        let tm = TagsMatcher::new();

        let left_row = row(&lt, 7);
        let left = ConstPayload::new(&lt, &left_row);
        assert!(js.matches(&left, &tm, &[Some(0)]).unwrap());
        let rows = js.matching_rows(&left, &tm, &[Some(0)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row_id, 0);

        let miss_row = row(&lt, 8);
        let miss = ConstPayload::new(&lt, &miss_row);
        assert!(!js.matches(&miss, &tm, &[Some(0)]).unwrap());
    }

    #[test]
    fn test_right_field_values() {
        let rt = right_type();
        let js = selector(vec![(0, row(&rt, 7)), (1, row(&rt, 9))]);
        let vals = js.right_field_values("id").unwrap();
        assert_eq!(vals, vec![Variant::Int(7), Variant::Int(9)]);
    }

    #[test]
    fn test_join_without_on_is_query_exec() {
        let rt = right_type();
        let lt = left_type();
        let mut js = selector(vec![(0, row(&rt, 7))]);
        js.on.clear();
        let left_row = row(&lt, 7);
        let left = ConstPayload::new(&lt, &left_row);
        let err = js.matches(&left, &TagsMatcher::new(), &[]).unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::QueryExec);
    }
}

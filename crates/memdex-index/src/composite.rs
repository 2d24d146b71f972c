use std::collections::HashMap;
use std::hash::Hasher;

use memdex_error::{MemdexError, Result};
use memdex_query::CondType;
use memdex_types::{
    CollateOpts, ConstPayload, FieldsSet, PayloadType, PayloadValue, RowId, Variant, VariantArray,
};
use xxhash_rust::xxh3::Xxh3;

use crate::comparator::{Comparator, ComparatorField};
use crate::idset::{AddMode, IdSet};
use crate::selectkey::{SelectKeyResult, SelectKeyResults};
use crate::SelectOpts;

/// A hash index over a tuple of payload fields.
///
/// Keys are synthesized payload values carrying only the masked fields.
/// Buckets are keyed by the field-mask hash; equality within a bucket goes
/// through `Payload::compare`.
#[derive(Debug, Clone)]
pub struct CompositeIndex {
    buckets: HashMap<u64, Vec<(PayloadValue, IdSet)>>,
    fields: FieldsSet,
    ptype: PayloadType,
    collate: CollateOpts,
    keys: usize,
}

impl CompositeIndex {
    #[must_use]
    pub fn new(fields: FieldsSet, ptype: PayloadType, collate: CollateOpts) -> Self {
        Self {
            buckets: HashMap::new(),
            fields,
            ptype,
            collate,
            keys: 0,
        }
    }

    #[must_use]
    pub fn fields(&self) -> &FieldsSet {
        &self.fields
    }

    #[must_use]
    pub fn keys_count(&self) -> usize {
        self.keys
    }

    fn hash_of(&self, value: &PayloadValue) -> u64 {
        let mut hasher = Xxh3::new();
        ConstPayload::new(&self.ptype, value).hash_fields(&self.fields, &mut hasher);
        hasher.finish()
    }

    fn key_equals(&self, a: &PayloadValue, b: &PayloadValue) -> bool {
        Self::key_equals_parts(&self.ptype, &self.fields, &self.collate, a, b)
    }

    fn key_equals_parts(
        ptype: &PayloadType,
        fields: &FieldsSet,
        collate: &CollateOpts,
        a: &PayloadValue,
        b: &PayloadValue,
    ) -> bool {
        ConstPayload::new(ptype, a).compare(&ConstPayload::new(ptype, b), fields, collate)
            == std::cmp::Ordering::Equal
    }

    /// Build the synthesized key for a full row.
    fn key_of(&self, row: &PayloadValue) -> PayloadValue {
        let mut key = PayloadValue::new(self.ptype.num_fields());
        let src = ConstPayload::new(&self.ptype, row);
        let mut pl = memdex_types::Payload::new(&self.ptype, &mut key);
        for field in self.fields.iter() {
            if field >= 0 {
                // Values are already of the declared kind.
                let _ = pl.set(field as usize, src.get(field as usize));
            }
        }
        key
    }

    pub fn upsert_row(&mut self, row: &PayloadValue, id: RowId) {
        let key = self.key_of(row);
        let hash = self.hash_of(&key);
        let ptype = self.ptype.clone();
        let fields = self.fields.clone();
        let collate = self.collate.clone();
        let bucket = self.buckets.entry(hash).or_default();
        for (existing, set) in bucket.iter_mut() {
            if Self::key_equals_parts(&ptype, &fields, &collate, existing, &key) {
                set.add(id, AddMode::Ordered);
                return;
            }
        }
        let mut set = IdSet::new();
        set.add(id, AddMode::Ordered);
        bucket.push((key, set));
        self.keys += 1;
    }

    pub fn delete_row(&mut self, row: &PayloadValue, id: RowId) {
        let key = self.key_of(row);
        let hash = self.hash_of(&key);
        let ptype = self.ptype.clone();
        let fields = self.fields.clone();
        let collate = self.collate.clone();
        if let Some(bucket) = self.buckets.get_mut(&hash) {
            let mut remove_at = None;
            for (i, (existing, set)) in bucket.iter_mut().enumerate() {
                if Self::key_equals_parts(&ptype, &fields, &collate, existing, &key) {
                    set.remove(id);
                    if set.is_empty() {
                        remove_at = Some(i);
                    }
                    break;
                }
            }
            if let Some(i) = remove_at {
                bucket.remove(i);
                self.keys -= 1;
                if bucket.is_empty() {
                    self.buckets.remove(&hash);
                }
            }
        }
    }

    /// Synthesize a composite key from a tuple of per-field values, in the
    /// mask's field order.
    pub fn make_key(&self, tuple: &[Variant]) -> Result<Variant> {
        let positions: Vec<i32> = self.fields.iter().collect();
        if tuple.len() != positions.len() {
            return Err(MemdexError::params(format!(
                "composite key expects {} values, got {}",
                positions.len(),
                tuple.len()
            )));
        }
        let mut key = PayloadValue::new(self.ptype.num_fields());
        let mut pl = memdex_types::Payload::new(&self.ptype, &mut key);
        for (field, value) in positions.into_iter().zip(tuple.iter()) {
            if field >= 0 {
                pl.set_one(field as usize, value.clone())?;
            }
        }
        Ok(Variant::Composite(key))
    }

    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        _opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        match condition {
            CondType::Eq | CondType::Set => {
                let mut res = SelectKeyResult::default();
                for value in values {
                    let Variant::Composite(key) = value else {
                        return Err(MemdexError::query_exec(
                            "composite index expects composite keys",
                        ));
                    };
                    let hash = self.hash_of(key);
                    if let Some(bucket) = self.buckets.get(&hash) {
                        for (existing, set) in bucket {
                            if self.key_equals(existing, key) {
                                res.idsets.push(set.clone());
                            }
                        }
                    }
                }
                if res.idsets.is_empty() {
                    res.idsets.push(IdSet::new());
                }
                Ok(vec![res])
            }
            _ => Ok(vec![SelectKeyResult::from_comparator(Comparator::new(
                ComparatorField::Composite(self.fields.clone()),
                condition,
                values.clone(),
                self.collate.clone(),
            ))]),
        }
    }
}

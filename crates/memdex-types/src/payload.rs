use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use memdex_error::{MemdexError, Result};
use smallvec::smallvec;

use crate::collate::CollateOpts;
use crate::tags::{TagsMatcher, TagsPath};
use crate::variant::{Variant, VariantArray};
use crate::{FieldsSet, KeyValueKind, Lsn};

// ---------------------------------------------------------------------------
// PayloadType — the fixed schema every document in a namespace conforms to
// ---------------------------------------------------------------------------

/// One field of a payload type.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFieldType {
    pub name: String,
    pub kind: KeyValueKind,
    pub is_array: bool,
    pub json_paths: Vec<String>,
}

impl PayloadFieldType {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: KeyValueKind, is_array: bool) -> Self {
        let name = name.into();
        let json_paths = vec![name.clone()];
        Self {
            name,
            kind,
            is_array,
            json_paths,
        }
    }
}

#[derive(Debug, Default)]
struct PayloadTypeInner {
    name: String,
    fields: Vec<PayloadFieldType>,
    // lowercase name -> field position
    by_name: HashMap<String, usize>,
}

/// An ordered, append-only list of fixed fields. Cheap to clone; concurrent
/// readers keep a consistent snapshot via the inner `Arc`.
#[derive(Debug, Clone, Default)]
pub struct PayloadType {
    inner: Arc<PayloadTypeInner>,
}

impl PayloadType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PayloadTypeInner {
                name: name.into(),
                fields: Vec::new(),
                by_name: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.inner.fields.len()
    }

    #[must_use]
    pub fn field(&self, idx: usize) -> Option<&PayloadFieldType> {
        self.inner.fields.get(idx)
    }

    /// Case-insensitive field lookup.
    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<usize> {
        self.inner.by_name.get(&name.to_lowercase()).copied()
    }

    /// Append a field. Fails with `exists` when the name (case-insensitive)
    /// is already taken. Produces a new snapshot; existing readers keep the
    /// old one.
    pub fn add_field(&mut self, field: PayloadFieldType) -> Result<usize> {
        let key = field.name.to_lowercase();
        if self.inner.by_name.contains_key(&key) {
            return Err(MemdexError::exists("field", &field.name));
        }
        let mut inner = PayloadTypeInner {
            name: self.inner.name.clone(),
            fields: self.inner.fields.clone(),
            by_name: self.inner.by_name.clone(),
        };
        let pos = inner.fields.len();
        inner.by_name.insert(key, pos);
        inner.fields.push(field);
        self.inner = Arc::new(inner);
        Ok(pos)
    }

    pub fn fields(&self) -> impl Iterator<Item = &PayloadFieldType> {
        self.inner.fields.iter()
    }
}

// ---------------------------------------------------------------------------
// Document tree — non-indexed content addressed by tag paths
// ---------------------------------------------------------------------------

/// The decoded document, keyed by tagsmatcher tags. Carries everything the
/// fixed slots don't: nested objects, non-indexed fields, sparse paths.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DocNode {
    #[default]
    Empty,
    Scalar(Variant),
    Array(Vec<DocNode>),
    Object(Vec<(u32, DocNode)>),
}

impl DocNode {
    /// Walk a tag path, collecting every scalar it addresses (arrays fan
    /// out).
    pub fn collect(&self, path: &[u32], out: &mut VariantArray) {
        match self {
            Self::Empty => {}
            Self::Scalar(v) => {
                if path.is_empty() {
                    out.push(v.clone());
                }
            }
            Self::Array(items) => {
                for item in items {
                    item.collect(path, out);
                }
            }
            Self::Object(members) => {
                if let Some((tag, rest)) = path.split_first() {
                    for (member_tag, node) in members {
                        if member_tag == tag {
                            node.collect(rest, out);
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PayloadValue — one row, copy-on-write
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct PayloadInner {
    slots: Vec<VariantArray>,
    doc: DocNode,
    lsn: Lsn,
    free: bool,
}

/// A reference-counted, copy-on-write row buffer.
///
/// Clones share the buffer; any mutation through [`Payload`] copies it first
/// when shared, so a reader that cloned the value before a writer replaced
/// the slot keeps observing the old contents. String tails are `Arc<str>`
/// inside [`Variant`] and survive the row being overwritten for as long as
/// any holder remains.
#[derive(Debug, Clone, Default)]
pub struct PayloadValue {
    inner: Arc<PayloadInner>,
}

impl PayloadValue {
    #[must_use]
    pub fn new(num_fields: usize) -> Self {
        Self {
            inner: Arc::new(PayloadInner {
                slots: vec![VariantArray::new(); num_fields],
                doc: DocNode::Empty,
                lsn: Lsn::EMPTY,
                free: false,
            }),
        }
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.inner.free
    }

    pub fn set_free(&mut self, free: bool) {
        Arc::make_mut(&mut self.inner).free = free;
    }

    #[must_use]
    pub fn lsn(&self) -> Lsn {
        self.inner.lsn
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        Arc::make_mut(&mut self.inner).lsn = lsn;
    }

    #[must_use]
    pub fn doc(&self) -> &DocNode {
        &self.inner.doc
    }

    pub fn set_doc(&mut self, doc: DocNode) {
        Arc::make_mut(&mut self.inner).doc = doc;
    }

    /// Grow the slot vector when the payload type gained fields after this
    /// row was created.
    pub fn resize_slots(&mut self, num_fields: usize) {
        let inner = Arc::make_mut(&mut self.inner);
        if inner.slots.len() < num_fields {
            inner.slots.resize(num_fields, VariantArray::new());
        }
    }

    /// Identity comparison used by composite [`Variant`] keys.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn ptr_hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

// ---------------------------------------------------------------------------
// Payload — typed accessors over a value
// ---------------------------------------------------------------------------

/// Read-only accessor pairing a [`PayloadType`] with a [`PayloadValue`].
pub struct ConstPayload<'a> {
    ptype: &'a PayloadType,
    value: &'a PayloadValue,
}

impl<'a> ConstPayload<'a> {
    #[must_use]
    pub fn new(ptype: &'a PayloadType, value: &'a PayloadValue) -> Self {
        Self { ptype, value }
    }

    /// Values of one fixed field.
    #[must_use]
    pub fn get(&self, field: usize) -> VariantArray {
        self.value
            .inner
            .slots
            .get(field)
            .cloned()
            .unwrap_or_default()
    }

    /// Values addressed by a json path through the tags dictionary.
    pub fn get_by_json_path(
        &self,
        path: &str,
        tm: &TagsMatcher,
        expected: KeyValueKind,
    ) -> Result<VariantArray> {
        let tags = tm.path2tag(path);
        let mut out = VariantArray::new();
        if tags.is_empty() {
            return Ok(out);
        }
        self.value.inner.doc.collect(tags.as_slice(), &mut out);
        if expected != KeyValueKind::Undefined {
            for v in &mut out {
                *v = v.convert(expected)?;
            }
        }
        Ok(out)
    }

    /// Values addressed by an already-resolved tag path.
    #[must_use]
    pub fn get_by_tags_path(&self, path: &TagsPath) -> VariantArray {
        let mut out = VariantArray::new();
        self.value.inner.doc.collect(path.as_slice(), &mut out);
        out
    }

    /// Lexicographic comparison of the masked fields, strings under the
    /// given collation. Fields addressed by json-path in the mask are
    /// skipped: composite indexes over sparse paths compare through the
    /// document tree instead.
    #[must_use]
    pub fn compare(&self, other: &Self, fields: &FieldsSet, collate: &CollateOpts) -> Ordering {
        for field in fields.iter() {
            if field < 0 {
                continue;
            }
            let lhs = self.get(field as usize);
            let rhs = other.get(field as usize);
            let ord = cmp_arrays(&lhs, &rhs, collate);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Order-insensitive hash of the masked fields, consistent with
    /// [`Self::compare`] equality under the default collation.
    pub fn hash_fields<H: Hasher>(&self, fields: &FieldsSet, state: &mut H) {
        for field in fields.iter() {
            if field < 0 {
                continue;
            }
            for v in self.get(field as usize).iter() {
                v.hash(state);
            }
        }
    }

    #[must_use]
    pub fn payload_type(&self) -> &PayloadType {
        self.ptype
    }

    #[must_use]
    pub fn value(&self) -> &PayloadValue {
        self.value
    }
}

fn cmp_arrays(lhs: &VariantArray, rhs: &VariantArray, collate: &CollateOpts) -> Ordering {
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        let ord = l.relax_cmp(r, collate);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    lhs.len().cmp(&rhs.len())
}

/// Mutable accessor. All writes go through copy-on-write.
pub struct Payload<'a> {
    ptype: &'a PayloadType,
    value: &'a mut PayloadValue,
}

impl<'a> Payload<'a> {
    pub fn new(ptype: &'a PayloadType, value: &'a mut PayloadValue) -> Self {
        value.resize_slots(ptype.num_fields());
        Self { ptype, value }
    }

    #[must_use]
    pub fn get(&self, field: usize) -> VariantArray {
        ConstPayload::new(self.ptype, self.value).get(field)
    }

    /// Replace one field's values, converting each to the declared kind.
    pub fn set(&mut self, field: usize, values: VariantArray) -> Result<()> {
        let ftype = self
            .ptype
            .field(field)
            .ok_or_else(|| MemdexError::logic(format!("field #{field} out of payload range")))?;
        if values.len() > 1 && !ftype.is_array {
            return Err(MemdexError::params(format!(
                "field '{}' is not an array",
                ftype.name
            )));
        }
        let mut converted = VariantArray::new();
        for v in values {
            if v.is_null() {
                converted.push(v);
            } else {
                converted.push(v.convert(ftype.kind)?);
            }
        }
        let inner = Arc::make_mut(&mut self.value.inner);
        inner.slots[field] = converted;
        Ok(())
    }

    /// Convenience for scalar fields.
    pub fn set_one(&mut self, field: usize, value: Variant) -> Result<()> {
        self.set(field, smallvec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_type() -> PayloadType {
        let mut ptype = PayloadType::new("items");
        ptype
            .add_field(PayloadFieldType::new("id", KeyValueKind::Int, false))
            .unwrap();
        ptype
            .add_field(PayloadFieldType::new("name", KeyValueKind::String, false))
            .unwrap();
        ptype
            .add_field(PayloadFieldType::new("prices", KeyValueKind::Int, true))
            .unwrap();
        ptype
    }

    #[test]
    fn test_field_lookup_is_case_insensitive() {
        let ptype = sample_type();
        assert_eq!(ptype.field_by_name("ID"), Some(0));
        assert_eq!(ptype.field_by_name("Name"), Some(1));
        assert_eq!(ptype.field_by_name("missing"), None);
    }

    #[test]
    fn test_duplicate_field_name_fails() {
        let mut ptype = sample_type();
        let err = ptype
            .add_field(PayloadFieldType::new("NAME", KeyValueKind::String, false))
            .unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::Exists);
    }

    #[test]
    fn test_set_get_roundtrip_with_conversion() {
        let ptype = sample_type();
        let mut value = PayloadValue::new(ptype.num_fields());
        let mut pl = Payload::new(&ptype, &mut value);
        pl.set_one(0, Variant::Int64(7)).unwrap();
        pl.set_one(1, Variant::string("widget")).unwrap();
        assert_eq!(pl.get(0)[0], Variant::Int(7));
        assert_eq!(pl.get(1)[0], Variant::string("widget"));
    }

    #[test]
    fn test_non_array_field_rejects_multiple_values() {
        let ptype = sample_type();
        let mut value = PayloadValue::new(ptype.num_fields());
        let mut pl = Payload::new(&ptype, &mut value);
        let err = pl
            .set(0, smallvec![Variant::Int(1), Variant::Int(2)])
            .unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::Params);
    }

    #[test]
    fn test_copy_on_write_preserves_readers() {
        let ptype = sample_type();
        let mut value = PayloadValue::new(ptype.num_fields());
        Payload::new(&ptype, &mut value)
            .set_one(0, Variant::Int(1))
            .unwrap();
        let snapshot = value.clone();
        Payload::new(&ptype, &mut value)
            .set_one(0, Variant::Int(2))
            .unwrap();
        assert_eq!(ConstPayload::new(&ptype, &snapshot).get(0)[0], Variant::Int(1));
        assert_eq!(ConstPayload::new(&ptype, &value).get(0)[0], Variant::Int(2));
    }

    #[test]
    fn test_compare_masked_fields() {
        let ptype = sample_type();
        let collate = CollateOpts::default();
        let mut a = PayloadValue::new(ptype.num_fields());
        let mut b = PayloadValue::new(ptype.num_fields());
        Payload::new(&ptype, &mut a)
            .set_one(0, Variant::Int(1))
            .unwrap();
        Payload::new(&ptype, &mut b)
            .set_one(0, Variant::Int(2))
            .unwrap();
        let fields = FieldsSet::from_fields([0]);
        assert_eq!(
            ConstPayload::new(&ptype, &a).compare(&ConstPayload::new(&ptype, &b), &fields, &collate),
            Ordering::Less
        );
    }

    #[test]
    fn test_doc_tree_collect_through_arrays() {
        let doc = DocNode::Object(vec![(
            1,
            DocNode::Array(vec![
                DocNode::Object(vec![(2, DocNode::Scalar(Variant::Int(10)))]),
                DocNode::Object(vec![(2, DocNode::Scalar(Variant::Int(20)))]),
            ]),
        )]);
        let mut out = VariantArray::new();
        doc.collect(&[1, 2], &mut out);
        assert_eq!(out.as_slice(), &[Variant::Int(10), Variant::Int(20)]);
    }

    #[test]
    fn test_free_flag_and_lsn_stamp() {
        let mut value = PayloadValue::new(1);
        assert!(!value.is_free());
        value.set_lsn(Lsn(5));
        value.set_free(true);
        assert!(value.is_free());
        assert_eq!(value.lsn(), Lsn(5));
    }
}

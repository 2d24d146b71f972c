//! Typed secondary indexes for memdex.
//!
//! Every index kind sits behind the [`Index`] sum type so the hot
//! `select_key` path dispatches once per condition, never per row. Results
//! come back as [`SelectKeyResult`]s: id-sets to iterate or comparators for
//! the outer loop to run.

mod comparator;
mod composite;
mod fulltext;
mod idset;
mod kv;
mod rtree;
mod selectkey;

pub use comparator::{dwithin_args, like_match, Comparator, ComparatorField};
pub use composite::CompositeIndex;
pub use fulltext::FullTextIndex;
pub use idset::{AddMode, IdSet, IdSetIter};
pub use kv::{HashIndex, StoreIndex, TreeIndex};
pub use rtree::{Point, RTreeIndex, Rect, Splitter};
pub use selectkey::{SelectKeyResult, SelectKeyResults};

use memdex_error::{MemdexError, Result};
use memdex_query::CondType;
use memdex_types::{
    CollateOpts, ConstPayload, FieldsSet, IndexOpts, KeyValueKind, PayloadType, RowId, TagsMatcher,
    TagsPath, Variant, VariantArray,
};
pub use serde_like::IndexDef;

/// Options the selector passes down to `select_key`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectOpts {
    /// Live rows in the namespace; caps comparator costs.
    pub items_count: usize,
    /// Skip the per-index idset cache (cost probes must not pollute it).
    pub disable_idset_cache: bool,
    /// Probe the candidate sort order of an unbuilt tree index.
    pub unbuilt_sort_orders: bool,
}

mod serde_like {
    use super::{IndexOpts, KeyValueKind};
    use serde::{Deserialize, Serialize};

    /// Declarative index definition, as accepted by `add_index`.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct IndexDef {
        pub name: String,
        /// Document paths feeding the index. Composite and fulltext indexes
        /// list several.
        pub json_paths: Vec<String>,
        pub index_type: super::IndexType,
        pub field_type: KeyValueKind,
        pub opts: IndexOpts,
    }

    impl IndexDef {
        #[must_use]
        pub fn new(
            name: impl Into<String>,
            index_type: super::IndexType,
            field_type: KeyValueKind,
            opts: IndexOpts,
        ) -> Self {
            let name = name.into();
            Self {
                json_paths: vec![name.clone()],
                name,
                index_type,
                field_type,
                opts,
            }
        }

        #[must_use]
        pub fn with_json_paths(mut self, paths: Vec<String>) -> Self {
            self.json_paths = paths;
            self
        }

        /// Composite definitions name their source fields `"f1+f2"`.
        #[must_use]
        pub fn is_composite(&self) -> bool {
            self.index_type == super::IndexType::Composite
        }
    }
}

/// Index structure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IndexType {
    Hash,
    Tree,
    /// `"-"`: stored in the payload only, no structure.
    Store,
    Text,
    RTree,
    Composite,
}

#[derive(Clone)]
enum IndexVariant {
    Hash(HashIndex),
    Tree(TreeIndex),
    Store(StoreIndex),
    Composite(CompositeIndex),
    RTree(RTreeIndex),
    FullText(FullTextIndex),
}

/// One namespace index: definition, resolved fields and the structure.
#[derive(Clone)]
pub struct Index {
    def: IndexDef,
    fields: FieldsSet,
    sparse_path: Option<TagsPath>,
    variant: IndexVariant,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.def.name)
            .field("type", &self.def.index_type)
            .finish()
    }
}

impl Index {
    /// Build an index from its definition. `fields` holds the payload slots
    /// the namespace resolved for the definition's json paths;
    /// `sparse_path` is set for sparse indexes instead.
    pub fn create(
        def: IndexDef,
        ptype: &PayloadType,
        fields: FieldsSet,
        sparse_path: Option<TagsPath>,
    ) -> Result<Self> {
        let first_field = fields.iter().find(|&f| f >= 0).unwrap_or(0).max(0) as usize;
        let collate = def.opts.collate.clone();
        let variant = match def.index_type {
            IndexType::Hash => IndexVariant::Hash(HashIndex::new(def.field_type, collate, first_field)),
            IndexType::Tree => IndexVariant::Tree(TreeIndex::new(def.field_type, collate, first_field)),
            IndexType::Store => IndexVariant::Store(StoreIndex::new(collate, first_field)),
            IndexType::Composite => IndexVariant::Composite(CompositeIndex::new(
                fields.clone(),
                ptype.clone(),
                collate,
            )),
            IndexType::RTree => IndexVariant::RTree(RTreeIndex::new(if def.opts.is_rtree_linear() {
                Splitter::Linear
            } else {
                Splitter::Quadratic
            })),
            IndexType::Text => {
                let names = def.json_paths.clone();
                IndexVariant::FullText(FullTextIndex::new(names))
            }
        };
        Ok(Self {
            def,
            fields,
            sparse_path,
            variant,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.def.name
    }

    #[must_use]
    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    #[must_use]
    pub fn opts(&self) -> &IndexOpts {
        &self.def.opts
    }

    #[must_use]
    pub fn key_type(&self) -> KeyValueKind {
        self.def.field_type
    }

    #[must_use]
    pub fn collate(&self) -> &CollateOpts {
        &self.def.opts.collate
    }

    #[must_use]
    pub fn fields(&self) -> &FieldsSet {
        &self.fields
    }

    #[must_use]
    pub fn is_ordered(&self) -> bool {
        matches!(self.variant, IndexVariant::Tree(_))
    }

    #[must_use]
    pub fn is_fulltext(&self) -> bool {
        matches!(self.variant, IndexVariant::FullText(_))
    }

    #[must_use]
    pub fn is_composite(&self) -> bool {
        matches!(self.variant, IndexVariant::Composite(_))
    }

    /// Distinct keys; the engine's only cardinality statistic.
    #[must_use]
    pub fn keys_count(&self) -> usize {
        match &self.variant {
            IndexVariant::Hash(idx) => idx.keys_count(),
            IndexVariant::Tree(idx) => idx.keys_count(),
            IndexVariant::Composite(idx) => idx.keys_count(),
            IndexVariant::RTree(idx) => idx.len(),
            IndexVariant::FullText(idx) => idx.docs_count(),
            IndexVariant::Store(_) => 0,
        }
    }

    /// Evaluate one condition. `_sort_id` identifies the requested sort
    /// order for cursor-producing indexes.
    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        _sort_id: u32,
        opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        match &self.variant {
            IndexVariant::Hash(idx) => idx.select_key(values, condition, opts),
            IndexVariant::Tree(idx) => idx.select_key(values, condition, opts),
            IndexVariant::Store(idx) => idx.select_key(values, condition, opts),
            IndexVariant::Composite(idx) => idx.select_key(values, condition, opts),
            IndexVariant::RTree(idx) => idx.select_key(values, condition, opts),
            IndexVariant::FullText(idx) => idx.select_key(values, condition, opts),
        }
    }

    /// Add a row's values. Sparse indexes skip rows whose path is absent.
    pub fn upsert(&mut self, pl: &ConstPayload<'_>, _tm: &TagsMatcher, id: RowId) -> Result<()> {
        match &mut self.variant {
            IndexVariant::Composite(idx) => {
                idx.upsert_row(pl.value(), id);
                Ok(())
            }
            IndexVariant::FullText(idx) => {
                let texts = Self::text_values(&self.fields, pl);
                idx.upsert_doc(&texts, id);
                Ok(())
            }
            variant => {
                let values = Self::scalar_values(&self.fields, &self.sparse_path, pl);
                if values.is_empty() {
                    return Ok(());
                }
                match variant {
                    IndexVariant::Hash(idx) => idx.upsert(&values, id),
                    IndexVariant::Tree(idx) => idx.upsert(&values, id),
                    IndexVariant::RTree(idx) => idx.upsert(&values, id),
                    IndexVariant::Store(_) => Ok(()),
                    IndexVariant::Composite(_) | IndexVariant::FullText(_) => unreachable!(),
                }
            }
        }
    }

    /// Remove a row's values.
    pub fn delete(&mut self, pl: &ConstPayload<'_>, _tm: &TagsMatcher, id: RowId) -> Result<()> {
        match &mut self.variant {
            IndexVariant::Composite(idx) => {
                idx.delete_row(pl.value(), id);
                Ok(())
            }
            IndexVariant::FullText(idx) => {
                idx.delete_doc(id);
                Ok(())
            }
            variant => {
                let values = Self::scalar_values(&self.fields, &self.sparse_path, pl);
                if values.is_empty() {
                    return Ok(());
                }
                match variant {
                    IndexVariant::Hash(idx) => idx.delete(&values, id),
                    IndexVariant::Tree(idx) => idx.delete(&values, id),
                    IndexVariant::RTree(idx) => idx.delete_values(&values, id),
                    IndexVariant::Store(_) => Ok(()),
                    IndexVariant::Composite(_) | IndexVariant::FullText(_) => unreachable!(),
                }
            }
        }
    }

    fn scalar_values(
        fields: &FieldsSet,
        sparse_path: &Option<TagsPath>,
        pl: &ConstPayload<'_>,
    ) -> VariantArray {
        match sparse_path {
            Some(path) => pl.get_by_tags_path(path),
            None => {
                let field = fields.iter().find(|&f| f >= 0).unwrap_or(0).max(0) as usize;
                pl.get(field)
            }
        }
    }

    fn text_values(fields: &FieldsSet, pl: &ConstPayload<'_>) -> Vec<String> {
        fields
            .iter()
            .filter(|&f| f >= 0)
            .map(|f| {
                pl.get(f as usize)
                    .iter()
                    .map(|v| match v {
                        Variant::String(s) => s.to_string(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    /// Build deferred structures (tree sort orders).
    pub fn commit(&mut self) {
        if let IndexVariant::Tree(idx) = &mut self.variant {
            idx.commit();
        }
    }

    /// The materialized scan-position -> row-id permutation of an ordered
    /// index, empty until built.
    #[must_use]
    pub fn sort_orders(&self) -> &[RowId] {
        match &self.variant {
            IndexVariant::Tree(idx) => idx.sort_orders(),
            _ => &[],
        }
    }

    #[must_use]
    pub fn sort_orders_built(&self) -> bool {
        match &self.variant {
            IndexVariant::Tree(idx) => idx.sort_orders_built(),
            _ => false,
        }
    }

    /// Candidate sort order of an unbuilt tree index, computed on demand.
    #[must_use]
    pub fn ordered_ids(&self) -> Vec<RowId> {
        match &self.variant {
            IndexVariant::Tree(idx) => idx.ordered_ids(),
            _ => Vec::new(),
        }
    }

    /// Synthesize a composite key from per-field values.
    pub fn make_composite_key(&self, tuple: &[Variant]) -> Result<Variant> {
        match &self.variant {
            IndexVariant::Composite(idx) => idx.make_key(tuple),
            _ => Err(MemdexError::logic(format!(
                "index '{}' is not composite",
                self.def.name
            ))),
        }
    }

    /// The rtree verifier, for tests and consistency checks.
    pub fn verify_rtree(&self) -> Result<()> {
        match &self.variant {
            IndexVariant::RTree(idx) => idx.verify(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memdex_types::{Payload, PayloadFieldType, PayloadValue};
    use smallvec::smallvec;

    fn ptype() -> PayloadType {
        let mut pt = PayloadType::new("items");
        pt.add_field(PayloadFieldType::new("id", KeyValueKind::Int, false))
            .unwrap();
        pt.add_field(PayloadFieldType::new("name", KeyValueKind::String, false))
            .unwrap();
        pt
    }

    fn row(pt: &PayloadType, id: i32, name: &str) -> PayloadValue {
        let mut pv = PayloadValue::new(pt.num_fields());
        let mut pl = Payload::new(pt, &mut pv);
        pl.set_one(0, Variant::Int(id)).unwrap();
        pl.set_one(1, Variant::string(name)).unwrap();
        pv
    }

    #[test]
    fn test_index_create_and_upsert_select() {
        let pt = ptype();
        let tm = TagsMatcher::new();
        let def = IndexDef::new("id", IndexType::Hash, KeyValueKind::Int, IndexOpts::new());
        let mut idx = Index::create(def, &pt, FieldsSet::from_fields([0]), None).unwrap();
        let r1 = row(&pt, 7, "a");
        idx.upsert(&ConstPayload::new(&pt, &r1), &tm, 0).unwrap();
        let res = idx
            .select_key(
                &smallvec![Variant::Int(7)],
                CondType::Eq,
                0,
                &SelectOpts::default(),
            )
            .unwrap();
        let ids: Vec<RowId> = res[0].idsets.iter().flat_map(IdSet::iter).collect();
        assert_eq!(ids, vec![0]);
        assert_eq!(idx.keys_count(), 1);
    }

    #[test]
    fn test_tree_index_is_ordered() {
        let pt = ptype();
        let def = IndexDef::new("id", IndexType::Tree, KeyValueKind::Int, IndexOpts::new());
        let idx = Index::create(def, &pt, FieldsSet::from_fields([0]), None).unwrap();
        assert!(idx.is_ordered());
        assert!(!idx.is_fulltext());
        assert!(!idx.sort_orders_built());
    }

    #[test]
    fn test_sparse_index_skips_absent_rows() {
        let pt = ptype();
        let mut tm = TagsMatcher::new();
        let path = tm.path2tag_or_add("extra");
        let def = IndexDef::new(
            "extra",
            IndexType::Hash,
            KeyValueKind::String,
            IndexOpts::new().sparse(true),
        );
        let mut idx = Index::create(def, &pt, FieldsSet::new(), Some(path)).unwrap();
        let r1 = row(&pt, 1, "a"); // no "extra" in the doc tree
        idx.upsert(&ConstPayload::new(&pt, &r1), &tm, 0).unwrap();
        assert_eq!(idx.keys_count(), 0);
    }
}

//! Core data-model types for memdex.
//!
//! Everything the engine passes between layers lives here: the [`Variant`]
//! scalar, the fixed-schema payload layer ([`PayloadType`], [`PayloadValue`],
//! [`Payload`]), the JSON tag dictionary ([`TagsMatcher`]) and the small
//! plain types (row ids, LSNs, index options) shared by every crate.

mod collate;
mod payload;
mod tags;
mod variant;

pub use collate::{CollateMode, CollateOpts, SortOrderTable};
pub use payload::{ConstPayload, DocNode, Payload, PayloadFieldType, PayloadType, PayloadValue};
pub use tags::{TagsMatcher, TagsPath};
pub use variant::{Variant, VariantArray};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Row ids and LSNs
// ---------------------------------------------------------------------------

/// Index into a namespace's items vector. Stable for a record's lifetime.
pub type RowId = u32;

/// Log sequence number, monotonically increasing per namespace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub i64);

impl Lsn {
    /// Sentinel for "no LSN assigned yet".
    pub const EMPTY: Self = Self(-1);

    /// Whether this LSN has been assigned.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 < 0
    }

    /// The next LSN in sequence.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// The (upstream, origin) LSN pair attached to every replicated update.
///
/// `upstream` is the master's LSN for the record; `origin` is the LSN the
/// slave assigned when applying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LsnPair {
    pub upstream: Lsn,
    pub origin: Lsn,
}

// ---------------------------------------------------------------------------
// Value kinds
// ---------------------------------------------------------------------------

/// The declared kind of an indexed field or a [`Variant`] value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyValueKind {
    Int,
    Int64,
    Double,
    Bool,
    String,
    Composite,
    Tuple,
    Null,
    #[default]
    Undefined,
}

impl KeyValueKind {
    /// Name used in error messages and index definitions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Int64 => "int64",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Composite => "composite",
            Self::Tuple => "tuple",
            Self::Null => "null",
            Self::Undefined => "undefined",
        }
    }
}

// ---------------------------------------------------------------------------
// Index options
// ---------------------------------------------------------------------------

/// Bit flags and collation options attached to an index definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOpts {
    flags: u8,
    pub collate: CollateOpts,
    /// Opaque per-index configuration blob (fulltext tuning etc).
    pub config: Option<String>,
}

impl IndexOpts {
    pub const PK: u8 = 1 << 0;
    pub const ARRAY: u8 = 1 << 1;
    pub const DENSE: u8 = 1 << 2;
    pub const SPARSE: u8 = 1 << 3;
    pub const RTREE_LINEAR: u8 = 1 << 4;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn is_pk(&self) -> bool {
        self.flags & Self::PK != 0
    }

    #[must_use]
    pub const fn is_array(&self) -> bool {
        self.flags & Self::ARRAY != 0
    }

    #[must_use]
    pub const fn is_dense(&self) -> bool {
        self.flags & Self::DENSE != 0
    }

    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        self.flags & Self::SPARSE != 0
    }

    #[must_use]
    pub const fn is_rtree_linear(&self) -> bool {
        self.flags & Self::RTREE_LINEAR != 0
    }

    #[must_use]
    pub const fn pk(mut self, value: bool) -> Self {
        self.flags = if value {
            self.flags | Self::PK
        } else {
            self.flags & !Self::PK
        };
        self
    }

    #[must_use]
    pub const fn array(mut self, value: bool) -> Self {
        self.flags = if value {
            self.flags | Self::ARRAY
        } else {
            self.flags & !Self::ARRAY
        };
        self
    }

    #[must_use]
    pub const fn dense(mut self, value: bool) -> Self {
        self.flags = if value {
            self.flags | Self::DENSE
        } else {
            self.flags & !Self::DENSE
        };
        self
    }

    #[must_use]
    pub const fn sparse(mut self, value: bool) -> Self {
        self.flags = if value {
            self.flags | Self::SPARSE
        } else {
            self.flags & !Self::SPARSE
        };
        self
    }

    #[must_use]
    pub const fn rtree_linear(mut self, value: bool) -> Self {
        self.flags = if value {
            self.flags | Self::RTREE_LINEAR
        } else {
            self.flags & !Self::RTREE_LINEAR
        };
        self
    }

    #[must_use]
    pub fn collate(mut self, collate: CollateOpts) -> Self {
        self.collate = collate;
        self
    }
}

// ---------------------------------------------------------------------------
// Field sets
// ---------------------------------------------------------------------------

/// Marker for a field addressed by json-path instead of index number.
pub const SET_BY_JSON_PATH: i32 = -2;
/// Marker for an unresolved field.
pub const NOT_SET: i32 = -1;

/// An ordered set of payload field positions, with optional json-paths for
/// sparse entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldsSet {
    fields: smallvec::SmallVec<[i32; 4]>,
    tags_paths: Vec<TagsPath>,
}

impl FieldsSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_fields(fields: impl IntoIterator<Item = i32>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
            tags_paths: Vec::new(),
        }
    }

    pub fn push(&mut self, field: i32) {
        self.fields.push(field);
    }

    /// Register a sparse json-path entry.
    pub fn push_tags_path(&mut self, path: TagsPath) {
        self.fields.push(SET_BY_JSON_PATH);
        self.tags_paths.push(path);
    }

    #[must_use]
    pub fn contains(&self, field: i32) -> bool {
        self.fields.contains(&field)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.fields.iter().copied()
    }

    #[must_use]
    pub fn tags_path(&self, i: usize) -> Option<&TagsPath> {
        self.tags_paths.get(i)
    }
}

// ---------------------------------------------------------------------------
// Item references
// ---------------------------------------------------------------------------

/// A reference to one result row.
///
/// `value` is populated lazily: inside the select loop only the row id is
/// recorded; the payload is attached before the results are handed out (or
/// immediately, for join preresults in stored-values mode).
#[derive(Debug, Clone)]
pub struct ItemRef {
    pub row_id: RowId,
    pub value: Option<PayloadValue>,
    /// Fulltext rank in percent, 0 for non-ranked rows.
    pub rank: u8,
    pub ns_id: u8,
}

impl ItemRef {
    #[must_use]
    pub fn new(row_id: RowId, rank: u8, ns_id: u8) -> Self {
        Self {
            row_id,
            value: None,
            rank,
            ns_id,
        }
    }

    #[must_use]
    pub fn with_value(row_id: RowId, value: PayloadValue, rank: u8, ns_id: u8) -> Self {
        Self {
            row_id,
            value: Some(value),
            rank,
            ns_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn(1) < Lsn(2));
        assert!(Lsn::EMPTY.is_empty());
        assert!(!Lsn(0).is_empty());
        assert_eq!(Lsn(41).next(), Lsn(42));
    }

    #[test]
    fn test_index_opts_flags() {
        let opts = IndexOpts::new().pk(true).array(true);
        assert!(opts.is_pk());
        assert!(opts.is_array());
        assert!(!opts.is_sparse());
        let opts = opts.pk(false);
        assert!(!opts.is_pk());
        assert!(opts.is_array());
    }

    #[test]
    fn test_fields_set_sparse_entries() {
        let mut fields = FieldsSet::from_fields([0, 2]);
        fields.push_tags_path(TagsPath::from(vec![7, 9]));
        assert_eq!(fields.len(), 3);
        assert!(fields.contains(SET_BY_JSON_PATH));
        assert_eq!(fields.tags_path(0).unwrap().as_slice(), &[7, 9]);
    }
}

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use memdex_error::{MemdexError, Result};
use smallvec::SmallVec;

use crate::collate::{collate_cmp, CollateOpts};
use crate::payload::PayloadValue;
use crate::KeyValueKind;

/// The tagged scalar used throughout the engine.
///
/// Everything a query condition, an index key or a payload slot can hold is
/// one of these. `Composite` carries a synthesized payload row and is only
/// comparable through `Payload::compare` with its field mask; plain
/// comparisons treat it by identity.
#[derive(Clone, Default)]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Double(f64),
    String(Arc<str>),
    Tuple(Vec<Variant>),
    Composite(PayloadValue),
}

/// A small vector of variants: one payload field's value(s).
pub type VariantArray = SmallVec<[Variant; 2]>;

impl Variant {
    #[must_use]
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::String(Arc::from(s.as_ref()))
    }

    #[must_use]
    pub const fn kind(&self) -> KeyValueKind {
        match self {
            Self::Null => KeyValueKind::Null,
            Self::Bool(_) => KeyValueKind::Bool,
            Self::Int(_) => KeyValueKind::Int,
            Self::Int64(_) => KeyValueKind::Int64,
            Self::Double(_) => KeyValueKind::Double,
            Self::String(_) => KeyValueKind::String,
            Self::Tuple(_) => KeyValueKind::Tuple,
            Self::Composite(_) => KeyValueKind::Composite,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by relaxed comparison and sort expressions.
    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(f64::from(*v)),
            Self::Int64(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Convert this value to the declared kind of an index.
    ///
    /// Used on query literals before they are handed to `select_key`, so the
    /// index only ever sees keys of its own kind.
    pub fn convert(&self, kind: KeyValueKind) -> Result<Self> {
        if self.kind() == kind {
            return Ok(self.clone());
        }
        let fail = || {
            MemdexError::params(format!(
                "can't convert value of type '{}' to '{}'",
                self.kind().as_str(),
                kind.as_str()
            ))
        };
        match kind {
            KeyValueKind::Int => match self {
                Self::Bool(v) => Ok(Self::Int(i32::from(*v))),
                Self::Int64(v) => i32::try_from(*v).map(Self::Int).map_err(|_| fail()),
                Self::Double(v) => Ok(Self::Int(*v as i32)),
                Self::String(s) => s.trim().parse::<i32>().map(Self::Int).map_err(|_| fail()),
                _ => Err(fail()),
            },
            KeyValueKind::Int64 => match self {
                Self::Bool(v) => Ok(Self::Int64(i64::from(*v))),
                Self::Int(v) => Ok(Self::Int64(i64::from(*v))),
                Self::Double(v) => Ok(Self::Int64(*v as i64)),
                Self::String(s) => s.trim().parse::<i64>().map(Self::Int64).map_err(|_| fail()),
                _ => Err(fail()),
            },
            KeyValueKind::Double => match self {
                Self::Bool(v) => Ok(Self::Double(if *v { 1.0 } else { 0.0 })),
                Self::Int(v) => Ok(Self::Double(f64::from(*v))),
                Self::Int64(v) => Ok(Self::Double(*v as f64)),
                Self::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Self::Double)
                    .map_err(|_| fail()),
                _ => Err(fail()),
            },
            KeyValueKind::Bool => match self {
                Self::Int(v) => Ok(Self::Bool(*v != 0)),
                Self::Int64(v) => Ok(Self::Bool(*v != 0)),
                Self::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(Self::Bool(true)),
                    "false" | "0" => Ok(Self::Bool(false)),
                    _ => Err(fail()),
                },
                _ => Err(fail()),
            },
            KeyValueKind::String => Ok(Self::string(self.to_string())),
            KeyValueKind::Null | KeyValueKind::Undefined => Ok(Self::Null),
            KeyValueKind::Composite | KeyValueKind::Tuple => Err(fail()),
        }
    }

    /// Strict comparison between values of the same kind; strings honor the
    /// collation.
    #[must_use]
    pub fn collate_cmp(&self, other: &Self, opts: &CollateOpts) -> Ordering {
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Null, _) => Ordering::Less,
            (_, Self::Null) => Ordering::Greater,
            (Self::Bool(l), Self::Bool(r)) => l.cmp(r),
            (Self::Int(l), Self::Int(r)) => l.cmp(r),
            (Self::Int64(l), Self::Int64(r)) => l.cmp(r),
            (Self::Double(l), Self::Double(r)) => l.total_cmp(r),
            (Self::String(l), Self::String(r)) => collate_cmp(l, r, opts),
            (Self::Tuple(l), Self::Tuple(r)) => {
                for (lv, rv) in l.iter().zip(r.iter()) {
                    let ord = lv.collate_cmp(rv, opts);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                l.len().cmp(&r.len())
            }
            _ => self.relax_cmp(other, opts),
        }
    }

    /// Relaxed comparison across numeric kinds; comparator predicates use
    /// this so `WHERE price > 10` matches both int and double payloads.
    #[must_use]
    pub fn relax_cmp(&self, other: &Self, opts: &CollateOpts) -> Ordering {
        if self.kind() == other.kind() {
            return self.collate_cmp(other, opts);
        }
        match (self.as_double(), other.as_double()) {
            (Some(l), Some(r)) => l.total_cmp(&r),
            _ => {
                // Mixed incomparable kinds get a stable order by kind tag.
                kind_rank(self.kind()).cmp(&kind_rank(other.kind()))
            }
        }
    }

    /// Normalize this value so that plain `Eq`/`Hash` agree with the collate
    /// semantics. Hash indexes store normalized keys.
    #[must_use]
    pub fn normalized(&self, opts: &CollateOpts) -> Self {
        use crate::collate::CollateMode;
        match (self, opts.mode) {
            (Self::String(s), CollateMode::Ascii) => Self::string(s.to_ascii_lowercase()),
            (Self::String(s), CollateMode::Utf8) => Self::string(s.to_lowercase()),
            (Self::String(s), CollateMode::Numeric) => {
                match s.trim().parse::<f64>() {
                    // Whole-string numbers collapse to one canonical form.
                    Ok(v) => Self::string(format!("\u{1}{}", v.to_bits())),
                    Err(_) => self.clone(),
                }
            }
            _ => self.clone(),
        }
    }
}

const fn kind_rank(kind: KeyValueKind) -> u8 {
    match kind {
        KeyValueKind::Null | KeyValueKind::Undefined => 0,
        KeyValueKind::Bool => 1,
        KeyValueKind::Int | KeyValueKind::Int64 | KeyValueKind::Double => 2,
        KeyValueKind::String => 3,
        KeyValueKind::Tuple => 4,
        KeyValueKind::Composite => 5,
    }
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(l), Self::Bool(r)) => l == r,
            (Self::Int(l), Self::Int(r)) => l == r,
            (Self::Int64(l), Self::Int64(r)) => l == r,
            (Self::Double(l), Self::Double(r)) => l.total_cmp(r) == Ordering::Equal,
            (Self::String(l), Self::String(r)) => l == r,
            (Self::Tuple(l), Self::Tuple(r)) => l == r,
            (Self::Composite(l), Self::Composite(r)) => l.ptr_eq(r),
            _ => false,
        }
    }
}

impl Eq for Variant {}

impl Hash for Variant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Null => 0u8.hash(state),
            Self::Bool(v) => {
                1u8.hash(state);
                v.hash(state);
            }
            Self::Int(v) => {
                2u8.hash(state);
                i64::from(*v).hash(state);
            }
            Self::Int64(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            Self::Double(v) => {
                3u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::String(v) => {
                4u8.hash(state);
                v.hash(state);
            }
            Self::Tuple(v) => {
                5u8.hash(state);
                v.hash(state);
            }
            Self::Composite(v) => {
                6u8.hash(state);
                v.ptr_hash(state);
            }
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Tuple(v) => {
                f.write_str("(")?;
                for (i, item) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Self::Composite(_) => f.write_str("<composite>"),
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v:?}"),
            other => write!(f, "{other}"),
        }
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::string(v)
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::String(Arc::from(v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::CollateMode;

    #[test]
    fn test_convert_between_numeric_kinds() {
        let v = Variant::Int(42);
        assert_eq!(v.convert(KeyValueKind::Int64).unwrap(), Variant::Int64(42));
        assert_eq!(
            v.convert(KeyValueKind::Double).unwrap(),
            Variant::Double(42.0)
        );
        assert_eq!(
            Variant::string("17").convert(KeyValueKind::Int).unwrap(),
            Variant::Int(17)
        );
    }

    #[test]
    fn test_convert_failure_is_params() {
        let err = Variant::string("abc")
            .convert(KeyValueKind::Int)
            .unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::Params);
    }

    #[test]
    fn test_relax_cmp_across_kinds() {
        let opts = CollateOpts::default();
        assert_eq!(
            Variant::Int(5).relax_cmp(&Variant::Double(5.0), &opts),
            Ordering::Equal
        );
        assert_eq!(
            Variant::Int64(3).relax_cmp(&Variant::Double(3.5), &opts),
            Ordering::Less
        );
    }

    #[test]
    fn test_collated_string_cmp() {
        let opts = CollateOpts::new(CollateMode::Ascii);
        assert_eq!(
            Variant::string("Foo").collate_cmp(&Variant::string("foo"), &opts),
            Ordering::Equal
        );
    }

    #[test]
    fn test_normalized_ascii_keys_collide() {
        let opts = CollateOpts::new(CollateMode::Ascii);
        assert_eq!(
            Variant::string("AbC").normalized(&opts),
            Variant::string("abc").normalized(&opts)
        );
    }

    #[test]
    fn test_null_sorts_first() {
        let opts = CollateOpts::default();
        assert_eq!(
            Variant::Null.collate_cmp(&Variant::Int(0), &opts),
            Ordering::Less
        );
    }
}

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// String comparison mode chosen at index-definition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CollateMode {
    /// Plain byte comparison.
    #[default]
    None,
    /// Case-insensitive comparison over the ASCII range.
    Ascii,
    /// Case-insensitive comparison with full UTF-8 case folding.
    Utf8,
    /// Compare leading numeric prefixes as numbers, remainder as bytes.
    Numeric,
    /// Compare through a user-supplied sort-order table.
    Custom,
}

/// A custom character ordering: characters earlier in the table sort first,
/// characters absent from the table sort after all present ones, by code
/// point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortOrderTable {
    weights: std::collections::HashMap<char, u32>,
}

impl SortOrderTable {
    /// Build a table from the ordering string (e.g. `"AaBbCc..."`).
    #[must_use]
    pub fn new(order: &str) -> Self {
        let mut weights = std::collections::HashMap::new();
        for (i, ch) in order.chars().enumerate() {
            weights.entry(ch).or_insert(i as u32);
        }
        Self { weights }
    }

    fn weight(&self, ch: char) -> (u32, u32) {
        match self.weights.get(&ch) {
            Some(&w) => (0, w),
            None => (1, ch as u32),
        }
    }
}

/// Collation options: mode plus the custom table when mode is `Custom`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollateOpts {
    pub mode: CollateMode,
    #[serde(skip)]
    pub sort_order_table: Option<Arc<SortOrderTable>>,
}

impl CollateOpts {
    #[must_use]
    pub fn new(mode: CollateMode) -> Self {
        Self {
            mode,
            sort_order_table: None,
        }
    }

    #[must_use]
    pub fn custom(order: &str) -> Self {
        Self {
            mode: CollateMode::Custom,
            sort_order_table: Some(Arc::new(SortOrderTable::new(order))),
        }
    }
}

/// Compare two strings under the given collation.
#[must_use]
pub fn collate_cmp(lhs: &str, rhs: &str, opts: &CollateOpts) -> Ordering {
    match opts.mode {
        CollateMode::None => lhs.cmp(rhs),
        CollateMode::Ascii => {
            let mut li = lhs.bytes();
            let mut ri = rhs.bytes();
            loop {
                match (li.next(), ri.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(l), Some(r)) => {
                        let lc = l.to_ascii_lowercase();
                        let rc = r.to_ascii_lowercase();
                        if lc != rc {
                            return lc.cmp(&rc);
                        }
                    }
                }
            }
        }
        CollateMode::Utf8 => {
            let mut li = lhs.chars().flat_map(char::to_lowercase);
            let mut ri = rhs.chars().flat_map(char::to_lowercase);
            loop {
                match (li.next(), ri.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(l), Some(r)) => {
                        if l != r {
                            return l.cmp(&r);
                        }
                    }
                }
            }
        }
        CollateMode::Numeric => numeric_cmp(lhs, rhs),
        CollateMode::Custom => match &opts.sort_order_table {
            Some(table) => {
                let mut li = lhs.chars();
                let mut ri = rhs.chars();
                loop {
                    match (li.next(), ri.next()) {
                        (None, None) => return Ordering::Equal,
                        (None, Some(_)) => return Ordering::Less,
                        (Some(_), None) => return Ordering::Greater,
                        (Some(l), Some(r)) => {
                            let lw = table.weight(l);
                            let rw = table.weight(r);
                            if lw != rw {
                                return lw.cmp(&rw);
                            }
                        }
                    }
                }
            }
            None => lhs.cmp(rhs),
        },
    }
}

/// Compare leading decimal prefixes numerically, the rest bytewise.
fn numeric_cmp(lhs: &str, rhs: &str) -> Ordering {
    let (ln, lrest) = split_numeric_prefix(lhs);
    let (rn, rrest) = split_numeric_prefix(rhs);
    match (ln, rn) {
        (Some(l), Some(r)) => l
            .partial_cmp(&r)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lrest.cmp(rrest)),
        _ => lhs.cmp(rhs),
    }
}

fn split_numeric_prefix(s: &str) -> (Option<f64>, &str) {
    let trimmed = s.trim_start();
    let mut end = 0;
    let bytes = trimmed.as_bytes();
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end == digits_start {
        return (None, s);
    }
    match trimmed[..end].parse::<f64>() {
        Ok(v) => (Some(v), &trimmed[end..]),
        Err(_) => (None, s),
    }
}

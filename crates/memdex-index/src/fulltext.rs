use std::collections::HashMap;

use memdex_error::{MemdexError, Result};
use memdex_query::{CondType, FtDslQuery, FtDslTerm};
use memdex_types::{RowId, Variant, VariantArray};
use smallvec::SmallVec;

use crate::idset::{AddMode, IdSet};
use crate::selectkey::{SelectKeyResult, SelectKeyResults};
use crate::SelectOpts;

#[derive(Debug, Clone)]
struct Posting {
    id: RowId,
    field: u16,
    positions: SmallVec<[u32; 4]>,
}

/// Inverted fulltext index over one or more text fields.
///
/// Documents are tokenized into lowercase words with per-field positions.
/// Queries arrive as a parsed [`FtDslQuery`]; results are ranked and the
/// id-set keeps relevancy order.
#[derive(Debug, Default, Clone)]
pub struct FullTextIndex {
    field_names: Vec<String>,
    postings: HashMap<String, Vec<Posting>>,
    doc_words: HashMap<RowId, Vec<String>>,
}

impl FullTextIndex {
    #[must_use]
    pub fn new(field_names: Vec<String>) -> Self {
        Self {
            field_names,
            postings: HashMap::new(),
            doc_words: HashMap::new(),
        }
    }

    #[must_use]
    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    #[must_use]
    pub fn docs_count(&self) -> usize {
        self.doc_words.len()
    }

    /// Index one document; `texts` holds the value of each text field in
    /// declaration order.
    pub fn upsert_doc(&mut self, texts: &[String], id: RowId) {
        self.delete_doc(id);
        let mut words = Vec::new();
        for (field, text) in texts.iter().enumerate() {
            for (pos, word) in tokenize(text) {
                let entry = self.postings.entry(word.clone()).or_default();
                match entry
                    .iter_mut()
                    .find(|p| p.id == id && p.field == field as u16)
                {
                    Some(posting) => posting.positions.push(pos),
                    None => entry.push(Posting {
                        id,
                        field: field as u16,
                        positions: SmallVec::from_elem(pos, 1),
                    }),
                }
                words.push(word);
            }
        }
        words.sort_unstable();
        words.dedup();
        self.doc_words.insert(id, words);
    }

    pub fn delete_doc(&mut self, id: RowId) {
        let Some(words) = self.doc_words.remove(&id) else {
            return;
        };
        for word in words {
            if let Some(postings) = self.postings.get_mut(&word) {
                postings.retain(|p| p.id != id);
                if postings.is_empty() {
                    self.postings.remove(&word);
                }
            }
        }
    }

    pub fn select_key(
        &self,
        values: &VariantArray,
        condition: CondType,
        _opts: &SelectOpts,
    ) -> Result<SelectKeyResults> {
        if condition != CondType::Eq && condition != CondType::Set && condition != CondType::Like {
            return Err(MemdexError::query_exec(format!(
                "fulltext index does not support condition {}",
                condition.as_str()
            )));
        }
        let dsl_text = values
            .first()
            .and_then(Variant::as_str)
            .ok_or_else(|| MemdexError::query_exec("fulltext query expects a string"))?;
        let dsl = FtDslQuery::parse(dsl_text, &self.field_names)?;
        let ranked = self.search(&dsl);

        let mut result = SelectKeyResult::default();
        let mut set = IdSet::new();
        for &(id, rank) in &ranked {
            set.add(id, AddMode::Unordered);
            result.ranks.insert(id, rank);
        }
        result.idsets.push(set);
        Ok(vec![result])
    }

    /// Run a parsed query; returns `(id, rank)` in descending rank order.
    #[must_use]
    pub fn search(&self, dsl: &FtDslQuery) -> Vec<(RowId, u8)> {
        let mut scores: HashMap<RowId, f64> = HashMap::new();
        let mut excluded: Vec<RowId> = Vec::new();
        let mut required_sets: Vec<Vec<RowId>> = Vec::new();
        let mut any_positive = false;

        for term in &dsl.terms {
            let matched = if term.is_phrase() {
                self.match_phrase(term)
            } else {
                self.match_word(term)
            };
            if term.excluded {
                excluded.extend(matched.keys().copied());
                continue;
            }
            any_positive = true;
            if term.required {
                required_sets.push(matched.keys().copied().collect());
            }
            for (id, score) in matched {
                *scores.entry(id).or_insert(0.0) += score;
            }
        }
        if !any_positive {
            return Vec::new();
        }
        for req in &required_sets {
            scores.retain(|id, _| req.contains(id));
        }
        for id in excluded {
            scores.remove(&id);
        }
        let max = scores.values().copied().fold(0.0f64, f64::max);
        if max <= 0.0 {
            return Vec::new();
        }
        let mut ranked: Vec<(RowId, u8)> = scores
            .into_iter()
            .map(|(id, score)| (id, ((score / max) * 100.0).round() as u8))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    fn field_boost(&self, term: &FtDslTerm, field: u16) -> Option<f64> {
        if term.fields.is_empty() {
            return Some(1.0);
        }
        let name = self.field_names.get(field as usize)?;
        term.fields
            .iter()
            .find(|f| f.name == "*" || f.name.eq_ignore_ascii_case(name))
            .map(|f| f.boost)
    }

    fn match_word(&self, term: &FtDslTerm) -> HashMap<RowId, f64> {
        let mut out = HashMap::new();
        for (word, postings) in &self.postings {
            if !word_matches(word, term) {
                continue;
            }
            for posting in postings {
                let Some(fboost) = self.field_boost(term, posting.field) else {
                    continue;
                };
                let tf = posting.positions.len() as f64;
                *out.entry(posting.id).or_insert(0.0) += term.boost * fboost * tf;
            }
        }
        out
    }

    fn match_phrase(&self, term: &FtDslTerm) -> HashMap<RowId, f64> {
        let distance = term.phrase_distance.unwrap_or(1);
        let words: Vec<String> = tokenize(&term.pattern).map(|(_, w)| w).collect();
        let mut out = HashMap::new();
        if words.is_empty() {
            return out;
        }
        // Candidate docs contain every word of the phrase.
        let Some(first) = self.postings.get(&words[0]) else {
            return out;
        };
        'candidates: for posting in first {
            let mut current = posting.positions.clone();
            for word in &words[1..] {
                let Some(next_postings) = self.postings.get(word) else {
                    continue 'candidates;
                };
                let Some(next) = next_postings
                    .iter()
                    .find(|p| p.id == posting.id && p.field == posting.field)
                else {
                    continue 'candidates;
                };
                let mut advanced: SmallVec<[u32; 4]> = SmallVec::new();
                for &p in &next.positions {
                    if current
                        .iter()
                        .any(|&c| p > c && p - c <= distance)
                    {
                        advanced.push(p);
                    }
                }
                if advanced.is_empty() {
                    continue 'candidates;
                }
                current = advanced;
            }
            let Some(fboost) = self.field_boost(term, posting.field) else {
                continue;
            };
            *out.entry(posting.id).or_insert(0.0) += term.boost * fboost * words.len() as f64;
        }
        out
    }
}

fn word_matches(word: &str, term: &FtDslTerm) -> bool {
    let pattern = term.pattern.as_str();
    if term.exact {
        return word == pattern;
    }
    if term.prefix_match && term.suffix_match {
        return word.contains(pattern);
    }
    if term.prefix_match {
        return word.starts_with(pattern);
    }
    if term.suffix_match {
        return word.ends_with(pattern);
    }
    if word == pattern {
        return true;
    }
    if term.typos {
        return edit_distance_le1(word, pattern);
    }
    false
}

/// True when the words are within Damerau-style edit distance one
/// (insert, delete, replace or adjacent transposition).
fn edit_distance_le1(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    match long.len() - short.len() {
        0 => {
            let diffs: Vec<usize> = (0..a.len()).filter(|&i| a[i] != b[i]).collect();
            match diffs.len() {
                0 | 1 => true,
                2 => {
                    let (i, j) = (diffs[0], diffs[1]);
                    j == i + 1 && a[i] == b[j] && a[j] == b[i]
                }
                _ => false,
            }
        }
        1 => {
            let mut skipped = false;
            let mut si = 0;
            for &c in long.iter() {
                if si < short.len() && short[si] == c {
                    si += 1;
                } else if skipped {
                    return false;
                } else {
                    skipped = true;
                }
            }
            true
        }
        _ => false,
    }
}

/// Lowercased alphanumeric words with their positions.
fn tokenize(text: &str) -> impl Iterator<Item = (u32, String)> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .enumerate()
        .map(|(pos, w)| (pos as u32, w.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> FullTextIndex {
        let mut idx = FullTextIndex::new(vec!["name".to_owned(), "description".to_owned()]);
        idx.upsert_doc(
            &["quick brown fox".to_owned(), "jumps over the dog".to_owned()],
            1,
        );
        idx.upsert_doc(
            &["lazy dog".to_owned(), "sleeps all day".to_owned()],
            2,
        );
        idx.upsert_doc(
            &["brown bear".to_owned(), "eats honey".to_owned()],
            3,
        );
        idx
    }

    fn search(idx: &FullTextIndex, dsl: &str) -> Vec<RowId> {
        let q = FtDslQuery::parse(dsl, &idx.field_names.clone()).unwrap();
        idx.search(&q).into_iter().map(|(id, _)| id).collect()
    }

    #[test]
    fn test_plain_term() {
        let idx = index();
        let mut ids = search(&idx, "brown");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_required_and_excluded() {
        let idx = index();
        assert_eq!(search(&idx, "+brown -bear"), vec![1]);
        assert_eq!(search(&idx, "dog -lazy"), vec![1]);
    }

    #[test]
    fn test_prefix_suffix_match() {
        let idx = index();
        let mut ids = search(&idx, "bro*");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        let ids = search(&idx, "*zy");
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn test_typo_tolerance() {
        let idx = index();
        let mut ids = search(&idx, "brwon~");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3]);
        assert!(search(&idx, "brwon").is_empty());
    }

    #[test]
    fn test_field_restriction_and_boost() {
        let idx = index();
        // "dog" appears in doc 1 description and doc 2 name.
        assert_eq!(search(&idx, "@name dog"), vec![2]);
        let ranked_ids = search(&idx, "@name^2.0,description^0.1 dog");
        assert_eq!(ranked_ids[0], 2);
    }

    #[test]
    fn test_phrase_distance() {
        let idx = index();
        assert_eq!(search(&idx, "'quick brown'"), vec![1]);
        assert!(search(&idx, "'quick fox'").is_empty());
        assert_eq!(search(&idx, "'quick fox'~2"), vec![1]);
        // Words in different fields never form a phrase.
        assert!(search(&idx, "'fox jumps'~5").is_empty());
    }

    #[test]
    fn test_rank_order_and_scaling() {
        let mut idx = FullTextIndex::new(vec!["text".to_owned()]);
        idx.upsert_doc(&["word word word".to_owned()], 1);
        idx.upsert_doc(&["word".to_owned()], 2);
        let q = FtDslQuery::parse("word", &["text".to_owned()]).unwrap();
        let ranked = idx.search(&q);
        assert_eq!(ranked[0], (1, 100));
        assert!(ranked[1].0 == 2 && ranked[1].1 < 100);
    }

    #[test]
    fn test_delete_doc_removes_postings() {
        let mut idx = index();
        idx.delete_doc(1);
        assert_eq!(search(&idx, "fox"), Vec::<RowId>::new());
        assert_eq!(idx.docs_count(), 2);
    }

    #[test]
    fn test_edit_distance() {
        assert!(edit_distance_le1("fox", "fox"));
        assert!(edit_distance_le1("fox", "fx"));
        assert!(edit_distance_le1("fox", "foxy"));
        assert!(edit_distance_le1("fox", "fax"));
        assert!(edit_distance_le1("brwon", "brown")); // transposition
        assert!(!edit_distance_le1("fox", "cat"));
        assert!(!edit_distance_le1("fox", "foxes"));
    }
}

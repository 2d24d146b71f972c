/// Keywords offered by [`suggestions`]. Namespace and index names are mixed
/// in by the database handle, which owns the catalog.
const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "OR", "NOT", "IN", "RANGE", "ALLSET", "LIKE", "IS", "NULL",
    "ORDER", "BY", "ASC", "DESC", "FIELD", "LIMIT", "OFFSET", "INNER", "LEFT", "JOIN", "ON",
    "MERGE", "COUNT", "COUNT_CACHED", "SUM", "AVG", "MIN", "MAX", "FACET", "DISTINCT", "RANK",
    "EQUAL_POSITION", "DWITHIN", "POINT", "TRUE", "FALSE",
];

/// Completion candidates for the word being typed at `pos`.
///
/// Returns keywords matching the prefix case-insensitively, plus the extra
/// candidates the caller supplies (namespace and index names). A cursor
/// inside a multi-byte character snaps back to its start.
#[must_use]
pub fn suggestions(sql: &str, pos: usize, extra: &[String]) -> Vec<String> {
    let mut pos = pos.min(sql.len());
    while pos > 0 && !sql.is_char_boundary(pos) {
        pos -= 1;
    }
    let head = &sql[..pos];
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !c.is_alphanumeric() && *c != '_')
        .map_or(0, |(i, c)| i + c.len_utf8());
    let prefix = &head[start..];

    let matches_prefix =
        |name: &str| name.get(..prefix.len()).is_some_and(|head| head.eq_ignore_ascii_case(prefix));
    let mut out: Vec<String> = KEYWORDS
        .iter()
        .filter(|kw| matches_prefix(kw))
        .map(|kw| (*kw).to_owned())
        .collect();
    out.extend(extra.iter().filter(|name| matches_prefix(name)).cloned());
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_completion() {
        let got = suggestions("SELECT * FROM items WHERE id = 1 OR", 35, &[]);
        assert!(got.contains(&"OR".to_owned()));
        assert!(got.contains(&"ORDER".to_owned()));
        assert!(!got.contains(&"WHERE".to_owned()));
    }

    #[test]
    fn test_case_insensitive_prefix() {
        let got = suggestions("sel", 3, &[]);
        assert_eq!(got, vec!["SELECT".to_owned()]);
    }

    #[test]
    fn test_extra_names_are_merged() {
        let got = suggestions("SELECT * FROM it", 16, &["items".to_owned()]);
        assert!(got.contains(&"items".to_owned()));
    }

    #[test]
    fn test_empty_prefix_lists_everything() {
        let got = suggestions("", 0, &[]);
        assert!(got.len() >= KEYWORDS.len());
    }

    #[test]
    fn test_cursor_inside_multibyte_char_snaps_back() {
        // 'п' is two bytes; a cursor landing between them must not panic.
        let sql = "SELECT * FROM поля";
        for pos in 0..=sql.len() + 2 {
            let _ = suggestions(sql, pos, &[]);
        }
        // Multi-byte separator right before the word being completed.
        let sql = "SELECT *\u{a0}FR";
        let got = suggestions(sql, sql.len(), &[]);
        assert!(got.contains(&"FROM".to_owned()));
    }
}

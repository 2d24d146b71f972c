use memdex_error::{MemdexError, Result};

/// A field restriction with its boost: `@name^1.5`.
#[derive(Debug, Clone, PartialEq)]
pub struct FtDslField {
    pub name: String,
    pub boost: f64,
}

/// One parsed term of a fulltext query.
#[derive(Debug, Clone, PartialEq)]
pub struct FtDslTerm {
    /// The search pattern. For phrases this is the whole quoted text.
    pub pattern: String,
    /// `+term`: must be present.
    pub required: bool,
    /// `-term`: must be absent.
    pub excluded: bool,
    /// `=term`: no stemming or fuzziness.
    pub exact: bool,
    /// `term*`: match words starting with the pattern.
    pub prefix_match: bool,
    /// `*term`: match words ending with the pattern.
    pub suffix_match: bool,
    /// `term~`: allow typos.
    pub typos: bool,
    /// `term^0.5`.
    pub boost: f64,
    /// `'a b'~N`: maximum word distance inside a phrase; `None` for plain
    /// terms.
    pub phrase_distance: Option<u32>,
    /// Fields this term is restricted to; empty means every text field.
    pub fields: Vec<FtDslField>,
}

impl FtDslTerm {
    fn new(pattern: String) -> Self {
        Self {
            pattern,
            required: false,
            excluded: false,
            exact: false,
            prefix_match: false,
            suffix_match: false,
            typos: false,
            boost: 1.0,
            phrase_distance: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_phrase(&self) -> bool {
        self.phrase_distance.is_some()
    }
}

/// A parsed fulltext query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FtDslQuery {
    pub terms: Vec<FtDslTerm>,
}

impl FtDslQuery {
    /// Parse the fulltext DSL.
    ///
    /// `known_fields` lists the text fields of the index; a `@field`
    /// restriction naming anything else fails.
    pub fn parse(dsl: &str, known_fields: &[String]) -> Result<Self> {
        let mut terms = Vec::new();
        let mut current_fields: Vec<FtDslField> = Vec::new();
        let bytes = dsl.as_bytes();
        let mut pos = 0usize;

        while pos < bytes.len() {
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if pos >= bytes.len() {
                break;
            }
            match bytes[pos] {
                b'@' => {
                    pos += 1;
                    let start = pos;
                    while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                        pos += 1;
                    }
                    current_fields = parse_field_list(&dsl[start..pos], known_fields)?;
                }
                b'\'' | b'"' => {
                    let quote = bytes[pos];
                    pos += 1;
                    let start = pos;
                    while pos < bytes.len() && bytes[pos] != quote {
                        pos += 1;
                    }
                    if pos >= bytes.len() {
                        return Err(MemdexError::parse_dsl("no closing quote in phrase"));
                    }
                    let phrase = dsl[start..pos].trim().to_owned();
                    pos += 1;
                    let mut distance = 1u32;
                    if pos < bytes.len() && bytes[pos] == b'~' {
                        pos += 1;
                        let dstart = pos;
                        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                            pos += 1;
                        }
                        distance = dsl[dstart..pos].parse().map_err(|_| {
                            MemdexError::parse_dsl("phrase distance must be a number")
                        })?;
                    }
                    if phrase.is_empty() {
                        return Err(MemdexError::parse_dsl("empty phrase"));
                    }
                    let mut term = FtDslTerm::new(phrase);
                    term.phrase_distance = Some(distance);
                    term.fields = current_fields.clone();
                    terms.push(term);
                }
                _ => {
                    let start = pos;
                    while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                        pos += 1;
                    }
                    let token = &dsl[start..pos];
                    terms.push(parse_word(token, &current_fields)?);
                }
            }
        }
        Ok(Self { terms })
    }
}

fn parse_field_list(list: &str, known_fields: &[String]) -> Result<Vec<FtDslField>> {
    let mut fields = Vec::new();
    for part in list.split(',') {
        if part.is_empty() {
            continue;
        }
        let (name, boost) = match part.split_once('^') {
            Some((name, boost)) => {
                let boost: f64 = boost
                    .parse()
                    .map_err(|_| MemdexError::parse_dsl(format!("bad boost value '{boost}'")))?;
                (name, boost)
            }
            None => (part, 1.0),
        };
        if name != "*"
            && !known_fields.is_empty()
            && !known_fields.iter().any(|f| f.eq_ignore_ascii_case(name))
        {
            return Err(MemdexError::parse_dsl(format!(
                "unknown fulltext field '{name}'"
            )));
        }
        fields.push(FtDslField {
            name: name.to_owned(),
            boost,
        });
    }
    Ok(fields)
}

fn parse_word(token: &str, fields: &[FtDslField]) -> Result<FtDslTerm> {
    let mut rest = token;
    let mut term = FtDslTerm::new(String::new());
    term.fields = fields.to_vec();

    loop {
        if let Some(r) = rest.strip_prefix('+') {
            term.required = true;
            rest = r;
        } else if let Some(r) = rest.strip_prefix('-') {
            term.excluded = true;
            rest = r;
        } else if let Some(r) = rest.strip_prefix('=') {
            term.exact = true;
            rest = r;
        } else if let Some(r) = rest.strip_prefix('*') {
            term.suffix_match = true;
            rest = r;
        } else {
            break;
        }
    }
    if let Some((word, boost)) = rest.split_once('^') {
        term.boost = boost
            .parse()
            .map_err(|_| MemdexError::parse_dsl(format!("bad boost value '{boost}'")))?;
        rest = word;
    }
    if let Some(r) = rest.strip_suffix('~') {
        term.typos = true;
        rest = r;
    }
    if let Some(r) = rest.strip_suffix('*') {
        term.prefix_match = true;
        rest = r;
    }
    if rest.is_empty() {
        return Err(MemdexError::parse_dsl(format!("empty term in '{token}'")));
    }
    if term.required && term.excluded {
        return Err(MemdexError::parse_dsl(format!(
            "term '{token}' is both required and excluded"
        )));
    }
    term.pattern = rest.to_lowercase();
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<String> {
        vec!["name".to_owned(), "description".to_owned()]
    }

    #[test]
    fn test_parse_bare_terms() {
        let q = FtDslQuery::parse("quick brown fox", &fields()).unwrap();
        assert_eq!(q.terms.len(), 3);
        assert_eq!(q.terms[0].pattern, "quick");
        assert!(!q.terms[0].required);
    }

    #[test]
    fn test_parse_required_and_excluded() {
        let q = FtDslQuery::parse("+quick -slow", &fields()).unwrap();
        assert!(q.terms[0].required);
        assert!(q.terms[1].excluded);
    }

    #[test]
    fn test_parse_boosts_and_modifiers() {
        let q = FtDslQuery::parse("=exact term^0.5 pre* *suf fuzzy~", &fields()).unwrap();
        assert!(q.terms[0].exact);
        assert!((q.terms[1].boost - 0.5).abs() < 1e-9);
        assert!(q.terms[2].prefix_match);
        assert!(q.terms[3].suffix_match);
        assert!(q.terms[4].typos);
    }

    #[test]
    fn test_parse_field_restriction_with_boosts() {
        let q = FtDslQuery::parse("@name^1.5,description^0.5 fox", &fields()).unwrap();
        assert_eq!(q.terms[0].fields.len(), 2);
        assert!((q.terms[0].fields[0].boost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_field_fails() {
        let err = FtDslQuery::parse("@missing fox", &fields()).unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::ParseDsl);
    }

    #[test]
    fn test_phrase_with_distance() {
        let q = FtDslQuery::parse("'quick fox'~3", &fields()).unwrap();
        assert_eq!(q.terms.len(), 1);
        assert_eq!(q.terms[0].phrase_distance, Some(3));
        assert_eq!(q.terms[0].pattern, "quick fox");
    }

    #[test]
    fn test_no_closing_quote_fails() {
        let err = FtDslQuery::parse("'quick fox", &fields()).unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::ParseDsl);
    }

    #[test]
    fn test_bad_boost_fails() {
        let err = FtDslQuery::parse("term^abc", &fields()).unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::ParseDsl);
    }
}

use std::fmt;

use memdex_error::{MemdexError, Result};

// ---------------------------------------------------------------------------
// Node types
// ---------------------------------------------------------------------------

/// Arithmetic operation joining a node to its left siblings, plus a unary
/// negation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithmeticOp {
    pub op: ArithOp,
    pub negative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Plus,
    Minus,
    Mult,
    Div,
}

impl ArithOp {
    const fn as_char(self) -> char {
        match self {
            Self::Plus => '+',
            Self::Minus => '-',
            Self::Mult => '*',
            Self::Div => '/',
        }
    }
}

/// A leaf of a sort expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SortExprNode {
    /// Numeric literal.
    Value(f64),
    /// Payload field (or json path) of the queried namespace.
    Index { column: String },
    /// Field of a joined namespace: `ns.column`.
    JoinedIndex { ns_idx: usize, column: String },
    /// The fulltext `rank()` function.
    Rank,
}

#[derive(Debug, Clone, PartialEq)]
enum NodeKind {
    Leaf(SortExprNode),
    SubTree { size: usize, is_abs: bool },
}

#[derive(Debug, Clone, PartialEq)]
struct Node {
    op: ArithmeticOp,
    kind: NodeKind,
}

/// Resolves leaf values during evaluation. The selector implements this
/// against the current payload, the joined results and the fulltext rank.
pub trait SortValueResolver {
    fn index_value(&self, column: &str) -> Result<f64>;
    fn joined_value(&self, ns_idx: usize, column: &str) -> Result<f64>;
    fn rank(&self) -> f64;
}

// ---------------------------------------------------------------------------
// SortExpression
// ---------------------------------------------------------------------------

/// A parsed `ORDER BY` expression, stored as a flat vector tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SortExpression {
    nodes: Vec<Node>,
    active_brackets: Vec<usize>,
}

impl SortExpression {
    /// Append a leaf to the innermost open bracket.
    pub fn append(&mut self, op: ArithmeticOp, value: SortExprNode) {
        self.grow_active(1);
        self.nodes.push(Node {
            op,
            kind: NodeKind::Leaf(value),
        });
    }

    pub fn open_bracket(&mut self, op: ArithmeticOp, is_abs: bool) {
        self.grow_active(1);
        self.active_brackets.push(self.nodes.len());
        self.nodes.push(Node {
            op,
            kind: NodeKind::SubTree { size: 1, is_abs },
        });
    }

    pub fn close_bracket(&mut self) -> Result<()> {
        self.active_brackets
            .pop()
            .map(|_| ())
            .ok_or_else(|| MemdexError::logic("close bracket without open bracket"))
    }

    fn grow_active(&mut self, by: usize) {
        for &idx in &self.active_brackets {
            if let NodeKind::SubTree { size, .. } = &mut self.nodes[idx].kind {
                *size += by;
            }
        }
    }

    /// Whether the expression is exactly one non-negated field reference.
    /// Such "expressions" sort by the field directly, possibly through an
    /// index.
    #[must_use]
    pub fn by_index_field(&self) -> bool {
        self.nodes.len() == 1
            && !self.nodes[0].op.negative
            && matches!(self.nodes[0].kind, NodeKind::Leaf(SortExprNode::Index { .. }))
    }

    /// The single field name when [`Self::by_index_field`] holds.
    #[must_use]
    pub fn index_field(&self) -> Option<&str> {
        match self.nodes.first() {
            Some(Node {
                kind: NodeKind::Leaf(SortExprNode::Index { column }),
                op,
            }) if self.nodes.len() == 1 && !op.negative => Some(column),
            _ => None,
        }
    }

    /// Whether any leaf is `rank()`.
    #[must_use]
    pub fn contains_rank(&self) -> bool {
        self.nodes.iter().any(|n| {
            matches!(
                n.kind,
                NodeKind::Leaf(SortExprNode::Rank)
            )
        })
    }

    /// Visit every leaf.
    pub fn for_each_leaf(&self, mut f: impl FnMut(&SortExprNode)) {
        for node in &self.nodes {
            if let NodeKind::Leaf(leaf) = &node.kind {
                f(leaf);
            }
        }
    }

    /// Evaluate the expression for one row.
    pub fn calculate(&self, resolver: &dyn SortValueResolver) -> Result<f64> {
        let (value, _) = self.calc_span(0, self.nodes.len(), resolver)?;
        Ok(value)
    }

    fn calc_span(
        &self,
        from: usize,
        to: usize,
        resolver: &dyn SortValueResolver,
    ) -> Result<(f64, usize)> {
        let mut acc = 0.0f64;
        let mut i = from;
        while i < to {
            let node = &self.nodes[i];
            let (mut v, next) = match &node.kind {
                NodeKind::Leaf(leaf) => {
                    let v = match leaf {
                        SortExprNode::Value(v) => *v,
                        SortExprNode::Index { column } => resolver.index_value(column)?,
                        SortExprNode::JoinedIndex { ns_idx, column } => {
                            resolver.joined_value(*ns_idx, column)?
                        }
                        SortExprNode::Rank => resolver.rank(),
                    };
                    (v, i + 1)
                }
                NodeKind::SubTree { size, is_abs } => {
                    let (mut v, _) = self.calc_span(i + 1, i + size, resolver)?;
                    if *is_abs {
                        v = v.abs();
                    }
                    (v, i + size)
                }
            };
            if node.op.negative {
                v = -v;
            }
            match node.op.op {
                ArithOp::Plus => acc += v,
                ArithOp::Minus => acc -= v,
                ArithOp::Mult => acc *= v,
                ArithOp::Div => {
                    if v == 0.0 {
                        return Err(MemdexError::query_exec("division by zero in sort expression"));
                    }
                    acc /= v;
                }
            }
            i = next;
        }
        Ok((acc, to))
    }

    // -----------------------------------------------------------------------
    // Parsing
    // -----------------------------------------------------------------------

    /// Parse a sort expression. `joined_ns` lists the namespaces of the
    /// query's joins; a `ns.field` reference whose prefix matches one of
    /// them becomes a joined-index leaf.
    pub fn parse(text: &str, joined_ns: &[&str]) -> Result<Self> {
        let mut parser = Parser {
            bytes: text.as_bytes(),
            pos: 0,
            joined_ns,
            expr: SortExpression::default(),
        };
        parser.parse_expr(true)?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(MemdexError::params(format!(
                "unexpected trailing characters in sort expression '{text}'"
            )));
        }
        let expr = parser.expr;
        let has_field = {
            let mut found = false;
            expr.for_each_leaf(|leaf| {
                found |= !matches!(leaf, SortExprNode::Value(_));
            });
            found
        };
        if !has_field {
            return Err(MemdexError::params(format!(
                "sort expression '{text}' contains no fields"
            )));
        }
        Ok(expr)
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    joined_ns: &'a [&'a str],
    expr: SortExpression,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn err(&self, msg: &str) -> MemdexError {
        MemdexError::params(format!("sort expression error at {}: {msg}", self.pos))
    }

    /// expr := term (('+'|'-') term)*
    ///
    /// The first term is emitted inline; later multi-factor terms are
    /// wrapped in a bracket so the flat tree keeps precedence.
    fn parse_expr(&mut self, toplevel: bool) -> Result<()> {
        self.parse_term(
            ArithmeticOp {
                op: ArithOp::Plus,
                negative: false,
            },
            true,
        )?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'+') => ArithOp::Plus,
                Some(b'-') => ArithOp::Minus,
                Some(b')') if !toplevel => return Ok(()),
                None => return Ok(()),
                Some(_) if toplevel => return Ok(()),
                Some(c) => return Err(self.err(&format!("unexpected character '{}'", c as char))),
            };
            self.pos += 1;
            self.parse_term(
                ArithmeticOp {
                    op,
                    negative: false,
                },
                false,
            )?;
        }
    }

    /// term := factor (('*'|'/') factor)*
    ///
    /// Unary signs before the first factor fold into the term: the first
    /// term of an expression keeps a negation flag, later terms flip their
    /// `+`/`-` operation instead.
    fn parse_term(&mut self, mut op: ArithmeticOp, first_in_expr: bool) -> Result<()> {
        self.skip_ws();
        if self.fold_signs() {
            if first_in_expr {
                op.negative = !op.negative;
            } else {
                op.op = match op.op {
                    ArithOp::Plus => ArithOp::Minus,
                    ArithOp::Minus => ArithOp::Plus,
                    other => other,
                };
            }
        }
        // Look ahead: does this term have more than one factor?
        let save_pos = self.pos;
        let save_expr = self.expr.clone();
        self.parse_primary(op)?;
        self.skip_ws();
        let multi = matches!(self.peek(), Some(b'*') | Some(b'/'));
        if multi && !first_in_expr {
            // Rewind and re-emit inside a bracket so the flat tree keeps
            // precedence.
            self.pos = save_pos;
            self.expr = save_expr;
            self.expr.open_bracket(
                ArithmeticOp {
                    op: op.op,
                    negative: false,
                },
                false,
            );
            self.parse_primary(ArithmeticOp {
                op: ArithOp::Plus,
                negative: op.negative,
            })?;
            self.parse_term_tail()?;
            self.expr.close_bracket()?;
        } else {
            self.parse_term_tail()?;
        }
        Ok(())
    }

    /// Consume a run of unary `+`/`-`; true when the net sign is negative.
    fn fold_signs(&mut self) -> bool {
        let mut negative = false;
        while let Some(c) = self.peek() {
            match c {
                b'-' => {
                    negative = !negative;
                    self.pos += 1;
                    self.skip_ws();
                }
                b'+' => {
                    self.pos += 1;
                    self.skip_ws();
                }
                _ => break,
            }
        }
        negative
    }

    fn parse_term_tail(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'*') => ArithOp::Mult,
                Some(b'/') => ArithOp::Div,
                _ => return Ok(()),
            };
            self.pos += 1;
            self.parse_factor(ArithmeticOp {
                op,
                negative: false,
            })?;
        }
    }

    /// factor := [-]* primary — used for `*`/`/` chain tails, where the
    /// sign stays a negation flag on the factor itself.
    fn parse_factor(&mut self, mut op: ArithmeticOp) -> Result<()> {
        self.skip_ws();
        if self.fold_signs() {
            op.negative = !op.negative;
        }
        self.parse_primary(op)
    }

    /// primary := number | ident | ns.ident | rank() | abs(expr) | (expr)
    fn parse_primary(&mut self, mut op: ArithmeticOp) -> Result<()> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                self.expr.open_bracket(op, false);
                self.parse_expr(false)?;
                self.expect_close()?;
                self.expr.close_bracket()
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => {
                let mut v = self.parse_number()?;
                if op.negative {
                    v = -v;
                    op.negative = false;
                }
                self.expr.append(op, SortExprNode::Value(v));
                Ok(())
            }
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.parse_ident(op),
            Some(c) => Err(self.err(&format!("unexpected character '{}'", c as char))),
            None => Err(self.err("unexpected end of expression")),
        }
    }

    fn expect_close(&mut self) -> Result<()> {
        self.skip_ws();
        if self.peek() == Some(b')') {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err("expected ')'"))
        }
    }

    fn parse_number(&mut self) -> Result<f64> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == b'.' {
                self.pos += 1;
            } else if (c == b'e' || c == b'E')
                && self.pos > start
                && self
                    .bytes
                    .get(self.pos + 1)
                    .is_some_and(|&n| n == b'+' || n == b'-' || n.is_ascii_digit())
            {
                self.pos += 2;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                break;
            } else {
                break;
            }
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| self.err("malformed number"))
    }

    fn parse_ident(&mut self, op: ArithmeticOp) -> Result<()> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let ident = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| self.err("invalid identifier"))?;
        if ident.ends_with('.') || ident.contains("..") {
            return Err(self.err(&format!("malformed field reference '{ident}'")));
        }
        let lower = ident.to_ascii_lowercase();
        if lower == "rank" || lower == "abs" {
            self.skip_ws();
            if self.peek() != Some(b'(') {
                return Err(self.err(&format!("expected '(' after {lower}")));
            }
            self.pos += 1;
            if lower == "rank" {
                self.expect_close()?;
                self.expr.append(op, SortExprNode::Rank);
                return Ok(());
            }
            // abs(expr): an absolute-value bracket.
            self.skip_ws();
            if self.peek() == Some(b')') {
                return Err(self.err("empty abs()"));
            }
            self.expr.open_bracket(op, true);
            self.parse_expr(false)?;
            self.expect_close()?;
            return self.expr.close_bracket();
        }
        if let Some(dot) = ident.find('.') {
            let prefix = &ident[..dot];
            if let Some(ns_idx) = self.joined_ns.iter().position(|ns| *ns == prefix) {
                self.expr.append(
                    op,
                    SortExprNode::JoinedIndex {
                        ns_idx,
                        column: ident[dot + 1..].to_owned(),
                    },
                );
                return Ok(());
            }
        }
        self.expr.append(
            op,
            SortExprNode::Index {
                column: ident.to_owned(),
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

impl fmt::Display for SortExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_span(f, 0, self.nodes.len())
    }
}

impl SortExpression {
    fn fmt_span(&self, f: &mut fmt::Formatter<'_>, from: usize, to: usize) -> fmt::Result {
        let mut i = from;
        while i < to {
            let node = &self.nodes[i];
            if i != from {
                write!(f, " {} ", node.op.op.as_char())?;
            }
            if node.op.negative {
                f.write_str("-")?;
            }
            match &node.kind {
                NodeKind::Leaf(leaf) => {
                    match leaf {
                        SortExprNode::Value(v) => write!(f, "{v}")?,
                        SortExprNode::Index { column } => f.write_str(column)?,
                        SortExprNode::JoinedIndex { ns_idx, column } => {
                            write!(f, "joined<{ns_idx}>.{column}")?;
                        }
                        SortExprNode::Rank => f.write_str("rank()")?,
                    }
                    i += 1;
                }
                NodeKind::SubTree { size, is_abs } => {
                    f.write_str(if *is_abs { "abs(" } else { "(" })?;
                    self.fmt_span(f, i + 1, i + size)?;
                    f.write_str(")")?;
                    i += size;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(column: &str) -> SortExprNode {
        SortExprNode::Index {
            column: column.to_owned(),
        }
    }

    fn parse(s: &str) -> SortExpression {
        SortExpression::parse(s, &[]).unwrap()
    }

    #[test]
    fn test_parse_single_field() {
        let e = parse("id");
        assert!(e.by_index_field());
        assert_eq!(e.index_field(), Some("id"));
    }

    #[test]
    fn test_parse_rejects_pure_constant() {
        assert!(SortExpression::parse("-1.2E-3", &[]).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(SortExpression::parse("ns.", &["ns"]).is_err());
        assert!(SortExpression::parse("rank(", &[]).is_err());
        assert!(SortExpression::parse("abs()", &[]).is_err());
    }

    #[test]
    fn test_parse_addition_chain() {
        let e = parse("id + value");
        assert!(!e.by_index_field());
        let mut leaves = Vec::new();
        e.for_each_leaf(|l| leaves.push(l.clone()));
        assert_eq!(leaves, vec![idx("id"), idx("value")]);
    }

    #[test]
    fn test_parse_joined_field() {
        let e = SortExpression::parse("ns.id", &["ns"]).unwrap();
        let mut leaves = Vec::new();
        e.for_each_leaf(|l| leaves.push(l.clone()));
        assert_eq!(
            leaves,
            vec![SortExprNode::JoinedIndex {
                ns_idx: 0,
                column: "id".to_owned()
            }]
        );
        // Unknown prefix stays a plain (json path) field.
        let e = SortExpression::parse("ns2.id_1", &["ns1"]).unwrap();
        assert!(e.by_index_field());
        assert_eq!(e.index_field(), Some("ns2.id_1"));
    }

    #[test]
    fn test_parse_rank_case_insensitive() {
        let e = parse("-RANK()");
        assert!(e.contains_rank());
    }

    #[test]
    fn test_precedence_wraps_trailing_term() {
        // value / 1.2 binds tighter than +.
        let e = parse("id + value / 1.2");
        assert_eq!(format!("{e}"), "id + (value / 1.2)");
        // A leading multi-factor term stays flat.
        let e = parse("id * value - 1.2");
        assert_eq!(format!("{e}"), "id * value - 1.2");
    }

    #[test]
    fn test_double_negation_folds() {
        let e = parse("-1.2E-3+-id--obj.value +-Rank()");
        assert_eq!(format!("{e}"), "-0.0012 - id + obj.value - rank()");
    }

    struct FixedResolver;

    impl SortValueResolver for FixedResolver {
        fn index_value(&self, column: &str) -> Result<f64> {
            match column {
                "id" => Ok(10.0),
                "value" => Ok(4.0),
                _ => Err(MemdexError::params(format!("no field {column}"))),
            }
        }
        fn joined_value(&self, _ns_idx: usize, _column: &str) -> Result<f64> {
            Ok(100.0)
        }
        fn rank(&self) -> f64 {
            0.5
        }
    }

    #[test]
    fn test_calculate_respects_precedence() {
        assert_eq!(parse("id + value * 2").calculate(&FixedResolver).unwrap(), 18.0);
        assert_eq!(parse("(id + value) * 2").calculate(&FixedResolver).unwrap(), 28.0);
        assert_eq!(parse("abs(value - id)").calculate(&FixedResolver).unwrap(), 6.0);
        assert_eq!(parse("id + rank()").calculate(&FixedResolver).unwrap(), 10.5);
    }

    #[test]
    fn test_calculate_division_by_zero() {
        let e = parse("id / (value - 4)");
        assert!(e.calculate(&FixedResolver).is_err());
    }

    #[test]
    fn test_format_parse_roundtrip() {
        for s in [
            "id",
            "id + value",
            "id * value - 1.2",
            "id + (value / 1.2)",
            "-id + abs(value - 2) * rank()",
        ] {
            let e = SortExpression::parse(s, &[]).unwrap();
            let formatted = format!("{e}");
            let reparsed = SortExpression::parse(&formatted, &[]).unwrap();
            assert_eq!(e, reparsed, "{s} -> {formatted}");
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn ident() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,6}".prop_filter("reserved words", |s| {
            s != "rank" && s != "abs"
        })
    }

    fn expr_text() -> impl Strategy<Value = String> {
        // field (op (field | number))* with optional unary minus runs.
        let term = prop_oneof![
            ident(),
            ident().prop_map(|s| format!("-{s}")),
            (0u32..1000, 0u32..100).prop_map(|(a, b)| format!("{a}.{b}")),
        ];
        (
            ident(),
            proptest::collection::vec(
                (prop_oneof!["\\+", "-", "\\*", "/"], term),
                0..5,
            ),
        )
            .prop_map(|(first, rest)| {
                let mut out = first;
                for (op, term) in rest {
                    out.push_str(&format!(" {op} {term}"));
                }
                out
            })
    }

    proptest! {
        #[test]
        fn prop_format_reparses_to_same_tree(text in expr_text()) {
            let parsed = SortExpression::parse(&text, &[]).unwrap();
            let formatted = format!("{parsed}");
            let reparsed = SortExpression::parse(&formatted, &[]).unwrap();
            prop_assert_eq!(parsed, reparsed);
        }
    }
}

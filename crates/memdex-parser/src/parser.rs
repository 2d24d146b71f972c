use memdex_error::{MemdexError, Result};
use memdex_query::{
    AggType, AggregateEntry, CalcTotalMode, CondType, JoinType, JoinedQuery, OpType, Query,
    QueryEntry, QueryJoinEntry, SortingEntry,
};
use memdex_types::Variant;
use smallvec::SmallVec;

use crate::lexer::{Lexer, Token, TokenKind};

/// Parse one SQL SELECT statement into a [`Query`].
pub fn parse_sql(sql: &str) -> Result<Query> {
    let tokens = Lexer::tokenize(sql)?;
    let mut parser = Parser { tokens, pos: 0 };
    let query = parser.parse_select()?;
    parser.expect_end()?;
    Ok(query)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn err_here(&self, msg: impl Into<String>) -> MemdexError {
        MemdexError::parse_sql(self.peek().start, msg)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek().is_kw(kw) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected {kw}, found '{}'", self.peek().text)))
        }
    }

    fn eat_symbol(&mut self, sym: &str) -> bool {
        if self.peek().is_symbol(sym) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, sym: &str) -> Result<()> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(self.err_here(format!("expected '{sym}', found '{}'", self.peek().text)))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        if self.peek().kind == TokenKind::Ident {
            Ok(self.next().text)
        } else {
            Err(self.err_here(format!("expected identifier, found '{}'", self.peek().text)))
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.err_here(format!("unexpected '{}'", self.peek().text)))
        }
    }

    // -----------------------------------------------------------------------
    // SELECT
    // -----------------------------------------------------------------------

    fn parse_select(&mut self) -> Result<Query> {
        self.expect_kw("select")?;
        let mut query = Query::new("");
        self.parse_select_list(&mut query)?;
        self.expect_kw("from")?;
        query.namespace = self.expect_ident()?;

        loop {
            let tok = self.peek().clone();
            if tok.is_kw("where") {
                self.next();
                self.parse_conditions(&mut query)?;
            } else if tok.is_kw("inner") || tok.is_kw("left") || tok.is_kw("join") {
                let join_type = if self.eat_kw("left") {
                    JoinType::Left
                } else {
                    self.eat_kw("inner");
                    JoinType::Inner
                };
                self.expect_kw("join")?;
                self.parse_join(&mut query, join_type)?;
            } else if tok.is_kw("order") {
                self.next();
                self.expect_kw("by")?;
                self.parse_order_by(&mut query)?;
            } else if tok.is_kw("limit") {
                self.next();
                query.count = self.expect_unsigned()?;
            } else if tok.is_kw("offset") {
                self.next();
                query.start = self.expect_unsigned()?;
            } else if tok.is_kw("merge") {
                self.next();
                self.expect_symbol("(")?;
                let merged = self.parse_select()?;
                self.expect_symbol(")")?;
                query.merge_queries.push(merged);
            } else {
                break;
            }
        }
        Ok(query)
    }

    fn parse_select_list(&mut self, query: &mut Query) -> Result<()> {
        loop {
            let tok = self.peek().clone();
            if tok.is_symbol("*") {
                self.next();
            } else if tok.is_kw("count") {
                self.next();
                self.expect_symbol("(")?;
                self.expect_symbol("*")?;
                self.expect_symbol(")")?;
                query.calc_total = CalcTotalMode::AccurateTotal;
                query.count = 0;
            } else if tok.is_kw("count_cached") {
                self.next();
                self.expect_symbol("(")?;
                self.expect_symbol("*")?;
                self.expect_symbol(")")?;
                query.calc_total = CalcTotalMode::CachedTotal;
                query.count = 0;
            } else if tok.is_kw("rank") {
                self.next();
                self.expect_symbol("(")?;
                self.expect_symbol(")")?;
                query.with_rank = true;
            } else if tok.is_kw("distinct") {
                self.next();
                self.expect_symbol("(")?;
                let field = self.expect_ident()?;
                self.expect_symbol(")")?;
                query
                    .aggregations
                    .push(AggregateEntry::new(AggType::Distinct, [field]));
            } else if tok.is_kw("facet") {
                self.next();
                query.aggregations.push(self.parse_facet()?);
            } else if let Some(agg) = Self::agg_kw(&tok) {
                self.next();
                self.expect_symbol("(")?;
                let field = self.expect_ident()?;
                self.expect_symbol(")")?;
                query.aggregations.push(AggregateEntry::new(agg, [field]));
            } else if tok.kind == TokenKind::Ident {
                self.next();
                query.select_filter.push(tok.text);
            } else {
                return Err(self.err_here("expected select list"));
            }
            if !self.eat_symbol(",") {
                return Ok(());
            }
        }
    }

    fn agg_kw(tok: &Token) -> Option<AggType> {
        if tok.is_kw("sum") {
            Some(AggType::Sum)
        } else if tok.is_kw("avg") {
            Some(AggType::Avg)
        } else if tok.is_kw("min") {
            Some(AggType::Min)
        } else if tok.is_kw("max") {
            Some(AggType::Max)
        } else {
            None
        }
    }

    fn parse_facet(&mut self) -> Result<AggregateEntry> {
        self.expect_symbol("(")?;
        let mut entry = AggregateEntry::new(AggType::Facet, std::iter::empty());
        loop {
            entry.fields.push(self.expect_ident()?);
            if !self.eat_symbol(",") {
                break;
            }
        }
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            loop {
                let field = if self.peek().kind == TokenKind::String {
                    self.next().text
                } else {
                    self.expect_ident()?
                };
                let desc = self.parse_direction();
                entry.sorting.push(SortingEntry::new(field, desc));
                if !self.eat_symbol(",") {
                    break;
                }
            }
        }
        if self.eat_kw("limit") {
            entry.limit = self.expect_unsigned()?;
        }
        if self.eat_kw("offset") {
            entry.offset = self.expect_unsigned()?;
        }
        self.expect_symbol(")")?;
        Ok(entry)
    }

    fn expect_unsigned(&mut self) -> Result<usize> {
        let tok = self.next();
        if tok.kind != TokenKind::Number {
            return Err(MemdexError::parse_sql(tok.start, "expected a number"));
        }
        tok.text
            .parse::<usize>()
            .map_err(|_| MemdexError::parse_sql(tok.start, "expected an unsigned integer"))
    }

    // -----------------------------------------------------------------------
    // WHERE
    // -----------------------------------------------------------------------

    fn parse_conditions(&mut self, query: &mut Query) -> Result<()> {
        let mut op = OpType::And;
        loop {
            let tok = self.peek().clone();
            if tok.is_kw("not") {
                self.next();
                op = OpType::Not;
                continue;
            }
            if tok.is_symbol("(") {
                self.next();
                query.entries.open_bracket(op);
                self.parse_conditions(query)?;
                self.expect_symbol(")")?;
                query.entries.close_bracket()?;
            } else if tok.is_kw("equal_position") {
                self.next();
                self.expect_symbol("(")?;
                let mut group = Vec::new();
                loop {
                    group.push(self.expect_ident()?);
                    if !self.eat_symbol(",") {
                        break;
                    }
                }
                self.expect_symbol(")")?;
                query.equal_positions.push(group);
            } else {
                let entry = self.parse_condition_atom(&mut op)?;
                query.entries.append(op, entry);
            }

            if self.eat_kw("and") {
                op = OpType::And;
            } else if self.eat_kw("or") {
                op = OpType::Or;
            } else {
                return Ok(());
            }
        }
    }

    fn parse_condition_atom(&mut self, op: &mut OpType) -> Result<QueryEntry> {
        if self.peek().is_kw("dwithin") {
            self.next();
            self.expect_symbol("(")?;
            let field = self.expect_ident()?;
            self.expect_symbol(",")?;
            self.expect_kw("point")?;
            self.expect_symbol("(")?;
            let x = self.expect_number()?;
            self.eat_symbol(",");
            let y = self.expect_number()?;
            self.expect_symbol(")")?;
            self.expect_symbol(",")?;
            let dist = self.expect_number()?;
            self.expect_symbol(")")?;
            return Ok(QueryEntry::new(
                CondType::DWithin,
                field,
                [
                    Variant::Tuple(vec![Variant::Double(x), Variant::Double(y)]),
                    Variant::Double(dist),
                ]
                .into_iter()
                .collect(),
            ));
        }

        let field = self.expect_ident()?;
        let tok = self.next();
        let (condition, values) = if tok.kind == TokenKind::Symbol {
            let condition = match tok.text.as_str() {
                "=" => CondType::Eq,
                "<" => CondType::Lt,
                "<=" => CondType::Le,
                ">" => CondType::Gt,
                ">=" => CondType::Ge,
                "<>" => {
                    // `a <> b` desugars to `NOT a = b`.
                    *op = match op {
                        OpType::Not => OpType::And,
                        _ => OpType::Not,
                    };
                    CondType::Eq
                }
                other => {
                    return Err(MemdexError::parse_sql(
                        tok.start,
                        format!("unexpected operator '{other}'"),
                    ))
                }
            };
            (condition, SmallVec::from_elem(self.parse_value()?, 1))
        } else if tok.is_kw("in") {
            self.expect_symbol("(")?;
            let mut values = SmallVec::new();
            loop {
                values.push(self.parse_value()?);
                if !self.eat_symbol(",") {
                    break;
                }
            }
            self.expect_symbol(")")?;
            (CondType::Set, values)
        } else if tok.is_kw("allset") {
            self.expect_symbol("(")?;
            let mut values = SmallVec::new();
            loop {
                values.push(self.parse_value()?);
                if !self.eat_symbol(",") {
                    break;
                }
            }
            self.expect_symbol(")")?;
            (CondType::AllSet, values)
        } else if tok.is_kw("range") {
            self.expect_symbol("(")?;
            let low = self.parse_value()?;
            self.expect_symbol(",")?;
            let high = self.parse_value()?;
            self.expect_symbol(")")?;
            (
                CondType::Range,
                [low, high].into_iter().collect::<SmallVec<_>>(),
            )
        } else if tok.is_kw("like") {
            let pattern = self.next();
            if pattern.kind != TokenKind::String {
                return Err(MemdexError::parse_sql(
                    pattern.start,
                    "LIKE expects a string pattern",
                ));
            }
            (
                CondType::Like,
                SmallVec::from_elem(Variant::string(pattern.text), 1),
            )
        } else if tok.is_kw("is") {
            if self.eat_kw("not") {
                self.expect_kw("null")?;
                (CondType::Any, SmallVec::new())
            } else {
                self.expect_kw("null")?;
                (CondType::Empty, SmallVec::new())
            }
        } else {
            return Err(MemdexError::parse_sql(
                tok.start,
                format!("expected condition, found '{}'", tok.text),
            ));
        };
        Ok(QueryEntry::new(condition, field, values))
    }

    fn parse_value(&mut self) -> Result<Variant> {
        let tok = self.next();
        match tok.kind {
            TokenKind::Number => Ok(number_variant(&tok.text)),
            TokenKind::String => Ok(Variant::string(tok.text)),
            TokenKind::Ident if tok.is_kw("true") => Ok(Variant::Bool(true)),
            TokenKind::Ident if tok.is_kw("false") => Ok(Variant::Bool(false)),
            TokenKind::Ident if tok.is_kw("null") => Ok(Variant::Null),
            TokenKind::Symbol if tok.text == "-" => {
                let tok = self.next();
                if tok.kind != TokenKind::Number {
                    return Err(MemdexError::parse_sql(tok.start, "expected a number"));
                }
                Ok(match number_variant(&tok.text) {
                    Variant::Int64(v) => Variant::Int64(-v),
                    Variant::Double(v) => Variant::Double(-v),
                    other => other,
                })
            }
            _ => Err(MemdexError::parse_sql(
                tok.start,
                format!("expected literal value, found '{}'", tok.text),
            )),
        }
    }

    fn expect_number(&mut self) -> Result<f64> {
        let negative = self.eat_symbol("-");
        let tok = self.next();
        if tok.kind != TokenKind::Number {
            return Err(MemdexError::parse_sql(tok.start, "expected a number"));
        }
        let v: f64 = tok
            .text
            .parse()
            .map_err(|_| MemdexError::parse_sql(tok.start, "malformed number"))?;
        Ok(if negative { -v } else { v })
    }

    // -----------------------------------------------------------------------
    // JOIN / ORDER BY
    // -----------------------------------------------------------------------

    fn parse_join(&mut self, query: &mut Query, join_type: JoinType) -> Result<()> {
        let sub = if self.eat_symbol("(") {
            let sub = self.parse_select()?;
            self.expect_symbol(")")?;
            sub
        } else {
            Query::new(self.expect_ident()?)
        };
        self.expect_kw("on")?;
        let mut on = Vec::new();
        let mut op = OpType::And;
        loop {
            let left = self.expect_ident()?;
            let cmp = self.next();
            let condition = match cmp.text.as_str() {
                "=" => CondType::Eq,
                "<" => CondType::Lt,
                "<=" => CondType::Le,
                ">" => CondType::Gt,
                ">=" => CondType::Ge,
                _ => {
                    return Err(MemdexError::parse_sql(
                        cmp.start,
                        "expected comparison in join condition",
                    ))
                }
            };
            let right = self.expect_ident()?;
            // Either side may be written `ns.field`; the joined namespace's
            // side becomes the right field.
            let joined_prefix = format!("{}.", sub.namespace);
            let (left_field, right_field, condition) =
                if let Some(stripped) = left.strip_prefix(&joined_prefix) {
                    (strip_ns(&right), stripped.to_owned(), invert(condition))
                } else {
                    (strip_ns(&left), strip_ns(&right), condition)
                };
            on.push(QueryJoinEntry {
                op,
                condition,
                left_field,
                right_field,
            });
            if self.eat_kw("and") {
                op = OpType::And;
            } else if self.eat_kw("or") {
                op = OpType::Or;
            } else {
                break;
            }
        }
        *query = std::mem::take(query).join(JoinedQuery {
            join_type,
            query: sub,
            on,
        });
        Ok(())
    }

    fn parse_order_by(&mut self, query: &mut Query) -> Result<()> {
        loop {
            let tok = self.peek().clone();
            if tok.is_kw("field") {
                // ORDER BY FIELD(col, v1, v2, ...): forced order.
                self.next();
                self.expect_symbol("(")?;
                let column = self.expect_ident()?;
                let mut values = Vec::new();
                while self.eat_symbol(",") {
                    values.push(self.parse_value()?);
                }
                self.expect_symbol(")")?;
                let desc = self.parse_direction();
                if query.sorting_entries.is_empty() {
                    query.forced_sort_order = values;
                } else {
                    return Err(self.err_here("forced sort must be the first order entry"));
                }
                query.sorting_entries.push(SortingEntry::new(column, desc));
            } else {
                let expression = if tok.kind == TokenKind::String {
                    self.next().text
                } else {
                    self.expect_ident()?
                };
                let desc = self.parse_direction();
                query.sorting_entries.push(SortingEntry::new(expression, desc));
            }
            if !self.eat_symbol(",") {
                return Ok(());
            }
        }
    }

    fn parse_direction(&mut self) -> bool {
        if self.eat_kw("desc") {
            true
        } else {
            self.eat_kw("asc");
            false
        }
    }
}

fn number_variant(text: &str) -> Variant {
    if !text.contains('.') && !text.contains('e') && !text.contains('E') {
        if let Ok(v) = text.parse::<i64>() {
            return Variant::Int64(v);
        }
    }
    Variant::Double(text.parse().unwrap_or(0.0))
}

fn strip_ns(field: &str) -> String {
    match field.split_once('.') {
        Some((_, rest)) => rest.to_owned(),
        None => field.to_owned(),
    }
}

const fn invert(condition: CondType) -> CondType {
    match condition {
        CondType::Lt => CondType::Gt,
        CondType::Le => CondType::Ge,
        CondType::Gt => CondType::Lt,
        CondType::Ge => CondType::Le,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_select() {
        let q = parse_sql("SELECT * FROM items WHERE id = 3 LIMIT 10 OFFSET 5").unwrap();
        assert_eq!(q.namespace, "items");
        assert_eq!(q.count, 10);
        assert_eq!(q.start, 5);
        let entry = q.entries.leaf(0).unwrap();
        assert_eq!(entry.index, "id");
        assert_eq!(entry.condition, CondType::Eq);
        assert_eq!(entry.values[0], Variant::Int64(3));
    }

    #[test]
    fn test_parse_boolean_tree_with_brackets() {
        let q = parse_sql("SELECT * FROM t WHERE a = 1 AND (b = 2 OR c = 3) AND NOT d = 4")
            .unwrap();
        assert_eq!(q.entries.len(), 5);
        assert!(!q.entries.is_leaf(1));
        assert_eq!(q.entries.op(1), OpType::And);
        assert_eq!(q.entries.op(3), OpType::Or);
        assert_eq!(q.entries.op(4), OpType::Not);
    }

    #[test]
    fn test_parse_in_range_like() {
        let q = parse_sql(
            "SELECT * FROM t WHERE a IN (1, 2, 3) AND b RANGE (10, 20) AND c LIKE 'x%_'",
        )
        .unwrap();
        let a = q.entries.leaf(0).unwrap();
        assert_eq!(a.condition, CondType::Set);
        assert_eq!(a.values.len(), 3);
        let b = q.entries.leaf(1).unwrap();
        assert_eq!(b.condition, CondType::Range);
        let c = q.entries.leaf(2).unwrap();
        assert_eq!(c.condition, CondType::Like);
    }

    #[test]
    fn test_parse_is_null_and_not_equal() {
        let q = parse_sql("SELECT * FROM t WHERE a IS NULL AND b IS NOT NULL AND c <> 5").unwrap();
        assert_eq!(q.entries.leaf(0).unwrap().condition, CondType::Empty);
        assert_eq!(q.entries.leaf(1).unwrap().condition, CondType::Any);
        assert_eq!(q.entries.op(2), OpType::Not);
        assert_eq!(q.entries.leaf(2).unwrap().condition, CondType::Eq);
    }

    #[test]
    fn test_parse_aggregates_and_facets() {
        let q = parse_sql("SELECT SUM(price), FACET(brand, model ORDER BY count DESC LIMIT 5) FROM t")
            .unwrap();
        assert_eq!(q.aggregations.len(), 2);
        assert_eq!(q.aggregations[0].agg_type, AggType::Sum);
        let facet = &q.aggregations[1];
        assert_eq!(facet.agg_type, AggType::Facet);
        assert_eq!(facet.fields.len(), 2);
        assert_eq!(facet.limit, 5);
        assert!(facet.sorting[0].desc);
    }

    #[test]
    fn test_parse_count_sets_total_mode() {
        let q = parse_sql("SELECT COUNT(*) FROM t").unwrap();
        assert_eq!(q.calc_total, CalcTotalMode::AccurateTotal);
        assert_eq!(q.count, 0);
        let q = parse_sql("SELECT COUNT_CACHED(*) FROM t").unwrap();
        assert_eq!(q.calc_total, CalcTotalMode::CachedTotal);
    }

    #[test]
    fn test_parse_order_by_variants() {
        let q = parse_sql("SELECT * FROM t ORDER BY a DESC, 'b + c / 2', d ASC").unwrap();
        assert_eq!(q.sorting_entries.len(), 3);
        assert!(q.sorting_entries[0].desc);
        assert_eq!(q.sorting_entries[1].expression, "b + c / 2");
        assert!(!q.sorting_entries[2].desc);
    }

    #[test]
    fn test_parse_forced_sort() {
        let q = parse_sql("SELECT * FROM t ORDER BY FIELD(status, 'new', 'open') DESC").unwrap();
        assert_eq!(q.forced_sort_order.len(), 2);
        assert_eq!(q.sorting_entries[0].expression, "status");
        assert!(q.sorting_entries[0].desc);
    }

    #[test]
    fn test_parse_joins() {
        let q = parse_sql(
            "SELECT * FROM orders INNER JOIN (SELECT * FROM users WHERE age > 18) ON users.id = orders.user_id",
        )
        .unwrap();
        assert_eq!(q.join_queries.len(), 1);
        let join = &q.join_queries[0];
        assert_eq!(join.join_type, JoinType::Inner);
        assert_eq!(join.query.namespace, "users");
        assert_eq!(join.on[0].left_field, "user_id");
        assert_eq!(join.on[0].right_field, "id");
        // Inner join leaves a placeholder in the boolean tree.
        assert!(q.entries.leaf(0).unwrap().is_join());
    }

    #[test]
    fn test_parse_left_join_no_placeholder() {
        let q = parse_sql("SELECT * FROM a LEFT JOIN (SELECT * FROM b) ON b.x = a.y").unwrap();
        assert_eq!(q.join_queries[0].join_type, JoinType::Left);
        assert!(q.entries.is_empty());
    }

    #[test]
    fn test_parse_merge() {
        let q = parse_sql("SELECT * FROM a WHERE x = 1 MERGE (SELECT * FROM b WHERE y = 2)")
            .unwrap();
        assert_eq!(q.merge_queries.len(), 1);
        assert_eq!(q.merge_queries[0].namespace, "b");
    }

    #[test]
    fn test_parse_equal_position() {
        let q = parse_sql("SELECT * FROM t WHERE a = 1 AND equal_position(f1, f2)").unwrap();
        assert_eq!(q.equal_positions, vec![vec!["f1".to_owned(), "f2".to_owned()]]);
    }

    #[test]
    fn test_parse_dwithin() {
        let q = parse_sql("SELECT * FROM t WHERE DWITHIN(location, POINT(1.5, -2.5), 10)").unwrap();
        let entry = q.entries.leaf(0).unwrap();
        assert_eq!(entry.condition, CondType::DWithin);
        assert_eq!(entry.index, "location");
        assert_eq!(entry.values[1], Variant::Double(10.0));
    }

    #[test]
    fn test_parse_errors_carry_position() {
        let err = parse_sql("SELECT * FROM").unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::ParseSql);
        let err = parse_sql("SELECT * FROM t WHERE").unwrap_err();
        assert_eq!(err.code(), memdex_error::ErrorCode::ParseSql);
    }

    #[test]
    fn test_parse_rank_select() {
        let q = parse_sql("SELECT *, RANK() FROM t WHERE ft = 'hello'").unwrap();
        assert!(q.with_rank);
    }
}

use memdex_error::{MemdexError, Result};

/// Token kind produced by the SQL lexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword (keywords resolve in the parser).
    Ident,
    /// Single-quoted string literal, unescaped.
    String,
    /// Numeric literal, decimal with optional exponent.
    Number,
    /// One operator or punctuation symbol.
    Symbol,
    Eof,
}

/// One token with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// Case-insensitive keyword check.
    #[must_use]
    pub fn is_kw(&self, kw: &str) -> bool {
        self.kind == TokenKind::Ident && self.text.eq_ignore_ascii_case(kw)
    }

    #[must_use]
    pub fn is_symbol(&self, sym: &str) -> bool {
        self.kind == TokenKind::Symbol && self.text == sym
    }
}

/// Byte-level SQL lexer with span tracking.
pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
        }
    }

    /// Tokenize the whole input.
    pub fn tokenize(source: &str) -> Result<Vec<Token>> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.src.get(self.pos + off).copied()
    }

    pub fn next_token(&mut self) -> Result<Token> {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                text: String::new(),
                start,
                end: start,
            });
        };
        match c {
            b'\'' => self.lex_string(start),
            c if c.is_ascii_digit()
                || (c == b'.' && self.peek_at(1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                self.lex_number(start)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
                {
                    self.pos += 1;
                }
                Ok(self.token(TokenKind::Ident, start))
            }
            b'<' | b'>' => {
                self.pos += 1;
                if self.peek() == Some(b'=') || (c == b'<' && self.peek() == Some(b'>')) {
                    self.pos += 1;
                }
                Ok(self.token(TokenKind::Symbol, start))
            }
            b'=' | b'(' | b')' | b',' | b'*' | b'+' | b'-' | b'/' => {
                self.pos += 1;
                Ok(self.token(TokenKind::Symbol, start))
            }
            other => Err(MemdexError::parse_sql(
                start,
                format!("unexpected character '{}'", other as char),
            )),
        }
    }

    fn token(&self, kind: TokenKind, start: usize) -> Token {
        Token {
            kind,
            text: String::from_utf8_lossy(&self.src[start..self.pos]).into_owned(),
            start,
            end: self.pos,
        }
    }

    fn lex_string(&mut self, start: usize) -> Result<Token> {
        self.pos += 1; // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(MemdexError::parse_sql(start, "unterminated string literal"))
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let Some(escaped) = self.peek() else {
                        return Err(MemdexError::parse_sql(start, "unterminated escape"));
                    };
                    text.push(match escaped {
                        b'n' => '\n',
                        b't' => '\t',
                        other => other as char,
                    });
                    self.pos += 1;
                }
                Some(b'\'') => {
                    self.pos += 1;
                    return Ok(Token {
                        kind: TokenKind::String,
                        text,
                        start,
                        end: self.pos,
                    });
                }
                Some(_) => {
                    // Copy the whole UTF-8 character.
                    let rest = &self.src[self.pos..];
                    let s = std::str::from_utf8(rest)
                        .map_err(|_| MemdexError::parse_sql(self.pos, "invalid UTF-8"))?;
                    let ch = s.chars().next().expect("non-empty");
                    text.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        }
    }

    fn lex_number(&mut self, start: usize) -> Result<Token> {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'.') {
            self.pos += 1;
        }
        if self.peek().is_some_and(|c| c == b'e' || c == b'E') {
            let mut off = 1;
            if self
                .peek_at(1)
                .is_some_and(|c| c == b'+' || c == b'-')
            {
                off += 1;
            }
            if self.peek_at(off).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += off;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let tok = self.token(TokenKind::Number, start);
        if tok.text.parse::<f64>().is_err() {
            return Err(MemdexError::parse_sql(
                start,
                format!("malformed number '{}'", tok.text),
            ));
        }
        Ok(tok)
    }
}

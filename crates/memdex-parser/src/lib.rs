//! SQL front-end for memdex.
//!
//! Translates the SQL-like surface (`SELECT ... FROM ns WHERE ...`) into the
//! [`memdex_query::Query`] form the selector executes, and provides keyword
//! completion for interactive clients.

mod lexer;
mod parser;
mod suggest;

pub use lexer::{Lexer, Token, TokenKind};
pub use parser::parse_sql;
pub use suggest::suggestions;

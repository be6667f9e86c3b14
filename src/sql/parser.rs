//! Named parameter rewriting.
//!
//! [`parse_sql`] scans SQL text once and replaces every `:name` placeholder
//! with a positional `$N` marker. The first occurrence of a name is assigned
//! the next index, later occurrences reuse it. String constants, quoted
//! identifiers, comments and `$$` literals are copied verbatim, so placeholder
//! syntax inside them is never touched. Cast syntax (`::int`) is preserved
//! because a colon preceded by another colon never starts a parameter.
//!
//! # Example
//!
//! ```
//! use tinysql::sql::parse_sql;
//!
//! let parsed = parse_sql("SELECT * FROM users WHERE id = :id AND org = :org.id");
//! assert_eq!(
//!     parsed.parameterized_sql,
//!     "SELECT * FROM users WHERE id = $1 AND org = $2"
//! );
//! assert_eq!(parsed.mapping[1].name, "org.id");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Association of a named placeholder to its 1-based positional index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamMapping {
    pub name: String,
    pub index: usize,
}

/// Output of [`parse_sql`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteResult {
    pub parameterized_sql: String,
    /// Ordered by index: `mapping[i].index == i + 1`
    pub mapping: Vec<ParamMapping>,
}

/// Lexical state of the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParserState {
    Query,
    QuotedIdent,
    StringConstant,
    LineComment,
    BlockComment { depth: u32 },
    DollarQuoteLiteral,
    ConsumingIdent { name: String },
    /// Drop one character that was already emitted, then continue in `then`.
    SkipNext { then: Box<ParserState> },
}

mod token {
    pub const COLON: char = ':';
    pub const BACK_SLASH: char = '\\';
    pub const FORWARD_SLASH: char = '/';
    pub const SINGLE_QUOTE: char = '\'';
    pub const DASH: char = '-';
    pub const STAR: char = '*';
    pub const NEW_LINE: char = '\n';
    pub const DOLLAR: char = '$';
    pub const DOUBLE_QUOTE: char = '"';
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

struct Scanner {
    output: String,
    mapping: Vec<ParamMapping>,
}

impl Scanner {
    /// Emit the positional marker for `name`, registering it on first sight.
    fn push_param(&mut self, name: &str) {
        let index = match self.mapping.iter().find(|m| m.name == name) {
            Some(existing) => existing.index,
            None => {
                let index = self.mapping.len() + 1;
                self.mapping.push(ParamMapping {
                    name: name.to_string(),
                    index,
                });
                index
            }
        };
        // Writing to a String cannot fail
        let _ = write!(self.output, "{}{}", token::DOLLAR, index);
    }

    fn scan_query(&mut self, current: char, previous: Option<char>, next: Option<char>) -> ParserState {
        use token::*;

        if current == COLON && previous != Some(COLON) && next.is_some_and(is_ident_start) {
            return ParserState::ConsumingIdent {
                name: String::new(),
            };
        }

        if current == SINGLE_QUOTE && previous != Some(BACK_SLASH) {
            self.output.push(current);
            return ParserState::StringConstant;
        }

        if current == DASH && next == Some(DASH) {
            self.output.push(DASH);
            self.output.push(DASH);
            return ParserState::SkipNext {
                then: Box::new(ParserState::LineComment),
            };
        }

        if current == FORWARD_SLASH && next == Some(STAR) {
            self.output.push(FORWARD_SLASH);
            self.output.push(STAR);
            return ParserState::SkipNext {
                then: Box::new(ParserState::BlockComment { depth: 1 }),
            };
        }

        if current == DOLLAR && previous == Some(DOLLAR) {
            self.output.push(current);
            return ParserState::DollarQuoteLiteral;
        }

        if current == DOUBLE_QUOTE {
            self.output.push(current);
            return ParserState::QuotedIdent;
        }

        self.output.push(current);
        ParserState::Query
    }

    fn scan_block_comment(&mut self, depth: u32, current: char, next: Option<char>) -> ParserState {
        use token::*;

        self.output.push(current);
        match (current, next) {
            (STAR, Some(FORWARD_SLASH)) => {
                self.output.push(FORWARD_SLASH);
                let then = if depth <= 1 {
                    ParserState::Query
                } else {
                    ParserState::BlockComment { depth: depth - 1 }
                };
                ParserState::SkipNext {
                    then: Box::new(then),
                }
            }
            (FORWARD_SLASH, Some(STAR)) => {
                self.output.push(STAR);
                ParserState::SkipNext {
                    then: Box::new(ParserState::BlockComment { depth: depth + 1 }),
                }
            }
            _ => ParserState::BlockComment { depth },
        }
    }
}

/// Rewrite `:name` placeholders into `$N` markers.
///
/// Total over all inputs: unterminated strings, comments and literals simply
/// run to the end of the text.
pub fn parse_sql(sql: &str) -> RewriteResult {
    let chars: Vec<char> = sql.chars().collect();
    let mut scanner = Scanner {
        output: String::with_capacity(sql.len() + 8),
        mapping: Vec::new(),
    };
    let mut state = ParserState::Query;

    for (i, &current) in chars.iter().enumerate() {
        let previous = i.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(i + 1).copied();

        state = match state {
            ParserState::Query => scanner.scan_query(current, previous, next),
            ParserState::BlockComment { depth } => {
                scanner.scan_block_comment(depth, current, next)
            }
            ParserState::LineComment => {
                scanner.output.push(current);
                if current == token::NEW_LINE {
                    ParserState::Query
                } else {
                    ParserState::LineComment
                }
            }
            ParserState::StringConstant => {
                scanner.output.push(current);
                if current == token::SINGLE_QUOTE && previous != Some(token::BACK_SLASH) {
                    ParserState::Query
                } else {
                    ParserState::StringConstant
                }
            }
            ParserState::ConsumingIdent { mut name } => {
                if is_ident_char(current) {
                    name.push(current);
                    ParserState::ConsumingIdent { name }
                } else {
                    scanner.push_param(&name);
                    scanner.scan_query(current, previous, next)
                }
            }
            ParserState::DollarQuoteLiteral => {
                scanner.output.push(current);
                if current == token::DOLLAR && previous == Some(token::DOLLAR) {
                    ParserState::Query
                } else {
                    ParserState::DollarQuoteLiteral
                }
            }
            ParserState::QuotedIdent => {
                scanner.output.push(current);
                if current == token::DOUBLE_QUOTE {
                    ParserState::Query
                } else {
                    ParserState::QuotedIdent
                }
            }
            ParserState::SkipNext { then } => *then,
        };
    }

    if let ParserState::ConsumingIdent { name } = state {
        scanner.push_param(&name);
    }

    RewriteResult {
        parameterized_sql: scanner.output,
        mapping: scanner.mapping,
    }
}

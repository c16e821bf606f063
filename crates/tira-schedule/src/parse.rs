//! Schedule string lexer and parser.
//!
//! Validation is a consequence of parsing: a schedule is valid exactly when
//! it parses into a sequence of [`Atom`]s, and the canonical form is the
//! re-emission of that sequence. There is no separate validator to drift out
//! of sync with.

use tira_core::{ErrorInfo, TiraError};

use crate::atom::{Atom, LoopId};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(String),
    Quoted(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eq,
    Pipe,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("`{name}`"),
            Token::Int(text) => format!("`{text}`"),
            Token::Quoted(text) => format!("`'{text}'`"),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::LBracket => "`[`".to_string(),
            Token::RBracket => "`]`".to_string(),
            Token::Comma => "`,`".to_string(),
            Token::Eq => "`=`".to_string(),
            Token::Pipe => "`|`".to_string(),
        }
    }
}

fn parse_error(message: impl Into<String>, offset: usize) -> TiraError {
    TiraError::InvalidArgument(
        ErrorInfo::new("tira_schedule.parse", message).with("offset", offset.to_string()),
    )
}

fn lex(src: &str) -> Result<Vec<(usize, Token)>, TiraError> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(offset, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        match ch {
            '(' | ')' | '[' | ']' | ',' | '=' | '|' => {
                chars.next();
                let token = match ch {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    '=' => Token::Eq,
                    _ => Token::Pipe,
                };
                tokens.push((offset, token));
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == ch {
                        closed = true;
                        break;
                    }
                    text.push(c);
                }
                if !closed {
                    return Err(parse_error("unterminated quoted comp identifier", offset));
                }
                tokens.push((offset, Token::Quoted(text)));
            }
            '-' => {
                chars.next();
                let mut text = String::from("-");
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if text.len() == 1 {
                    return Err(parse_error("`-` must be followed by digits", offset));
                }
                tokens.push((offset, Token::Int(text)));
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((offset, Token::Int(text)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((offset, Token::Ident(text)));
            }
            other => {
                return Err(parse_error(
                    format!("unexpected character `{other}` in schedule"),
                    offset,
                ));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end)
    }

    fn malformed(&self, tag: &str, detail: impl Into<String>) -> TiraError {
        parse_error(
            format!("malformed {tag} transformation: {}", detail.into()),
            self.offset(),
        )
    }

    fn expect(&mut self, tag: &str, expected: Token) -> Result<(), TiraError> {
        match self.next() {
            Some((_, token)) if token == expected => Ok(()),
            Some((offset, token)) => Err(parse_error(
                format!(
                    "malformed {tag} transformation: expected {} but found {}",
                    expected.describe(),
                    token.describe()
                ),
                offset,
            )),
            None => Err(self.malformed(tag, format!("expected {}", expected.describe()))),
        }
    }

    fn loop_id(&mut self, tag: &str) -> Result<LoopId, TiraError> {
        match self.next() {
            Some((offset, Token::Ident(name))) => {
                let digits = name.strip_prefix('L').unwrap_or("");
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    let level = digits.parse::<u32>().map_err(|_| {
                        parse_error(
                            format!("malformed {tag} transformation: loop id out of range"),
                            offset,
                        )
                    })?;
                    Ok(LoopId(level))
                } else {
                    Err(parse_error(
                        format!("malformed {tag} transformation: expected loop id, found `{name}`"),
                        offset,
                    ))
                }
            }
            Some((offset, token)) => Err(parse_error(
                format!(
                    "malformed {tag} transformation: expected loop id, found {}",
                    token.describe()
                ),
                offset,
            )),
            None => Err(self.malformed(tag, "expected loop id")),
        }
    }

    fn signed(&mut self, tag: &str) -> Result<i64, TiraError> {
        match self.next() {
            Some((offset, Token::Int(text))) => text.parse::<i64>().map_err(|_| {
                parse_error(
                    format!("malformed {tag} transformation: integer out of range"),
                    offset,
                )
            }),
            Some((offset, token)) => Err(parse_error(
                format!(
                    "malformed {tag} transformation: expected integer, found {}",
                    token.describe()
                ),
                offset,
            )),
            None => Err(self.malformed(tag, "expected integer")),
        }
    }

    fn unsigned(&mut self, tag: &str) -> Result<u64, TiraError> {
        match self.next() {
            Some((offset, Token::Int(text))) => text.parse::<u64>().map_err(|_| {
                parse_error(
                    format!("malformed {tag} transformation: expected non-negative integer"),
                    offset,
                )
            }),
            Some((offset, token)) => Err(parse_error(
                format!(
                    "malformed {tag} transformation: expected integer, found {}",
                    token.describe()
                ),
                offset,
            )),
            None => Err(self.malformed(tag, "expected integer")),
        }
    }

    fn comma(&mut self, tag: &str) -> Result<(), TiraError> {
        self.expect(tag, Token::Comma)
    }

    fn comp_name(&mut self, tag: &str) -> Result<String, TiraError> {
        match self.next() {
            Some((_, Token::Ident(name))) => Ok(name),
            Some((offset, Token::Quoted(text))) => {
                if text.contains('\'') {
                    Err(parse_error(
                        format!("malformed {tag} transformation: comp identifier contains a quote"),
                        offset,
                    ))
                } else {
                    Ok(text)
                }
            }
            Some((offset, token)) => Err(parse_error(
                format!(
                    "malformed {tag} transformation: expected comp identifier, found {}",
                    token.describe()
                ),
                offset,
            )),
            None => Err(self.malformed(tag, "expected comp identifier")),
        }
    }

    /// Parses the optional `,comps=[…]` clause and the closing paren.
    fn finish(&mut self, tag: &str) -> Result<Vec<String>, TiraError> {
        match self.next() {
            Some((_, Token::RParen)) => Ok(Vec::new()),
            Some((_, Token::Comma)) => {
                match self.next() {
                    Some((_, Token::Ident(keyword))) if keyword == "comps" => {}
                    Some((offset, token)) => {
                        return Err(parse_error(
                            format!(
                                "malformed {tag} transformation: expected `comps=[…]`, found {}",
                                token.describe()
                            ),
                            offset,
                        ));
                    }
                    None => return Err(self.malformed(tag, "expected `comps=[…]`")),
                }
                self.expect(tag, Token::Eq)?;
                self.expect(tag, Token::LBracket)?;
                let mut comps = vec![self.comp_name(tag)?];
                while self.peek() == Some(&Token::Comma) {
                    self.next();
                    comps.push(self.comp_name(tag)?);
                }
                self.expect(tag, Token::RBracket)?;
                self.expect(tag, Token::RParen)?;
                Ok(comps)
            }
            Some((offset, token)) => Err(parse_error(
                format!(
                    "malformed {tag} transformation: expected `,` or `)`, found {}",
                    token.describe()
                ),
                offset,
            )),
            None => Err(self.malformed(tag, "expected `,` or `)`")),
        }
    }

    fn atom(&mut self) -> Result<Atom, TiraError> {
        let (offset, token) = self
            .next()
            .ok_or_else(|| parse_error("expected a transformation name", self.end))?;
        let name = match token {
            Token::Ident(name) => name,
            other => {
                return Err(parse_error(
                    format!("expected a transformation name, found {}", other.describe()),
                    offset,
                ));
            }
        };
        let tag = name.as_str();
        match tag {
            "S" => {
                self.expect(tag, Token::LParen)?;
                let outer = self.loop_id(tag)?;
                self.comma(tag)?;
                let inner = self.loop_id(tag)?;
                self.comma(tag)?;
                let factor_outer = self.signed(tag)?;
                self.comma(tag)?;
                let factor_inner = self.signed(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Skew {
                    outer,
                    inner,
                    factor_outer,
                    factor_inner,
                    comps,
                })
            }
            "I" => {
                self.expect(tag, Token::LParen)?;
                let outer = self.loop_id(tag)?;
                self.comma(tag)?;
                let inner = self.loop_id(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Interchange {
                    outer,
                    inner,
                    comps,
                })
            }
            "R" => {
                self.expect(tag, Token::LParen)?;
                let level = self.loop_id(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Reverse { level, comps })
            }
            "P" => {
                self.expect(tag, Token::LParen)?;
                let level = self.loop_id(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Parallelize { level, comps })
            }
            "T2" => {
                self.expect(tag, Token::LParen)?;
                let outer = self.loop_id(tag)?;
                self.comma(tag)?;
                let inner = self.loop_id(tag)?;
                self.comma(tag)?;
                let size_outer = self.unsigned(tag)?;
                self.comma(tag)?;
                let size_inner = self.unsigned(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Tile2 {
                    outer,
                    inner,
                    size_outer,
                    size_inner,
                    comps,
                })
            }
            "T3" => {
                self.expect(tag, Token::LParen)?;
                let outer = self.loop_id(tag)?;
                self.comma(tag)?;
                let middle = self.loop_id(tag)?;
                self.comma(tag)?;
                let inner = self.loop_id(tag)?;
                self.comma(tag)?;
                let size_outer = self.unsigned(tag)?;
                self.comma(tag)?;
                let size_middle = self.unsigned(tag)?;
                self.comma(tag)?;
                let size_inner = self.unsigned(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Tile3 {
                    outer,
                    middle,
                    inner,
                    size_outer,
                    size_middle,
                    size_inner,
                    comps,
                })
            }
            "U" => {
                self.expect(tag, Token::LParen)?;
                let level = self.loop_id(tag)?;
                self.comma(tag)?;
                let factor = self.unsigned(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Unroll {
                    level,
                    factor,
                    comps,
                })
            }
            "F" => {
                self.expect(tag, Token::LParen)?;
                let first = self.loop_id(tag)?;
                self.comma(tag)?;
                let second = self.loop_id(tag)?;
                let comps = self.finish(tag)?;
                Ok(Atom::Fuse {
                    first,
                    second,
                    comps,
                })
            }
            other => Err(parse_error(
                format!("unknown transformation `{other}`"),
                offset,
            )),
        }
    }
}

/// Parses a schedule string into its transformation atoms.
///
/// The empty (or all-whitespace) string is the identity schedule and parses
/// to an empty sequence.
pub fn parse_schedule(input: &str) -> Result<Vec<Atom>, TiraError> {
    let tokens = lex(input)?;
    if tokens.is_empty() {
        return Ok(Vec::new());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let mut atoms = Vec::new();
    loop {
        if parser.peek() == Some(&Token::Pipe) {
            return Err(parse_error("empty segment in schedule", parser.offset()));
        }
        atoms.push(parser.atom()?);
        match parser.next() {
            None => break,
            Some((offset, Token::Pipe)) => {
                if parser.peek().is_none() {
                    return Err(parse_error("empty segment in schedule", offset));
                }
            }
            Some((offset, token)) => {
                return Err(parse_error(
                    format!(
                        "expected `|` between transformations, found {}",
                        token.describe()
                    ),
                    offset,
                ));
            }
        }
    }
    Ok(atoms)
}

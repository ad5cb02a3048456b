// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A lazy, one-token-peek tokenizer for GHPERM text.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub row: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    LBrace,
    RBrace,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: Location,
}

#[derive(Debug, thiserror::Error)]
#[error("{loc}: {message}")]
pub struct TokenizeError {
    pub loc: Location,
    pub message: String,
}

pub struct Tokenizer<'a> {
    data: &'a [u8],
    idx: usize,
    row: usize,
    column: usize,
    peeked: Option<Token>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(data: &'a [u8]) -> Tokenizer<'a> {
        Tokenizer {
            data,
            idx: 0,
            row: 1,
            column: 1,
            peeked: None,
        }
    }

    fn loc(&self) -> Location {
        Location {
            row: self.row,
            column: self.column,
        }
    }

    fn cur(&self) -> u8 {
        self.data.get(self.idx).copied().unwrap_or(0)
    }

    fn advance(&mut self) {
        if self.idx >= self.data.len() {
            return;
        }
        if self.cur() == b'\n' {
            self.row += 1;
            self.column = 0;
        }
        self.idx += 1;
        self.column += 1;
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.cur() {
                b' ' | b'\t' | b'\n' | b'\r' => self.advance(),
                b'#' => {
                    while self.cur() != b'\n' && self.idx < self.data.len() {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn is_ident_byte(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_'
    }

    fn read_ident(&mut self) -> String {
        let start = self.idx;
        while Self::is_ident_byte(self.cur()) {
            self.advance();
        }
        String::from_utf8_lossy(&self.data[start..self.idx]).into_owned()
    }

    fn read_string(&mut self) -> Result<String, TokenizeError> {
        let loc = self.loc();
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.cur() {
                0 if self.idx >= self.data.len() => {
                    return Err(TokenizeError {
                        loc,
                        message: "unterminated string literal".to_string(),
                    })
                }
                b'"' => {
                    self.advance();
                    break;
                }
                b'\\' => {
                    self.advance();
                    match self.cur() {
                        b'n' => out.push('\n'),
                        b't' => out.push('\t'),
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        other => {
                            return Err(TokenizeError {
                                loc: self.loc(),
                                message: format!("unknown escape sequence '\\{}'", other as char),
                            })
                        }
                    }
                    self.advance();
                }
                c => {
                    out.push(c as char);
                    self.advance();
                }
            }
        }
        Ok(out)
    }

    fn lex_one(&mut self) -> Result<Token, TokenizeError> {
        self.skip_whitespace_and_comments();
        let loc = self.loc();
        if self.idx >= self.data.len() {
            return Ok(Token {
                kind: TokenKind::Eof,
                loc,
            });
        }
        let kind = match self.cur() {
            b'{' => {
                self.advance();
                TokenKind::LBrace
            }
            b'}' => {
                self.advance();
                TokenKind::RBrace
            }
            b'"' => TokenKind::Str(self.read_string()?),
            c if Self::is_ident_byte(c) => TokenKind::Ident(self.read_ident()),
            c => {
                return Err(TokenizeError {
                    loc,
                    message: format!("unexpected character '{}'", c as char),
                })
            }
        };
        Ok(Token { kind, loc })
    }

    pub fn peek(&mut self) -> Result<&Token, TokenizeError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex_one()?);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    pub fn next(&mut self) -> Result<Token, TokenizeError> {
        if let Some(tok) = self.peeked.take() {
            return Ok(tok);
        }
        self.lex_one()
    }
}

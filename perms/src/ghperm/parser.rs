// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recursive-descent parser over the GHPERM grammar:
//!
//! ```text
//! file      := resource* EOF
//! resource  := IDENT IDENT '{' entry* '}'
//! entry     := STRING '{' field* '}'
//! field     := IDENT arg+
//! arg       := IDENT | STRING
//! ```
//!
//! A resource block is routed to the first domain whose `matches(group, resource)`
//! accepts it: the filesystem domain, then the exec domain, then registered generic
//! domains in registration order.
//!
//! A filesystem entry's `self`/`children` fields specialize the general `field := IDENT
//! arg+` shape further: the first arg is an action identifier (`accept`/`reject`/
//! `prompt`) and every remaining arg is a quoted mode name, e.g. `self accept "read"
//! "createdir"`. A `self`/`children` name may repeat within one entry (one line per
//! action) and every occurrence accumulates into the same modeset.

use crate::exec::ExecDomain;
use crate::filesystem::FilesystemDomain;
use crate::generic::GenericRegistry;
use crate::ghperm::tokenizer::{Location, Token, TokenKind, Tokenizer};

#[derive(Debug, thiserror::Error)]
#[error("{loc}: {message}")]
pub struct ParseError {
    pub loc: Location,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, ParseError>;

fn err(loc: Location, message: impl Into<String>) -> ParseError {
    ParseError {
        loc,
        message: message.into(),
    }
}

#[derive(Debug, Clone)]
pub enum Arg {
    Ident(String),
    Str(String),
}

impl Arg {
    pub fn as_str(&self) -> &str {
        match self {
            Arg::Ident(s) | Arg::Str(s) => s,
        }
    }
}

pub struct Parser<'a> {
    tokenizer: Tokenizer<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8]) -> Parser<'a> {
        Parser {
            tokenizer: Tokenizer::new(data),
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Location)> {
        let tok = self.tokenizer.next().map_err(|e| err(e.loc, e.message))?;
        match tok.kind {
            TokenKind::Ident(s) => Ok((s, tok.loc)),
            other => Err(err(tok.loc, format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect_str(&mut self) -> Result<(String, Location)> {
        let tok = self.tokenizer.next().map_err(|e| err(e.loc, e.message))?;
        match tok.kind {
            TokenKind::Str(s) => Ok((s, tok.loc)),
            other => Err(err(tok.loc, format!("expected string, found {other:?}"))),
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        let tok = self.tokenizer.next().map_err(|e| err(e.loc, e.message))?;
        if tok.kind == kind {
            Ok(tok)
        } else {
            Err(err(tok.loc, format!("expected {kind:?}, found {:?}", tok.kind)))
        }
    }

    fn peek_is_arg(&mut self) -> Result<bool> {
        let tok = self.tokenizer.peek().map_err(|e| err(e.loc, e.message))?;
        Ok(matches!(tok.kind, TokenKind::Ident(_) | TokenKind::Str(_)))
    }

    fn parse_arg(&mut self) -> Result<Arg> {
        let tok = self.tokenizer.next().map_err(|e| err(e.loc, e.message))?;
        match tok.kind {
            TokenKind::Ident(s) => Ok(Arg::Ident(s)),
            TokenKind::Str(s) => Ok(Arg::Str(s)),
            other => Err(err(tok.loc, format!("expected an argument, found {other:?}"))),
        }
    }

    /// Parses the whole file, dispatching each resource block into `filesystem`,
    /// `exec`, or `generic` depending on which domain's `matches` accepts the block's
    /// (group, resource) header, in that order.
    pub fn parse_into(
        &mut self,
        filesystem: &mut FilesystemDomain,
        exec: &mut ExecDomain,
        generic: &mut GenericRegistry,
    ) -> Result<()> {
        loop {
            let peeked = self.tokenizer.peek().map_err(|e| err(e.loc, e.message))?;
            if peeked.kind == TokenKind::Eof {
                break;
            }
            self.parse_resource(filesystem, exec, generic)?;
        }
        Ok(())
    }

    fn parse_resource(
        &mut self,
        filesystem: &mut FilesystemDomain,
        exec: &mut ExecDomain,
        generic: &mut GenericRegistry,
    ) -> Result<()> {
        let (group, group_loc) = self.expect_ident()?;
        let (resource, _) = self.expect_ident()?;
        self.expect(TokenKind::LBrace)?;

        if group == "filesystem" && resource == "node" {
            self.parse_filesystem_entries(filesystem)?;
        } else if group == "exec" && resource == "process" {
            self.parse_exec_entries(exec)?;
        } else if let Some(domain) = generic.find_matching(&group, &resource) {
            self.parse_generic_entries(domain)?;
        } else {
            return Err(err(
                group_loc,
                format!("no permission domain claims resource \"{group} {resource}\""),
            ));
        }

        self.expect(TokenKind::RBrace)?;
        Ok(())
    }

    fn parse_fields<E>(
        &mut self,
        mut load_field: impl FnMut(&str, &[Arg]) -> std::result::Result<(), E>,
        field_err: impl Fn(Location, E) -> ParseError,
    ) -> Result<()> {
        loop {
            let peeked = self.tokenizer.peek().map_err(|e| err(e.loc, e.message))?;
            if peeked.kind == TokenKind::RBrace {
                break;
            }
            let (field_name, field_loc) = self.expect_ident()?;
            let mut args = Vec::new();
            while self.peek_is_arg()? {
                args.push(self.parse_arg()?);
            }
            if args.is_empty() {
                return Err(err(field_loc, format!("field {field_name:?} has no arguments")));
            }
            load_field(&field_name, &args).map_err(|e| field_err(field_loc, e))?;
        }
        Ok(())
    }

    fn parse_filesystem_entries(&mut self, domain: &mut FilesystemDomain) -> Result<()> {
        loop {
            let peeked = self.tokenizer.peek().map_err(|e| err(e.loc, e.message))?;
            if peeked.kind == TokenKind::RBrace {
                break;
            }
            let (key, _) = self.expect_str()?;
            self.expect(TokenKind::LBrace)?;

            let mut entry = crate::filesystem::Entry {
                key: key.clone(),
                ..Default::default()
            };
            self.parse_fields::<String>(
                |field_name, args| load_filesystem_field(&mut entry, field_name, args),
                |loc, message| err(loc, message),
            )?;
            domain.insert(entry);

            self.expect(TokenKind::RBrace)?;
        }
        Ok(())
    }

    fn parse_exec_entries(&mut self, domain: &mut ExecDomain) -> Result<()> {
        loop {
            let peeked = self.tokenizer.peek().map_err(|e| err(e.loc, e.message))?;
            if peeked.kind == TokenKind::RBrace {
                break;
            }
            let (key, key_loc) = self.expect_str()?;
            self.expect(TokenKind::LBrace)?;

            let mut verdict: Option<crate::exec::Verdict> = None;
            self.parse_fields::<String>(
                |field_name, args| load_exec_field(&mut verdict, field_name, args),
                |loc, message| err(loc, message),
            )?;

            let digest = crate::exec::Digest32::from_hex(&key)
                .ok_or_else(|| err(key_loc, format!("{key:?} is not a 64-character hex hash")))?;
            let verdict = verdict.ok_or_else(|| err(key_loc, "exec entry is missing a mode field"))?;
            domain.set_verdict(digest, verdict);

            self.expect(TokenKind::RBrace)?;
        }
        Ok(())
    }

    fn parse_generic_entries(&mut self, domain: &mut (dyn crate::generic::GenericDomain + 'static)) -> Result<()> {
        loop {
            let peeked = self.tokenizer.peek().map_err(|e| err(e.loc, e.message))?;
            if peeked.kind == TokenKind::RBrace {
                break;
            }
            let (key, _) = self.expect_str()?;
            self.expect(TokenKind::LBrace)?;
            domain.new_entry(&key);
            self.parse_fields(
                |field_name, args| {
                    let raw: Vec<String> = args.iter().map(|a| a.as_str().to_string()).collect();
                    domain.load_field(field_name, &raw)
                },
                |loc, message| err(loc, message),
            )?;
            self.expect(TokenKind::RBrace)?;
        }
        Ok(())
    }
}

fn load_filesystem_field(
    entry: &mut crate::filesystem::Entry,
    field_name: &str,
    args: &[Arg],
) -> std::result::Result<(), String> {
    let modeset = match field_name {
        "self" => &mut entry.self_modeset,
        "children" => &mut entry.children_modeset,
        other => return Err(format!("unknown filesystem field {other:?}")),
    };
    let (verb, mode_args) = args
        .split_first()
        .ok_or_else(|| format!("field {field_name:?} names no action"))?;
    let verb = match verb {
        Arg::Ident(s) => s.as_str(),
        Arg::Str(s) => return Err(format!("expected an action identifier, found the string {s:?}")),
    };
    let bucket = match verb {
        "reject" => &mut modeset.reject,
        "accept" => &mut modeset.accept,
        "prompt" => &mut modeset.prompt,
        other => return Err(format!("unknown verb {other:?}, expected reject/accept/prompt")),
    };
    if mode_args.is_empty() {
        return Err(format!("{field_name} {verb} names no modes"));
    }
    for arg in mode_args {
        let mode_name = match arg {
            Arg::Str(s) => s.as_str(),
            Arg::Ident(s) => return Err(format!("expected a quoted mode name, found the identifier {s:?}")),
        };
        let bit = crate::filesystem::flags::from_name(mode_name)
            .ok_or_else(|| format!("unknown filesystem mode {mode_name:?}"))?;
        *bucket |= bit;
    }
    Ok(())
}

fn load_exec_field(
    verdict: &mut Option<crate::exec::Verdict>,
    field_name: &str,
    args: &[Arg],
) -> std::result::Result<(), String> {
    match field_name {
        "mode" => {
            let value = args
                .first()
                .ok_or_else(|| "mode field requires one argument".to_string())?
                .as_str();
            *verdict = Some(match value {
                "accept" => crate::exec::Verdict::Accept,
                "reject" => crate::exec::Verdict::Reject,
                other => return Err(format!("unknown exec mode {other:?}")),
            });
            Ok(())
        }
        other => Err(format!("unknown exec field {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_filesystem_block() {
        let text = br#"
            filesystem node {
                "/tmp" {
                    self accept "read" "createdir"
                    self reject "write"
                    children reject "write"
                    children accept "read"
                }
            }
        "#;
        let mut fs = FilesystemDomain::new();
        let mut exec = ExecDomain::new();
        let mut generic = GenericRegistry::new();
        Parser::new(text)
            .parse_into(&mut fs, &mut exec, &mut generic)
            .unwrap();

        let entries: Vec<_> = fs.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "/tmp");
        assert_eq!(
            entries[0].self_modeset.accept,
            crate::filesystem::flags::READ | crate::filesystem::flags::CREATEDIR
        );
        assert_eq!(entries[0].self_modeset.reject, crate::filesystem::flags::WRITE);
        assert_eq!(entries[0].children_modeset.reject, crate::filesystem::flags::WRITE);
        assert_eq!(entries[0].children_modeset.accept, crate::filesystem::flags::READ);
    }

    #[test]
    fn reports_row_and_column_on_syntax_error() {
        let text = b"filesystem node {\n  bogus\n}";
        let mut fs = FilesystemDomain::new();
        let mut exec = ExecDomain::new();
        let mut generic = GenericRegistry::new();
        let err = Parser::new(text)
            .parse_into(&mut fs, &mut exec, &mut generic)
            .unwrap_err();
        assert_eq!(err.loc.row, 2);
    }

    #[test]
    fn unknown_resource_is_a_distinct_error() {
        let text = b"nosuchgroup nosuchresource {\n}";
        let mut fs = FilesystemDomain::new();
        let mut exec = ExecDomain::new();
        let mut generic = GenericRegistry::new();
        let err = Parser::new(text)
            .parse_into(&mut fs, &mut exec, &mut generic)
            .unwrap_err();
        assert!(err.message.contains("no permission domain"));
    }

    #[test]
    fn comments_are_skipped_anywhere_whitespace_is_allowed() {
        let text = b"# a leading comment\nfilesystem node { # trailing\n}";
        let mut fs = FilesystemDomain::new();
        let mut exec = ExecDomain::new();
        let mut generic = GenericRegistry::new();
        Parser::new(text)
            .parse_into(&mut fs, &mut exec, &mut generic)
            .unwrap();
    }
}

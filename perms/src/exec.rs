// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The exec permission domain: hashes an executable's content together with its
//! argv to form a single combined key, and gates execution against a table of
//! previously accepted/rejected keys.

use std::collections::HashMap;
use std::io::Read;

use sha2::{Digest, Sha256};

use crate::prompter::{Decision, PermissionRequest, Prompter};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read executable content: {0}")]
    ReadExecutable(std::io::Error),
    #[error("rejected by policy")]
    RejectedByPolicy,
    #[error("rejected by user")]
    RejectedByUser,
    #[error("emergency kill requested by the prompter")]
    EmergencyKill,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A 32-byte SHA-256 digest, printable as lowercase hex for GHPERM serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(s: &str) -> Option<Digest32> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in out.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Digest32(out))
    }
}

/// Hashes `executable_content`, then each argv entry in order, then hashes the
/// concatenation of those digests into one combined key. Matches the "combined hash"
/// construction: content identity plus the exact invocation shape both matter.
pub fn combined_key<R: Read>(mut executable_content: R, argv: &[String]) -> Result<Digest32> {
    let mut content_hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = executable_content
            .read(&mut buf)
            .map_err(Error::ReadExecutable)?;
        if n == 0 {
            break;
        }
        content_hasher.update(&buf[..n]);
    }
    let content_digest = content_hasher.finalize();

    let mut combined = Sha256::new();
    combined.update(content_digest);
    for arg in argv {
        let mut arg_hasher = Sha256::new();
        arg_hasher.update(arg.as_bytes());
        combined.update(arg_hasher.finalize());
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&combined.finalize());
    Ok(Digest32(out))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

#[derive(Default)]
struct HashTable {
    entries: HashMap<Digest32, Verdict>,
}

impl HashTable {
    /// Looks up `key`. Per the resolved "not found" contract, this returns `None` rather
    /// than leaving an out-parameter untouched: callers must match explicitly instead of
    /// relying on an implicit default.
    fn get(&self, key: &Digest32) -> Option<Verdict> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: Digest32, verdict: Verdict) {
        self.entries.insert(key, verdict);
    }
}

/// Env-var allow-list: an execution may only inherit names present in this set, an
/// explicit default-deny posture for environment propagation into a subjail.
#[derive(Default, Clone)]
pub struct EnvAllowList {
    allowed: std::collections::HashSet<String>,
}

impl EnvAllowList {
    pub fn new() -> EnvAllowList {
        EnvAllowList::default()
    }

    pub fn allow(&mut self, name: impl Into<String>) {
        self.allowed.insert(name.into());
    }

    pub fn filter<'a, I: IntoIterator<Item = (&'a String, &'a String)>>(
        &self,
        env: I,
    ) -> Vec<(String, String)> {
        env.into_iter()
            .filter(|(k, _)| self.allowed.contains(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[derive(Default)]
pub struct ExecDomain {
    table: HashTable,
    env_allow_list: EnvAllowList,
}

impl ExecDomain {
    pub fn new() -> ExecDomain {
        ExecDomain::default()
    }

    pub fn env_allow_list_mut(&mut self) -> &mut EnvAllowList {
        &mut self.env_allow_list
    }

    pub fn env_allow_list(&self) -> &EnvAllowList {
        &self.env_allow_list
    }

    /// Inserts a verdict directly under a pre-computed hash key, bypassing the
    /// prompter. Used by the GHPERM loader, where the key is already written out as a
    /// hex string rather than recomputed from a live executable and argv.
    pub fn set_verdict(&mut self, key: Digest32, verdict: Verdict) {
        self.table.set(key, verdict);
    }

    /// Iterates every stored (hash, verdict) pair, for GHPERM serialization.
    pub fn entries(&self) -> impl Iterator<Item = (&Digest32, &Verdict)> {
        self.table.entries.iter()
    }

    /// Gates execution of an executable whose content is `executable_content`, invoked
    /// with `argv`, attributed to `source` in any prompt raised.
    pub fn gateexec<R: Read>(
        &mut self,
        source: &str,
        executable_content: R,
        argv: &[String],
        prompter: &dyn Prompter,
    ) -> Result<()> {
        let key = combined_key(executable_content, argv)?;
        match self.table.get(&key) {
            Some(Verdict::Accept) => Ok(()),
            Some(Verdict::Reject) => Err(Error::RejectedByPolicy),
            None => self.resolve_prompt(source, key, argv, prompter),
        }
    }

    fn resolve_prompt(
        &mut self,
        source: &str,
        key: Digest32,
        argv: &[String],
        prompter: &dyn Prompter,
    ) -> Result<()> {
        let request = PermissionRequest {
            source: source.to_string(),
            group: "exec".to_string(),
            resource: "process".to_string(),
            fields: vec![
                ("hash".to_string(), key.to_hex()),
                ("argv".to_string(), argv.join(" ")),
            ],
        };
        match prompter.prompt(&request) {
            Decision::AcceptOnce => Ok(()),
            Decision::RejectOnce => Err(Error::RejectedByUser),
            Decision::AcceptAndRemember => {
                self.table.set(key, Verdict::Accept);
                Ok(())
            }
            Decision::RejectAndRemember => {
                self.table.set(key, Verdict::Reject);
                Err(Error::RejectedByUser)
            }
            Decision::EmergencyKill => Err(Error::EmergencyKill),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn combined_key_is_stable_for_same_content_and_argv() {
        let a = combined_key(Cursor::new(b"#!/bin/sh\necho hi\n"), &["hi".to_string()]).unwrap();
        let b = combined_key(Cursor::new(b"#!/bin/sh\necho hi\n"), &["hi".to_string()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn combined_key_differs_by_argv() {
        let a = combined_key(Cursor::new(b"#!/bin/sh\n"), &["one".to_string()]).unwrap();
        let b = combined_key(Cursor::new(b"#!/bin/sh\n"), &["two".to_string()]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_key_prompts_then_remembers() {
        let mut domain = ExecDomain::new();
        let prompter = crate::prompter::FixedPrompter(Decision::AcceptAndRemember);
        domain
            .gateexec("t", Cursor::new(b"x"), &["a".to_string()], &prompter)
            .unwrap();

        let rejecting = crate::prompter::FixedPrompter(Decision::RejectOnce);
        // Same content+argv now resolves from the table without consulting the prompter.
        domain
            .gateexec("t", Cursor::new(b"x"), &["a".to_string()], &rejecting)
            .unwrap();
    }

    #[test]
    fn env_allow_list_filters_to_named_vars() {
        let mut list = EnvAllowList::new();
        list.allow("PATH");
        let home = "HOME".to_string();
        let home_val = "/root".to_string();
        let path = "PATH".to_string();
        let path_val = "/bin".to_string();
        let env = vec![(&home, &home_val), (&path, &path_val)];
        let filtered = list.filter(env);
        assert_eq!(filtered, vec![("PATH".to_string(), "/bin".to_string())]);
    }
}

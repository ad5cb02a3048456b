// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The filesystem permission domain: path-keyed entries, each carrying a `self`
//! modeset (applies to the exact path) and a `children` modeset (applies to any path
//! the entry is a strict directory prefix of).

use std::collections::BTreeMap;

use crate::prompter::{Decision, PermissionRequest, Prompter};

/// Bit flags over the filesystem permission vocabulary.
pub mod flags {
    pub const READ: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const CREATEFILE: u32 = 1 << 2;
    pub const CREATEDIR: u32 = 1 << 3;
    pub const UNLINK: u32 = 1 << 4;
    pub const USER_READ: u32 = 1 << 5;
    pub const USER_WRITE: u32 = 1 << 6;
    pub const USER_EXEC: u32 = 1 << 7;
    pub const GROUP_READ: u32 = 1 << 8;
    pub const GROUP_WRITE: u32 = 1 << 9;
    pub const GROUP_EXEC: u32 = 1 << 10;
    pub const OTHER_READ: u32 = 1 << 11;
    pub const OTHER_WRITE: u32 = 1 << 12;
    pub const OTHER_EXEC: u32 = 1 << 13;

    pub fn name(bit: u32) -> &'static str {
        match bit {
            READ => "read",
            WRITE => "write",
            CREATEFILE => "createfile",
            CREATEDIR => "createdir",
            UNLINK => "unlink",
            USER_READ => "user_read",
            USER_WRITE => "user_write",
            USER_EXEC => "user_exec",
            GROUP_READ => "group_read",
            GROUP_WRITE => "group_write",
            GROUP_EXEC => "group_exec",
            OTHER_READ => "other_read",
            OTHER_WRITE => "other_write",
            OTHER_EXEC => "other_exec",
            _ => "unknown",
        }
    }

    pub fn from_name(s: &str) -> Option<u32> {
        Some(match s {
            "read" => READ,
            "write" => WRITE,
            "createfile" => CREATEFILE,
            "createdir" => CREATEDIR,
            "unlink" => UNLINK,
            "user_read" => USER_READ,
            "user_write" => USER_WRITE,
            "user_exec" => USER_EXEC,
            "group_read" => GROUP_READ,
            "group_write" => GROUP_WRITE,
            "group_exec" => GROUP_EXEC,
            "other_read" => OTHER_READ,
            "other_write" => OTHER_WRITE,
            "other_exec" => OTHER_EXEC,
            _ => return None,
        })
    }
}

/// The triple (reject, accept, prompt) of bitfields attached to either a filesystem
/// entry's `self` or `children`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeSet {
    pub reject: u32,
    pub accept: u32,
    pub prompt: u32,
}

impl ModeSet {
    pub fn merge(&mut self, other: &ModeSet) {
        self.reject |= other.reject;
        self.accept |= other.accept;
        self.prompt |= other.prompt;
    }
}

/// The result of evaluating a modeset against a requested flag set, per the mode-action
/// algorithm: reject wins outright; otherwise fully-accepted requests succeed; anything
/// left over — explicitly prompt-flagged or not mentioned at all — prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeAction {
    Accept,
    Reject(u32),
    Prompt(u32),
}

pub fn mode_action(modeset: &ModeSet, requested: u32) -> ModeAction {
    let rejected = modeset.reject & requested;
    if rejected != 0 {
        return ModeAction::Reject(rejected);
    }
    let accepted = modeset.accept & requested;
    if accepted == requested {
        return ModeAction::Accept;
    }
    ModeAction::Prompt(requested & !accepted)
}

#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub key: String,
    pub self_modeset: ModeSet,
    pub children_modeset: ModeSet,
}

fn is_strict_prefix(prefix: &str, path: &str) -> bool {
    if path == prefix || !path.starts_with(prefix) {
        return false;
    }
    if prefix == "/" {
        return path.len() > 1;
    }
    path.as_bytes()[prefix.len()] == b'/'
}

/// Merges every stored entry relevant to `path` into a `(self, children)` pair of
/// accumulator modesets. Per the resolved filesystem directory-prefix open question: a
/// strict-prefix entry's `children` modeset contributes to BOTH accumulators for
/// descendants, not just to `children`.
pub fn merged_modesets(entries: &[Entry], path: &str) -> (ModeSet, ModeSet) {
    let mut self_acc = ModeSet::default();
    let mut children_acc = ModeSet::default();
    for entry in entries {
        if entry.key == path {
            self_acc.merge(&entry.self_modeset);
            children_acc.merge(&entry.children_modeset);
        } else if is_strict_prefix(&entry.key, path) {
            self_acc.merge(&entry.children_modeset);
            children_acc.merge(&entry.children_modeset);
        }
    }
    (self_acc, children_acc)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rejected by policy: {0:#x}")]
    RejectedByPolicy(u32),
    #[error("rejected by user")]
    RejectedByUser,
    #[error("policy requires a prompt but none was resolved")]
    RejectedByPrompt,
    #[error("emergency kill requested by the prompter")]
    EmergencyKill,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Path-keyed filesystem permission entries, the domain gating file I/O requests.
#[derive(Default)]
pub struct FilesystemDomain {
    entries: BTreeMap<String, Entry>,
}

impl FilesystemDomain {
    pub fn new() -> FilesystemDomain {
        FilesystemDomain::default()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    fn entry_mut(&mut self, key: &str) -> &mut Entry {
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            key: key.to_string(),
            ..Default::default()
        })
    }

    pub fn insert(&mut self, entry: Entry) {
        self.entry_mut(&entry.key).self_modeset.merge(&entry.self_modeset);
        self.entry_mut(&entry.key)
            .children_modeset
            .merge(&entry.children_modeset);
    }

    /// Evaluates `requested` against the canonical `path`, consulting `prompter` for
    /// anything not already settled by reject/accept, and remembering the prompt
    /// response (if "and remember") back into the domain's entries.
    pub fn gatefile(
        &mut self,
        source: &str,
        path: &str,
        requested: u32,
        prompter: &dyn Prompter,
    ) -> Result<()> {
        let all: Vec<Entry> = self.entries.values().cloned().collect();
        let (self_acc, _children_acc) = merged_modesets(&all, path);

        match mode_action(&self_acc, requested) {
            ModeAction::Reject(bits) => Err(Error::RejectedByPolicy(bits)),
            ModeAction::Accept => Ok(()),
            ModeAction::Prompt(bits) => self.resolve_prompt(source, path, bits, prompter),
        }
    }

    /// Script-initiated explicit request; evaluates `self_mode` and `children_mode`
    /// independently. If `dry_run` is set, reports whether prompting would be required
    /// without actually prompting (no entries are mutated and no prompt is shown).
    pub fn requestnode(
        &mut self,
        source: &str,
        path: &str,
        self_mode: u32,
        children_mode: u32,
        prompter: &dyn Prompter,
        dry_run: bool,
    ) -> Result<bool> {
        let all: Vec<Entry> = self.entries.values().cloned().collect();
        let (self_acc, children_acc) = merged_modesets(&all, path);

        let mut would_prompt = false;
        for (mode, acc) in [(self_mode, self_acc), (children_mode, children_acc)] {
            if mode == 0 {
                continue;
            }
            match mode_action(&acc, mode) {
                ModeAction::Reject(bits) => return Err(Error::RejectedByPolicy(bits)),
                ModeAction::Accept => {}
                ModeAction::Prompt(bits) => {
                    would_prompt = true;
                    if !dry_run {
                        self.resolve_prompt(source, path, bits, prompter)?;
                    }
                }
            }
        }
        Ok(would_prompt)
    }

    fn resolve_prompt(
        &mut self,
        source: &str,
        path: &str,
        bits: u32,
        prompter: &dyn Prompter,
    ) -> Result<()> {
        let mut fields = Vec::new();
        fields.push(("path".to_string(), path.to_string()));
        let names: Vec<&str> = (0..32)
            .map(|i| 1u32 << i)
            .filter(|&bit| bit & bits != 0)
            .map(flags::name)
            .collect();
        fields.push(("modes".to_string(), names.join(",")));

        let request = PermissionRequest {
            source: source.to_string(),
            group: "filesystem".to_string(),
            resource: "node".to_string(),
            fields,
        };

        match prompter.prompt(&request) {
            Decision::AcceptOnce => Ok(()),
            Decision::RejectOnce => Err(Error::RejectedByUser),
            Decision::AcceptAndRemember => {
                self.entry_mut(path).self_modeset.accept |= bits;
                Ok(())
            }
            Decision::RejectAndRemember => {
                self.entry_mut(path).self_modeset.reject |= bits;
                Err(Error::RejectedByUser)
            }
            Decision::EmergencyKill => Err(Error::EmergencyKill),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompter::Decision;

    struct FixedPrompter(Decision);
    impl Prompter for FixedPrompter {
        fn prompt(&self, _req: &PermissionRequest) -> Decision {
            self.0
        }
    }

    fn tmp_policy() -> FilesystemDomain {
        let mut fs = FilesystemDomain::new();
        fs.insert(Entry {
            key: "/tmp".into(),
            self_modeset: ModeSet {
                reject: flags::WRITE,
                accept: flags::READ | flags::CREATEDIR,
                prompt: 0,
            },
            children_modeset: ModeSet {
                reject: flags::WRITE,
                accept: flags::READ,
                prompt: 0,
            },
        });
        fs
    }

    #[test]
    fn exact_path_read_accepted() {
        let mut fs = tmp_policy();
        let prompter = FixedPrompter(Decision::RejectOnce);
        assert!(fs.gatefile("t", "/tmp", flags::READ, &prompter).is_ok());
    }

    #[test]
    fn exact_path_write_rejected() {
        let mut fs = tmp_policy();
        let prompter = FixedPrompter(Decision::AcceptOnce);
        let err = fs.gatefile("t", "/tmp", flags::WRITE, &prompter).unwrap_err();
        assert!(matches!(err, Error::RejectedByPolicy(_)));
    }

    #[test]
    fn exact_path_createfile_prompts() {
        let mut fs = tmp_policy();
        let prompter = FixedPrompter(Decision::AcceptOnce);
        assert!(fs
            .gatefile("t", "/tmp", flags::CREATEFILE, &prompter)
            .is_ok());
    }

    #[test]
    fn descendant_write_rejected_read_accepted() {
        let mut fs = tmp_policy();
        let prompter = FixedPrompter(Decision::AcceptOnce);
        assert!(matches!(
            fs.gatefile("t", "/tmp/x", flags::WRITE, &prompter),
            Err(Error::RejectedByPolicy(_))
        ));
        assert!(fs.gatefile("t", "/tmp/x", flags::READ, &prompter).is_ok());
    }

    #[test]
    fn reject_cannot_be_overridden_by_any_prompt_response() {
        let mut fs = tmp_policy();
        for decision in [
            Decision::AcceptOnce,
            Decision::AcceptAndRemember,
            Decision::RejectOnce,
            Decision::RejectAndRemember,
        ] {
            let prompter = FixedPrompter(decision);
            assert!(matches!(
                fs.gatefile("t", "/tmp", flags::WRITE, &prompter),
                Err(Error::RejectedByPolicy(_))
            ));
        }
    }
}

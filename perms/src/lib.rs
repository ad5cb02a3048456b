// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The permission engine: a filesystem domain, an exec domain, up to 16 user-defined
//! generic domains, a prompter, and the GHPERM textual serialization that reads and
//! writes the whole policy.

pub mod exec;
pub mod filesystem;
pub mod generic;
pub mod ghperm;
pub mod pathfd;
pub mod prompter;

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use exec::ExecDomain;
use filesystem::FilesystemDomain;
use generic::{GenericDomain, GenericRegistry};
use pathfd::PathFd;
use prompter::Prompter;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Filesystem(#[from] filesystem::Error),
    #[error(transparent)]
    Exec(#[from] exec::Error),
    #[error(transparent)]
    Generic(#[from] generic::Error),
    #[error(transparent)]
    PathFd(#[from] pathfd::Error),
    #[error("failed to parse GHPERM policy: {0}")]
    Parse(#[from] ghperm::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The full permission policy for one sandbox: filesystem rules, exec rules, any
/// registered generic domains, and the prompter consulted whenever none of them can
/// settle a request on their own.
pub struct Perms {
    filesystem: FilesystemDomain,
    exec: ExecDomain,
    generic: GenericRegistry,
    prompter: Box<dyn Prompter>,
}

impl Perms {
    pub fn new(prompter: Box<dyn Prompter>) -> Perms {
        Perms {
            filesystem: FilesystemDomain::new(),
            exec: ExecDomain::new(),
            generic: GenericRegistry::new(),
            prompter,
        }
    }

    pub fn filesystem(&self) -> &FilesystemDomain {
        &self.filesystem
    }

    pub fn exec(&self) -> &ExecDomain {
        &self.exec
    }

    pub fn exec_mut(&mut self) -> &mut ExecDomain {
        &mut self.exec
    }

    /// Gates a single-path file operation: resolves `fd`'s canonical path and
    /// evaluates `requested` against the merged filesystem modeset for that path.
    pub fn gatefile(&mut self, source: &str, fd: &PathFd, requested: u32) -> Result<()> {
        let path = fd.canonical_path()?;
        self.filesystem
            .gatefile(source, &path, requested, self.prompter.as_ref())
            .map_err(Error::from)
    }

    /// Script-initiated explicit filesystem permission request, with an optional
    /// dry-run that reports whether prompting would occur without prompting.
    pub fn fsrequest(
        &mut self,
        source: &str,
        fd: &PathFd,
        self_mode: u32,
        children_mode: u32,
        dry_run: bool,
    ) -> Result<bool> {
        let path = fd.canonical_path()?;
        self.filesystem
            .requestnode(source, &path, self_mode, children_mode, self.prompter.as_ref(), dry_run)
            .map_err(Error::from)
    }

    /// Gates execution of the file named by `exe_fd`, invoked with `argv`. `envp` is
    /// filtered through the exec domain's allow-list before the caller spawns.
    pub fn gateexec(&mut self, source: &str, exe_fd: &PathFd, argv: &[String]) -> Result<()> {
        let real_fd = exe_fd.reopen(libc::O_RDONLY, 0)?;
        // Safe: real_fd was just opened by reopen() and is uniquely owned here; File
        // takes ownership and will close it.
        let file = unsafe { File::from_raw_fd(real_fd) };
        self.exec
            .gateexec(source, file, argv, self.prompter.as_ref())
            .map_err(Error::from)
    }

    /// Filters `env` down to the names present in the exec domain's allow-list.
    pub fn filtered_env<'a, I: IntoIterator<Item = (&'a String, &'a String)>>(
        &self,
        env: I,
    ) -> Vec<(String, String)> {
        self.exec.env_allow_list().filter(env)
    }

    pub fn registergeneric(&mut self, id: impl Into<String>, domain: Box<dyn GenericDomain>) -> Result<()> {
        self.generic.register(id, domain).map_err(Error::from)
    }

    pub fn getgeneric(&self, id: &str) -> Option<&dyn GenericDomain> {
        self.generic.get(id)
    }

    pub fn getgeneric_mut(&mut self, id: &str) -> Option<&mut (dyn GenericDomain + 'static)> {
        self.generic.get_mut(id)
    }

    /// Reads and parses a GHPERM policy from an open fd, merging it into this
    /// instance's domains.
    pub fn readfd(&mut self, fd: RawFd) -> Result<()> {
        // Safe: fd is caller-owned for the duration of this call; File is forgotten
        // afterward so this does not take ownership or close it.
        let mut file = std::mem::ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        self.readbuffer(&buf)
    }

    pub fn readbuffer(&mut self, buffer: &[u8]) -> Result<()> {
        ghperm::Parser::new(buffer)
            .parse_into(&mut self.filesystem, &mut self.exec, &mut self.generic)
            .map_err(Error::from)
    }

    pub fn read_file(&mut self, path: &Path) -> Result<()> {
        let buf = std::fs::read(path)?;
        self.readbuffer(&buf)
    }

    /// Writes the whole policy out in GHPERM text: filesystem block, exec block, then
    /// each generic domain's block in registration order.
    pub fn write(&self, out: &mut dyn io::Write) -> Result<()> {
        ghperm::write_policy(out, &self.filesystem, &self.exec, &self.generic).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prompter::{Decision, FixedPrompter};
    use tempfile::NamedTempFile;

    #[test]
    fn gatefile_consults_policy_loaded_from_ghperm_text() {
        let policy = br#"
            filesystem node {
                "/tmp" {
                    self accept "read"
                    children accept "read"
                }
            }
        "#;
        let mut perms = Perms::new(Box::new(FixedPrompter(Decision::RejectOnce)));
        perms.readbuffer(policy).unwrap();

        let tmpfile = NamedTempFile::new_in("/tmp").unwrap();
        let fd = PathFd::open_existing(tmpfile.path()).unwrap();
        assert!(perms.gatefile("test", &fd, filesystem::flags::READ).is_ok());
    }

    #[test]
    fn write_then_readbuffer_is_a_semantic_round_trip() {
        let mut perms = Perms::new(Box::new(FixedPrompter(Decision::RejectOnce)));
        perms.readbuffer(
            br#"
                filesystem node {
                    "/srv" {
                        self accept "read" "write"
                    }
                }
            "#,
        )
        .unwrap();

        let mut buf = Vec::new();
        perms.write(&mut buf).unwrap();

        let mut perms2 = Perms::new(Box::new(FixedPrompter(Decision::RejectOnce)));
        perms2.readbuffer(&buf).unwrap();

        let entries: Vec<_> = perms2.filesystem().entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "/srv");
        assert_eq!(
            entries[0].self_modeset.accept,
            filesystem::flags::READ | filesystem::flags::WRITE
        );
    }
}

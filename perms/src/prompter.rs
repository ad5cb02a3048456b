// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The prompter abstraction: whenever a policy domain cannot settle a request from its
//! own reject/accept bits, it hands a description of the pending request to a
//! [`Prompter`] and waits for a [`Decision`].

use std::io::{self, BufRead, Write as _};

/// A single field of a pending permission request, rendered for a human or logged
/// verbatim by a non-interactive prompter.
pub struct PermissionRequest {
    pub source: String,
    pub group: String,
    pub resource: String,
    pub fields: Vec<(String, String)>,
}

/// The five responses a prompter may give to a pending request. "Remember" responses
/// are persisted back into the owning domain's entries; "once" responses are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AcceptOnce,
    RejectOnce,
    AcceptAndRemember,
    RejectAndRemember,
    EmergencyKill,
}

pub trait Prompter: Send + Sync {
    fn prompt(&self, request: &PermissionRequest) -> Decision;
}

/// Always answers the same way; used by hosts that never want to block on a human and
/// by tests.
pub struct FixedPrompter(pub Decision);

impl Prompter for FixedPrompter {
    fn prompt(&self, _request: &PermissionRequest) -> Decision {
        self.0
    }
}

/// Reads a one-line decision from stdin after printing the request to stderr. Accepts
/// `y` (accept once), `n` (reject once), `Y` (accept and remember), `N` (reject and
/// remember), `k` (emergency kill); anything else, or EOF, is treated as reject once.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn prompt(&self, request: &PermissionRequest) -> Decision {
        let mut stderr = io::stderr();
        let _ = writeln!(
            stderr,
            "permission request from {:?}: {}.{}",
            request.source, request.group, request.resource
        );
        for (key, value) in &request.fields {
            let _ = writeln!(stderr, "  {key} = {value}");
        }
        let _ = write!(stderr, "[y]es-once/[n]o-once/[Y]es-always/[N]o-always/[k]ill: ");
        let _ = stderr.flush();

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line).unwrap_or(0) == 0 {
            return Decision::RejectOnce;
        }
        match line.trim() {
            "y" => Decision::AcceptOnce,
            "Y" => Decision::AcceptAndRemember,
            "N" => Decision::RejectAndRemember,
            "k" => Decision::EmergencyKill,
            _ => Decision::RejectOnce,
        }
    }
}

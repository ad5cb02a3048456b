// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! User-defined permission domains, registered under an identifier and consulted by
//! the GHPERM parser/writer alongside the built-in filesystem and exec domains.
//!
//! Construction and destruction of a domain instance are ordinary Rust object
//! lifetime (a registered domain is just a boxed trait object, dropped with the
//! [`GenericRegistry`]), so [`GenericDomain`] only needs the four callbacks that have
//! no natural Rust equivalent: matching a (group, resource) pair, creating an entry by
//! key, loading one field into an entry during parsing, and writing every entry back
//! out during serialization.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no generic domain registered under identifier {0:?}")]
    UnknownIdentifier(String),
    #[error("domain {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("at most 16 generic domains may be registered, already have {0}")]
    TableFull(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const MAX_GENERIC_DOMAINS: usize = 16;

/// A user-defined permission domain. `group`/`resource` are the two leading
/// identifiers of a GHPERM `resource` block (see the GHPERM grammar); `matches`
/// decides whether this domain owns that block.
pub trait GenericDomain: Send + Sync {
    fn matches(&self, group: &str, resource: &str) -> bool;

    /// Starts a new entry keyed on `key` (the entry's leading GHPERM string), called
    /// once per entry before any of its fields are loaded.
    fn new_entry(&mut self, key: &str);

    /// Loads one field of the entry most recently started by `new_entry` into the
    /// domain's own state. `args` holds the field's argument tokens verbatim.
    fn load_field(&mut self, field_name: &str, args: &[String]) -> std::result::Result<(), String>;

    /// Writes every entry this domain owns as a sequence of complete GHPERM
    /// `resource` blocks (group, resource header included).
    fn write_all(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

/// Up to [`MAX_GENERIC_DOMAINS`] user-defined domains, each addressable by the
/// identifier it was registered under.
#[derive(Default)]
pub struct GenericRegistry {
    domains: Vec<(String, Box<dyn GenericDomain>)>,
}

impl GenericRegistry {
    pub fn new() -> GenericRegistry {
        GenericRegistry::default()
    }

    pub fn register(&mut self, identifier: impl Into<String>, domain: Box<dyn GenericDomain>) -> Result<()> {
        let identifier = identifier.into();
        if self.domains.len() >= MAX_GENERIC_DOMAINS {
            return Err(Error::TableFull(self.domains.len()));
        }
        if self.domains.iter().any(|(id, _)| *id == identifier) {
            return Err(Error::AlreadyRegistered(identifier));
        }
        self.domains.push((identifier, domain));
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<&dyn GenericDomain> {
        self.domains
            .iter()
            .find(|(id, _)| id == identifier)
            .map(|(_, d)| d.as_ref())
    }

    pub fn get_mut(&mut self, identifier: &str) -> Option<&mut (dyn GenericDomain + 'static)> {
        self.domains
            .iter_mut()
            .find(|(id, _)| id == identifier)
            .map(|(_, d)| d.as_mut())
    }

    /// Returns the first registered domain whose `matches` accepts (group, resource),
    /// in registration order, as the GHPERM parser requires.
    pub fn find_matching(&mut self, group: &str, resource: &str) -> Option<&mut (dyn GenericDomain + 'static)> {
        self.domains
            .iter_mut()
            .find(|(_, d)| d.matches(group, resource))
            .map(|(_, d)| d.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn GenericDomain)> {
        self.domains.iter().map(|(id, d)| (id.as_str(), d.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Echo {
        entries: BTreeMap<String, Vec<(String, Vec<String>)>>,
        current: Option<String>,
    }

    impl GenericDomain for Echo {
        fn matches(&self, group: &str, resource: &str) -> bool {
            group == "echo" && resource == "line"
        }
        fn new_entry(&mut self, key: &str) {
            self.entries.entry(key.to_string()).or_default();
            self.current = Some(key.to_string());
        }
        fn load_field(&mut self, field_name: &str, args: &[String]) -> std::result::Result<(), String> {
            let key = self.current.clone().ok_or("no current entry")?;
            self.entries
                .get_mut(&key)
                .unwrap()
                .push((field_name.to_string(), args.to_vec()));
            Ok(())
        }
        fn write_all(&self, out: &mut dyn io::Write) -> io::Result<()> {
            for (key, fields) in &self.entries {
                writeln!(out, "echo line \"{key}\" {{")?;
                for (name, args) in fields {
                    writeln!(out, "  {name} {}", args.join(" "))?;
                }
                writeln!(out, "}}")?;
            }
            Ok(())
        }
    }

    #[test]
    fn registry_rejects_duplicate_identifiers() {
        let mut reg = GenericRegistry::new();
        reg.register(
            "echo",
            Box::new(Echo {
                entries: BTreeMap::new(),
                current: None,
            }),
        )
        .unwrap();
        let err = reg
            .register(
                "echo",
                Box::new(Echo {
                    entries: BTreeMap::new(),
                    current: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[test]
    fn find_matching_locates_the_owning_domain() {
        let mut reg = GenericRegistry::new();
        reg.register(
            "echo",
            Box::new(Echo {
                entries: BTreeMap::new(),
                current: None,
            }),
        )
        .unwrap();
        assert!(reg.find_matching("echo", "line").is_some());
        assert!(reg.find_matching("filesystem", "node").is_none());
    }
}

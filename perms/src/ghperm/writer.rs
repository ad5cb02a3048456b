// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GHPERM emitter. Write order is fixed: the filesystem block first, then the exec
//! block, then each generic domain's block in registration order.

use std::io::{self, Write};

use crate::exec::ExecDomain;
use crate::filesystem::{flags, FilesystemDomain, ModeSet};
use crate::generic::GenericRegistry;

/// Tracks indent depth and whether the most recent thing written was a field (so
/// later field-args calls know whether to insert a leading space) versus a fresh line
/// (entry/resource header), mirroring the writer's small indent/layer state machine.
struct Writer<'w> {
    out: &'w mut dyn Write,
    indent: usize,
    mid_field: bool,
}

impl<'w> Writer<'w> {
    fn new(out: &'w mut dyn Write) -> Writer<'w> {
        Writer {
            out,
            indent: 0,
            mid_field: false,
        }
    }

    fn print_indent(&mut self) -> io::Result<()> {
        for _ in 0..self.indent {
            write!(self.out, "    ")?;
        }
        Ok(())
    }

    fn begin_resource(&mut self, group: &str, resource: &str) -> io::Result<()> {
        self.print_indent()?;
        writeln!(self.out, "{group} {resource} {{")?;
        self.indent += 1;
        self.mid_field = false;
        Ok(())
    }

    fn end_resource(&mut self) -> io::Result<()> {
        self.indent = self.indent.saturating_sub(1);
        self.print_indent()?;
        writeln!(self.out, "}}")
    }

    fn begin_entry(&mut self, key: &str) -> io::Result<()> {
        self.print_indent()?;
        write!(self.out, "\"")?;
        write_escaped(self.out, key)?;
        writeln!(self.out, "\" {{")?;
        self.indent += 1;
        self.mid_field = false;
        Ok(())
    }

    fn end_entry(&mut self) -> io::Result<()> {
        if self.mid_field {
            writeln!(self.out)?;
        }
        self.mid_field = false;
        self.indent = self.indent.saturating_sub(1);
        self.print_indent()?;
        writeln!(self.out, "}}")
    }

    fn field(&mut self, name: &str) -> io::Result<()> {
        if self.mid_field {
            writeln!(self.out)?;
        }
        self.print_indent()?;
        write!(self.out, "{name}")?;
        self.mid_field = true;
        Ok(())
    }

    fn arg_ident(&mut self, value: &str) -> io::Result<()> {
        write!(self.out, " {value}")
    }

    fn arg_str(&mut self, value: &str) -> io::Result<()> {
        write!(self.out, " \"")?;
        write_escaped(self.out, value)?;
        write!(self.out, "\"")
    }
}

fn write_escaped(out: &mut dyn Write, s: &str) -> io::Result<()> {
    for c in s.chars() {
        match c {
            '\\' => write!(out, "\\\\")?,
            '"' => write!(out, "\\\"")?,
            '\n' => write!(out, "\\n")?,
            '\t' => write!(out, "\\t")?,
            c => write!(out, "{c}")?,
        }
    }
    Ok(())
}

/// Writes one `self`/`children` line per non-empty verb bucket, e.g.
/// `self accept "read" "createdir"` followed by `self reject "write"`.
fn write_modeset(writer: &mut Writer, field_name: &str, modeset: &ModeSet) -> io::Result<()> {
    for (verb, set) in [
        ("reject", modeset.reject),
        ("accept", modeset.accept),
        ("prompt", modeset.prompt),
    ] {
        if set == 0 {
            continue;
        }
        writer.field(field_name)?;
        writer.arg_ident(verb)?;
        for shift in 0..32u32 {
            let bit = 1u32 << shift;
            if set & bit != 0 {
                writer.arg_str(flags::name(bit))?;
            }
        }
    }
    Ok(())
}

fn write_filesystem(writer: &mut Writer, domain: &FilesystemDomain) -> io::Result<()> {
    writer.begin_resource("filesystem", "node")?;
    for entry in domain.entries() {
        writer.begin_entry(&entry.key)?;
        write_modeset(writer, "self", &entry.self_modeset)?;
        write_modeset(writer, "children", &entry.children_modeset)?;
        writer.end_entry()?;
    }
    writer.end_resource()
}

fn write_exec(writer: &mut Writer, domain: &ExecDomain) -> io::Result<()> {
    writer.begin_resource("exec", "process")?;
    for (digest, verdict) in domain.entries() {
        writer.begin_entry(&digest.to_hex())?;
        writer.field("mode")?;
        writer.arg_ident(match verdict {
            crate::exec::Verdict::Accept => "accept",
            crate::exec::Verdict::Reject => "reject",
        })?;
        writer.end_entry()?;
    }
    writer.end_resource()
}

/// Writes the full policy: filesystem block, exec block, then every generic domain's
/// own `write_all` output verbatim (each generic domain is responsible for emitting
/// its own complete resource blocks).
pub fn write_policy(
    out: &mut dyn Write,
    filesystem: &FilesystemDomain,
    exec: &ExecDomain,
    generic: &GenericRegistry,
) -> io::Result<()> {
    let mut writer = Writer::new(out);
    write_filesystem(&mut writer, filesystem)?;
    write_exec(&mut writer, exec)?;
    for (_id, domain) in generic.iter() {
        domain.write_all(writer.out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::Entry;

    #[test]
    fn round_trips_through_the_parser() {
        let mut fs = FilesystemDomain::new();
        fs.insert(Entry {
            key: "/tmp".to_string(),
            self_modeset: ModeSet {
                reject: flags::WRITE,
                accept: flags::READ,
                prompt: 0,
            },
            children_modeset: ModeSet::default(),
        });
        let exec = ExecDomain::new();
        let generic = GenericRegistry::new();

        let mut buf = Vec::new();
        write_policy(&mut buf, &fs, &exec, &generic).unwrap();

        let mut fs2 = FilesystemDomain::new();
        let mut exec2 = ExecDomain::new();
        let mut generic2 = GenericRegistry::new();
        crate::ghperm::parser::Parser::new(&buf)
            .parse_into(&mut fs2, &mut exec2, &mut generic2)
            .unwrap();

        let entries: Vec<_> = fs2.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "/tmp");
        assert_eq!(entries[0].self_modeset.reject, flags::WRITE);
        assert_eq!(entries[0].self_modeset.accept, flags::READ);
    }

    #[test]
    fn escapes_quotes_and_backslashes_in_keys() {
        let mut fs = FilesystemDomain::new();
        fs.insert(Entry {
            key: "/tmp/\"quoted\"".to_string(),
            self_modeset: ModeSet {
                accept: flags::READ,
                ..Default::default()
            },
            children_modeset: ModeSet::default(),
        });
        let exec = ExecDomain::new();
        let generic = GenericRegistry::new();
        let mut buf = Vec::new();
        write_policy(&mut buf, &fs, &exec, &generic).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("\\\"quoted\\\""));
    }
}

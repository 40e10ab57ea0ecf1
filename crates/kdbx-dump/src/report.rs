//! Plain-text dump of every entry, grouped by folder

use kdbx_core::{Database, Entry, Group};
use std::io::{self, Write};

const SECTION_SEPARATOR: &str = "****************************************";
const ENTRY_SEPARATOR: &str = "----------------------------------------";

/// Writes the report for one database
pub struct Report<'a> {
    db: &'a Database,
    excluded: &'a [String],
}

impl<'a> Report<'a> {
    /// `excluded` lists group names skipped together with their subgroups
    pub fn new(db: &'a Database, excluded: &'a [String]) -> Self {
        Self { db, excluded }
    }

    /// Root entries first, then every root subgroup depth-first
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let root = self.db.root_group();
        self.write_group(out, "Root entries", root)?;
        for child in self.db.child_groups(root) {
            self.write_tree(out, &child.name, child)?;
        }
        Ok(())
    }

    fn write_tree<W: Write>(&self, out: &mut W, path: &str, group: &Group) -> io::Result<()> {
        if self.excluded.iter().any(|name| *name == group.name) {
            tracing::debug!("Skipping excluded group {}", path);
            return Ok(());
        }
        self.write_group(out, path, group)?;
        for child in self.db.child_groups(group) {
            self.write_tree(out, &format!("{}/{}", path, child.name), child)?;
        }
        Ok(())
    }

    fn write_group<W: Write>(&self, out: &mut W, heading: &str, group: &Group) -> io::Result<()> {
        let mut entries: Vec<&Entry> = self.db.entries_in(group).collect();
        if entries.is_empty() {
            return Ok(());
        }
        entries.sort_by(|a, b| a.title().cmp(b.title()));

        writeln!(out, "{}", SECTION_SEPARATOR)?;
        writeln!(out, "Group: {}", heading)?;
        let mut separator = SECTION_SEPARATOR;
        for entry in entries {
            writeln!(out, "{}", separator)?;
            write_entry(out, entry)?;
            separator = ENTRY_SEPARATOR;
        }
        Ok(())
    }
}

fn write_entry<W: Write>(out: &mut W, entry: &Entry) -> io::Result<()> {
    writeln!(out, "{}", entry.title())?;
    writeln!(out, "user: {}, pass: {}", entry.username(), entry.password())?;
    if !entry.url().trim().is_empty() {
        writeln!(out, "url: {}", entry.url())?;
    }
    for line in entry.notes().trim().lines() {
        writeln!(out, "{}", line.trim())?;
    }
    Ok(())
}

//! Streaming decoder for the KeePass XML document
//!
//! The document is read in a single forward pass. Protected values are
//! unmasked as they are met, since each one consumes the next bytes of the
//! inner keystream: an element skipped because it is unknown still has its
//! protected values run through the stream.

use crate::cipher::ProtectedStream;
use crate::database::Meta;
use crate::entry::{Entry, Times, Value};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::secret::SecureString;
use base64::Engine;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use uuid::Uuid;
use xml::attribute::OwnedAttribute;
use xml::reader::{EventReader, ParserConfig, XmlEvent};
use zeroize::Zeroizing;

/// Deepest group nesting accepted
pub const MAX_GROUP_DEPTH: usize = 256;

/// Deepest element nesting accepted anywhere in the document
const MAX_ELEMENT_DEPTH: usize = 1024;

/// Decoded tree, before it is wrapped into a [`Database`](crate::Database)
#[derive(Debug)]
pub(crate) struct Tree {
    pub meta: Meta,
    pub root: Uuid,
    pub groups: HashMap<Uuid, Group>,
    pub entries: HashMap<Uuid, Entry>,
}

/// Decode `xml`, unmasking protected values with `stream`.
///
/// Fails with [`Error::MalformedTree`] on XML syntax errors, missing required
/// elements, duplicate UUIDs or excessive nesting.
pub(crate) fn decode(xml: &[u8], stream: ProtectedStream) -> Result<Tree> {
    let reader = ParserConfig::new()
        .cdata_to_characters(true)
        .whitespace_to_characters(true)
        .ignore_comments(true)
        .create_reader(xml);

    let mut decoder = Decoder {
        reader,
        stream,
        depth: 0,
        protected_values: 0,
        meta: Meta::default(),
        groups: HashMap::new(),
        entries: HashMap::new(),
    };
    let root = decoder.document()?;

    let Decoder {
        meta,
        mut groups,
        entries,
        protected_values,
        ..
    } = decoder;

    if meta.recycle_bin_enabled {
        if let Some(bin) = meta.recycle_bin_uuid.and_then(|uuid| groups.get_mut(&uuid)) {
            bin.is_recycle_bin = true;
        }
    }

    tracing::debug!(
        "Decoded XML tree: {} groups, {} entries, {} protected values",
        groups.len(),
        entries.len(),
        protected_values
    );
    Ok(Tree {
        meta,
        root,
        groups,
        entries,
    })
}

struct Decoder<'a> {
    reader: EventReader<&'a [u8]>,
    stream: ProtectedStream,
    depth: usize,
    protected_values: usize,
    meta: Meta,
    groups: HashMap<Uuid, Group>,
    entries: HashMap<Uuid, Entry>,
}

fn malformed(message: impl Into<String>) -> Error {
    Error::MalformedTree(message.into())
}

fn attribute<'a>(attributes: &'a [OwnedAttribute], name: &str) -> Option<&'a str> {
    attributes
        .iter()
        .find(|a| a.name.local_name == name)
        .map(|a| a.value.as_str())
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn flag(attributes: &[OwnedAttribute], name: &str) -> bool {
    attribute(attributes, name).map(is_true).unwrap_or(false)
}

/// Child element of the element currently being decoded
enum Child {
    Start {
        name: String,
        attributes: Vec<OwnedAttribute>,
    },
    End,
}

impl<'a> Decoder<'a> {
    fn next_event(&mut self) -> Result<XmlEvent> {
        match self.reader.next()? {
            XmlEvent::EndDocument => Err(malformed("Unexpected end of document")),
            event => Ok(event),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_ELEMENT_DEPTH {
            return Err(malformed("Document nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Advance to the next child element of the current element, or its end.
    /// Text between children is ignored.
    fn next_child(&mut self) -> Result<Child> {
        loop {
            match self.next_event()? {
                XmlEvent::StartElement {
                    name, attributes, ..
                } => {
                    self.enter()?;
                    return Ok(Child::Start {
                        name: name.local_name,
                        attributes,
                    });
                }
                XmlEvent::EndElement { .. } => {
                    self.leave();
                    return Ok(Child::End);
                }
                _ => {}
            }
        }
    }

    /// Consume the current element and return its content, unmasked if it is
    /// marked `Protected="True"`. Nested elements are skipped, with their own
    /// protected values consumed in order.
    fn read_content(&mut self, attributes: &[OwnedAttribute]) -> Result<Zeroizing<Vec<u8>>> {
        let mut text = Zeroizing::new(String::new());
        loop {
            match self.next_event()? {
                XmlEvent::Characters(chunk) => text.push_str(&chunk),
                XmlEvent::StartElement { attributes, .. } => {
                    self.enter()?;
                    self.read_content(&attributes)?;
                }
                XmlEvent::EndElement { .. } => {
                    self.leave();
                    break;
                }
                _ => {}
            }
        }

        if !flag(attributes, "Protected") {
            return Ok(Zeroizing::new(text.as_bytes().to_vec()));
        }
        self.protected_values += 1;
        self.stream.decrypt(&text)
    }

    /// Like [`Self::read_content`], for elements holding text
    fn read_text(&mut self, attributes: &[OwnedAttribute]) -> Result<Zeroizing<String>> {
        let content = self.read_content(attributes)?;
        let text = std::str::from_utf8(&content)
            .map_err(|_| malformed("Protected value is not valid UTF-8"))?;
        Ok(Zeroizing::new(text.to_string()))
    }

    /// Binary protected values (3.x attachments) are consumed but never decoded
    fn skip(&mut self, attributes: &[OwnedAttribute]) -> Result<()> {
        self.read_content(attributes).map(|_| ())
    }

    fn read_string(&mut self, attributes: &[OwnedAttribute]) -> Result<String> {
        Ok(self.read_text(attributes)?.as_str().to_string())
    }

    fn read_bool(&mut self, attributes: &[OwnedAttribute]) -> Result<bool> {
        Ok(is_true(&self.read_text(attributes)?))
    }

    fn read_uuid(&mut self, attributes: &[OwnedAttribute]) -> Result<Uuid> {
        let text = self.read_text(attributes)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .ok()
            .and_then(|bytes| Uuid::from_slice(&bytes).ok())
            .ok_or_else(|| malformed(format!("Invalid UUID '{}'", text.trim())))
    }

    fn document(&mut self) -> Result<Uuid> {
        loop {
            match self.next_event()? {
                XmlEvent::StartElement { name, .. } => {
                    if name.local_name != "KeePassFile" {
                        return Err(malformed(format!(
                            "Expected <KeePassFile>, found <{}>",
                            name.local_name
                        )));
                    }
                    self.enter()?;
                    break;
                }
                XmlEvent::Characters(text) if !text.trim().is_empty() => {
                    return Err(malformed("Text before document element"));
                }
                _ => {}
            }
        }

        let mut root = None;
        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "Meta" => self.read_meta()?,
                "Root" if root.is_none() => root = Some(self.read_root()?),
                _ => self.skip(&attributes)?,
            }
        }
        root.ok_or_else(|| malformed("Missing <Root> element"))
    }

    fn read_meta(&mut self) -> Result<()> {
        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "Generator" => self.meta.generator = self.read_string(&attributes)?,
                "DatabaseName" => self.meta.name = self.read_string(&attributes)?,
                "DatabaseDescription" => self.meta.description = self.read_string(&attributes)?,
                "DefaultUserName" => self.meta.default_username = self.read_string(&attributes)?,
                "RecycleBinEnabled" => self.meta.recycle_bin_enabled = self.read_bool(&attributes)?,
                "RecycleBinUUID" => {
                    let uuid = self.read_uuid(&attributes)?;
                    self.meta.recycle_bin_uuid = (!uuid.is_nil()).then_some(uuid);
                }
                "HeaderHash" => {
                    let text = self.read_text(&attributes)?;
                    let hash = base64::engine::general_purpose::STANDARD
                        .decode(text.trim())
                        .map_err(|_| malformed("HeaderHash is not base64"))?;
                    self.meta.header_hash = Some(hash);
                }
                _ => self.skip(&attributes)?,
            }
        }
        Ok(())
    }

    fn read_root(&mut self) -> Result<Uuid> {
        let mut root = None;
        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "Group" if root.is_none() => root = Some(self.read_group(1)?),
                _ => self.skip(&attributes)?,
            }
        }
        root.ok_or_else(|| malformed("Missing root <Group>"))
    }

    /// Read a group and its subtree; children are registered before the group
    fn read_group(&mut self, depth: usize) -> Result<Uuid> {
        if depth > MAX_GROUP_DEPTH {
            return Err(malformed(format!(
                "Groups nested deeper than {}",
                MAX_GROUP_DEPTH
            )));
        }

        let mut uuid = None;
        let mut group = Group::with_uuid(Uuid::nil(), "");
        let mut entries = Vec::new();

        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "UUID" => uuid = Some(self.read_uuid(&attributes)?),
                "Name" => group.name = self.read_string(&attributes)?,
                "Notes" => group.notes = self.read_string(&attributes)?,
                "IconID" => group.icon_id = self.read_text(&attributes)?.trim().parse().ok(),
                "Times" => group.times = self.read_times()?,
                "Group" => group.children.push(self.read_group(depth + 1)?),
                "Entry" => {
                    let entry = self.read_entry(false)?;
                    group.entries.push(entry.uuid);
                    entries.push(entry);
                }
                _ => self.skip(&attributes)?,
            }
        }

        let uuid = uuid.ok_or_else(|| malformed(format!("Group '{}' has no UUID", group.name)))?;
        group.uuid = uuid;

        for child in &group.children {
            if let Some(child) = self.groups.get_mut(child) {
                child.parent = Some(uuid);
            }
        }
        for mut entry in entries {
            entry.parent_group = Some(uuid);
            let entry_uuid = entry.uuid;
            if self.entries.insert(entry_uuid, entry).is_some() {
                return Err(malformed(format!("Duplicate entry UUID {}", entry_uuid)));
            }
        }
        if self.groups.insert(uuid, group).is_some() {
            return Err(malformed(format!("Duplicate group UUID {}", uuid)));
        }
        Ok(uuid)
    }

    fn read_entry(&mut self, in_history: bool) -> Result<Entry> {
        let mut uuid = None;
        let mut entry = Entry::with_uuid(Uuid::nil());

        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "UUID" => uuid = Some(self.read_uuid(&attributes)?),
                "IconID" => entry.icon_id = self.read_text(&attributes)?.trim().parse().ok(),
                "Tags" => {
                    entry.tags = self
                        .read_text(&attributes)?
                        .split([';', ','])
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(String::from)
                        .collect();
                }
                "Times" => entry.times = self.read_times()?,
                "String" => {
                    let (key, value) = self.read_field()?;
                    entry.set(key, value);
                }
                "History" if !in_history => entry.history = self.read_history()?,
                _ => self.skip(&attributes)?,
            }
        }

        entry.uuid = uuid.ok_or_else(|| malformed("Entry has no UUID"))?;
        Ok(entry)
    }

    fn read_history(&mut self) -> Result<Vec<Entry>> {
        let mut history = Vec::new();
        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "Entry" => history.push(self.read_entry(true)?),
                _ => self.skip(&attributes)?,
            }
        }
        Ok(history)
    }

    /// `<String><Key>..</Key><Value Protected="True">..</Value></String>`
    fn read_field(&mut self) -> Result<(String, Value)> {
        let mut key = None;
        let mut value = Value::Unprotected(String::new());

        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "Key" => key = Some(self.read_string(&attributes)?),
                "Value" => {
                    let in_memory = flag(&attributes, "Protected")
                        || flag(&attributes, "ProtectInMemory");
                    let text = self.read_text(&attributes)?;
                    value = if in_memory {
                        Value::Protected(SecureString::new(text.as_str()))
                    } else {
                        Value::Unprotected(text.as_str().to_string())
                    };
                }
                _ => self.skip(&attributes)?,
            }
        }

        let key = key.ok_or_else(|| malformed("<String> without <Key>"))?;
        Ok((key, value))
    }

    fn read_times(&mut self) -> Result<Times> {
        let mut times = Times::default();
        while let Child::Start { name, attributes } = self.next_child()? {
            match name.as_str() {
                "CreationTime" => times.created = parse_time(&self.read_text(&attributes)?),
                "LastModificationTime" => {
                    times.modified = parse_time(&self.read_text(&attributes)?)
                }
                "LastAccessTime" => times.accessed = parse_time(&self.read_text(&attributes)?),
                "ExpiryTime" => times.expiry = parse_time(&self.read_text(&attributes)?),
                "Expires" => times.expires = self.read_bool(&attributes)?,
                _ => self.skip(&attributes)?,
            }
        }
        Ok(times)
    }
}

/// 3.x writes ISO-8601 text; 4.x writes base64 of an i64 count of seconds
/// since 0001-01-01T00:00:00Z
fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Some(time.with_timezone(&Utc));
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(text).ok()?;
    let seconds = i64::from_le_bytes(bytes.as_slice().try_into().ok()?);
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)?.and_hms_opt(0, 0, 0)?;
    let time = epoch.checked_add_signed(chrono::Duration::try_seconds(seconds)?)?;
    Some(Utc.from_utc_datetime(&time))
}

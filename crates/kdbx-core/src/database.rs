//! Database operations for KeePass files

use crate::cancel::CancelToken;
use crate::cipher::ProtectedStream;
use crate::decrypt::decrypt_database;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::header::DatabaseHeader;
use crate::kdf::KdfLimits;
use crate::key::CompositeKey;
use crate::xml;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use uuid::Uuid;

/// Database-wide settings from the `<Meta>` element
#[derive(Debug, Clone, Default, Serialize)]
pub struct Meta {
    pub name: String,
    pub description: String,
    pub generator: String,
    pub default_username: String,
    pub recycle_bin_enabled: bool,
    pub recycle_bin_uuid: Option<Uuid>,
    /// SHA-256 of the outer header as recorded by 3.x writers
    #[serde(skip)]
    pub header_hash: Option<Vec<u8>>,
}

/// A KeePass database with entries and groups.
///
/// Read-only once opened. Groups and entries live in flat maps keyed by UUID;
/// the tree shape is carried by each group's ordered `children` and `entries`.
#[derive(Debug)]
pub struct Database {
    header: Option<DatabaseHeader>,
    meta: Meta,
    /// All entries indexed by UUID
    entries: HashMap<Uuid, Entry>,
    /// All groups indexed by UUID
    groups: HashMap<Uuid, Group>,
    /// Root group UUID
    root_group: Uuid,
}

/// Metadata about the database (for display without walking the tree)
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseMetadata {
    pub name: String,
    pub description: String,
    pub generator: String,
    /// Format version, e.g. "4.0"; empty for in-memory databases
    pub version: String,
    pub entry_count: usize,
    pub group_count: usize,
}

/// A tree node for displaying the group hierarchy
#[derive(Debug, Clone, Serialize)]
pub struct GroupTreeNode {
    pub uuid: Uuid,
    pub name: String,
    pub entry_count: usize,
    pub is_recycle_bin: bool,
    pub children: Vec<GroupTreeNode>,
}

impl Database {
    /// Open a database from bytes with default KDF limits
    pub fn open(data: &[u8], key: &CompositeKey) -> Result<Self> {
        Self::open_with(data, key, &KdfLimits::default(), &CancelToken::new())
    }

    /// Open a database from bytes, bounding KDF cost by `limits`; key
    /// derivation stops with [`Error::Cancelled`] once `cancel` fires
    pub fn open_with(
        data: &[u8],
        key: &CompositeKey,
        limits: &KdfLimits,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let (header, payload) = decrypt_database(data, key, limits, cancel)?;

        let stream = ProtectedStream::new(payload.inner_stream, payload.inner_stream_key.as_bytes())?;
        let tree = xml::decode(&payload.xml, stream)?;

        if !header.version.is_kdbx4() {
            if let Some(stored) = &tree.meta.header_hash {
                if stored.as_slice() != payload.header_hash.as_slice() {
                    return Err(Error::IntegrityError("Meta header hash mismatch".into()));
                }
            }
        }

        let database = Self {
            header: Some(header),
            meta: tree.meta,
            entries: tree.entries,
            groups: tree.groups,
            root_group: tree.root,
        };
        tracing::info!(
            "Opened KDBX {} database '{}': {} groups, {} entries",
            database.metadata().version,
            database.meta.name,
            database.groups.len(),
            database.entries.len()
        );
        Ok(database)
    }

    /// Open a database from bytes with a password and optional keyfile
    pub fn open_with_keyfile(data: &[u8], password: &str, keyfile: Option<&[u8]>) -> Result<Self> {
        let mut key = CompositeKey::new().with_password(password);
        if let Some(kf) = keyfile {
            key = key.with_keyfile(&mut Cursor::new(kf))?;
        }
        Self::open(data, &key)
    }

    /// Read and open a database file
    pub fn open_file(
        path: impl AsRef<Path>,
        key: &CompositeKey,
        limits: &KdfLimits,
        cancel: &CancelToken,
    ) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Reading database file {}", path.display());
        let data = std::fs::read(path)?;
        Self::open_with(&data, key, limits, cancel)
    }

    /// Open a database file keyed by a master password only
    pub fn open_file_with_password(path: impl AsRef<Path>, password: &str) -> Result<Self> {
        let key = CompositeKey::new().with_password(password);
        Self::open_file(path, &key, &KdfLimits::default(), &CancelToken::new())
    }

    /// Open on a blocking worker so key derivation does not stall the runtime.
    ///
    /// Dropping the returned future does not stop the worker; cancel through
    /// `cancel` instead.
    #[cfg(feature = "tokio")]
    pub async fn open_async(
        data: Vec<u8>,
        key: CompositeKey,
        limits: KdfLimits,
        cancel: CancelToken,
    ) -> Result<Self> {
        let data = zeroize::Zeroizing::new(data);
        tokio::task::spawn_blocking(move || Self::open_with(&data, &key, &limits, &cancel))
            .await
            .map_err(|e| Error::IoError(format!("Unlock task failed: {}", e)))?
    }

    /// Get database metadata
    pub fn metadata(&self) -> DatabaseMetadata {
        DatabaseMetadata {
            name: self.meta.name.clone(),
            description: self.meta.description.clone(),
            generator: self.meta.generator.clone(),
            version: self
                .header
                .as_ref()
                .map(|h| h.version.to_string())
                .unwrap_or_default(),
            entry_count: self.entries.len(),
            group_count: self.groups.len(),
        }
    }

    /// Outer header; `None` for databases built in memory
    pub fn header(&self) -> Option<&DatabaseHeader> {
        self.header.as_ref()
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Get the root group
    pub fn root_group(&self) -> &Group {
        self.groups
            .get(&self.root_group)
            .expect("Root group must exist")
    }

    /// Get all entries
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    /// Get an entry by UUID
    pub fn get_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.entries.get(uuid)
    }

    /// Get all groups
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Get a group by UUID
    pub fn get_group(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.get(uuid)
    }

    /// Direct subgroups of `group`, in document order
    pub fn child_groups<'a>(&'a self, group: &'a Group) -> impl Iterator<Item = &'a Group> + 'a {
        group.children.iter().filter_map(|uuid| self.groups.get(uuid))
    }

    /// Entries directly in `group`, in document order
    pub fn entries_in<'a>(&'a self, group: &'a Group) -> impl Iterator<Item = &'a Entry> + 'a {
        group.entries.iter().filter_map(|uuid| self.entries.get(uuid))
    }

    /// Get entries in a specific group
    pub fn entries_in_group(&self, group_uuid: &Uuid) -> Vec<&Entry> {
        self.groups
            .get(group_uuid)
            .map(|group| self.entries_in(group).collect())
            .unwrap_or_default()
    }

    /// Owning group of an entry
    pub fn parent_of(&self, entry: &Entry) -> Option<&Group> {
        entry.parent_group.and_then(|uuid| self.groups.get(&uuid))
    }

    /// Every group depth-first, pre-order, with its slash-separated path.
    /// The root's path is empty; its children's paths are their names.
    pub fn walk(&self) -> Vec<(String, &Group)> {
        let mut out = Vec::with_capacity(self.groups.len());
        let mut stack = vec![(String::new(), self.root_group())];
        while let Some((path, group)) = stack.pop() {
            let children: Vec<_> = self.child_groups(group).collect();
            for child in children.into_iter().rev() {
                let child_path = if path.is_empty() {
                    child.name.clone()
                } else {
                    format!("{}/{}", path, child.name)
                };
                stack.push((child_path, child));
            }
            out.push((path, group));
        }
        out
    }

    /// First direct child of the root literally named `name`
    pub fn find_group(&self, name: &str) -> Option<&Group> {
        self.child_groups(self.root_group()).find(|g| g.name == name)
    }

    /// First entry in `group` (not its subgroups) with exactly this title and,
    /// when given, exactly this username
    pub fn find_entry_in<'a>(
        &'a self,
        group: &'a Group,
        title: &str,
        username: Option<&str>,
    ) -> Option<&'a Entry> {
        self.entries_in(group).find(|e| e.matches(title, username))
    }

    /// Look up an entry the way the KeePass utility helpers do.
    ///
    /// With no (or an empty) `group_name` only the root group's own entries are
    /// searched. Otherwise only the first direct child of the root named
    /// `group_name` is searched; deeper groups are never considered.
    pub fn find_entry(
        &self,
        group_name: Option<&str>,
        title: &str,
        username: Option<&str>,
    ) -> Option<&Entry> {
        let group = match group_name {
            None | Some("") => self.root_group(),
            Some(name) => self.find_group(name)?,
        };
        self.find_entry_in(group, title, username)
    }

    /// First matching entry anywhere in the tree, depth-first from the root
    pub fn find_entry_anywhere(&self, title: &str, username: Option<&str>) -> Option<&Entry> {
        self.walk()
            .into_iter()
            .find_map(|(_, group)| self.find_entry_in(group, title, username))
    }

    /// Password of the entry matching title and username in the given group
    pub fn get_password(&self, group_name: Option<&str>, title: &str, username: &str) -> Option<&str> {
        self.find_entry(group_name, title, Some(username))
            .map(Entry::password)
    }

    /// Username and password of the first entry with this title in the given group
    pub fn get_user_and_password(&self, group_name: Option<&str>, title: &str) -> Option<(&str, &str)> {
        self.find_entry(group_name, title, None)
            .map(|e| (e.username(), e.password()))
    }

    /// Get the group tree structure
    pub fn group_tree(&self) -> GroupTreeNode {
        self.build_group_tree(self.root_group())
    }

    fn build_group_tree(&self, group: &Group) -> GroupTreeNode {
        GroupTreeNode {
            uuid: group.uuid,
            name: group.name.clone(),
            entry_count: group.entries.len(),
            is_recycle_bin: group.is_recycle_bin,
            children: self
                .child_groups(group)
                .map(|child| self.build_group_tree(child))
                .collect(),
        }
    }
}

/// Assembles a [`Database`] in memory, e.g. for tests of code consuming the model
pub struct DatabaseBuilder {
    meta: Meta,
    entries: HashMap<Uuid, Entry>,
    groups: HashMap<Uuid, Group>,
    root_group: Uuid,
}

impl DatabaseBuilder {
    pub fn new(root: Group) -> Self {
        let root_group = root.uuid;
        let mut groups = HashMap::new();
        groups.insert(root_group, Group { parent: None, ..root });
        Self {
            meta: Meta::default(),
            entries: HashMap::new(),
            groups,
            root_group,
        }
    }

    pub fn root(&self) -> Uuid {
        self.root_group
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = name.into();
        self
    }

    /// Add `group` as the last child of `parent`
    pub fn add_group(&mut self, parent: Uuid, mut group: Group) -> Result<Uuid> {
        let uuid = group.uuid;
        if self.groups.contains_key(&uuid) {
            return Err(Error::MalformedTree(format!("Duplicate group UUID {}", uuid)));
        }
        let parent_group = self
            .groups
            .get_mut(&parent)
            .ok_or_else(|| Error::MalformedTree(format!("Unknown parent group {}", parent)))?;
        parent_group.children.push(uuid);

        group.parent = Some(parent);
        group.children.clear();
        group.entries.clear();
        self.groups.insert(uuid, group);
        Ok(uuid)
    }

    /// Add `entry` as the last entry of `group`
    pub fn add_entry(&mut self, group: Uuid, mut entry: Entry) -> Result<Uuid> {
        let uuid = entry.uuid;
        if self.entries.contains_key(&uuid) {
            return Err(Error::MalformedTree(format!("Duplicate entry UUID {}", uuid)));
        }
        let owner = self
            .groups
            .get_mut(&group)
            .ok_or_else(|| Error::MalformedTree(format!("Unknown group {}", group)))?;
        owner.entries.push(uuid);

        entry.parent_group = Some(group);
        self.entries.insert(uuid, entry);
        Ok(uuid)
    }

    pub fn build(self) -> Database {
        Database {
            header: None,
            meta: self.meta,
            entries: self.entries,
            groups: self.groups,
            root_group: self.root_group,
        }
    }
}

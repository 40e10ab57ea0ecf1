//! Group types and operations

use crate::entry::Times;
use serde::Serialize;
use uuid::Uuid;

/// A group (folder) in a KeePass database that contains entries and subgroups
#[derive(Debug, Clone, Serialize)]
pub struct Group {
    /// Unique identifier for this group
    pub uuid: Uuid,
    /// Group name
    pub name: String,
    /// Notes for this group
    pub notes: String,
    /// Icon ID
    pub icon_id: Option<u32>,
    pub times: Times,
    /// UUID of the parent group (None for root)
    pub parent: Option<Uuid>,
    /// UUIDs of child groups, in document order
    pub children: Vec<Uuid>,
    /// UUIDs of entries in this group, in document order
    pub entries: Vec<Uuid>,
    /// Whether this is the database's active recycle bin
    pub is_recycle_bin: bool,
}

impl Group {
    /// Create a new group with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name)
    }

    /// Create a new group with a specific UUID (used when loading from database)
    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            notes: String::new(),
            icon_id: None,
            times: Times::default(),
            parent: None,
            children: Vec::new(),
            entries: Vec::new(),
            is_recycle_bin: false,
        }
    }

    /// Check if this is a root group (no parent)
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

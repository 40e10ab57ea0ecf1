//! Entry types and operations

use crate::secret::SecureString;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

pub const TITLE: &str = "Title";
pub const USERNAME: &str = "UserName";
pub const PASSWORD: &str = "Password";
pub const URL: &str = "URL";
pub const NOTES: &str = "Notes";

const STANDARD_FIELDS: [&str; 5] = [TITLE, USERNAME, PASSWORD, URL, NOTES];

/// A field value; protected values are held in zero-on-drop storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Unprotected(String),
    Protected(SecureString),
}

impl Value {
    pub fn as_str(&self) -> &str {
        match self {
            Value::Unprotected(s) => s,
            Value::Protected(s) => s.as_str(),
        }
    }

    pub fn is_protected(&self) -> bool {
        matches!(self, Value::Protected(_))
    }
}

/// Timestamps shared by entries and groups.
///
/// Any timestamp the database stores in an unreadable form is left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Times {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
    /// Whether `expiry` is in force
    pub expires: bool,
}

/// A password entry in a KeePass database
#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    /// Unique identifier for this entry
    pub uuid: Uuid,
    /// All string fields. Serialized without protected values.
    #[serde(serialize_with = "serialize_public_fields")]
    fields: HashMap<String, Value>,
    /// Tags for organization
    pub tags: Vec<String>,
    /// Icon ID
    pub icon_id: Option<u32>,
    pub times: Times,
    /// Previous versions of this entry, oldest first
    pub history: Vec<Entry>,
    /// UUID of the owning group; `None` for history snapshots
    pub parent_group: Option<Uuid>,
}

fn serialize_public_fields<S>(fields: &HashMap<String, Value>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let public: BTreeMap<&str, &str> = fields
        .iter()
        .filter(|(_, value)| !value.is_protected())
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect();
    public.serialize(serializer)
}

impl Entry {
    /// Create a new entry with the given title
    pub fn new(title: impl Into<String>) -> Self {
        let mut entry = Self::with_uuid(Uuid::new_v4());
        entry.set(TITLE, Value::Unprotected(title.into()));
        entry
    }

    /// Empty entry with a specific UUID (used when loading from a database)
    pub(crate) fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            fields: HashMap::new(),
            tags: Vec::new(),
            icon_id: None,
            times: Times::default(),
            history: Vec::new(),
            parent_group: None,
        }
    }

    pub(crate) fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Value of a field, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(Value::as_str)
    }

    /// Value of a field, or `default` when absent
    pub fn get_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).unwrap_or(default)
    }

    /// Whether the field was protected in the database; false if absent
    pub fn is_protected(&self, name: &str) -> bool {
        self.fields.get(name).map(Value::is_protected).unwrap_or(false)
    }

    /// Fields other than Title, UserName, Password, URL and Notes
    pub fn custom_fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .filter(|(key, _)| !STANDARD_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn title(&self) -> &str {
        self.get_or(TITLE, "")
    }

    pub fn username(&self) -> &str {
        self.get_or(USERNAME, "")
    }

    pub fn password(&self) -> &str {
        self.get_or(PASSWORD, "")
    }

    pub fn url(&self) -> &str {
        self.get_or(URL, "")
    }

    pub fn notes(&self) -> &str {
        self.get_or(NOTES, "")
    }

    /// Exact, case-sensitive match on title and, when given, username
    pub fn matches(&self, title: &str, username: Option<&str>) -> bool {
        self.title() == title && username.map_or(true, |u| self.username() == u)
    }
}

/// Builder for creating entries
pub struct EntryBuilder {
    entry: Entry,
}

impl EntryBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            entry: Entry::new(title),
        }
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.entry.uuid = uuid;
        self
    }

    pub fn username(self, username: impl Into<String>) -> Self {
        self.field(USERNAME, username)
    }

    /// Passwords are always stored protected
    pub fn password(self, password: impl Into<String>) -> Self {
        self.protected_field(PASSWORD, password)
    }

    pub fn url(self, url: impl Into<String>) -> Self {
        self.field(URL, url)
    }

    pub fn notes(self, notes: impl Into<String>) -> Self {
        self.field(NOTES, notes)
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry.set(key, Value::Unprotected(value.into()));
        self
    }

    pub fn protected_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entry.set(key, Value::Protected(SecureString::new(value)));
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.entry.tags.push(tag.into());
        self
    }

    pub fn icon_id(mut self, icon_id: u32) -> Self {
        self.entry.icon_id = Some(icon_id);
        self
    }

    pub fn build(self) -> Entry {
        self.entry
    }
}

//! The metadata document.
//!
//! On disk this is a single JSON object: every ordinary key is a file name
//! mapped to its [`FileEntry`], and three reserved keys hold the group tree,
//! the shared texts and a diagnostic scratch value. In memory those sections
//! are kept apart in a typed [`Document`] so the rest of the crate never has
//! to skip sentinel keys by hand.

use serde::de::{DeserializeOwned, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use tracing::warn;

mod repository;

pub use repository::MetadataRepository;

pub const GROUPS_KEY: &str = "__groups__";
pub const TEXTS_KEY: &str = "__texts__";
pub const DEBUG_KEY: &str = "__debug__";

pub const ROOT_GROUP_ID: &str = "root";
pub const ROOT_GROUP_NAME: &str = "Root";
pub const SYSTEM_CREATOR: &str = "system";

/// Keys that can never name a file entry.
pub fn is_reserved_key(key: &str) -> bool {
    matches!(key, GROUPS_KEY | TEXTS_KEY | DEBUG_KEY)
}

fn root_group_id() -> String {
    ROOT_GROUP_ID.to_string()
}

// A missing, null or blank reference all mean the root group.
fn group_or_root<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(match value {
        Some(id) if !id.trim().is_empty() => id,
        _ => root_group_id(),
    })
}

/// Seconds since the epoch, kept as the JSON number found on disk so an
/// integer stamp is written back as an integer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(Number);

impl Timestamp {
    pub fn from_secs(secs: f64) -> Self {
        Self(Number::from_f64(secs).unwrap_or_else(|| Number::from(0)))
    }

    pub fn secs(&self) -> f64 {
        self.0.as_f64().unwrap_or(0.0)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self(Number::from(0))
    }
}

/// Annotation for one uploaded file; the document key is the file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default = "root_group_id", deserialize_with = "group_or_root")]
    pub group_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileEntry {
    pub fn new(uploader: impl Into<String>) -> Self {
        Self {
            uploader: uploader.into(),
            ..Self::default()
        }
    }
}

impl Default for FileEntry {
    fn default() -> Self {
        Self {
            uploader: String::new(),
            password_hash: None,
            group_id: root_group_id(),
            extra: Map::new(),
        }
    }
}

/// A shared text snippet, keyed by its millisecond id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextEntry {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub uploader: String,
    #[serde(default)]
    pub uploader_id: Option<String>,
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub mtime: Timestamp,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A node of the group tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub mtime: Timestamp,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        parent_id: Option<String>,
        created_by: impl Into<String>,
        mtime: f64,
    ) -> Self {
        Self {
            name: name.into(),
            parent_id,
            created_by: created_by.into(),
            mtime: Timestamp::from_secs(mtime),
            hidden: false,
            is_pinned: false,
            extra: Map::new(),
        }
    }

    pub fn root(mtime: f64) -> Self {
        Self::new(ROOT_GROUP_NAME, None, SYSTEM_CREATOR, mtime)
    }
}

/// The whole metadata store, split into its sections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub files: BTreeMap<String, FileEntry>,
    pub groups: BTreeMap<String, Group>,
    pub texts: BTreeMap<String, TextEntry>,
    pub debug: Option<Value>,
    /// Top-level values that are not file entries, carried through as-is.
    pub unrecognized: Map<String, Value>,
    /// Group records that did not parse, written back untouched.
    pub raw_groups: Map<String, Value>,
    /// Text records that did not parse, written back untouched.
    pub raw_texts: Map<String, Value>,
    /// `__texts__` was present on load; it is written even when empty.
    pub texts_present: bool,
}

impl Document {
    /// Split a raw JSON object into sections.
    ///
    /// Nothing here fails. A section that is not an object is treated as
    /// empty. A group or text record that does not parse is kept verbatim in
    /// [`Document::raw_groups`] or [`Document::raw_texts`], and an ordinary key
    /// whose value does not parse as a file entry is kept verbatim in
    /// [`Document::unrecognized`].
    pub fn from_map(map: Map<String, Value>) -> Self {
        let mut doc = Document::default();
        for (key, value) in map {
            match key.as_str() {
                GROUPS_KEY => {
                    (doc.groups, doc.raw_groups) = parse_section(GROUPS_KEY, value);
                }
                TEXTS_KEY => {
                    doc.texts_present = value.is_object();
                    (doc.texts, doc.raw_texts) = parse_section(TEXTS_KEY, value);
                }
                DEBUG_KEY => doc.debug = Some(value),
                _ if value.is_object() => match FileEntry::deserialize(&value) {
                    Ok(entry) => {
                        doc.files.insert(key, entry);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "unreadable file entry kept as raw value");
                        doc.unrecognized.insert(key, value);
                    }
                },
                _ => {
                    doc.unrecognized.insert(key, value);
                }
            }
        }
        doc
    }

    /// Insert the root group if it is missing. Returns whether it was added.
    pub fn ensure_root(&mut self, now: f64) -> bool {
        if self.groups.contains_key(ROOT_GROUP_ID) {
            return false;
        }
        self.groups.insert(ROOT_GROUP_ID.to_string(), Group::root(now));
        true
    }

    /// Hang every group whose parent no longer exists under root. Returns
    /// the ids that were moved.
    pub fn adopt_orphans(&mut self) -> Vec<String> {
        let orphans: Vec<String> = self
            .groups
            .iter()
            .filter(|(id, group)| {
                id.as_str() != ROOT_GROUP_ID
                    && group
                        .parent_id
                        .as_deref()
                        .map_or(false, |parent| !self.groups.contains_key(parent))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &orphans {
            if let Some(group) = self.groups.get_mut(id) {
                group.parent_id = Some(ROOT_GROUP_ID.to_string());
            }
        }
        orphans
    }

    pub fn has_group(&self, id: &str) -> bool {
        self.groups.contains_key(id)
    }

    /// Whether `id` names a text, parsed or not.
    pub fn has_text(&self, id: &str) -> bool {
        self.texts.contains_key(id) || self.raw_texts.contains_key(id)
    }
}

fn parse_section<T: DeserializeOwned>(
    section: &str,
    value: Value,
) -> (BTreeMap<String, T>, Map<String, Value>) {
    let mut parsed = BTreeMap::new();
    let mut raw = Map::new();
    let Value::Object(records) = value else {
        warn!(section, "malformed section, recreating");
        return (parsed, raw);
    };
    for (id, record) in records {
        match T::deserialize(&record) {
            Ok(entry) => {
                parsed.insert(id, entry);
            }
            Err(e) => {
                warn!(section, id = %id, error = %e, "unreadable record kept as raw value");
                raw.insert(id, record);
            }
        }
    }
    (parsed, raw)
}

/// A section's parsed records followed by the raw ones they do not shadow.
struct Section<'a, T> {
    records: &'a BTreeMap<String, T>,
    raw: &'a Map<String, Value>,
}

impl<T: Serialize> Serialize for Section<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (id, record) in self.records {
            map.serialize_entry(id, record)?;
        }
        for (id, value) in self.raw {
            if !self.records.contains_key(id) {
                map.serialize_entry(id, value)?;
            }
        }
        map.end()
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (name, entry) in &self.files {
            map.serialize_entry(name, entry)?;
        }
        for (key, value) in &self.unrecognized {
            if !self.files.contains_key(key) && !is_reserved_key(key) {
                map.serialize_entry(key, value)?;
            }
        }
        let groups = Section {
            records: &self.groups,
            raw: &self.raw_groups,
        };
        map.serialize_entry(GROUPS_KEY, &groups)?;
        if self.texts_present || !self.texts.is_empty() || !self.raw_texts.is_empty() {
            let texts = Section {
                records: &self.texts,
                raw: &self.raw_texts,
            };
            map.serialize_entry(TEXTS_KEY, &texts)?;
        }
        if let Some(debug) = &self.debug {
            map.serialize_entry(DEBUG_KEY, debug)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(Document::from_map(map))
    }
}

#[cfg(test)]
mod tests;

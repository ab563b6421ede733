//! The group tree.
//!
//! Groups form a tree rooted at [`ROOT_GROUP_ID`]. Structural checks run
//! against the freshly loaded document before anything is changed, so a
//! rejected operation never reaches disk.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metadata::{Document, Group, MetadataRepository, Timestamp, ROOT_GROUP_ID};

/// What happens to the files of a deleted group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteMode {
    /// Files move to the deleted group's parent.
    #[default]
    DeleteOnly,
    /// Files are removed from disk and from the document.
    DeleteWithFiles,
}

impl FromStr for DeleteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "delete_only" => Ok(DeleteMode::DeleteOnly),
            "delete_with_files" => Ok(DeleteMode::DeleteWithFiles),
            other => Err(Error::invalid(format!("unknown delete mode '{other}'"))),
        }
    }
}

/// Fields an update may change. `None` leaves the field alone.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GroupUpdate {
    pub name: Option<String>,
    pub parent_id: Option<String>,
    pub is_pinned: Option<bool>,
}

/// Outcome of a group delete.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GroupDeletion {
    pub new_parent: String,
    pub reparented_groups: Vec<String>,
    pub moved_files: Vec<String>,
    pub deleted_files: Vec<String>,
}

/// A group as presented to callers, with its visible children.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupView {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub created_by: String,
    pub mtime: f64,
    pub hidden: bool,
    pub is_pinned: bool,
    pub children: Vec<String>,
}

pub struct GroupTree {
    repo: Arc<MetadataRepository>,
}

impl GroupTree {
    pub fn new(repo: Arc<MetadataRepository>) -> Self {
        Self { repo }
    }

    /// Create a group and return its id.
    pub fn create(&self, name: &str, parent_id: Option<&str>, created_by: &str) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid("group name is empty"));
        }
        let parent = match parent_id.map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => ROOT_GROUP_ID.to_string(),
        };
        let now = self.repo.clock().now_secs();
        let id = Uuid::new_v4().simple().to_string();

        self.repo.mutate(|doc| {
            if !doc.has_group(&parent) {
                return Err(Error::invalid(format!("invalid parent '{parent}'")));
            }
            doc.groups.insert(
                id.clone(),
                Group::new(name, Some(parent.clone()), created_by, now),
            );
            Ok(())
        })?;
        info!(group = %id, parent = %parent, "group created");
        Ok(id)
    }

    pub fn update(&self, id: &str, update: &GroupUpdate) -> Result<()> {
        let now = self.repo.clock().now_secs();
        self.repo.mutate(|doc| apply_update(doc, id, update, now))?;
        debug!(group = %id, "group updated");
        Ok(())
    }

    pub fn set_hidden(&self, id: &str, hidden: bool) -> Result<()> {
        let now = self.repo.clock().now_secs();
        self.repo.mutate(|doc| {
            let group = doc
                .groups
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("group '{id}'")))?;
            group.hidden = hidden;
            group.mtime = Timestamp::from_secs(now);
            Ok(())
        })
    }

    /// Delete a group, lifting its children and files to its parent.
    ///
    /// With [`DeleteMode::DeleteWithFiles`] the group's files are removed from
    /// disk once the document change has been committed.
    pub fn delete(&self, id: &str, mode: DeleteMode) -> Result<GroupDeletion> {
        let deletion = self.repo.mutate(|doc| apply_delete(doc, id, mode))?;

        if !deletion.deleted_files.is_empty() {
            let upload_dir = self.repo.upload_dir();
            for name in &deletion.deleted_files {
                match fs::remove_file(upload_dir.join(name)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!(file = %name, error = %e, "could not remove file of deleted group"),
                }
            }
        }
        info!(
            group = %id,
            ?mode,
            reparented = deletion.reparented_groups.len(),
            moved = deletion.moved_files.len(),
            deleted = deletion.deleted_files.len(),
            "group deleted"
        );
        Ok(deletion)
    }

    pub fn list(&self, include_hidden: bool) -> Vec<GroupView> {
        visible_groups(&self.repo.load(), include_hidden)
    }

    pub fn get(&self, id: &str) -> Result<Group> {
        self.repo
            .load()
            .groups
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("group '{id}'")))
    }
}

/// The parent a group hangs under; a non-root group without one sits under root.
fn effective_parent<'a>(id: &str, group: &'a Group) -> Option<&'a str> {
    if id == ROOT_GROUP_ID {
        return None;
    }
    Some(group.parent_id.as_deref().unwrap_or(ROOT_GROUP_ID))
}

/// Whether making `new_parent` the parent of `id` would close a loop.
fn creates_cycle(groups: &BTreeMap<String, Group>, id: &str, new_parent: &str) -> bool {
    let mut seen = HashSet::new();
    let mut current = Some(new_parent);
    while let Some(cursor) = current {
        if cursor == id {
            return true;
        }
        if !seen.insert(cursor) {
            // the stored tree already loops above this point
            return false;
        }
        current = groups
            .get(cursor)
            .and_then(|group| effective_parent(cursor, group));
    }
    false
}

fn apply_update(doc: &mut Document, id: &str, update: &GroupUpdate, now: f64) -> Result<()> {
    if !doc.has_group(id) {
        return Err(Error::not_found(format!("group '{id}'")));
    }
    let name = match &update.name {
        Some(name) if name.trim().is_empty() => {
            return Err(Error::invalid("group name is empty"));
        }
        Some(name) => Some(name.trim().to_string()),
        None => None,
    };
    let parent = match update.parent_id.as_deref().map(str::trim) {
        Some(parent) if !parent.is_empty() => {
            if parent == id {
                return Err(Error::invalid("a group cannot be its own parent"));
            }
            if !doc.has_group(parent) {
                return Err(Error::invalid(format!("invalid parent '{parent}'")));
            }
            if creates_cycle(&doc.groups, id, parent) {
                return Err(Error::CycleDetected(format!(
                    "'{parent}' is a descendant of '{id}'"
                )));
            }
            Some(parent.to_string())
        }
        _ => None,
    };

    let group = doc
        .groups
        .get_mut(id)
        .ok_or_else(|| Error::not_found(format!("group '{id}'")))?;
    if let Some(name) = name {
        group.name = name;
    }
    if let Some(parent) = parent {
        group.parent_id = Some(parent);
    }
    if let Some(pinned) = update.is_pinned {
        group.is_pinned = pinned;
    }
    group.mtime = Timestamp::from_secs(now);
    Ok(())
}

fn apply_delete(doc: &mut Document, id: &str, mode: DeleteMode) -> Result<GroupDeletion> {
    if id == ROOT_GROUP_ID {
        return Err(Error::Protected("the root group cannot be deleted".into()));
    }
    let group = doc
        .groups
        .remove(id)
        .ok_or_else(|| Error::not_found(format!("group '{id}'")))?;
    let new_parent = group
        .parent_id
        .unwrap_or_else(|| ROOT_GROUP_ID.to_string());

    let mut deletion = GroupDeletion {
        new_parent: new_parent.clone(),
        ..GroupDeletion::default()
    };
    for (child_id, child) in doc.groups.iter_mut() {
        if child.parent_id.as_deref() == Some(id) {
            child.parent_id = Some(new_parent.clone());
            deletion.reparented_groups.push(child_id.clone());
        }
    }

    let members: Vec<String> = doc
        .files
        .iter()
        .filter(|(_, entry)| entry.group_id == id)
        .map(|(name, _)| name.clone())
        .collect();
    for name in members {
        match mode {
            DeleteMode::DeleteOnly => {
                if let Some(entry) = doc.files.get_mut(&name) {
                    entry.group_id = new_parent.clone();
                }
                deletion.moved_files.push(name);
            }
            DeleteMode::DeleteWithFiles => {
                doc.files.remove(&name);
                deletion.deleted_files.push(name);
            }
        }
    }
    Ok(deletion)
}

/// Groups reachable from root, filtered for display.
///
/// Without `include_hidden`, hidden groups are left out and a child whose
/// parent was left out reports no parent.
pub fn visible_groups(doc: &Document, include_hidden: bool) -> Vec<GroupView> {
    let reachable: HashSet<&str> = doc
        .groups
        .keys()
        .map(String::as_str)
        .filter(|id| reaches_root(&doc.groups, id))
        .collect();
    let shown: HashSet<&str> = reachable
        .iter()
        .copied()
        .filter(|id| include_hidden || !doc.groups[*id].hidden)
        .collect();

    let mut views: Vec<GroupView> = doc
        .groups
        .iter()
        .filter(|(id, _)| shown.contains(id.as_str()))
        .map(|(id, group)| GroupView {
            id: id.clone(),
            name: group.name.clone(),
            parent_id: effective_parent(id, group)
                .filter(|parent| shown.contains(parent))
                .map(str::to_string),
            created_by: group.created_by.clone(),
            mtime: group.mtime.secs(),
            hidden: group.hidden,
            is_pinned: group.is_pinned,
            children: Vec::new(),
        })
        .collect();
    views.sort_by(|a, b| {
        (a.id != ROOT_GROUP_ID)
            .cmp(&(b.id != ROOT_GROUP_ID))
            .then(a.mtime.total_cmp(&b.mtime))
            .then_with(|| a.id.cmp(&b.id))
    });

    let children: Vec<(String, String)> = views
        .iter()
        .filter_map(|v| v.parent_id.clone().map(|p| (p, v.id.clone())))
        .collect();
    for (parent, child) in children {
        if let Some(view) = views.iter_mut().find(|v| v.id == parent) {
            view.children.push(child);
        }
    }
    views
}

/// Ids of groups that are hidden themselves or sit under a hidden group.
pub fn hidden_group_ids(doc: &Document) -> HashSet<String> {
    doc.groups
        .keys()
        .filter(|id| {
            let mut seen = HashSet::new();
            let mut current = Some(id.as_str());
            while let Some(cursor) = current {
                if !seen.insert(cursor) {
                    break;
                }
                let Some(group) = doc.groups.get(cursor) else {
                    break;
                };
                if group.hidden {
                    return true;
                }
                current = effective_parent(cursor, group);
            }
            false
        })
        .cloned()
        .collect()
}

fn reaches_root(groups: &BTreeMap<String, Group>, id: &str) -> bool {
    let mut seen = HashSet::new();
    let mut current = Some(id);
    while let Some(cursor) = current {
        if cursor == ROOT_GROUP_ID {
            return true;
        }
        if !seen.insert(cursor) {
            return false;
        }
        current = groups
            .get(cursor)
            .and_then(|group| effective_parent(cursor, group));
    }
    false
}

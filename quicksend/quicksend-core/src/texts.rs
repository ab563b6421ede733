//! Shared text snippets stored in the `__texts__` section.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::auth::{self, Caller};
use crate::config::TransferMode;
use crate::error::{Error, Result};
use crate::metadata::{Document, MetadataRepository, TextEntry, Timestamp};

#[derive(Clone, Debug, Default)]
pub struct NewText {
    pub content: String,
    pub uploader: String,
    pub uploader_id: Option<String>,
    pub password: Option<String>,
}

/// A text as listed to callers. Protected texts carry no content.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TextListing {
    pub id: String,
    pub uploader: String,
    pub uploader_id: Option<String>,
    pub mtime: f64,
    pub has_password: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// First free id at or after `now_millis`.
fn next_text_id(doc: &Document, now_millis: i64) -> String {
    let mut candidate = now_millis;
    while doc.has_text(&candidate.to_string()) {
        candidate += 1;
    }
    candidate.to_string()
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct TextBoard {
    repo: Arc<MetadataRepository>,
}

impl TextBoard {
    pub fn new(repo: Arc<MetadataRepository>) -> Self {
        Self { repo }
    }

    /// Store a new text and return its id.
    pub fn submit(&self, text: NewText) -> Result<String> {
        let content = text.content.trim();
        if content.is_empty() {
            return Err(Error::invalid("text content is empty"));
        }
        let password_hash = match non_blank(text.password.as_deref()) {
            Some(password) => Some(auth::hash_password(&password)?),
            None => None,
        };
        let entry = TextEntry {
            content: content.to_string(),
            uploader: text.uploader.trim().to_string(),
            uploader_id: non_blank(text.uploader_id.as_deref()),
            password_hash,
            mtime: Timestamp::default(),
            extra: Default::default(),
        };

        let clock = self.repo.clock();
        let id = self.repo.mutate(|doc| {
            let id = next_text_id(doc, clock.now_millis());
            doc.texts.insert(
                id.clone(),
                TextEntry {
                    mtime: Timestamp::from_secs(clock.now_secs()),
                    ..entry
                },
            );
            Ok(id)
        })?;
        info!(text = %id, chars = content.chars().count(), "text shared");
        Ok(id)
    }

    /// Newest first. In one-way mode remote callers see nothing.
    pub fn list(&self, caller: &Caller, mode: TransferMode) -> Vec<TextListing> {
        if mode == TransferMode::Oneway && !caller.privileged {
            return Vec::new();
        }
        let doc = self.repo.load();
        let mut listings: Vec<TextListing> = doc
            .texts
            .into_iter()
            .map(|(id, entry)| {
                let has_password = entry.password_hash.as_deref().map_or(false, |h| !h.is_empty());
                TextListing {
                    id,
                    uploader: entry.uploader,
                    uploader_id: entry.uploader_id,
                    mtime: entry.mtime.secs(),
                    has_password,
                    content: (!has_password).then_some(entry.content),
                }
            })
            .collect();
        listings.sort_by(|a, b| b.mtime.total_cmp(&a.mtime).then_with(|| b.id.cmp(&a.id)));
        listings
    }

    /// Read a text's content, checking its password if it has one.
    pub fn get(&self, id: &str, password: Option<&str>) -> Result<String> {
        let entry = self
            .repo
            .load()
            .texts
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("text '{id}'")))?;
        if !auth::check_password(entry.password_hash.as_deref(), password) {
            return Err(Error::forbidden("wrong password"));
        }
        Ok(entry.content)
    }

    pub fn delete(&self, id: &str, caller: &Caller) -> Result<()> {
        self.repo.mutate(|doc| {
            let entry = doc
                .texts
                .get(id)
                .ok_or_else(|| Error::not_found(format!("text '{id}'")))?;
            caller.authorize(entry, "text")?;
            doc.texts.remove(id);
            Ok(())
        })?;
        info!(text = %id, "text deleted");
        Ok(())
    }

    pub fn set_password(&self, id: &str, password: &str, caller: &Caller) -> Result<()> {
        let password = password.trim();
        if password.is_empty() {
            return Err(Error::invalid("password is empty"));
        }
        let hash = auth::hash_password(password)?;
        self.update_password(id, Some(hash), caller)
    }

    pub fn clear_password(&self, id: &str, caller: &Caller) -> Result<()> {
        self.update_password(id, None, caller)
    }

    fn update_password(&self, id: &str, hash: Option<String>, caller: &Caller) -> Result<()> {
        self.repo.mutate(|doc| {
            let entry = doc
                .texts
                .get_mut(id)
                .ok_or_else(|| Error::not_found(format!("text '{id}'")))?;
            caller.authorize(&*entry, "text")?;
            entry.password_hash = hash;
            Ok(())
        })
    }

    /// Remove every text. Host only. Returns how many were removed.
    pub fn clear_all(&self, caller: &Caller) -> Result<usize> {
        caller.require_privileged()?;
        let removed = self.repo.mutate(|doc| {
            let count = doc.texts.len() + doc.raw_texts.len();
            doc.texts.clear();
            doc.raw_texts.clear();
            Ok(count)
        })?;
        info!(removed, "texts cleared");
        Ok(removed)
    }
}

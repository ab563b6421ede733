use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Document;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::storage::JsonFile;

/// Sole writer of the metadata document.
///
/// Every change goes through [`MetadataRepository::mutate`], which holds a
/// process-wide lock across the load, the change and the save so two
/// concurrent writers cannot overwrite each other's work.
pub struct MetadataRepository {
    file: JsonFile,
    upload_dir: RwLock<PathBuf>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl MetadataRepository {
    pub fn new(metadata_path: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::new(metadata_path),
            upload_dir: RwLock::new(upload_dir.into()),
            clock: Arc::new(SystemClock),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn metadata_path(&self) -> &Path {
        self.file.path()
    }

    /// Whether `name` refers to the metadata document itself.
    pub fn is_metadata_file(&self, name: &str) -> bool {
        self.file
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |own| own.eq_ignore_ascii_case(name))
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir.read().clone()
    }

    pub fn set_upload_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        info!(dir = %dir.display(), "upload folder changed");
        *self.upload_dir.write() = dir;
    }

    /// Read the document and apply the load-time repairs: the root group is
    /// created if missing and groups whose parent is gone are put under root.
    pub fn load(&self) -> Document {
        let raw: Map<String, Value> = self.file.load();
        let mut doc = Document::from_map(raw);
        if doc.ensure_root(self.clock.now_secs()) {
            debug!(path = %self.file.path().display(), "bootstrapped root group");
        }
        let adopted = doc.adopt_orphans();
        if !adopted.is_empty() {
            warn!(groups = ?adopted, "groups with a missing parent moved under root");
        }
        doc
    }

    pub fn save(&self, doc: &Document) -> bool {
        self.file.save(doc)
    }

    /// Run one load-change-save cycle under the write lock.
    ///
    /// When `apply` fails the document is not saved. A failed save is
    /// reported as [`Error::StorageFailure`].
    pub fn mutate<T>(&self, apply: impl FnOnce(&mut Document) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut doc = self.load();
        let value = apply(&mut doc)?;
        if !self.save(&doc) {
            return Err(Error::StorageFailure(format!(
                "could not write {}",
                self.file.path().display()
            )));
        }
        Ok(value)
    }
}

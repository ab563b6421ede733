//! Crash-safe persistence for JSON documents.
//!
//! Writes go to a sibling temporary file which is flushed to disk and then
//! renamed over the target, so readers only ever observe the previous or the
//! next complete version. Reads fail soft: a missing, empty or unparsable file
//! yields the type's default value.

use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::error::Result;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A JSON document stored at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the document. `Ok(None)` when the file is absent or blank.
    pub fn try_load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Read the document, falling back to `T::default()` on any failure.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        match self.try_load() {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(path = %self.path.display(), "no document on disk, using empty");
                T::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read document, using empty");
                T::default()
            }
        }
    }

    /// Serialize `value` and atomically replace the file with it.
    pub fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let temp_path = parent.join(self.temp_name());
        let written = (|| -> std::io::Result<()> {
            let mut temp_file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)?;
            temp_file.write_all(&bytes)?;
            temp_file.flush()?;
            temp_file.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = bytes.len(), "document saved");
        Ok(())
    }

    /// Like [`JsonFile::write`] but reports only whether the write landed.
    pub fn save<T: Serialize>(&self, value: &T) -> bool {
        match self.write(value) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to save document");
                false
            }
        }
    }

    fn temp_name(&self) -> String {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(".{}.tmp-{}-{}", file_name, std::process::id(), seq)
    }
}

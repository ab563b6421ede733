//! Uploaded files and their metadata entries.
//!
//! The bytes live in the upload folder under their sanitized name; the entry
//! in the metadata document carries the uploader, password and group.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::auth::{self, Caller};
use crate::config::TransferMode;
use crate::error::{Error, Result};
use crate::groups::hidden_group_ids;
use crate::metadata::{is_reserved_key, FileEntry, MetadataRepository, ROOT_GROUP_ID};

const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Reduce a client-supplied name to a safe file name.
///
/// Only the last path component survives, with characters that are illegal
/// on common filesystems removed. A name that ends up empty (or `.`/`..`)
/// becomes `file_<millis>` with the original extension.
pub fn sanitize_filename(raw: &str, now_millis: i64) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !FORBIDDEN_CHARS.contains(c)).collect();
    let cleaned = cleaned.trim();
    if !cleaned.is_empty() && cleaned != "." && cleaned != ".." {
        return cleaned.to_string();
    }
    let ext: String = Path::new(raw)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.chars().filter(|c| !FORBIDDEN_CHARS.contains(c)).collect())
        .unwrap_or_default();
    if ext.is_empty() {
        format!("file_{now_millis}")
    } else {
        format!("file_{now_millis}.{ext}")
    }
}

/// Who uploaded a batch and how it should be filed.
#[derive(Clone, Debug, Default)]
pub struct UploadMeta {
    pub uploader: String,
    pub password: Option<String>,
    pub group_id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FileQuery {
    pub group_id: Option<String>,
    pub query: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileListing {
    pub name: String,
    pub size: u64,
    pub mtime: f64,
    pub uploader: String,
    pub has_password: bool,
    pub group_id: String,
}

pub struct FileCatalog {
    repo: Arc<MetadataRepository>,
}

impl FileCatalog {
    pub fn new(repo: Arc<MetadataRepository>) -> Self {
        Self { repo }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.repo.upload_dir()
    }

    /// Reject names that could escape the upload folder or clobber metadata.
    fn checked_name<'a>(&self, name: &'a str) -> Result<&'a str> {
        if self.repo.is_metadata_file(name) || is_reserved_key(name) {
            return Err(Error::Protected(format!("'{name}' is reserved")));
        }
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(Error::invalid(format!("bad file name '{name}'")));
        }
        Ok(name)
    }

    /// Write `bytes` under the sanitized form of `raw_name`, replacing any
    /// file of that name, and return the name used.
    pub fn save_bytes(&self, raw_name: &str, bytes: &[u8]) -> Result<String> {
        let name = sanitize_filename(raw_name, self.repo.clock().now_millis());
        self.checked_name(&name)?;
        self.write_file(&name, bytes)?;
        Ok(name)
    }

    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.repo.upload_dir();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), bytes)?;
        debug!(file = %name, bytes = bytes.len(), "file stored");
        Ok(())
    }

    /// Store several uploads and register them in one write.
    ///
    /// Every name is checked before any bytes are written, so a rejected name
    /// leaves the upload folder untouched.
    pub fn store_batch<B: AsRef<[u8]>>(
        &self,
        uploads: &[(String, B)],
        meta: &UploadMeta,
    ) -> Result<Vec<String>> {
        let now = self.repo.clock().now_millis();
        let names = uploads
            .iter()
            .map(|(raw_name, _)| -> Result<String> {
                let name = sanitize_filename(raw_name, now);
                self.checked_name(&name)?;
                Ok(name)
            })
            .collect::<Result<Vec<_>>>()?;
        for (name, (_, bytes)) in names.iter().zip(uploads) {
            self.write_file(name, bytes.as_ref())?;
        }
        self.register_many(&names, meta)?;
        Ok(names)
    }

    /// Store one upload and register it.
    pub fn store_upload(&self, raw_name: &str, bytes: &[u8], meta: &UploadMeta) -> Result<String> {
        let name = self.save_bytes(raw_name, bytes)?;
        self.register(&name, meta)?;
        Ok(name)
    }

    pub fn register(&self, name: &str, meta: &UploadMeta) -> Result<()> {
        self.register_many(&[name.to_string()], meta)
    }

    /// Create or overwrite the entries for files already on disk.
    pub fn register_many(&self, names: &[String], meta: &UploadMeta) -> Result<()> {
        for name in names {
            self.checked_name(name)?;
        }
        let password_hash = match meta.password.as_deref().map(str::trim) {
            Some(password) if !password.is_empty() => Some(auth::hash_password(password)?),
            _ => None,
        };
        let group_id = match meta.group_id.as_deref().map(str::trim) {
            Some(group) if !group.is_empty() => group.to_string(),
            _ => ROOT_GROUP_ID.to_string(),
        };
        self.repo.mutate(|doc| {
            for name in names {
                doc.unrecognized.remove(name);
                doc.files.insert(
                    name.clone(),
                    FileEntry {
                        uploader: meta.uploader.clone(),
                        password_hash: password_hash.clone(),
                        group_id: group_id.clone(),
                        ..FileEntry::default()
                    },
                );
            }
            Ok(())
        })?;
        info!(count = names.len(), group = %group_id, uploader = %meta.uploader, "files registered");
        Ok(())
    }

    /// Files in the upload folder joined with their entries, newest first.
    pub fn list(&self, query: &FileQuery, caller: &Caller, mode: TransferMode) -> Result<Vec<FileListing>> {
        if mode == TransferMode::Oneway && !caller.privileged {
            return Ok(Vec::new());
        }
        let dir = self.repo.upload_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let doc = self.repo.load();
        let hidden = if caller.privileged {
            Default::default()
        } else {
            hidden_group_ids(&doc)
        };
        let needle = query
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let wanted_group = query.group_id.as_deref().filter(|g| !g.is_empty());

        let mut listings = Vec::new();
        for item in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "cannot read upload folder entry");
                    continue;
                }
            };
            if !item.file_type().is_file() {
                continue;
            }
            let Some(name) = item.file_name().to_str() else {
                continue;
            };
            if self.repo.is_metadata_file(name) || is_temp_sibling(name) {
                continue;
            }
            let entry = doc.files.get(name).cloned().unwrap_or_default();
            if hidden.contains(&entry.group_id) {
                continue;
            }
            if wanted_group.map_or(false, |g| g != entry.group_id) {
                continue;
            }
            if let Some(needle) = &needle {
                if !name.to_lowercase().contains(needle.as_str()) {
                    continue;
                }
            }
            let meta = item.metadata().map_err(|e| Error::Io(e.into()))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0.0, |d| d.as_secs_f64());
            listings.push(FileListing {
                name: name.to_string(),
                size: meta.len(),
                mtime,
                has_password: entry.password_hash.as_deref().map_or(false, |h| !h.is_empty()),
                uploader: entry.uploader,
                group_id: entry.group_id,
            });
        }
        listings.sort_by(|a, b| b.mtime.total_cmp(&a.mtime).then_with(|| a.name.cmp(&b.name)));
        Ok(listings)
    }

    /// File a file under `group_id`. Returns the group it landed in.
    pub fn move_to_group(&self, name: &str, group_id: &str) -> Result<String> {
        let name = self.checked_name(name)?;
        let group_id = match group_id.trim() {
            "" => ROOT_GROUP_ID,
            id => id,
        };
        let on_disk = self.repo.upload_dir().join(name).is_file();
        self.repo.mutate(|doc| {
            if !doc.has_group(group_id) {
                return Err(Error::invalid(format!("invalid group '{group_id}'")));
            }
            if !doc.files.contains_key(name) {
                if !on_disk {
                    return Err(Error::not_found(format!("file '{name}'")));
                }
                doc.files.insert(name.to_string(), FileEntry::default());
            }
            if let Some(entry) = doc.files.get_mut(name) {
                entry.group_id = group_id.to_string();
            }
            Ok(())
        })?;
        debug!(file = %name, group = %group_id, "file moved");
        Ok(group_id.to_string())
    }

    /// Delete a file and its entry. A file already gone from disk is fine.
    ///
    /// The bytes are removed only after the entry's removal is committed.
    pub fn delete(&self, name: &str, caller: &Caller) -> Result<()> {
        let name = self.checked_name(name)?;
        let path = self.repo.upload_dir().join(name);
        self.repo.mutate(|doc| {
            if let Some(entry) = doc.files.get(name) {
                caller.authorize(entry, "file")?;
            } else if !path.exists() {
                return Err(Error::not_found(format!("file '{name}'")));
            }
            doc.files.remove(name);
            Ok(())
        })?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(file = %name, error = %e, "entry removed but file could not be deleted");
                return Err(e.into());
            }
        }
        info!(file = %name, "file deleted");
        Ok(())
    }

    pub fn set_password(&self, name: &str, password: &str, caller: &Caller) -> Result<()> {
        let password = password.trim();
        if password.is_empty() {
            return Err(Error::invalid("password is empty"));
        }
        let hash = auth::hash_password(password)?;
        self.update_password(name, Some(hash), caller)
    }

    pub fn clear_password(&self, name: &str, caller: &Caller) -> Result<()> {
        self.update_password(name, None, caller)
    }

    fn update_password(&self, name: &str, hash: Option<String>, caller: &Caller) -> Result<()> {
        let name = self.checked_name(name)?;
        let on_disk = self.repo.upload_dir().join(name).is_file();
        self.repo.mutate(|doc| {
            if !doc.files.contains_key(name) {
                if !on_disk {
                    return Err(Error::not_found(format!("file '{name}'")));
                }
                let uploader = caller.identity.name.clone().unwrap_or_default();
                doc.files.insert(name.to_string(), FileEntry::new(uploader));
            }
            let entry = doc
                .files
                .get_mut(name)
                .ok_or_else(|| Error::not_found(format!("file '{name}'")))?;
            caller.authorize(&*entry, "file")?;
            entry.password_hash = hash;
            Ok(())
        })
    }

    /// Resolve the on-disk path of `name` if `password` unlocks it.
    pub fn authorize_download(&self, name: &str, password: Option<&str>) -> Result<PathBuf> {
        let name = self.checked_name(name)?;
        let path = self.repo.upload_dir().join(name);
        if !path.is_file() {
            return Err(Error::not_found(format!("file '{name}'")));
        }
        let doc = self.repo.load();
        let hash = doc.files.get(name).and_then(|e| e.password_hash.as_deref());
        if !auth::check_password(hash, password) {
            return Err(Error::forbidden("wrong password"));
        }
        Ok(path)
    }
}

// Leftovers of an interrupted atomic save, e.g. `.metadata.json.tmp-12-0`.
fn is_temp_sibling(name: &str) -> bool {
    name.starts_with('.') && name.contains(".tmp-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::clock::ManualClock;
    use crate::groups::GroupTree;

    struct Fixture {
        _tempdir: tempfile::TempDir,
        repo: Arc<MetadataRepository>,
        catalog: FileCatalog,
    }

    fn fixture() -> Fixture {
        let tempdir = tempfile::tempdir().unwrap();
        let upload_dir = tempdir.path().join("uploads");
        fs::create_dir_all(&upload_dir).unwrap();
        // the metadata document shares the upload folder, as it does by default
        let repo = Arc::new(
            MetadataRepository::new(upload_dir.join("metadata.json"), &upload_dir)
                .with_clock(Arc::new(ManualClock::new(1_234))),
        );
        let catalog = FileCatalog::new(repo.clone());
        Fixture {
            _tempdir: tempdir,
            repo,
            catalog,
        }
    }

    fn by(uploader: &str) -> UploadMeta {
        UploadMeta {
            uploader: uploader.into(),
            ..UploadMeta::default()
        }
    }

    fn remote(name: &str) -> Caller {
        Caller::remote(Identity::named(name))
    }

    #[test]
    fn sanitize_strips_paths_and_illegal_characters() {
        assert_eq!(sanitize_filename("../../etc/passwd", 1), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\amy\\a<b>.txt", 1), "ab.txt");
        assert_eq!(sanitize_filename("  report.pdf ", 1), "report.pdf");
        assert_eq!(sanitize_filename("报告.docx", 1), "报告.docx");
        assert_eq!(sanitize_filename("", 42), "file_42");
        assert_eq!(sanitize_filename("..", 42), "file_42");
        assert_eq!(sanitize_filename("???", 42), "file_42");
        assert_eq!(sanitize_filename("photos/img.jpg/", 42), "file_42.jpg");
    }

    #[test]
    fn upload_without_group_lands_in_root() {
        let fx = fixture();
        let name = fx.catalog.store_upload("report.pdf", b"%PDF", &by("amy")).unwrap();
        assert_eq!(name, "report.pdf");
        let doc = fx.repo.load();
        assert_eq!(doc.files["report.pdf"].group_id, ROOT_GROUP_ID);
        assert_eq!(doc.files["report.pdf"].uploader, "amy");

        let listed = fx
            .catalog
            .list(&FileQuery::default(), &remote("bob"), TransferMode::Share)
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 4);
        assert_eq!(listed[0].group_id, ROOT_GROUP_ID);
    }

    #[test]
    fn metadata_document_is_protected() {
        let fx = fixture();
        fx.catalog.store_upload("a.txt", b"a", &by("amy")).unwrap();
        assert!(fx.repo.metadata_path().exists());

        let err = fx
            .catalog
            .store_upload("metadata.json", b"{}", &by("eve"))
            .unwrap_err();
        assert!(matches!(err, Error::Protected(_)));
        assert!(matches!(
            fx.catalog.delete("metadata.json", &Caller::local()),
            Err(Error::Protected(_))
        ));
        assert!(matches!(
            fx.catalog.authorize_download("metadata.json", None),
            Err(Error::Protected(_))
        ));
        assert!(matches!(
            fx.catalog.register("__groups__", &by("eve")),
            Err(Error::Protected(_))
        ));

        let listed = fx
            .catalog
            .list(&FileQuery::default(), &Caller::local(), TransferMode::Share)
            .unwrap();
        let names: Vec<&str> = listed.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[test]
    fn list_filters_by_group_query_and_visibility() {
        let fx = fixture();
        let tree = GroupTree::new(fx.repo.clone());
        let photos = tree.create("Photos", None, "local").unwrap();
        let secret = tree.create("Secret", None, "local").unwrap();
        tree.set_hidden(&secret, true).unwrap();

        let in_group = |group: &str| UploadMeta {
            group_id: Some(group.to_string()),
            ..by("amy")
        };
        fx.catalog.store_upload("Beach.JPG", b"1", &in_group(&photos)).unwrap();
        fx.catalog.store_upload("notes.txt", b"2", &by("amy")).unwrap();
        fx.catalog.store_upload("diary.txt", b"3", &in_group(&secret)).unwrap();

        let names = |query: FileQuery, caller: &Caller| -> Vec<String> {
            let mut names: Vec<String> = fx
                .catalog
                .list(&query, caller, TransferMode::Share)
                .unwrap()
                .into_iter()
                .map(|f| f.name)
                .collect();
            names.sort();
            names
        };

        assert_eq!(names(FileQuery::default(), &remote("bob")), vec!["Beach.JPG", "notes.txt"]);
        assert_eq!(
            names(FileQuery::default(), &Caller::local()),
            vec!["Beach.JPG", "diary.txt", "notes.txt"]
        );
        let by_group = FileQuery {
            group_id: Some(photos.clone()),
            ..FileQuery::default()
        };
        assert_eq!(names(by_group, &remote("bob")), vec!["Beach.JPG"]);
        let search = FileQuery {
            query: Some("beach".into()),
            ..FileQuery::default()
        };
        assert_eq!(names(search, &remote("bob")), vec!["Beach.JPG"]);

        assert!(fx
            .catalog
            .list(&FileQuery::default(), &remote("bob"), TransferMode::Oneway)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn move_requires_known_group_and_adopts_untracked_files() {
        let fx = fixture();
        let tree = GroupTree::new(fx.repo.clone());
        let docs = tree.create("Docs", None, "local").unwrap();
        fs::write(fx.catalog.upload_dir().join("dropped.txt"), b"x").unwrap();

        assert!(matches!(
            fx.catalog.move_to_group("dropped.txt", "nope"),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(fx.catalog.move_to_group("dropped.txt", &docs).unwrap(), docs);
        assert_eq!(fx.repo.load().files["dropped.txt"].group_id, docs);
        assert!(matches!(
            fx.catalog.move_to_group("ghost.txt", &docs),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn delete_checks_uploader() {
        let fx = fixture();
        fx.catalog.store_upload("a.txt", b"a", &by("amy")).unwrap();

        assert!(matches!(
            fx.catalog.delete("a.txt", &remote("bob")),
            Err(Error::Forbidden(_))
        ));
        assert!(fx.catalog.upload_dir().join("a.txt").exists());

        fx.catalog.delete("a.txt", &remote("amy")).unwrap();
        assert!(!fx.catalog.upload_dir().join("a.txt").exists());
        assert!(!fx.repo.load().files.contains_key("a.txt"));

        // entry whose bytes are already gone
        fx.catalog.register("phantom.txt", &by("amy")).unwrap();
        fx.catalog.delete("phantom.txt", &Caller::local()).unwrap();
        assert!(matches!(
            fx.catalog.delete("phantom.txt", &Caller::local()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            fx.catalog.delete("../escape", &Caller::local()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn password_gates_download() {
        let fx = fixture();
        let meta = UploadMeta {
            password: Some("pw".into()),
            ..by("amy")
        };
        fx.catalog.store_upload("locked.bin", b"zz", &meta).unwrap();

        assert!(matches!(
            fx.catalog.authorize_download("locked.bin", None),
            Err(Error::Forbidden(_))
        ));
        let path = fx.catalog.authorize_download("locked.bin", Some("pw")).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"zz");

        assert!(matches!(
            fx.catalog.clear_password("locked.bin", &remote("bob")),
            Err(Error::Forbidden(_))
        ));
        fx.catalog.clear_password("locked.bin", &remote("amy")).unwrap();
        assert!(fx.catalog.authorize_download("locked.bin", None).is_ok());

        fx.catalog.set_password("locked.bin", "new", &Caller::local()).unwrap();
        let listed = fx
            .catalog
            .list(&FileQuery::default(), &Caller::local(), TransferMode::Share)
            .unwrap();
        assert!(listed[0].has_password);
        assert!(matches!(
            fx.catalog.authorize_download("missing.bin", None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rejected_name_in_batch_writes_nothing() {
        let fx = fixture();
        let uploads = vec![
            ("a.txt".to_string(), b"a".to_vec()),
            ("METADATA.json".to_string(), b"{}".to_vec()),
        ];
        assert!(matches!(
            fx.catalog.store_batch(&uploads, &by("eve")),
            Err(Error::Protected(_))
        ));
        assert!(!fx.catalog.upload_dir().join("a.txt").exists());
        assert!(fx.repo.load().files.is_empty());

        let names = fx.catalog.store_batch(&uploads[..1], &by("amy")).unwrap();
        assert_eq!(names, vec!["a.txt"]);
        assert_eq!(fx.repo.load().files["a.txt"].uploader, "amy");
    }

    #[test]
    fn failed_delete_commit_keeps_the_bytes() {
        let tempdir = tempfile::tempdir().unwrap();
        let upload_dir = tempdir.path().join("uploads");
        fs::create_dir_all(&upload_dir).unwrap();
        // a directory where the metadata file should be makes every save fail
        let metadata_path = tempdir.path().join("metadata.json");
        fs::create_dir_all(metadata_path.join("blocker")).unwrap();
        let repo = Arc::new(MetadataRepository::new(&metadata_path, &upload_dir));
        let catalog = FileCatalog::new(repo);
        fs::write(upload_dir.join("keep.bin"), b"k").unwrap();

        assert!(matches!(
            catalog.delete("keep.bin", &Caller::local()),
            Err(Error::StorageFailure(_))
        ));
        assert!(upload_dir.join("keep.bin").exists());
    }

    #[test]
    fn batch_registration_is_one_write() {
        let fx = fixture();
        for name in ["a.bin", "b.bin"] {
            fx.catalog.save_bytes(name, b"x").unwrap();
        }
        let meta = UploadMeta {
            group_id: Some("  ".into()),
            ..by("amy")
        };
        fx.catalog
            .register_many(&["a.bin".to_string(), "b.bin".to_string()], &meta)
            .unwrap();
        let doc = fx.repo.load();
        assert_eq!(doc.files.len(), 2);
        assert!(doc.files.values().all(|e| e.group_id == ROOT_GROUP_ID));
    }
}

//! Runtime configuration.
//!
//! [`AppConfig`] is assembled once at start-up from the data directory and the
//! environment and handed to the constructors that need it. [`SettingsStore`]
//! owns the user-editable `config.json`.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::JsonFile;

pub const METADATA_FILE: &str = "metadata.json";
pub const SETTINGS_FILE: &str = "config.json";
pub const USERS_FILE: &str = "users.json";
pub const SESSIONS_FILE: &str = "sessions.json";
pub const UPLOADS_DIR: &str = "uploads";

/// Whether remote clients may see what others shared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Share,
    /// Remote clients may send but not browse.
    Oneway,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub installation_id: String,
    #[serde(default)]
    pub upload_folder: Option<PathBuf>,
    #[serde(default)]
    pub mode: TransferMode,
    #[serde(default)]
    pub use_source_date: bool,
    #[serde(default = "default_true")]
    pub allow_remote_group_create: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            installation_id: String::new(),
            upload_folder: None,
            mode: TransferMode::Share,
            use_source_date: false,
            allow_remote_group_create: true,
            extra: Map::new(),
        }
    }
}

/// A partial settings change from the host UI.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub mode: Option<TransferMode>,
    pub use_source_date: Option<bool>,
    pub upload_folder: Option<PathBuf>,
    pub allow_remote_group_create: Option<bool>,
}

pub struct SettingsStore {
    file: JsonFile,
    default_upload_dir: PathBuf,
    current: RwLock<Settings>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load `config.json`, filling in an installation id and upload folder on
    /// first run. The flag is true when a new installation id was minted.
    pub fn bootstrap(path: impl Into<PathBuf>, default_upload_dir: impl Into<PathBuf>) -> Result<(Self, bool)> {
        let file = JsonFile::new(path);
        let default_upload_dir = default_upload_dir.into();
        let mut settings: Settings = file.load();

        let created = settings.installation_id.trim().is_empty();
        if created {
            settings.installation_id = Uuid::new_v4().simple().to_string();
        }
        let missing_folder = settings.upload_folder.is_none();
        if missing_folder {
            settings.upload_folder = Some(default_upload_dir.clone());
        }
        if let Some(folder) = &settings.upload_folder {
            std::fs::create_dir_all(folder)?;
        }
        if created || missing_folder {
            file.write(&settings)
                .map_err(|e| Error::StorageFailure(format!("cannot write settings: {e}")))?;
        }
        if created {
            info!(installation = %settings.installation_id, "new installation");
        }

        Ok((
            Self {
                file,
                default_upload_dir,
                current: RwLock::new(settings),
                write_lock: Mutex::new(()),
            },
            created,
        ))
    }

    pub fn get(&self) -> Settings {
        self.current.read().clone()
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.current
            .read()
            .upload_folder
            .clone()
            .unwrap_or_else(|| self.default_upload_dir.clone())
    }

    /// Apply `patch` and persist it. The upload folder, when given, must be an
    /// existing directory.
    pub fn update(&self, patch: &SettingsPatch) -> Result<Settings> {
        let _guard = self.write_lock.lock();
        if let Some(folder) = &patch.upload_folder {
            if !folder.is_dir() {
                return Err(Error::invalid(format!(
                    "'{}' is not a directory",
                    folder.display()
                )));
            }
        }

        // start from disk so keys written by other tools are kept
        let mut settings: Settings = self.file.load();
        let current = self.get();
        if settings.installation_id.is_empty() {
            settings.installation_id = current.installation_id;
        }
        if settings.upload_folder.is_none() {
            settings.upload_folder = current.upload_folder;
        }
        if let Some(mode) = patch.mode {
            settings.mode = mode;
        }
        if let Some(flag) = patch.use_source_date {
            settings.use_source_date = flag;
        }
        if let Some(flag) = patch.allow_remote_group_create {
            settings.allow_remote_group_create = flag;
        }
        if let Some(folder) = &patch.upload_folder {
            settings.upload_folder = Some(folder.clone());
        }

        if !self.file.save(&settings) {
            return Err(Error::StorageFailure("cannot write settings".into()));
        }
        *self.current.write() = settings.clone();
        Ok(settings)
    }
}

/// Where and whether usage events are sent.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub base_url: String,
    pub anon_key: String,
    pub timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            anon_key: String::new(),
            timeout: Duration::from_secs(2),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("SUPABASE_ANALYTICS_ENABLED")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(true);
        let base_url = lookup("SUPABASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_default();
        let anon_key = lookup("SUPABASE_ANON_KEY")
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        Self {
            enabled,
            base_url,
            anon_key,
            ..Self::default()
        }
    }

    /// True only when switched on and both endpoint and key are known.
    pub fn enabled(&self) -> bool {
        self.enabled && !self.base_url.is_empty() && !self.anon_key.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub metadata_path: PathBuf,
    pub settings_path: PathBuf,
    pub users_path: PathBuf,
    pub sessions_path: PathBuf,
    pub default_upload_dir: PathBuf,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn new(data_dir: impl AsRef<Path>, telemetry: TelemetryConfig) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            metadata_path: data_dir.join(METADATA_FILE),
            settings_path: data_dir.join(SETTINGS_FILE),
            users_path: data_dir.join(USERS_FILE),
            sessions_path: data_dir.join(SESSIONS_FILE),
            default_upload_dir: data_dir.join(UPLOADS_DIR),
            data_dir,
            telemetry,
        }
    }

    pub fn from_env(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir, TelemetryConfig::from_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn telemetry_requires_url_and_key() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert!(config.enabled);
        assert!(!config.enabled());

        let config = TelemetryConfig::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://example.supabase.co/"),
            ("SUPABASE_ANON_KEY", "anon"),
        ]));
        assert_eq!(config.base_url, "https://example.supabase.co");
        assert!(config.enabled());
        assert_eq!(config.timeout, Duration::from_secs(2));

        let config = TelemetryConfig::from_lookup(lookup(&[
            ("SUPABASE_ANALYTICS_ENABLED", "off"),
            ("SUPABASE_URL", "https://example.supabase.co"),
            ("SUPABASE_ANON_KEY", "anon"),
        ]));
        assert!(!config.enabled());
    }

    #[test]
    fn bootstrap_mints_installation_once() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join(SETTINGS_FILE);
        let uploads = tempdir.path().join(UPLOADS_DIR);

        let (store, created) = SettingsStore::bootstrap(&path, &uploads).unwrap();
        assert!(created);
        let id = store.get().installation_id;
        assert_eq!(id.len(), 32);
        assert!(uploads.is_dir());
        assert_eq!(store.upload_dir(), uploads);

        let (store, created) = SettingsStore::bootstrap(&path, &uploads).unwrap();
        assert!(!created);
        assert_eq!(store.get().installation_id, id);
    }

    #[test]
    fn update_keeps_unknown_keys_and_validates_folder() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{"installation_id": "abc", "theme": "dark"}"#).unwrap();
        let (store, created) =
            SettingsStore::bootstrap(&path, tempdir.path().join(UPLOADS_DIR)).unwrap();
        assert!(!created);
        assert!(store.get().allow_remote_group_create);

        let patch = SettingsPatch {
            mode: Some(TransferMode::Oneway),
            allow_remote_group_create: Some(false),
            ..SettingsPatch::default()
        };
        let settings = store.update(&patch).unwrap();
        assert_eq!(settings.mode, TransferMode::Oneway);

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
        assert_eq!(raw["mode"], "oneway");
        assert_eq!(raw["allow_remote_group_create"], false);

        let bad = SettingsPatch {
            upload_folder: Some(tempdir.path().join("missing")),
            ..SettingsPatch::default()
        };
        assert!(matches!(store.update(&bad), Err(Error::InvalidInput(_))));
        assert_eq!(store.get().mode, TransferMode::Oneway);
    }

    #[test]
    fn app_config_paths_live_in_data_dir() {
        let config = AppConfig::new("/srv/qs", TelemetryConfig::default());
        assert_eq!(config.metadata_path, Path::new("/srv/qs/metadata.json"));
        assert_eq!(config.sessions_path, Path::new("/srv/qs/sessions.json"));
        assert!(!config.telemetry.enabled());
    }
}

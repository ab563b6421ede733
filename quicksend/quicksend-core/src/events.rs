use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Install,
    AppOpen,
    FileUpload,
    TextShare,
}

/// One usage event as posted to the ingestion endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_name: EventName,
    pub installation_id: String,
    pub session_id: Option<String>,
    pub app_version: Option<String>,
    pub platform: Option<String>,
    pub is_frozen: Option<bool>,
    #[serde(default)]
    pub props: Map<String, Value>,
}

/// Fields shared by every event this process emits.
#[derive(Clone, Debug)]
pub struct EventContext {
    pub installation_id: String,
    pub session_id: String,
    pub app_version: String,
    pub platform: String,
    pub is_frozen: bool,
}

impl EventContext {
    pub fn new(installation_id: impl Into<String>) -> Self {
        Self {
            installation_id: installation_id.into(),
            session_id: Uuid::new_v4().simple().to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: current_platform().to_string(),
            is_frozen: !cfg!(debug_assertions),
        }
    }

    /// Stamp an event. Non-object `props` are dropped.
    pub fn event(&self, name: EventName, props: Value) -> TelemetryEvent {
        let props = match props {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        TelemetryEvent {
            event_name: name,
            installation_id: self.installation_id.clone(),
            session_id: Some(self.session_id.clone()),
            app_version: Some(self.app_version.clone()),
            platform: Some(self.platform.clone()),
            is_frozen: Some(self.is_frozen),
            props,
        }
    }
}

fn current_platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "win32"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else {
        "linux"
    }
}

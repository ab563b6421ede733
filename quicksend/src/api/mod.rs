//! HTTP API over the QuickSend core.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use quicksend_core::{
    accounts::{Accounts, Session},
    auth::{AccessGate, Caller, Identity, LocalAddress},
    config::{AppConfig, SettingsPatch, SettingsStore},
    events::{EventContext, EventName},
    files::{FileCatalog, FileListing, FileQuery, UploadMeta},
    groups::{DeleteMode, GroupDeletion, GroupTree, GroupUpdate, GroupView},
    metadata::MetadataRepository,
    telemetry::{Dispatcher, PostResult},
    texts::{NewText, TextBoard, TextListing},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;

mod error;

pub use error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<MetadataRepository>,
    pub groups: Arc<GroupTree>,
    pub texts: Arc<TextBoard>,
    pub files: Arc<FileCatalog>,
    pub settings: Arc<SettingsStore>,
    pub accounts: Arc<Accounts>,
    pub gate: AccessGate,
    pub local: Arc<dyn LocalAddress>,
    pub telemetry: Dispatcher,
    pub events: Arc<EventContext>,
}

impl AppState {
    /// Wire up the core from `config`. The flag reports a fresh installation.
    pub fn open(config: &AppConfig, local: Arc<dyn LocalAddress>) -> quicksend_core::Result<(Self, bool)> {
        let (settings, installed) =
            SettingsStore::bootstrap(&config.settings_path, &config.default_upload_dir)?;
        let repo = Arc::new(MetadataRepository::new(
            &config.metadata_path,
            settings.upload_dir(),
        ));
        let events = EventContext::new(settings.get().installation_id);
        let state = Self {
            groups: Arc::new(GroupTree::new(repo.clone())),
            texts: Arc::new(TextBoard::new(repo.clone())),
            files: Arc::new(FileCatalog::new(repo.clone())),
            repo,
            settings: Arc::new(settings),
            accounts: Arc::new(Accounts::new(&config.users_path, &config.sessions_path)),
            gate: AccessGate::new(local.clone()),
            local,
            telemetry: Dispatcher::new(config.telemetry.clone()),
            events: Arc::new(events),
        };
        Ok((state, installed))
    }

    pub fn with_dispatcher(mut self, telemetry: Dispatcher) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Fire-and-forget usage event.
    pub fn track(&self, name: EventName, props: Value) {
        self.telemetry.track(self.events.event(name, props));
    }
}

/// The requesting client: where it connects from and who it says it is.
///
/// The claimed identity comes from the `uploader` and `uploader_id` query
/// parameters. A request without connection info is treated as remote.
pub struct Client {
    pub origin: IpAddr,
    pub caller: Caller,
}

#[derive(Deserialize, Default)]
struct IdentityParams {
    uploader: Option<String>,
    uploader_id: Option<String>,
}

impl FromRequestParts<AppState> for Client {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let origin = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let params = Query::<IdentityParams>::try_from_uri(&parts.uri)
            .map(|Query(params)| params)
            .unwrap_or_default();
        let identity = Identity::new(params.uploader_id.as_deref(), params.uploader.as_deref());
        Ok(Self {
            origin,
            caller: state.gate.caller(origin, identity),
        })
    }
}

/// Run core work that hashes passwords or writes to disk on the blocking pool.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> quicksend_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError(quicksend_core::Error::Io(std::io::Error::other(e))))?
        .map_err(ApiError::from)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/version", get(version))
        .route("/api/ip", get(host_info))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/files", get(list_files).post(upload_files))
        .route("/api/files/{name}", axum::routing::delete(delete_file))
        .route("/api/files/{name}/group", post(move_file))
        .route(
            "/api/files/{name}/password",
            post(set_file_password).delete(clear_file_password),
        )
        .route("/download/{name}", get(download))
        .route("/api/texts", get(list_texts).post(submit_text))
        .route("/api/texts/clear", axum::routing::delete(clear_texts))
        .route("/api/texts/{id}", get(get_text).delete(delete_text))
        .route(
            "/api/texts/{id}/password",
            post(set_text_password).delete(clear_text_password),
        )
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/{id}", put(update_group).delete(delete_group))
        .route("/api/groups/{id}/hidden", post(set_group_hidden))
        .route("/api/user/auth", post(user_auth))
        .route("/api/user/logout", post(user_logout))
        .route("/api/user/me", post(user_me))
        .route("/api/telemetry/test", post(telemetry_test))
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn host_info(State(state): State<AppState>, client: Client) -> Json<Value> {
    Json(json!({
        "ip": state.local.current().map(|ip| ip.to_string()),
        "client_ip": client.origin.to_string(),
        "is_host": client.caller.privileged,
    }))
}

async fn get_config(State(state): State<AppState>, client: Client) -> Json<Value> {
    let settings = state.settings.get();
    let mut body = json!({
        "mode": settings.mode,
        "use_source_date": settings.use_source_date,
        "allow_remote_group_create": settings.allow_remote_group_create,
        "is_host": client.caller.privileged,
    });
    if client.caller.privileged {
        body["upload_folder"] = json!(state.settings.upload_dir().display().to_string());
    }
    Json(body)
}

async fn update_config(
    State(state): State<AppState>,
    client: Client,
    Json(patch): Json<SettingsPatch>,
) -> ApiResult<Json<Value>> {
    client.caller.require_privileged()?;
    let folder_changed = patch.upload_folder.is_some();
    let store = state.settings.clone();
    let settings = blocking(move || store.update(&patch)).await?;
    if folder_changed {
        state.repo.set_upload_dir(state.settings.upload_dir());
    }
    info!(mode = ?settings.mode, "settings updated");
    Ok(Json(json!({
        "mode": settings.mode,
        "use_source_date": settings.use_source_date,
        "allow_remote_group_create": settings.allow_remote_group_create,
        "upload_folder": state.settings.upload_dir().display().to_string(),
    })))
}

#[derive(Deserialize)]
struct FileListParams {
    group_id: Option<String>,
    q: Option<String>,
}

async fn list_files(
    State(state): State<AppState>,
    client: Client,
    Query(params): Query<FileListParams>,
) -> ApiResult<Json<Vec<FileListing>>> {
    let query = FileQuery {
        group_id: params.group_id,
        query: params.q,
    };
    let mode = state.settings.get().mode;
    Ok(Json(state.files.list(&query, &client.caller, mode)?))
}

async fn upload_files(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Json<Value>> {
    let mut uploads: Vec<(String, Bytes)> = Vec::new();
    let mut meta = UploadMeta::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" | "files" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                uploads.push((file_name, bytes));
            }
            "uploader" | "password" | "group_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                match field_name.as_str() {
                    "uploader" => meta.uploader = text.trim().to_string(),
                    "password" => meta.password = Some(text),
                    _ => meta.group_id = Some(text),
                }
            }
            _ => {}
        }
    }
    if uploads.is_empty() {
        return Err(ApiError::bad_request("no file in upload"));
    }

    let total_bytes: usize = uploads.iter().map(|(_, bytes)| bytes.len()).sum();
    let files = state.files.clone();
    let names = blocking(move || files.store_batch(&uploads, &meta)).await?;
    state.track(
        EventName::FileUpload,
        json!({ "count": names.len(), "total_bytes": total_bytes }),
    );
    Ok(Json(json!({ "files": names })))
}

async fn delete_file(
    State(state): State<AppState>,
    client: Client,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let files = state.files.clone();
    blocking(move || files.delete(&name, &client.caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct MoveRequest {
    #[serde(default)]
    group_id: String,
}

async fn move_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<MoveRequest>,
) -> ApiResult<Json<Value>> {
    let files = state.files.clone();
    let moved = name.clone();
    let group_id = blocking(move || files.move_to_group(&moved, &req.group_id)).await?;
    Ok(Json(json!({ "name": name, "group_id": group_id })))
}

#[derive(Deserialize)]
struct PasswordRequest {
    #[serde(default)]
    password: String,
}

async fn set_file_password(
    State(state): State<AppState>,
    client: Client,
    Path(name): Path<String>,
    Json(req): Json<PasswordRequest>,
) -> ApiResult<StatusCode> {
    let files = state.files.clone();
    blocking(move || files.set_password(&name, &req.password, &client.caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_file_password(
    State(state): State<AppState>,
    client: Client,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    let files = state.files.clone();
    blocking(move || files.clear_password(&name, &client.caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct PasswordParams {
    password: Option<String>,
}

async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<PasswordParams>,
) -> ApiResult<impl IntoResponse> {
    let path = state.files.authorize_download(&name, params.password.as_deref())?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(quicksend_core::Error::from)?;
    let disposition = format!("attachment; filename*=UTF-8''{}", encode_rfc5987(&name));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}

fn encode_rfc5987(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

async fn list_texts(State(state): State<AppState>, client: Client) -> Json<Vec<TextListing>> {
    let mode = state.settings.get().mode;
    Json(state.texts.list(&client.caller, mode))
}

#[derive(Deserialize)]
struct TextRequest {
    #[serde(default)]
    content: String,
    #[serde(default)]
    uploader: String,
    uploader_id: Option<String>,
    password: Option<String>,
}

async fn submit_text(State(state): State<AppState>, Json(req): Json<TextRequest>) -> ApiResult<Json<Value>> {
    let length = req.content.trim().chars().count();
    let text = NewText {
        content: req.content,
        uploader: req.uploader,
        uploader_id: req.uploader_id,
        password: req.password,
    };
    let texts = state.texts.clone();
    let id = blocking(move || texts.submit(text)).await?;
    state.track(EventName::TextShare, json!({ "length": length }));
    Ok(Json(json!({ "id": id })))
}

async fn clear_texts(State(state): State<AppState>, client: Client) -> ApiResult<Json<Value>> {
    let texts = state.texts.clone();
    let removed = blocking(move || texts.clear_all(&client.caller)).await?;
    Ok(Json(json!({ "removed": removed })))
}

async fn get_text(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PasswordParams>,
) -> ApiResult<Json<Value>> {
    let content = state.texts.get(&id, params.password.as_deref())?;
    Ok(Json(json!({ "id": id, "content": content })))
}

async fn delete_text(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let texts = state.texts.clone();
    blocking(move || texts.delete(&id, &client.caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_text_password(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
    Json(req): Json<PasswordRequest>,
) -> ApiResult<StatusCode> {
    let texts = state.texts.clone();
    blocking(move || texts.set_password(&id, &req.password, &client.caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_text_password(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let texts = state.texts.clone();
    blocking(move || texts.clear_password(&id, &client.caller)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_groups(State(state): State<AppState>, client: Client) -> Json<Vec<GroupView>> {
    Json(state.groups.list(client.caller.privileged))
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    #[serde(default)]
    name: String,
    parent_id: Option<String>,
}

async fn create_group(
    State(state): State<AppState>,
    client: Client,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<Json<Value>> {
    if !client.caller.privileged && !state.settings.get().allow_remote_group_create {
        return Err(quicksend_core::Error::Forbidden("remote group creation is disabled".into()).into());
    }
    let groups = state.groups.clone();
    let created_by = client.origin.to_string();
    let id = blocking(move || groups.create(&req.name, req.parent_id.as_deref(), &created_by)).await?;
    Ok(Json(json!({ "id": id })))
}

async fn update_group(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
    Json(update): Json<GroupUpdate>,
) -> ApiResult<StatusCode> {
    client.caller.require_privileged()?;
    let groups = state.groups.clone();
    blocking(move || groups.update(&id, &update)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct DeleteGroupParams {
    #[serde(default)]
    mode: String,
}

async fn delete_group(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
    Query(params): Query<DeleteGroupParams>,
) -> ApiResult<Json<GroupDeletion>> {
    client.caller.require_privileged()?;
    let mode: DeleteMode = params.mode.parse()?;
    let groups = state.groups.clone();
    Ok(Json(blocking(move || groups.delete(&id, mode)).await?))
}

#[derive(Deserialize)]
struct HiddenRequest {
    hidden: bool,
}

async fn set_group_hidden(
    State(state): State<AppState>,
    client: Client,
    Path(id): Path<String>,
    Json(req): Json<HiddenRequest>,
) -> ApiResult<StatusCode> {
    client.caller.require_privileged()?;
    let groups = state.groups.clone();
    blocking(move || groups.set_hidden(&id, req.hidden)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AuthRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn user_auth(State(state): State<AppState>, Json(req): Json<AuthRequest>) -> ApiResult<Json<Session>> {
    let accounts = state.accounts.clone();
    let session = blocking(move || accounts.authenticate(&req.username, &req.password)).await?;
    Ok(Json(session))
}

fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| quicksend_core::Error::Forbidden("missing session token".into()).into())
}

async fn user_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    let token = bearer_token(&headers)?.to_string();
    let accounts = state.accounts.clone();
    blocking(move || accounts.logout(&token)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn user_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    let username = state.accounts.whoami(bearer_token(&headers)?)?;
    Ok(Json(json!({ "username": username })))
}

async fn telemetry_test(State(state): State<AppState>, client: Client) -> ApiResult<Json<Value>> {
    client.caller.require_privileged()?;
    let event = state
        .events
        .event(EventName::AppOpen, json!({ "diagnostic": true }));
    let telemetry = state.telemetry.clone();
    let result: PostResult = tokio::task::spawn_blocking(move || telemetry.post_now(&event))
        .await
        .unwrap_or_else(|e| PostResult {
            error: Some(e.to_string()),
            ..PostResult::default()
        });
    Ok(Json(json!({
        "enabled": state.telemetry.enabled(),
        "result": result,
        "stats": state.telemetry.stats(),
    })))
}

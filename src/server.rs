//!
//! filedepot HTTP server
//! ---------------------
//! Axum-based JSON API over the storage core.
//!
//! Responsibilities:
//! - Session cookie handling backed by the stateless `SessionAuthority`,
//!   including transparent rotation near expiry.
//! - Role gating: read-only users browse, read-write users mutate, admins
//!   manage S3 profiles.
//! - Local and S3 file operations sharing one adapter-generic core.
//! - Streaming downloads, uploads, and archive assembly.
//! - Audit events for every successful mutation and every login outcome.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path as RoutePath, Query, RawQuery, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::archive::{self, ArchiveFormat};
use crate::audit::AuditSink;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::paths;
use crate::policy;
use crate::s3config::{S3ConfigInput, S3ConfigStore};
use crate::s3conn::S3ConnectionRegistry;
use crate::session::{SessionAuthority, VerifiedSession};
use crate::storage::{EntryKind, ListPage, LocalAdapter, S3Adapter, StorageAdapter};
use crate::trash::TrashStore;
use crate::users::UserRegistry;

const SESSION_COOKIE: &str = "depot_session";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub users: Arc<UserRegistry>,
    pub sessions: Arc<SessionAuthority>,
    pub s3_configs: Arc<S3ConfigStore>,
    pub s3_connections: Arc<S3ConnectionRegistry>,
    pub audit: Arc<AuditSink>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("request failed: {}", self.message());
        } else {
            debug!("request rejected: {}", self.message());
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let users = Arc::new(UserRegistry::load(&config)?);
    let audit = Arc::new(AuditSink::open(&config.audit_log_path)?);
    let sessions = Arc::new(SessionAuthority::new(config.session_secret.clone(), users.clone()));
    let s3_configs = Arc::new(S3ConfigStore::new(config.settings_path()));
    let s3_connections = Arc::new(S3ConnectionRegistry::new(config.max_s3_connections));

    reconcile_trash(&users).await;
    info!(
        users = users.len(),
        s3_profiles = s3_configs.count(),
        file_root = %users.file_root_real.display(),
        "filedepot ready"
    );

    let state = AppState {
        config: config.clone(),
        users,
        sessions,
        s3_configs,
        s3_connections,
        audit: audit.clone(),
    };

    let app = router(state);
    let addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    info!("Starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    audit.flush();
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "filedepot ok" }))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/list", post(list))
        .route("/api/download", get(download))
        .route("/api/preview", post(preview))
        .route("/api/image", get(image))
        .route("/api/edit", get(edit_read).post(edit_write))
        .route("/api/upload", post(upload).layer(DefaultBodyLimit::disable()))
        .route("/api/mkdir", post(mkdir))
        .route("/api/move", post(move_entry))
        .route("/api/copy", post(copy_entry))
        .route("/api/trash", post(trash_delete).get(trash_list))
        .route("/api/trash/restore", post(trash_restore))
        .route("/api/archive", get(archive_download))
        .route("/api/search", post(search))
        .route("/api/s3/configs", get(s3_config_list).post(s3_config_create))
        .route(
            "/api/s3/configs/{id}",
            get(s3_config_get).put(s3_config_update).delete(s3_config_delete),
        )
        .route("/api/s3/configs/{id}/test", post(s3_config_test))
        .route("/api/s3/connect", post(s3_connect))
        .route("/api/s3/disconnect", post(s3_disconnect))
        .route("/api/s3/connections", get(s3_connections))
        .route("/api/s3/list", post(s3_list))
        .route("/api/s3/download", get(s3_download))
        .route("/api/s3/preview", post(s3_preview))
        .route("/api/s3/edit", get(s3_edit_read).post(s3_edit_write))
        .route("/api/s3/upload", post(s3_upload).layer(DefaultBodyLimit::disable()))
        .route("/api/s3/mkdir", post(s3_mkdir))
        .route("/api/s3/move", post(s3_move))
        .route("/api/s3/copy", post(s3_copy))
        .route("/api/s3/delete", post(s3_delete))
        .layer(middleware::from_fn_with_state(state.clone(), rotate_session))
        .with_state(state)
}

async fn reconcile_trash(users: &UserRegistry) {
    let mut seen = HashSet::new();
    for user in users.iter() {
        if !seen.insert(user.root_real.clone()) {
            continue;
        }
        let adapter = LocalAdapter::new(user.root_real.clone());
        let store = TrashStore::new(&adapter);
        match store.reconcile().await {
            Ok(0) => {}
            Ok(removed) => info!(root = %user.root_real.display(), removed, "trash reconciliation"),
            Err(err) => warn!(root = %user.root_real.display(), "trash reconciliation failed: {err}"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

// ---------------------------------------------------------------------------
// Session plumbing
// ---------------------------------------------------------------------------

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get(header::COOKIE)?;
    let raw = cookie.to_str().ok()?;
    for part in raw.split(';') {
        let part = part.trim();
        if let Some(eq) = part.find('=') {
            let (k, v) = part.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

fn session_cookie(token: &str) -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/"
    ))
    .expect("cookie value is header-safe")
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Strict; Path=/"
    ))
    .expect("static cookie value")
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> AppResult<VerifiedSession> {
    let token = parse_cookie(headers, SESSION_COOKIE)
        .ok_or_else(|| AppError::unauthorized("Not authenticated."))?;
    state.sessions.verify(&token)
}

fn require_writer(session: &VerifiedSession) -> AppResult<()> {
    if session.user.role.can_write() {
        Ok(())
    } else {
        Err(AppError::forbidden("This account is read-only."))
    }
}

fn require_admin(session: &VerifiedSession) -> AppResult<()> {
    if session.user.role.is_admin() {
        Ok(())
    } else {
        Err(AppError::forbidden("Administrator access required."))
    }
}

fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

/// Attach a fresh cookie once the session enters its rotation window. The
/// old token stays valid until natural expiry; S3 bindings follow the new
/// session id.
async fn rotate_session(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = parse_cookie(request.headers(), SESSION_COOKIE);
    let mut response = next.run(request).await;
    let Some(token) = token else { return response };
    let Ok(session) = state.sessions.verify(&token) else { return response };
    let now = chrono::Utc::now().timestamp_millis();
    if !session.needs_rotation(now) || response.status().is_server_error() {
        return response;
    }
    let fresh = state.sessions.issue(&session.user);
    if let Ok(rotated) = state.sessions.verify(&fresh) {
        state.s3_connections.rekey_session(&session.nonce, &rotated.nonce);
    }
    response.headers_mut().append(header::SET_COOKIE, session_cookie(&fresh));
    response
}

// ---------------------------------------------------------------------------
// Auth handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginPayload {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<LoginPayload>,
) -> AppResult<Response> {
    let ip = client_ip(&headers, addr);
    match state.sessions.check_login(&payload.username, &payload.password) {
        Ok(user) => {
            let token = state.sessions.issue(&user);
            state.audit.record(&ip, "login", json!({ "user": user.username }));
            let mut response = Json(json!({
                "user": user.username,
                "role": user.role.as_str(),
            }))
            .into_response();
            response.headers_mut().insert(header::SET_COOKIE, session_cookie(&token));
            Ok(response)
        }
        Err(failure) => {
            state.audit.record(
                &ip,
                "login_failed",
                json!({ "user": payload.username, "reason": failure.audit_reason() }),
            );
            Err(AppError::unauthorized("Invalid credentials."))
        }
    }
}

async fn logout(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let ip = client_ip(&headers, addr);
    if let Ok(session) = authenticate(&state, &headers) {
        state.s3_connections.detach(&session.nonce, None);
        state.audit.record(&ip, "logout", json!({ "user": session.user.username }));
    }
    let mut response = Json(json!({ "status": "ok" })).into_response();
    response.headers_mut().insert(header::SET_COOKIE, clear_session_cookie());
    Ok(response)
}

// ---------------------------------------------------------------------------
// Adapter-generic operation cores
// ---------------------------------------------------------------------------

fn page_window(page: Option<usize>, page_size: Option<usize>) -> (Option<usize>, usize) {
    match page_size {
        None => (None, 0),
        Some(size) => (Some(size), page.unwrap_or(1).saturating_sub(1) * size),
    }
}

async fn op_list(
    adapter: &dyn StorageAdapter,
    session: &VerifiedSession,
    path: &str,
    page: Option<usize>,
    page_size: Option<usize>,
) -> AppResult<Value> {
    let normalized = paths::normalize(path)?;
    let (limit, offset) = page_window(page, page_size);
    let ListPage { entries, total } = adapter.list(&normalized, limit, offset).await?;
    Ok(json!({
        "path": normalized,
        "parent": paths::virtual_parent(&normalized),
        "entries": entries,
        "total": total,
        "page": page,
        "pageSize": page_size,
        "user": session.user.username,
        "role": session.user.role.as_str(),
    }))
}

async fn op_preview(adapter: &dyn StorageAdapter, path: &str) -> AppResult<Value> {
    let normalized = paths::normalize(path)?;
    let name = paths::basename(&normalized);
    if !policy::is_previewable(name) {
        return Err(AppError::invalid_request("Preview is not available for this file type."));
    }
    let entry = adapter
        .stat(&normalized)
        .await?
        .ok_or_else(|| AppError::not_found("Path not found."))?;
    if entry.kind == EntryKind::Dir {
        return Err(AppError::invalid_request("Not a file."));
    }
    if entry.size > policy::PREVIEW_MAX_BYTES {
        return Err(AppError::too_large("File is too large to preview."));
    }
    let bytes = adapter.read(&normalized).await?;
    if policy::looks_binary(&bytes) {
        return Err(AppError::invalid_request("Binary content cannot be previewed."));
    }
    Ok(json!({
        "path": normalized,
        "size": entry.size,
        "content": String::from_utf8_lossy(&bytes),
    }))
}

async fn op_edit_read(adapter: &dyn StorageAdapter, path: &str) -> AppResult<Value> {
    let normalized = paths::normalize(path)?;
    let name = paths::basename(&normalized);
    if !policy::is_editable(name) {
        return Err(AppError::invalid_request("This file type cannot be edited."));
    }
    let entry = adapter
        .stat(&normalized)
        .await?
        .ok_or_else(|| AppError::not_found("Path not found."))?;
    if entry.size > policy::EDIT_MAX_BYTES {
        return Err(AppError::too_large("File is too large to edit."));
    }
    let bytes = adapter.read(&normalized).await?;
    Ok(json!({
        "path": normalized,
        "content": String::from_utf8_lossy(&bytes),
    }))
}

async fn op_edit_write(adapter: &dyn StorageAdapter, path: &str, content: &str) -> AppResult<Value> {
    let normalized = paths::normalize(path)?;
    if !policy::is_editable(paths::basename(&normalized)) {
        return Err(AppError::invalid_request("This file type cannot be edited."));
    }
    if content.len() as u64 > policy::EDIT_MAX_BYTES {
        return Err(AppError::too_large("Content is too large to save."));
    }
    adapter.write(&normalized, content.as_bytes()).await?;
    Ok(json!({ "path": normalized, "size": content.len() }))
}

async fn op_mkdir(adapter: &dyn StorageAdapter, path: &str, name: &str) -> AppResult<String> {
    let base = paths::normalize(path)?;
    let leaf = paths::sanitize_leaf(name)?;
    let full = if base == "/" { format!("/{leaf}") } else { format!("{base}/{leaf}") };
    adapter.mkdir(&full).await?;
    Ok(full)
}

// ---------------------------------------------------------------------------
// Local file handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ListPayload {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default, rename = "pageSize")]
    page_size: Option<usize>,
}

async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<ListPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let path = payload.path.as_deref().unwrap_or("/");
    Ok(Json(op_list(&adapter, &session, path, payload.page, payload.page_size).await?))
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: String,
}

async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> AppResult<Response> {
    let session = authenticate(&state, &headers)?;
    let resolved = paths::resolve_safe(&query.path, &session.user.root_real)?;
    let meta = tokio::fs::metadata(&resolved.host_path).await?;
    if !meta.is_file() {
        return Err(AppError::invalid_request("Not a file."));
    }
    let file = tokio::fs::File::open(&resolved.host_path).await?;
    let name = paths::basename(&resolved.normalized);
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers_out = response.headers_mut();
    headers_out.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers_out.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.len().to_string()).map_err(|_| AppError::upstream("header"))?,
    );
    headers_out.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&archive::content_disposition(name))
            .map_err(|_| AppError::upstream("header"))?,
    );
    state.audit.record(
        &client_ip(&headers, addr),
        "download",
        json!({ "user": session.user.username, "path": resolved.normalized }),
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct PathPayload {
    path: String,
}

async fn preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<PathPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    Ok(Json(op_preview(&adapter, &payload.path).await?))
}

async fn image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> AppResult<Response> {
    let session = authenticate(&state, &headers)?;
    let resolved = paths::resolve_safe(&query.path, &session.user.root_real)?;
    let name = paths::basename(&resolved.normalized);
    if !policy::is_image(name) {
        return Err(AppError::invalid_request("Not an image."));
    }
    let meta = tokio::fs::metadata(&resolved.host_path).await?;
    if !meta.is_file() {
        return Err(AppError::invalid_request("Not a file."));
    }
    let file = tokio::fs::File::open(&resolved.host_path).await?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(policy::image_mime(name)));
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct EditPayload {
    path: String,
    content: String,
}

async fn edit_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    Ok(Json(op_edit_read(&adapter, &query.path).await?))
}

async fn edit_write(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<EditPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let result = op_edit_write(&adapter, &payload.path, &payload.content).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "edit",
        json!({ "user": session.user.username, "path": result["path"] }),
    );
    Ok(Json(result))
}

async fn upload(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let root = session.user.root_real.clone();

    let mut dir = "/".to_string();
    let mut overwrite = false;
    let mut saved: Vec<String> = Vec::new();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("path") => {
                dir = field
                    .text()
                    .await
                    .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?;
            }
            Some("overwrite") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?;
                overwrite = matches!(raw.as_str(), "true" | "1" | "yes");
            }
            Some("files") | Some("file") => {
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| AppError::invalid_request("Upload part is missing a filename."))?;
                let leaf = paths::sanitize_leaf(&filename)?.to_string();
                let base = paths::normalize(&dir)?;
                let target = if base == "/" { format!("/{leaf}") } else { format!("{base}/{leaf}") };
                let dest = paths::resolve_destination(&target, &root)?;
                if dest.host_path.symlink_metadata().is_ok() && !overwrite {
                    return Err(AppError::conflict(format!("{leaf} already exists.")));
                }
                // Stream the part straight to disk; nothing is buffered.
                let mut file = tokio::fs::File::create(&dest.host_path).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::invalid_request(format!("Upload interrupted: {e}")))?
                {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                saved.push(dest.normalized);
            }
            _ => {}
        }
    }
    if saved.is_empty() {
        return Err(AppError::invalid_request("No files in upload."));
    }
    state.audit.record(
        &client_ip(&headers, addr),
        "upload",
        json!({ "user": session.user.username, "paths": saved }),
    );
    Ok(Json(json!({ "saved": saved })))
}

#[derive(Debug, Deserialize)]
struct MkdirPayload {
    path: String,
    name: String,
}

async fn mkdir(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<MkdirPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let created = op_mkdir(&adapter, &payload.path, &payload.name).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "mkdir",
        json!({ "user": session.user.username, "path": created }),
    );
    Ok(Json(json!({ "path": created })))
}

#[derive(Debug, Deserialize)]
struct TransferPayload {
    from: String,
    to: String,
}

async fn move_entry(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<TransferPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    adapter.rename(&payload.from, &payload.to).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "move",
        json!({ "user": session.user.username, "from": payload.from, "to": payload.to }),
    );
    Ok(Json(json!({ "status": "ok" })))
}

async fn copy_entry(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<TransferPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    adapter.copy(&payload.from, &payload.to).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "copy",
        json!({ "user": session.user.username, "from": payload.from, "to": payload.to }),
    );
    Ok(Json(json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// Trash handlers (local backend only)
// ---------------------------------------------------------------------------

async fn trash_delete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<PathPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let record = adapter.trash(&payload.path).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "trash",
        json!({ "user": session.user.username, "path": record.original_path, "id": record.id }),
    );
    Ok(Json(json!({ "id": record.id })))
}

async fn trash_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let items = TrashStore::new(&adapter).list().await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
struct RestorePayload {
    id: String,
}

async fn trash_restore(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<RestorePayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let record = TrashStore::new(&adapter).consume(&payload.id).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "restore",
        json!({ "user": session.user.username, "path": record.original_path, "id": record.id }),
    );
    Ok(Json(json!({ "path": record.original_path })))
}

// ---------------------------------------------------------------------------
// Archive and search
// ---------------------------------------------------------------------------

async fn archive_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> AppResult<Response> {
    let session = authenticate(&state, &headers)?;
    let root = session.user.root_real.clone();

    let mut virtual_paths: Vec<String> = Vec::new();
    let mut format = ArchiveFormat::Zip;
    for (key, value) in url::form_urlencoded::parse(raw_query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "path" => virtual_paths.push(value.into_owned()),
            "format" => format = ArchiveFormat::parse(&value)?,
            _ => {}
        }
    }
    if virtual_paths.is_empty() {
        return Err(AppError::invalid_request("No paths to archive."));
    }

    let mut rel_paths = Vec::new();
    let mut hosts = Vec::new();
    for vp in &virtual_paths {
        let resolved = paths::resolve_safe(vp, &root)?;
        rel_paths.push(if resolved.normalized == "/" {
            ".".to_string()
        } else {
            resolved.normalized[1..].to_string()
        });
        hosts.push(resolved.host_path);
    }

    let adapter = LocalAdapter::new(root.clone());
    let store_mode = match format {
        ArchiveFormat::Zip => {
            let probed = adapter.probe_size(&hosts, state.config.archive_large_bytes)?;
            archive::use_store_mode(probed, state.config.archive_large_bytes)
        }
        ArchiveFormat::TarGz => false,
    };

    let stream = archive::spawn_archive(&root, &rel_paths, format, store_mode)?;
    let filename = archive::archive_filename(&rel_paths, format, chrono::Utc::now());

    state.audit.record(
        &client_ip(&headers, addr),
        "archive",
        json!({
            "user": session.user.username,
            "paths": rel_paths,
            "format": format.extension(),
            "store": store_mode,
        }),
    );

    let mut response = Body::from_stream(stream).into_response();
    let headers_out = response.headers_mut();
    headers_out.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    headers_out.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&archive::content_disposition(&filename))
            .map_err(|_| AppError::upstream("header"))?,
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct SearchPayload {
    #[serde(default)]
    path: Option<String>,
    query: String,
}

async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SearchPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = LocalAdapter::new(session.user.root_real.clone());
    let base = payload.path.as_deref().unwrap_or("/");
    let hits = adapter.search(base, &payload.query, state.config.search_max_bytes)?;
    Ok(Json(json!({ "query": payload.query, "results": hits })))
}

// ---------------------------------------------------------------------------
// S3 profile administration
// ---------------------------------------------------------------------------

async fn s3_config_list(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_admin(&session)?;
    Ok(Json(json!({ "configs": state.s3_configs.list()? })))
}

async fn s3_config_create(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(input): Json<S3ConfigInput>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_admin(&session)?;
    let profile = state.s3_configs.create(input)?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_config_create",
        json!({ "user": session.user.username, "configId": profile.id, "name": profile.name }),
    );
    Ok(Json(json!({ "config": profile.redacted() })))
}

async fn s3_config_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    RoutePath(id): RoutePath<String>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_admin(&session)?;
    // Full form including the secret, for the settings editing flow.
    Ok(Json(json!({ "config": state.s3_configs.get(&id)? })))
}

async fn s3_config_update(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RoutePath(id): RoutePath<String>,
    Json(input): Json<S3ConfigInput>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_admin(&session)?;
    let profile = state.s3_configs.update(&id, input)?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_config_update",
        json!({ "user": session.user.username, "configId": profile.id }),
    );
    Ok(Json(json!({ "config": profile.redacted() })))
}

async fn s3_config_delete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RoutePath(id): RoutePath<String>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_admin(&session)?;
    state.s3_configs.delete(&id)?;
    // Every live binding to this profile dies with it.
    state.s3_connections.on_profile_deleted(&id);
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_config_delete",
        json!({ "user": session.user.username, "configId": id }),
    );
    Ok(Json(json!({ "status": "ok" })))
}

async fn s3_config_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    RoutePath(id): RoutePath<String>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_admin(&session)?;
    let profile = state.s3_configs.get(&id)?;
    S3Adapter::new(profile)?.test_connection().await?;
    Ok(Json(json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// S3 session bindings
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    config_id: String,
}

async fn s3_connect(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<ConnectPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let profile = state.s3_configs.get(&payload.config_id)?;
    state.s3_connections.attach(&session.nonce, &profile)?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_connect",
        json!({ "user": session.user.username, "configId": profile.id }),
    );
    Ok(Json(json!({ "connected": state.s3_connections.session_configs(&session.nonce) })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectPayload {
    #[serde(default)]
    config_id: Option<String>,
}

async fn s3_disconnect(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<DisconnectPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    state.s3_connections.detach(&session.nonce, payload.config_id.as_deref());
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_disconnect",
        json!({ "user": session.user.username, "configId": payload.config_id }),
    );
    Ok(Json(json!({ "connected": state.s3_connections.session_configs(&session.nonce) })))
}

async fn s3_connections(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    Ok(Json(json!({
        "connected": state.s3_connections.session_configs(&session.nonce),
        "configs": state.s3_configs.list()?,
        "maxConnections": state.s3_connections.max_connections(),
    })))
}

// ---------------------------------------------------------------------------
// S3 file operations
// ---------------------------------------------------------------------------

fn s3_adapter(state: &AppState, session: &VerifiedSession, config_id: &str) -> AppResult<Arc<S3Adapter>> {
    state.s3_connections.resolve(&session.nonce, config_id)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3ListPayload {
    config_id: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

async fn s3_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<S3ListPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    let path = payload.path.as_deref().unwrap_or("/");
    Ok(Json(op_list(adapter.as_ref(), &session, path, payload.page, payload.page_size).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3PathQuery {
    config_id: String,
    path: String,
}

async fn s3_download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<S3PathQuery>,
) -> AppResult<Response> {
    let session = authenticate(&state, &headers)?;
    let adapter = s3_adapter(&state, &session, &query.config_id)?;
    let normalized = paths::normalize(&query.path)?;
    let bytes = adapter.read(&normalized).await?;
    let name = paths::basename(&normalized);

    state.audit.record(
        &client_ip(&headers, addr),
        "s3_download",
        json!({ "user": session.user.username, "configId": query.config_id, "path": normalized }),
    );

    let mut response = Body::from(bytes).into_response();
    let headers_out = response.headers_mut();
    headers_out.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers_out.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&archive::content_disposition(name))
            .map_err(|_| AppError::upstream("header"))?,
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3PathPayload {
    config_id: String,
    path: String,
}

async fn s3_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<S3PathPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    Ok(Json(op_preview(adapter.as_ref(), &payload.path).await?))
}

async fn s3_edit_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<S3PathQuery>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    let adapter = s3_adapter(&state, &session, &query.config_id)?;
    Ok(Json(op_edit_read(adapter.as_ref(), &query.path).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3EditPayload {
    config_id: String,
    path: String,
    content: String,
}

async fn s3_edit_write(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<S3EditPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    let result = op_edit_write(adapter.as_ref(), &payload.path, &payload.content).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_edit",
        json!({ "user": session.user.username, "configId": payload.config_id, "path": result["path"] }),
    );
    Ok(Json(result))
}

async fn s3_upload(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;

    let mut config_id: Option<String> = None;
    let mut dir = "/".to_string();
    let mut overwrite = false;
    let mut saved: Vec<String> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("configId") => {
                config_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?,
                );
            }
            Some("path") => {
                dir = field
                    .text()
                    .await
                    .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?;
            }
            Some("overwrite") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::invalid_request(format!("Malformed upload: {e}")))?;
                overwrite = matches!(raw.as_str(), "true" | "1" | "yes");
            }
            Some("files") | Some("file") => {
                let config_id = config_id
                    .as_deref()
                    .ok_or_else(|| AppError::invalid_request("configId must precede files."))?;
                let adapter = s3_adapter(&state, &session, config_id)?;
                let filename = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| AppError::invalid_request("Upload part is missing a filename."))?;
                let leaf = paths::sanitize_leaf(&filename)?.to_string();
                let base = paths::normalize(&dir)?;
                let target = if base == "/" { format!("/{leaf}") } else { format!("{base}/{leaf}") };
                if !overwrite && adapter.exists(&target).await? {
                    return Err(AppError::conflict(format!("{leaf} already exists.")));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::invalid_request(format!("Upload interrupted: {e}")))?;
                adapter.write(&target, &bytes).await?;
                saved.push(target);
            }
            _ => {}
        }
    }
    if saved.is_empty() {
        return Err(AppError::invalid_request("No files in upload."));
    }
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_upload",
        json!({ "user": session.user.username, "configId": config_id, "paths": saved }),
    );
    Ok(Json(json!({ "saved": saved })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3MkdirPayload {
    config_id: String,
    path: String,
    name: String,
}

async fn s3_mkdir(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<S3MkdirPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    let created = op_mkdir(adapter.as_ref(), &payload.path, &payload.name).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_mkdir",
        json!({ "user": session.user.username, "configId": payload.config_id, "path": created }),
    );
    Ok(Json(json!({ "path": created })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S3TransferPayload {
    config_id: String,
    from: String,
    to: String,
}

async fn s3_move(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<S3TransferPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    adapter.rename(&payload.from, &payload.to).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_move",
        json!({ "user": session.user.username, "configId": payload.config_id, "from": payload.from, "to": payload.to }),
    );
    Ok(Json(json!({ "status": "ok" })))
}

async fn s3_copy(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<S3TransferPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    adapter.copy(&payload.from, &payload.to).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_copy",
        json!({ "user": session.user.username, "configId": payload.config_id, "from": payload.from, "to": payload.to }),
    );
    Ok(Json(json!({ "status": "ok" })))
}

async fn s3_delete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<S3PathPayload>,
) -> AppResult<Json<Value>> {
    let session = authenticate(&state, &headers)?;
    require_writer(&session)?;
    let adapter = s3_adapter(&state, &session, &payload.config_id)?;
    adapter.delete(&payload.path).await?;
    state.audit.record(
        &client_ip(&headers, addr),
        "s3_delete",
        json!({ "user": session.user.username, "configId": payload.config_id, "path": payload.path }),
    );
    Ok(Json(json!({ "status": "ok" })))
}

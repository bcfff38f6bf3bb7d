use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::asset::{sanitize_file_name, ImageAsset};
use crate::config::{resolve_relative_to, AppConfig};
use crate::dispatch::{BatchWorker, DispatchError, Dispatched, Dispatcher, Job};
use crate::image_ops::{self, MergeOptions, OutputFormat, TransformError};
use crate::inference::{InferenceClient, InferenceError};
use crate::progress::{ProgressRecord, ProgressRegistry, RegistryError};

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;
const DEFAULT_FACE_MODEL_NAME: &str = "origin";
const UPLOAD_FALLBACK_NAME: &str = "upload";
const FALLBACK_NAME_PREFIX: &str = "IMG";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: ProgressRegistry,
    dispatcher: Dispatcher,
    client: InferenceClient,
    config: AppConfig,
    data_dir: PathBuf,
    output_dir: PathBuf,
    _queue_task: JoinHandle<()>,
}

impl AppState {
    /// Must be called inside a tokio runtime; the submission queue task is
    /// spawned here.
    pub fn new(
        config: AppConfig,
        data_dir: PathBuf,
        registry: ProgressRegistry,
        client: InferenceClient,
    ) -> Self {
        let output_dir = config.output_dir(&data_dir);
        let worker = BatchWorker::new(
            registry.clone(),
            client.clone(),
            config.inference.params.clone(),
            output_dir.clone(),
        );
        let (dispatcher, queue_task) =
            Dispatcher::spawn(worker, config.processing.queue_capacity);

        Self {
            inner: Arc::new(AppStateInner {
                registry,
                dispatcher,
                client,
                config,
                data_dir,
                output_dir,
                _queue_task: queue_task,
            }),
        }
    }

    pub fn registry(&self) -> &ProgressRegistry {
        &self.inner.registry
    }

    pub fn output_dir(&self) -> &StdPath {
        &self.inner.output_dir
    }

    /// The configured fallback source face, if one is set and readable.
    async fn default_source_image(&self) -> Option<ImageAsset> {
        let configured = self.inner.config.processing.default_source_image.as_ref()?;
        let path = resolve_relative_to(&self.inner.data_dir, configured);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "source".to_string());
                Some(ImageAsset::new(bytes, name))
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to read default source image; continuing without one"
                );
                None
            }
        }
    }
}

/// Build the client and registry from `config`, seed the registry from the
/// output directory, and start the submission queue.
pub fn app_state_with_config(config: AppConfig, data_dir: PathBuf) -> Result<AppState> {
    let client = InferenceClient::new(Duration::from_millis(config.inference.timeout_ms))?;
    let registry = ProgressRegistry::new();

    let output_dir = config.output_dir(&data_dir);
    if let Err(err) = registry.seed_from_dir(&output_dir) {
        warn!(
            error = %format!("{err:#}"),
            output_dir = %output_dir.display(),
            "Failed to seed progress registry; starting empty"
        );
    }

    Ok(AppState::new(config, data_dir, registry, client))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub status: String,
    pub targets: usize,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_page).post(submit_job))
        .route("/download/{counter}", get(download))
        .route("/download-and-delete/{counter}", get(download_and_delete))
        .route("/merge", post(merge_images))
        .route("/face-model", post(build_face_model))
        .route("/api/health", get(health))
        .route("/api/progress", get(list_progress))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn list_progress(State(state): State<AppState>) -> Json<Vec<ProgressRecord>> {
    state.inner.registry.reconcile();
    Json(state.inner.registry.snapshot())
}

// ─── Status page ─────────────────────────────────────────────────────────────

async fn status_page(State(state): State<AppState>) -> Html<String> {
    let removed = state.inner.registry.reconcile();
    if removed > 0 {
        info!(removed, "Dropped progress records whose artifacts are gone");
    }

    let records = state.inner.registry.snapshot();
    Html(render_status_page(&state.inner.config, &records, lan_ipv4()))
}

/// The outward-facing IPv4 address, so other devices on the LAN know where
/// to point a browser. `connect` on UDP only picks a route; nothing is sent.
fn lan_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

fn render_status_page(
    config: &AppConfig,
    records: &[ProgressRecord],
    lan_ip: Option<Ipv4Addr>,
) -> String {
    let server_address = match lan_ip {
        Some(ip) => {
            let url = format!("http://{ip}:{}/", config.server.port);
            format!("<a href=\"{url}\">{url}</a>")
        }
        None => "Failed to get server IP address.".to_string(),
    };
    let progress = if records.is_empty() {
        "<p>No .error.log or .cache.zip found locally.</p>".to_string()
    } else {
        records.iter().map(render_progress_entry).collect::<String>()
    };

    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8" />
    <title>facebatch v{version}</title>
  </head>
  <body>
    <form method="POST" enctype="multipart/form-data">
      <label>App Version = {version}</label>
      <br />
      <div>{server_address}</div>
      <br />
      <label>Source image:&nbsp;</label>
      <input type="file" name="source_image" />
      <br />
      <label>Target images:&nbsp;</label>
      <input type="file" name="target_image" multiple="multiple" />
      <br />
      <label>Name prefix:&nbsp;</label>
      <input type="text" name="name_prefix" value="{name_prefix}" />
      <br />
      <label>Reactor API:&nbsp;</label>
      <input type="text" name="reactor_api" value="{endpoint}" />
      <br />
      <label>Quality:&nbsp;</label>
      <input type="text" name="quality" value="{quality}" />
      <br />
      <label>Batches:&nbsp;</label>
      <input type="text" name="batches" value="{batches}" />
      <br />
      <input type="submit" />
    </form>
    <div>
{progress}
    </div>
  </body>
</html>
"#,
        version = env!("CARGO_PKG_VERSION"),
        name_prefix = escape_html(&config.processing.name_prefix),
        endpoint = escape_html(&config.inference.endpoint),
        quality = config.processing.quality,
        batches = config.processing.batches,
    )
}

fn render_progress_entry(record: &ProgressRecord) -> String {
    let counter = record.counter;
    match &record.output_file {
        Some(path) => {
            let file = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!(
                "      <p>{counter:04}&nbsp;-&nbsp;{file}<br /><a href=\"./download/{counter}\">Download Only</a>&nbsp;&nbsp;-&nbsp;&nbsp;<a href=\"./download-and-delete/{counter}\">Download &amp; Delete</a></p>\n",
                file = escape_html(&file),
            )
        }
        None => format!(
            "      <p>{counter:04} - In progress ( {} / {} )</p>\n",
            record.current, record.total
        ),
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ─── Downloads ───────────────────────────────────────────────────────────────

fn attachment(filename: &str, bytes: Vec<u8>) -> Response {
    let content_type = mime_guess::from_path(filename).first_or_octet_stream();
    let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', "_"));
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

async fn read_artifact(path: &StdPath) -> Result<(String, Vec<u8>), AppError> {
    let bytes = tokio::fs::read(path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("file not found: {}", path.display()))
        } else {
            AppError::Internal(format!("failed to read {}: {err}", path.display()))
        }
    })?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    Ok((filename, bytes))
}

async fn download(
    State(state): State<AppState>,
    Path(counter): Path<u64>,
) -> Result<Response, AppError> {
    let path = state.inner.registry.output_file(counter)?;
    let (filename, bytes) = read_artifact(&path).await?;
    Ok(attachment(&filename, bytes))
}

async fn download_and_delete(
    State(state): State<AppState>,
    Path(counter): Path<u64>,
) -> Result<Response, AppError> {
    let path = state.inner.registry.output_file(counter)?;
    let (filename, bytes) = read_artifact(&path).await?;

    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| AppError::Internal(format!("failed to delete {}: {e}", path.display())))?;
    state.inner.registry.remove(counter);
    info!(counter, path = %path.display(), "Artifact downloaded and deleted");

    Ok(attachment(&filename, bytes))
}

// ─── Form handling ───────────────────────────────────────────────────────────

/// A parsed multipart submission: uploaded files grouped by field name plus
/// plain text fields. Browsers send an empty part for an unused file input;
/// those are dropped.
#[derive(Debug, Default)]
struct FormData {
    files: HashMap<String, Vec<ImageAsset>>,
    fields: HashMap<String, String>,
}

impl FormData {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("multipart error: {e}")))?
        {
            let name = field.name().unwrap_or("").trim_end_matches("[]").to_string();
            let file_name = field.file_name().map(ToString::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("failed to read field {name}: {e}")))?;

            match file_name {
                Some(file_name) => {
                    if data.is_empty() {
                        continue;
                    }
                    let file_name = sanitize_file_name(&file_name, UPLOAD_FALLBACK_NAME);
                    form.files
                        .entry(name)
                        .or_default()
                        .push(ImageAsset::new(data.to_vec(), file_name));
                }
                None => {
                    form.fields
                        .insert(name, String::from_utf8_lossy(&data).into_owned());
                }
            }
        }
        Ok(form)
    }

    fn take_files(&mut self, name: &str) -> Vec<ImageAsset> {
        self.files.remove(name).unwrap_or_default()
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// Cut down to one file-name segment, since it names persisted artifacts.
    fn name_prefix(&self, fallback: &str) -> String {
        let fallback = sanitize_file_name(fallback, FALLBACK_NAME_PREFIX);
        sanitize_file_name(self.text("name_prefix").unwrap_or(&fallback), &fallback)
    }

    /// `reactor_api` when it parses as an http(s) URL, else `fallback`.
    fn endpoint(&self, fallback: &str) -> String {
        match self.text("reactor_api") {
            Some(raw) => match url::Url::parse(raw) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => raw.to_string(),
                _ => {
                    warn!(reactor_api = raw, fallback, "Ignoring unusable reactor_api");
                    fallback.to_string()
                }
            },
            None => fallback.to_string(),
        }
    }

    fn quality(&self, fallback: u8) -> u8 {
        self.text("quality")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(image_ops::clamp_quality)
            .unwrap_or(fallback)
    }

    /// Between 1 and `targets`; more batches than targets would only be empty.
    fn batches(&self, fallback: usize, targets: usize) -> usize {
        self.text("batches")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(|batches| usize::try_from(batches).unwrap_or(1))
            .unwrap_or(fallback)
            .clamp(1, targets.max(1))
    }

    fn flag(&self, name: &str, fallback: bool) -> bool {
        match self.text(name).map(str::to_ascii_lowercase).as_deref() {
            Some("1" | "true" | "on" | "yes") => true,
            Some("0" | "false" | "off" | "no") => false,
            _ => fallback,
        }
    }
}

async fn submit_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = FormData::read(multipart).await?;
    let config = &state.inner.config;

    let mut source_images = form.take_files("source_image");
    if source_images.is_empty() {
        source_images.extend(state.default_source_image().await);
    }

    let target_images = form.take_files("target_image");
    let job = Job {
        source_images,
        name_prefix: form.name_prefix(&config.processing.name_prefix),
        endpoint: form.endpoint(&config.inference.endpoint),
        quality: form.quality(config.processing.quality),
        batch_count: form.batches(config.processing.batches, target_images.len()),
        target_images,
    };
    let targets = job.target_images.len();
    info!(
        targets,
        batches = job.batch_count,
        name_prefix = %job.name_prefix,
        has_source = !job.source_images.is_empty(),
        "Job submitted"
    );

    match state.inner.dispatcher.dispatch(job).await? {
        Dispatched::Immediate(artifact) => Ok(attachment(&artifact.name, artifact.bytes)),
        Dispatched::Queued => Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                status: "queued".to_string(),
                targets,
            }),
        )
            .into_response()),
    }
}

async fn merge_images(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let mut form = FormData::read(multipart).await?;
    let config = &state.inner.config;

    let left = form
        .take_files("left_image")
        .into_iter()
        .next()
        .ok_or_else(|| AppError::BadRequest("missing left_image".to_string()))?;
    let right = form
        .take_files("right_image")
        .into_iter()
        .next()
        .ok_or_else(|| AppError::BadRequest("missing right_image".to_string()))?;

    let options = MergeOptions {
        mirror_left: form.flag("mirror", true),
        format: form
            .text("format")
            .map(OutputFormat::from_str_lossy)
            .unwrap_or_default(),
        quality: form.quality(config.processing.quality),
    };
    let name_prefix = form.name_prefix(&config.processing.name_prefix);

    let merged = tokio::task::spawn_blocking(move || {
        image_ops::merge_assets(&left, &right, &name_prefix, options)
    })
    .await
    .map_err(|e| AppError::Internal(format!("merge task failed: {e}")))??;

    Ok(attachment(&merged.name, merged.bytes))
}

async fn build_face_model(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<StatusCode, AppError> {
    let mut form = FormData::read(multipart).await?;
    let config = &state.inner.config;

    let mut faces = form.take_files("face_image");
    if faces.is_empty() {
        faces.extend(state.default_source_image().await);
    }
    if faces.is_empty() {
        return Err(AppError::BadRequest(
            "no face images were submitted and no default source image is configured".to_string(),
        ));
    }

    let endpoint = form.endpoint(&config.inference.face_model_endpoint);
    let name = form
        .text("model_name")
        .unwrap_or(DEFAULT_FACE_MODEL_NAME)
        .to_string();

    state
        .inner
        .client
        .build_face_model(&endpoint, &faces, &name)
        .await?;
    info!(faces = faces.len(), name = %name, "Face model built");

    Ok(StatusCode::NO_CONTENT)
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => AppError::NotFound(err.to_string()),
            RegistryError::NotReady(_) => AppError::Conflict(err.to_string()),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NoTargets => AppError::BadRequest(err.to_string()),
            DispatchError::Inference(inner) => inner.into(),
            DispatchError::QueueClosed => AppError::Internal(err.to_string()),
        }
    }
}

impl From<InferenceError> for AppError {
    fn from(err: InferenceError) -> Self {
        AppError::Internal(format!("Failed processing image: {err}"))
    }
}

impl From<TransformError> for AppError {
    fn from(err: TransformError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_ops::decode;
    use crate::test_support::{spawn_fake_reactor, split_color_png, FakeReactor, FAIL_MARKER};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::{tempdir, TempDir};
    use tower::{Service, ServiceExt};

    const BOUNDARY: &str = "facebatch-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, Vec<u8>),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, file_name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    struct TestApp {
        router: Router,
        state: AppState,
        data_dir: TempDir,
        reactor: FakeReactor,
    }

    async fn test_app() -> TestApp {
        test_app_with(|_| {}).await
    }

    async fn test_app_with(customize: impl FnOnce(&mut AppConfig)) -> TestApp {
        let reactor = spawn_fake_reactor().await;
        let data_dir = tempdir().expect("tempdir");

        let mut config = AppConfig::default();
        config.inference.endpoint = reactor.endpoint.clone();
        config.inference.face_model_endpoint = reactor.face_model_endpoint.clone();
        customize(&mut config);

        let state =
            app_state_with_config(config, data_dir.path().to_path_buf()).expect("app state");
        TestApp {
            router: app_router(state.clone()),
            state,
            data_dir,
            reactor,
        }
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> axum::response::Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(resp).await).unwrap()
    }

    fn header_str<'a>(resp: &'a Response, name: header::HeaderName) -> &'a str {
        resp.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    fn completed_record(app: &TestApp, file_name: &str, contents: &[u8]) -> u64 {
        let output_dir = app.state.output_dir();
        std::fs::create_dir_all(output_dir).unwrap();
        let path = output_dir.join(file_name);
        std::fs::write(&path, contents).unwrap();

        let registry = app.state.registry();
        let counter = registry.allocate_counter();
        registry.start(counter, 1);
        registry.advance(counter);
        registry.complete(counter, path);
        counter
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let mut app = test_app().await;
        let resp = send_request(&mut app.router, get_request("/api/health")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let mut app = test_app().await;
        let resp = send_request(&mut app.router, get_request("/api/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(resp).await["error"],
            "api endpoint not found: /api/nope"
        );
    }

    #[tokio::test]
    async fn test_status_page_lists_records_and_reconciles() {
        let mut app = test_app().await;
        let done = completed_record(&app, "IMG_0001_1700000000.cache.zip", b"zip");
        let gone = completed_record(&app, "gone.cache.zip", b"zip");
        std::fs::remove_file(app.state.output_dir().join("gone.cache.zip")).unwrap();

        let registry = app.state.registry();
        let running = registry.allocate_counter();
        registry.start(running, 4);
        registry.advance(running);

        let resp = send_request(&mut app.router, get_request("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let html = String::from_utf8(body_bytes(resp).await).unwrap();

        assert!(html.contains(&format!("{done:04}&nbsp;-&nbsp;IMG_0001_1700000000.cache.zip")));
        assert!(html.contains(&format!("./download/{done}")));
        assert!(html.contains(&format!("./download-and-delete/{done}")));
        assert!(html.contains(&format!("{running:04} - In progress ( 1 / 4 )")));
        assert!(!html.contains("gone.cache.zip"));
        assert_eq!(registry.lookup(gone), Err(RegistryError::NotFound(gone)));
    }

    #[tokio::test]
    async fn test_status_page_without_records() {
        let mut app = test_app().await;
        let resp = send_request(&mut app.router, get_request("/")).await;
        let html = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(html.contains("No .error.log or .cache.zip found locally."));
        assert!(html.contains("name=\"target_image\" multiple=\"multiple\""));
    }

    #[tokio::test]
    async fn test_progress_endpoint_returns_records_in_counter_order() {
        let mut app = test_app().await;
        let first = completed_record(&app, "a.error.log", b"boom");
        let registry = app.state.registry();
        let second = registry.allocate_counter();
        registry.start(second, 3);

        let resp = send_request(&mut app.router, get_request("/api/progress")).await;
        let json = body_json(resp).await;
        let records = json.as_array().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["counter"], first);
        assert!(records[0]["output_file"]
            .as_str()
            .unwrap()
            .ends_with("a.error.log"));
        assert_eq!(records[1]["counter"], second);
        assert_eq!(records[1]["total"], 3);
        assert!(records[1]["output_file"].is_null());
    }

    #[tokio::test]
    async fn test_download_serves_attachment() {
        let mut app = test_app().await;
        let counter = completed_record(&app, "IMG_0001_1.cache.zip", b"zip-bytes");

        let resp = send_request(
            &mut app.router,
            get_request(&format!("/download/{counter}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            header_str(&resp, header::CONTENT_DISPOSITION),
            "attachment; filename=\"IMG_0001_1.cache.zip\""
        );
        assert_eq!(header_str(&resp, header::CONTENT_TYPE), "application/zip");
        assert_eq!(body_bytes(resp).await, b"zip-bytes");

        assert!(app.state.output_dir().join("IMG_0001_1.cache.zip").exists());
        assert!(app.state.registry().lookup(counter).is_ok());
    }

    #[tokio::test]
    async fn test_download_and_delete_removes_file_and_record() {
        let mut app = test_app().await;
        let counter = completed_record(&app, "broken.error.log", b"Failed processing file x");

        let resp = send_request(
            &mut app.router,
            get_request(&format!("/download-and-delete/{counter}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, b"Failed processing file x");

        assert!(!app.state.output_dir().join("broken.error.log").exists());
        assert_eq!(
            app.state.registry().lookup(counter),
            Err(RegistryError::NotFound(counter))
        );

        let resp = send_request(
            &mut app.router,
            get_request(&format!("/download/{counter}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_unknown_and_running_counters() {
        let mut app = test_app().await;

        let resp = send_request(&mut app.router, get_request("/download/999")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(resp).await["error"],
            "target not found for counter 999"
        );

        let registry = app.state.registry();
        let running = registry.allocate_counter();
        registry.start(running, 2);
        let resp = send_request(
            &mut app.router,
            get_request(&format!("/download/{running}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = send_request(
            &mut app.router,
            get_request(&format!("/download-and-delete/{running}")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(registry.lookup(running).is_ok());
    }

    #[tokio::test]
    async fn test_submit_without_targets_is_bad_request() {
        let mut app = test_app().await;
        let req = multipart_request("/", &[Part::Text("name_prefix", "IMG")]);

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await["error"],
            "no target images were submitted"
        );
    }

    #[tokio::test]
    async fn test_submit_single_target_returns_image_directly() {
        let mut app = test_app().await;
        let req = multipart_request(
            "/",
            &[
                Part::File("target_image", "t.png", split_color_png(8, 6)),
                Part::Text("name_prefix", "Party"),
                Part::Text("reactor_api", "not a url"),
                Part::Text("quality", "250"),
            ],
        );

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::CONTENT_TYPE), "image/jpeg");
        let disposition = header_str(&resp, header::CONTENT_DISPOSITION).to_string();
        assert!(disposition.starts_with("attachment; filename=\"Party_"));
        assert!(disposition.ends_with(".jpg\""));

        let image = decode(&body_bytes(resp).await).unwrap();
        assert_eq!(image.dimensions(), (8, 6));
        assert!(app.state.registry().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_submit_single_target_failure_surfaces_error() {
        let mut app = test_app().await;
        let req = multipart_request(
            "/",
            &[Part::File("target_image", "t.png", FAIL_MARKER.to_vec())],
        );

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let error = body_json(resp).await["error"].as_str().unwrap().to_string();
        assert!(error.contains("wrong response [500]"));
    }

    #[tokio::test]
    async fn test_submit_many_targets_is_queued_and_completes() {
        let mut app = test_app().await;
        let req = multipart_request(
            "/",
            &[
                Part::File("source_image", "face.png", split_color_png(4, 4)),
                Part::File("target_image", "a.png", split_color_png(4, 4)),
                Part::File("target_image", "b.png", FAIL_MARKER.to_vec()),
                Part::File("target_image", "c.png", split_color_png(4, 4)),
                Part::Text("batches", "2"),
            ],
        );

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "queued");
        assert_eq!(json["targets"], 3);

        const MAX_POLLS: usize = 200;
        const POLL_INTERVAL_MS: u64 = 25;
        for _ in 0..MAX_POLLS {
            let records = app.state.registry().snapshot();
            if records.len() == 2 && records.iter().all(ProgressRecord::is_complete) {
                assert_eq!(records[0].total, 2);
                assert_eq!(records[1].total, 1);
                let first = records[0].output_file.as_ref().unwrap();
                assert!(first.to_string_lossy().ends_with(".cache.zip"));
                assert!(first.starts_with(app.data_dir.path().join("results")));
                return;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
        panic!("queued job did not complete within timeout");
    }

    #[tokio::test]
    async fn test_submit_confines_names_and_caps_batches() {
        let mut app = test_app().await;
        let req = multipart_request(
            "/",
            &[
                Part::File("target_image", "../../a.png", split_color_png(4, 4)),
                Part::File("target_image", "/tmp/b.png", FAIL_MARKER.to_vec()),
                Part::Text("name_prefix", "../../escaped"),
                Part::Text("batches", "99999999999"),
            ],
        );

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let results = app.data_dir.path().join("results");
        const MAX_POLLS: usize = 200;
        const POLL_INTERVAL_MS: u64 = 25;
        for _ in 0..MAX_POLLS {
            let records = app.state.registry().snapshot();
            if records.len() == 2 && records.iter().all(ProgressRecord::is_complete) {
                let names: Vec<String> = records
                    .iter()
                    .map(|record| {
                        let path = record.output_file.as_ref().unwrap();
                        assert_eq!(path.parent(), Some(results.as_path()));
                        path.file_name().unwrap().to_string_lossy().into_owned()
                    })
                    .collect();
                assert!(names[0].starts_with("escaped_") && names[0].ends_with(".jpg"));
                assert!(names[1].starts_with("escaped_") && names[1].ends_with(".error.log"));

                let log = std::fs::read_to_string(results.join(&names[1])).unwrap();
                assert!(log.starts_with("Failed processing file b.png:"), "{log}");
                assert!(!app.data_dir.path().join("escaped").exists());
                return;
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
        panic!("submission did not complete within timeout");
    }

    #[tokio::test]
    async fn test_merge_returns_composite() {
        let mut app = test_app().await;
        let req = multipart_request(
            "/merge",
            &[
                Part::File("left_image", "l.png", split_color_png(10, 4)),
                Part::File("right_image", "r.png", split_color_png(6, 8)),
                Part::Text("format", "png"),
                Part::Text("name_prefix", "MERGE"),
            ],
        );

        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(header_str(&resp, header::CONTENT_TYPE), "image/png");
        assert!(header_str(&resp, header::CONTENT_DISPOSITION)
            .starts_with("attachment; filename=\"MERGE_"));

        let merged = decode(&body_bytes(resp).await).unwrap();
        assert_eq!(merged.dimensions(), (5 + 3, 8));
        // Left half of the left image is red either way; the right half of
        // the right image is blue.
        assert_eq!(merged.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(merged.get_pixel(7, 0).0, [0, 0, 255, 255]);
    }

    #[tokio::test]
    async fn test_merge_rejects_missing_or_corrupt_input() {
        let mut app = test_app().await;

        let req = multipart_request(
            "/merge",
            &[Part::File("left_image", "l.png", split_color_png(4, 4))],
        );
        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "missing right_image");

        let req = multipart_request(
            "/merge",
            &[
                Part::File("left_image", "l.png", b"garbage".to_vec()),
                Part::File("right_image", "r.png", split_color_png(4, 4)),
            ],
        );
        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_face_model_uses_default_source_image() {
        let mut app = test_app_with(|config| {
            config.processing.default_source_image = Some(PathBuf::from("origin.png"));
        })
        .await;
        std::fs::write(app.data_dir.path().join("origin.png"), split_color_png(4, 4)).unwrap();

        let req = multipart_request("/face-model", &[Part::Text("model_name", "party")]);
        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let requests = app.reactor.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["name"], "party");
        assert_eq!(requests[0]["source_images"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_face_model_without_any_face_is_bad_request() {
        let mut app = test_app().await;
        let req = multipart_request("/face-model", &[Part::Text("model_name", "x")]);
        let resp = send_request(&mut app.router, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(app.reactor.requests().is_empty());
    }

    #[tokio::test]
    async fn test_state_seeds_registry_from_output_dir() {
        let reactor = spawn_fake_reactor().await;
        let data_dir = tempdir().expect("tempdir");
        let results = data_dir.path().join("results");
        std::fs::create_dir_all(&results).unwrap();
        std::fs::write(results.join("foo.cache.zip"), b"zip").unwrap();
        std::fs::write(results.join("bar.error.log"), b"log").unwrap();

        let mut config = AppConfig::default();
        config.inference.endpoint = reactor.endpoint.clone();
        let state = app_state_with_config(config, data_dir.path().to_path_buf()).unwrap();

        let records = state.registry().snapshot();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(ProgressRecord::is_complete));
    }

    #[test]
    fn test_form_parameter_fallbacks() {
        let mut form = FormData::default();
        assert_eq!(form.name_prefix("IMG"), "IMG");
        assert_eq!(form.quality(90), 90);
        assert_eq!(form.batches(3, 10), 3);
        assert_eq!(form.batches(3, 2), 2);
        assert_eq!(form.endpoint("http://fallback/"), "http://fallback/");

        for (key, value) in [
            ("name_prefix", " Trip "),
            ("quality", "0"),
            ("batches", "-4"),
            ("reactor_api", "https://gpu.local:7860/reactor/image"),
            ("mirror", "off"),
        ] {
            form.fields.insert(key.to_string(), value.to_string());
        }
        assert_eq!(form.name_prefix("IMG"), "Trip");
        assert_eq!(form.quality(90), 1);
        assert_eq!(form.batches(3, 10), 1);
        assert_eq!(
            form.endpoint("http://fallback/"),
            "https://gpu.local:7860/reactor/image"
        );
        assert!(!form.flag("mirror", true));

        form.fields.insert("quality".to_string(), "abc".to_string());
        form.fields
            .insert("reactor_api".to_string(), "ftp://gpu.local/x".to_string());
        assert_eq!(form.quality(90), 90);
        assert_eq!(form.endpoint("http://fallback/"), "http://fallback/");

        form.fields
            .insert("batches".to_string(), "99999999999".to_string());
        assert_eq!(form.batches(1, 4), 4);
        form.fields
            .insert("name_prefix".to_string(), "../../etc/cron".to_string());
        assert_eq!(form.name_prefix("IMG"), "cron");
        form.fields.insert("name_prefix".to_string(), "..".to_string());
        assert_eq!(form.name_prefix("../IMG"), "IMG");
    }

    #[test]
    fn test_status_page_shows_version_and_lan_address() {
        let mut config = AppConfig::default();
        config.server.port = 9123;

        let html = render_status_page(&config, &[], Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(html.contains(&format!("App Version = {}", env!("CARGO_PKG_VERSION"))));
        let url = "http://192.168.1.20:9123/";
        assert!(html.contains(&format!("<a href=\"{url}\">{url}</a>")));

        let html = render_status_page(&config, &[], None);
        assert!(html.contains("Failed to get server IP address."));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<a href=\"x\">&'"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }
}

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::config::ModeConfig;
use crate::error::{CoreError, ErrorKind};
use crate::model::{GenerateParams, Job, JobParams, Priority, SrParams};
use crate::AppState;

/// `POST /upload`: stores the first multipart field's bytes under a fresh
/// content-addressed ref for a subsequent `job:submit`'s `initImageRef`.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let field = match multipart.next_field().await {
        Ok(Some(field)) => field,
        Ok(None) => return (StatusCode::BAD_REQUEST, "missing file part").into_response(),
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let content_type = field
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let bytes = match field.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let reference = state.filerefs.put(bytes, content_type);
    (StatusCode::OK, Json(json!({"fileRef": reference}))).into_response()
}

/// `GET /storage/:key`: serves a previously completed job's output bytes.
pub async fn get_storage(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.outputs.get(&key) {
        Some(blob) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, blob.mime.clone())], blob.bytes.to_vec()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /healthz`: 200 plus a `system:status` snapshot, reused verbatim from
/// the WS protocol so uptime checks and clients agree on shape.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.router.system_status_value())
}

/// `POST /admin/modes/reload`: re-reads the mode document from disk and
/// atomically swaps it in. Does not touch whatever mode is currently loaded;
/// the new document takes effect on the next `job:submit`-triggered or
/// explicit mode switch.
pub async fn reload_modes(State(state): State<AppState>) -> Response {
    match ModeConfig::load(state.modes_path.as_ref()) {
        Ok(config) => {
            state.pool.reload_modes(config);
            (StatusCode::OK, Json(json!({"reloaded": true}))).into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"kind": "BadRequest", "message": err.to_string()})),
        )
            .into_response(),
    }
}

/// `GET /metrics`: Prometheus text exposition. Scraping cadence is the
/// collector's concern, not this process's.
pub async fn metrics() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::encode(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyGenerateRequest {
    pub prompt: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_cfg")]
    pub cfg: f32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_size() -> String {
    "512x512".to_string()
}
fn default_steps() -> u32 {
    20
}
fn default_cfg() -> f32 {
    7.5
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySrRequest {
    pub init_image_ref: String,
    #[serde(default = "default_magnitude")]
    pub magnitude: u32,
}

fn default_magnitude() -> u32 {
    2
}

/// Feature-parallel adapter kept for clients still speaking the pre-WS HTTP
/// surface: synthesizes a `generate` job and blocks on its result.
pub async fn legacy_generate(State(state): State<AppState>, Json(body): Json<LegacyGenerateRequest>) -> Response {
    let params = GenerateParams {
        prompt: body.prompt,
        size: body.size,
        steps: body.steps,
        cfg: body.cfg,
        seed: body.seed.unwrap_or_else(|| rand::random()),
        superres: false,
        superres_magnitude: 1,
        init_image_ref: None,
        denoise_strength: None,
    };
    submit_and_wait(&state, JobParams::Generate(params)).await
}

pub async fn legacy_superres(State(state): State<AppState>, Json(body): Json<LegacySrRequest>) -> Response {
    submit_and_wait(
        &state,
        JobParams::Sr(SrParams {
            init_image_ref: body.init_image_ref,
            magnitude: body.magnitude,
        }),
    )
    .await
}

async fn submit_and_wait(state: &AppState, params: JobParams) -> Response {
    let job = Job::new("http".to_string(), Priority::Normal, params, None);
    let rx = match state.pool.submit(job) {
        Ok(rx) => rx,
        Err(err) => return error_response(err),
    };
    match rx.await {
        Ok(Ok(result)) => (StatusCode::OK, Json(result)).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "worker pool closed unexpectedly").into_response(),
    }
}

fn error_response(err: CoreError) -> Response {
    let status = match err.kind() {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::RefNotFound | ErrorKind::ModeNotFound => StatusCode::NOT_FOUND,
        ErrorKind::QueueFull | ErrorKind::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DreamBusy => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ModelLoadFailed | ErrorKind::WorkerFailure => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Canceled | ErrorKind::UnknownType => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({"kind": err.kind(), "message": err.to_string()}))).into_response()
}

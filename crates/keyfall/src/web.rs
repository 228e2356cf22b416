//! HTTP API for Keyfall.
//!
//! Serves parsed note data from the MIDI store, accepts uploads, and exposes
//! the conversion job engine for polling.

use crate::error::{ApiError, ApiResult};
use crate::job_system::{EngineStatus, JobEngine, JobOutcome, SubmitOutcome};
use crate::store::{extension_of, is_midi_path, sanitize_filename, MidiStore};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use keyfallconf::UploadConfig;
use midi_notes::ParsedFile;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state for web handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: JobEngine,
    pub store: MidiStore,
    pub upload: Arc<UploadConfig>,
}

impl AppState {
    pub fn new(engine: JobEngine, store: MidiStore, upload: UploadConfig) -> Self {
        Self {
            engine,
            store,
            upload: Arc::new(upload),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.upload.max_bytes;

    Router::new()
        .route("/", get(serve_root))
        .route("/api/health", get(health))
        .route("/api/upload", post(upload))
        .route("/api/midi-files", get(list_midi_files))
        .route("/api/midi", get(get_default_midi))
        .route("/api/midi/{name}", get(get_midi))
        .route("/api/job/status", get(job_status))
        .route("/api/job/result", get(job_result))
        .route("/api/updates", get(check_updates))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve root discovery endpoint
async fn serve_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "Keyfall",
        "version": env!("CARGO_PKG_VERSION"),
        "links": {
            "health": "/api/health",
            "upload": "/api/upload",
            "midi_files": "/api/midi-files",
            "midi": "/api/midi/{name}",
            "job_status": "/api/job/status",
            "job_result": "/api/job/result",
            "updates": "/api/updates?since={rfc3339}",
        }
    }))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "keyfall",
    }))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum UploadResponse {
    Stored {
        filename: String,
    },
    Processing {
        job_id: uuid::Uuid,
        audio_filename: String,
    },
    Busy {
        message: String,
    },
}

/// Accept one file in the multipart field `file`.
///
/// MIDI files go straight into the store. Audio is kept in the upload
/// directory and handed to the job engine.
#[tracing::instrument(
    name = "http.upload",
    skip(state, multipart),
    fields(upload.filename = tracing::field::Empty, upload.bytes = tracing::field::Empty)
)]
async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> ApiResult<Response> {
    let mut received = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let raw_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::Validation(e.body_text()))?;
        received = Some((raw_name, bytes));
        break;
    }

    let (raw_name, bytes) =
        received.ok_or_else(|| ApiError::Validation("no file part in request".to_string()))?;
    if raw_name.is_empty() {
        return Err(ApiError::Validation("no file selected".to_string()));
    }
    let filename = sanitize_filename(&raw_name)
        .ok_or_else(|| ApiError::Validation(format!("unusable file name '{}'", raw_name)))?;
    if !extension_of(&filename).is_some_and(|ext| state.upload.allows(&ext)) {
        return Err(ApiError::Validation(format!(
            "file type not allowed: {} (allowed: {})",
            filename,
            state.upload.allowed_extensions.join(", ")
        )));
    }
    if bytes.is_empty() {
        return Err(ApiError::Validation(format!("{} is empty", filename)));
    }

    let span = tracing::Span::current();
    span.record("upload.filename", filename.as_str());
    span.record("upload.bytes", bytes.len());

    if is_midi_path(std::path::Path::new(&filename)) {
        state.store.store_midi(&filename, &bytes).await?;
        tracing::info!(midi.filename = %filename, "Stored uploaded MIDI file");
        return Ok(Json(UploadResponse::Stored { filename }).into_response());
    }

    let audio_filename = state.store.store_audio(&filename, &bytes, Utc::now()).await?;
    let audio_path = state.store.upload_dir().join(&audio_filename);

    let response = match state.engine.submit(audio_path, filename) {
        SubmitOutcome::Accepted(job_id) => (
            StatusCode::ACCEPTED,
            Json(UploadResponse::Processing {
                job_id,
                audio_filename,
            }),
        )
            .into_response(),
        SubmitOutcome::Rejected => Json(UploadResponse::Busy {
            message: "A conversion is already running. Try again when it finishes.".to_string(),
        })
        .into_response(),
    };
    Ok(response)
}

#[derive(Debug, Serialize)]
struct MidiFileList {
    midi_files: Vec<String>,
    count: usize,
    last_update: Option<DateTime<Utc>>,
}

#[tracing::instrument(name = "http.midi.list", skip(state))]
async fn list_midi_files(State(state): State<AppState>) -> ApiResult<Json<MidiFileList>> {
    let midi_files = state.store.list().await?;
    Ok(Json(MidiFileList {
        count: midi_files.len(),
        midi_files,
        last_update: state.engine.last_update_time(),
    }))
}

async fn get_default_midi(State(state): State<AppState>) -> ApiResult<Json<ParsedFile>> {
    let name = state.upload.sample_name.clone();
    load_parsed(&state, &name).await.map(Json)
}

#[tracing::instrument(name = "http.midi.get", skip(state))]
async fn get_midi(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<ParsedFile>> {
    load_parsed(&state, &name).await.map(Json)
}

/// Read and parse a stored file. Parsing runs on the blocking pool.
async fn load_parsed(state: &AppState, name: &str) -> ApiResult<ParsedFile> {
    let path = state
        .store
        .resolve(name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("MIDI file '{}'", name)))?;

    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let bytes = tokio::fs::read(&path).await?;

    let task_name = filename.clone();
    let parsed = tokio::task::spawn_blocking(move || midi_notes::parse_midi(&task_name, &bytes))
        .await
        .map_err(|e| ApiError::Internal(format!("parser task failed: {}", e)))?;

    parsed.map_err(|e| ApiError::Parse {
        filename,
        message: e.to_string(),
    })
}

async fn job_status(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.engine.status())
}

async fn job_result(State(state): State<AppState>) -> ApiResult<Json<JobOutcome>> {
    state
        .engine
        .latest_result()
        .map(Json)
        .ok_or(ApiError::NoHistory)
}

#[derive(Debug, Deserialize)]
struct UpdatesQuery {
    since: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateCheck {
    has_update: bool,
    last_update: Option<DateTime<Utc>>,
}

/// Without `since`, any conversion so far counts as an update.
async fn check_updates(
    State(state): State<AppState>,
    Query(query): Query<UpdatesQuery>,
) -> ApiResult<Json<UpdateCheck>> {
    let last_update = state.engine.last_update_time();
    let has_update = match query.since.as_deref().filter(|s| !s.is_empty()) {
        Some(since) => {
            let since = DateTime::parse_from_rfc3339(since)
                .map_err(|e| ApiError::Validation(format!("invalid 'since' timestamp: {}", e)))?
                .with_timezone(&Utc);
            state.engine.has_update_since(since)
        }
        None => last_update.is_some(),
    };

    Ok(Json(UpdateCheck {
        has_update,
        last_update,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{Converter, ConverterOutput};
    use crate::job_system::EngineSettings;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct NeverCalled;

    #[async_trait]
    impl Converter for NeverCalled {
        async fn convert(
            &self,
            _audio: &std::path::Path,
            _output_dir: &std::path::Path,
        ) -> anyhow::Result<ConverterOutput> {
            anyhow::bail!("converter should not run in these tests")
        }
    }

    async fn setup_test_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = MidiStore::new(temp_dir.path().join("midi"), temp_dir.path().join("uploads"));
        store.ensure_dirs().await.unwrap();
        store.ensure_sample("sample").await.unwrap();

        let engine = JobEngine::new(
            Arc::new(NeverCalled),
            store.clone(),
            EngineSettings {
                work_root: temp_dir.path().to_path_buf(),
                scratch_dir: temp_dir.path().join("scratch"),
                artifact_name: "piano.mid".to_string(),
            },
        );

        (
            AppState::new(engine, store, UploadConfig::default()),
            temp_dir,
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _temp_dir) = setup_test_state().await;
        let (status, json) = get_json(router(state), "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_list_midi_files() {
        let (state, _temp_dir) = setup_test_state().await;
        let (status, json) = get_json(router(state), "/api/midi-files").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["midi_files"], serde_json::json!(["sample"]));
        assert_eq!(json["count"], 1);
        assert!(json["last_update"].is_null());
    }

    #[tokio::test]
    async fn test_default_fetch_serves_sample() {
        let (state, _temp_dir) = setup_test_state().await;
        let (status, json) = get_json(router(state), "/api/midi").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filename"], "sample.mid");
        assert_eq!(json["tempo"], 120.0);
        assert_eq!(json["time_signature"], "4/4");
        assert_eq!(json["ticks_per_beat"], 480);
        assert_eq!(json["duration"], 4.0);
        assert_eq!(json["tracks"][0]["track_name"], "Piano");
        assert_eq!(json["tracks"][0]["notes"][0]["note"], 60);
        assert_eq!(json["tracks"][0]["notes"][0]["time"], 0.0);
        assert_eq!(json["tracks"][0]["notes"][0]["duration"], 0.5);
    }

    #[tokio::test]
    async fn test_fetch_accepts_extension() {
        let (state, _temp_dir) = setup_test_state().await;
        let (status, json) = get_json(router(state), "/api/midi/sample.mid").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filename"], "sample.mid");
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let (state, _temp_dir) = setup_test_state().await;
        let (status, json) = get_json(router(state), "/api/midi/nope").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert!(json.get("tracks").is_none());
    }

    #[tokio::test]
    async fn test_fetch_rejects_traversal() {
        let (state, temp_dir) = setup_test_state().await;
        std::fs::write(
            temp_dir.path().join("secret.mid"),
            midi_notes::sample_file(),
        )
        .unwrap();

        let (status, _) = get_json(router(state), "/api/midi/..%2Fsecret").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_parse_error() {
        let (state, _temp_dir) = setup_test_state().await;
        state.store.store_midi("broken.mid", b"MThd\x00\x00").await.unwrap();

        let (status, json) = get_json(router(state), "/api/midi/broken").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["error"]["code"], "PARSE_ERROR");
    }

    #[tokio::test]
    async fn test_job_endpoints_before_any_job() {
        let (state, _temp_dir) = setup_test_state().await;

        let (status, json) = get_json(router(state.clone()), "/api/job/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!({"state": "idle"}));

        let (status, json) = get_json(router(state), "/api/job/result").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "NO_HISTORY");
    }

    #[tokio::test]
    async fn test_updates() {
        let (state, _temp_dir) = setup_test_state().await;

        let (status, json) =
            get_json(router(state.clone()), "/api/updates?since=2024-01-01T00:00:00Z").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["has_update"], false);
        assert!(json["last_update"].is_null());

        let (status, json) = get_json(router(state), "/api/updates?since=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_cors_headers_present() {
        let (state, _temp_dir) = setup_test_state().await;
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
    }
}

//! Upload and conversion flows through the full router.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use keyfall::{
    router, AppState, Converter, ConverterOutput, EngineSettings, JobEngine, MidiStore,
};
use keyfallconf::UploadConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;

/// Records what it was asked to convert, waits for `gate` if set, then
/// writes the sample file as its artifact.
#[derive(Default)]
struct FakeConverter {
    gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    exit_code: i32,
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(&self, audio: &Path, output_dir: &Path) -> anyhow::Result<ConverterOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((audio.to_path_buf(), output_dir.to_path_buf()));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.exit_code == 0 {
            tokio::fs::write(output_dir.join("piano.mid"), midi_notes::sample_file()).await?;
        }
        Ok(ConverterOutput {
            exit_code: Some(self.exit_code),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                "transcription failed".to_string()
            },
            timed_out: false,
        })
    }
}

struct Harness {
    app: Router,
    engine: JobEngine,
    converter: Arc<FakeConverter>,
    dir: TempDir,
}

async fn harness(converter: FakeConverter) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = MidiStore::new(dir.path().join("midi_files"), dir.path().join("uploads"));
    store.ensure_dirs().await.unwrap();
    store.ensure_sample("sample").await.unwrap();

    let converter = Arc::new(converter);
    let engine = JobEngine::new(
        converter.clone(),
        store.clone(),
        EngineSettings {
            work_root: dir.path().to_path_buf(),
            scratch_dir: dir.path().join("scratch"),
            artifact_name: "piano.mid".to_string(),
        },
    );
    let app = router(AppState::new(engine.clone(), store, UploadConfig::default()));

    Harness {
        app,
        engine,
        converter,
        dir,
    }
}

fn upload_request(filename: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "keyfall-test-boundary";
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn midi_upload_is_stored_and_served() {
    let h = harness(FakeConverter::default()).await;

    let (status, json) = send(&h.app, upload_request("etude.mid", &midi_notes::sample_file())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "stored");
    assert_eq!(json["filename"], "etude.mid");

    let (_, list) = get(&h.app, "/api/midi-files").await;
    assert_eq!(list["midi_files"], serde_json::json!(["etude", "sample"]));
    assert_eq!(list["count"], 2);

    let (status, parsed) = get(&h.app, "/api/midi/etude").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parsed["filename"], "etude.mid");

    // Direct MIDI uploads never start a job.
    assert!(h.converter.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn listed_names_are_fetchable() {
    let h = harness(FakeConverter::default()).await;

    for filename in ["Etude.MID", "my..song.mid"] {
        let (status, _) = send(&h.app, upload_request(filename, &midi_notes::sample_file())).await;
        assert_eq!(status, StatusCode::OK, "{filename}");
    }

    let (_, list) = get(&h.app, "/api/midi-files").await;
    assert_eq!(
        list["midi_files"],
        serde_json::json!(["Etude", "my..song", "sample"])
    );

    for name in list["midi_files"].as_array().unwrap() {
        let name = name.as_str().unwrap();
        let (status, parsed) = get(&h.app, &format!("/api/midi/{}", name)).await;
        assert_eq!(status, StatusCode::OK, "{name}");
        assert_eq!(parsed["tracks"][0]["notes"].as_array().unwrap().len(), 8);
    }

    let (status, _) = get(&h.app, "/api/midi/%2E%2E").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn audio_upload_converts_in_background() {
    let h = harness(FakeConverter::default()).await;

    let (status, json) = send(&h.app, upload_request("my take.wav", b"RIFF....WAVE")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "processing");
    assert!(json["job_id"].is_string());
    let audio_filename = json["audio_filename"].as_str().unwrap().to_string();
    assert!(audio_filename.starts_with("my_take_"));
    assert!(audio_filename.ends_with(".wav"));
    assert!(h.dir.path().join("uploads").join(&audio_filename).exists());

    assert!(h.engine.wait_idle(WAIT).await);

    let (status, result) = get(&h.app, "/api/job/result").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "completed");
    let midi_filename = result["midi_filename"].as_str().unwrap().to_string();
    assert!(midi_filename.starts_with("my_take_"));

    // The converter saw the audio relative to the work root.
    let calls = h.converter.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, Path::new("uploads").join(&audio_filename));
    assert!(!calls[0].1.exists());

    let stem = midi_filename.trim_end_matches(".mid");
    let (status, parsed) = get(&h.app, &format!("/api/midi/{}", stem)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parsed["tracks"][0]["notes"].as_array().unwrap().len(), 8);

    let (_, updates) = get(&h.app, "/api/updates?since=2000-01-01T00:00:00Z").await;
    assert_eq!(updates["has_update"], true);
    let last = updates["last_update"].as_str().unwrap().to_string();

    let (_, updates) = get(&h.app, &format!("/api/updates?since={}", last.replace('+', "%2B"))).await;
    assert_eq!(updates["has_update"], false);
}

#[tokio::test]
async fn second_audio_upload_while_busy_is_not_an_error() {
    let gate = Arc::new(Notify::new());
    let h = harness(FakeConverter {
        gate: Some(gate.clone()),
        ..Default::default()
    })
    .await;

    let (status, _) = send(&h.app, upload_request("first.wav", b"RIFF")).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, job_status) = get(&h.app, "/api/job/status").await;
    assert_eq!(job_status["state"], "busy");
    assert_eq!(job_status["job"]["status"], "running");
    assert_eq!(job_status["job"]["original_filename"], "first.wav");

    let (status, json) = send(&h.app, upload_request("second.mp3", b"ID3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "busy");

    gate.notify_one();
    assert!(h.engine.wait_idle(WAIT).await);

    let history = h.engine.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].original_filename, "first.wav");

    let (_, job_status) = get(&h.app, "/api/job/status").await;
    assert_eq!(job_status, serde_json::json!({"state": "idle"}));
}

#[tokio::test]
async fn failed_conversion_is_reported_by_polling() {
    let h = harness(FakeConverter {
        exit_code: 1,
        ..Default::default()
    })
    .await;

    let (status, _) = send(&h.app, upload_request("noise.flac", b"fLaC")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(h.engine.wait_idle(WAIT).await);

    let (status, result) = get(&h.app, "/api/job/result").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "failed");
    assert!(result["error"]
        .as_str()
        .unwrap()
        .contains("transcription failed"));

    let (_, list) = get(&h.app, "/api/midi-files").await;
    assert_eq!(list["count"], 1);
    assert!(list["last_update"].is_null());
}

#[tokio::test]
async fn rejected_uploads() {
    let h = harness(FakeConverter::default()).await;

    let (status, json) = send(&h.app, upload_request("setup.exe", b"MZ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(&h.app, upload_request("", b"data")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.app, upload_request("empty.wav", b"")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.engine.history().is_empty());
    assert!(h.converter.calls.lock().unwrap().is_empty());
}

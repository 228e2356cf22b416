//! Single-slot conversion job engine.
//!
//! At most one conversion runs at a time. `submit` either occupies the slot
//! and hands the job to a background task, or reports that the slot is
//! taken; there is no queue. Terminal jobs are appended to an in-memory
//! history that clients poll through `status` and `latest_result`.

use crate::converter::Converter;
use crate::store::MidiStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use keyfallconf::KeyfallConfig;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

/// One conversion, from acceptance to its terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    pub audio_path: PathBuf,
    pub working_dir: PathBuf,
    pub original_filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub midi_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Set when the working directory could not be removed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
}

impl Job {
    /// The client-facing outcome, or None while still running.
    pub fn outcome(&self) -> Option<JobOutcome> {
        let completed_at = self.completion_time.unwrap_or(self.start_time);
        match self.status {
            JobStatus::Running => None,
            JobStatus::Completed => Some(JobOutcome::Completed {
                midi_filename: self.midi_filename.clone().unwrap_or_default(),
                completed_at,
            }),
            JobStatus::Failed => Some(JobOutcome::Failed {
                error: self.error_text.clone().unwrap_or_default(),
                completed_at,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        midi_filename: String,
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
        completed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineStatus {
    Idle,
    Busy { job: Job },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(Uuid),
    /// Another conversion holds the slot. Not an error; try again later.
    Rejected,
}

/// Filesystem settings the engine needs for each run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Converter working directory; audio paths are handed over relative to it.
    pub work_root: PathBuf,
    /// Parent of the per-job working directories.
    pub scratch_dir: PathBuf,
    /// File the converter must leave in the working directory.
    pub artifact_name: String,
}

impl EngineSettings {
    pub fn from_config(config: &KeyfallConfig) -> Self {
        Self {
            work_root: config.paths.work_root.clone(),
            scratch_dir: config.paths.scratch_dir.clone(),
            artifact_name: config.converter.artifact_name.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    current: Option<Job>,
    last_update: Option<DateTime<Utc>>,
    history: Vec<Job>,
}

/// Cheaply cloneable handle; all clones share one slot and one history.
#[derive(Clone)]
pub struct JobEngine {
    state: Arc<Mutex<EngineState>>,
    converter: Arc<dyn Converter>,
    store: MidiStore,
    settings: Arc<EngineSettings>,
}

impl JobEngine {
    pub fn new(converter: Arc<dyn Converter>, store: MidiStore, settings: EngineSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState::default())),
            converter,
            store,
            settings: Arc::new(settings),
        }
    }

    // A panic while holding the lock cannot leave EngineState half-written:
    // every mutation is a plain field assignment or push.
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the slot for `audio_path` and start converting it in the
    /// background. Must be called from within a tokio runtime.
    pub fn submit(&self, audio_path: PathBuf, original_filename: String) -> SubmitOutcome {
        let job = {
            let mut state = self.lock();
            if let Some(running) = &state.current {
                tracing::warn!(
                    job.running = %running.id,
                    job.original_filename = %original_filename,
                    "Conversion rejected, slot busy"
                );
                return SubmitOutcome::Rejected;
            }

            let id = Uuid::new_v4();
            let job = Job {
                id,
                status: JobStatus::Running,
                start_time: Utc::now(),
                audio_path,
                working_dir: self.settings.scratch_dir.join(format!("job-{}", id)),
                original_filename,
                midi_filename: None,
                error_text: None,
                completion_time: None,
                cleanup_error: None,
            };
            state.current = Some(job.clone());
            job
        };

        tracing::info!(
            job.id = %job.id,
            job.original_filename = %job.original_filename,
            job.audio_path = %job.audio_path.display(),
            "Conversion accepted"
        );

        let id = job.id;
        let engine = self.clone();
        tokio::spawn(async move { engine.execute(job).await });

        SubmitOutcome::Accepted(id)
    }

    /// Run the job to a terminal state. Never panics and always releases
    /// the slot.
    async fn execute(self, job: Job) {
        let run = AssertUnwindSafe(self.run(&job)).catch_unwind().await;

        let result = match run {
            Ok(Ok(midi_filename)) => Ok(midi_filename),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(format!("conversion panicked: {}", panic_message(&*panic))),
        };

        let cleanup_error = match tokio::fs::remove_dir_all(&job.working_dir).await {
            Ok(()) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(
                    job.id = %job.id,
                    job.working_dir = %job.working_dir.display(),
                    error = %e,
                    "Failed to remove job working directory"
                );
                Some(e.to_string())
            }
        };

        self.finish(job, result, cleanup_error);
    }

    async fn run(&self, job: &Job) -> Result<String> {
        tokio::fs::create_dir_all(&self.settings.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create scratch directory {}",
                    self.settings.scratch_dir.display()
                )
            })?;
        tokio::fs::create_dir(&job.working_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create working directory {}",
                    job.working_dir.display()
                )
            })?;

        let output_dir = tokio::fs::canonicalize(&job.working_dir).await?;
        let input = self.converter_input(&job.audio_path).await;

        let output = self.converter.convert(&input, &output_dir).await?;
        tracing::debug!(
            job.id = %job.id,
            converter.exit_code = ?output.exit_code,
            "Converter exited"
        );
        if !output.succeeded() {
            anyhow::bail!(output.failure_text());
        }

        let artifact = output_dir.join(&self.settings.artifact_name);
        if !tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
            anyhow::bail!(
                "converter exited successfully but produced no {}",
                self.settings.artifact_name
            );
        }

        self.store
            .import_artifact(&artifact, &job.original_filename, Utc::now())
            .await
            .context("Failed to copy converted MIDI into the store")
    }

    /// The audio path as the converter should see it: relative to the work
    /// root when it lives underneath it, absolute otherwise.
    async fn converter_input(&self, audio: &Path) -> PathBuf {
        let (Ok(audio_abs), Ok(root_abs)) = (
            tokio::fs::canonicalize(audio).await,
            tokio::fs::canonicalize(&self.settings.work_root).await,
        ) else {
            return audio.to_path_buf();
        };

        match audio_abs.strip_prefix(&root_abs) {
            Ok(relative) => relative.to_path_buf(),
            Err(_) => audio_abs,
        }
    }

    /// Record the terminal state, append to history and free the slot, all
    /// under one lock.
    fn finish(&self, mut job: Job, result: Result<String, String>, cleanup_error: Option<String>) {
        let now = Utc::now();
        let duration_secs = (now - job.start_time).num_milliseconds() as f64 / 1000.0;
        job.completion_time = Some(now);
        job.cleanup_error = cleanup_error;

        let mut state = self.lock();
        match result {
            Ok(midi_filename) => {
                tracing::info!(
                    job.id = %job.id,
                    job.midi_filename = %midi_filename,
                    job.duration_secs = duration_secs,
                    "Conversion completed"
                );
                job.status = JobStatus::Completed;
                job.midi_filename = Some(midi_filename);
                state.last_update = Some(now);
            }
            Err(error) => {
                tracing::error!(
                    job.id = %job.id,
                    job.duration_secs = duration_secs,
                    job.error = %error,
                    "Conversion failed"
                );
                job.status = JobStatus::Failed;
                job.error_text = Some(error);
            }
        }
        state.history.push(job);
        state.current = None;
    }

    pub fn status(&self) -> EngineStatus {
        match &self.lock().current {
            Some(job) => EngineStatus::Busy { job: job.clone() },
            None => EngineStatus::Idle,
        }
    }

    /// Outcome of the most recently finished job, if any.
    pub fn latest_result(&self) -> Option<JobOutcome> {
        self.lock().history.last().and_then(Job::outcome)
    }

    /// When a conversion last added a file to the store.
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.lock().last_update
    }

    /// Whether the store changed strictly after `since`.
    pub fn has_update_since(&self, since: DateTime<Utc>) -> bool {
        self.last_update_time().is_some_and(|t| t > since)
    }

    /// Every finished job, oldest first.
    pub fn history(&self) -> Vec<Job> {
        self.lock().history.clone()
    }

    /// Poll until the slot is free. Returns false if `limit` elapses first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.lock().current.is_none() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

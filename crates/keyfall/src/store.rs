//! On-disk file store for MIDI files and uploaded audio.
//!
//! MIDI files live flat in `midi_dir` and are addressed by their stem.
//! Audio uploads are kept in `upload_dir` under timestamped names so two
//! uploads of the same song never collide.

use chrono::{DateTime, Utc};
use keyfallconf::PathsConfig;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

const MIDI_EXTENSIONS: [&str; 2] = ["mid", "midi"];

/// Directory-backed store shared by the web handlers and the job engine.
#[derive(Debug, Clone)]
pub struct MidiStore {
    midi_dir: PathBuf,
    upload_dir: PathBuf,
}

impl MidiStore {
    pub fn new(midi_dir: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            midi_dir: midi_dir.into(),
            upload_dir: upload_dir.into(),
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(&paths.midi_dir, &paths.upload_dir)
    }

    pub fn midi_dir(&self) -> &Path {
        &self.midi_dir
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Create both directories if missing.
    pub async fn ensure_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.midi_dir).await?;
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        Ok(())
    }

    /// Write the bundled C-major sample as `<name>.mid` unless it already
    /// exists. Returns true when a file was written.
    pub async fn ensure_sample(&self, name: &str) -> io::Result<bool> {
        let path = self.midi_dir.join(format!("{}.mid", name));
        if tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::write(&path, midi_notes::sample_file()).await?;
        tracing::info!(path = %path.display(), "Generated sample MIDI file");
        Ok(true)
    }

    /// Stems of every stored MIDI file, sorted.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.midi_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(stem) = midi_stem(&entry.path()) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Map a requested name to a stored file.
    ///
    /// `name` is either a stem as returned by `list`, or a full file name
    /// with its `.mid`/`.midi` extension in any case. Anything that is not a
    /// single plain path component never resolves.
    pub async fn resolve(&self, name: &str) -> Option<PathBuf> {
        if !is_plain_name(name) {
            return None;
        }

        let mut entries = tokio::fs::read_dir(&self.midi_dir).await.ok()?;
        let mut matches = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !requested_as(&path, name) {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                matches.push(path);
            }
        }

        // An exact file name beats a stem match; otherwise `.mid` sorts
        // ahead of `.midi`.
        matches.sort();
        let exact = matches
            .iter()
            .position(|p| p.file_name().and_then(|n| n.to_str()) == Some(name));
        match exact {
            Some(i) => Some(matches.swap_remove(i)),
            None => matches.into_iter().next(),
        }
    }

    /// Store an uploaded MIDI file under its own (sanitized) name,
    /// replacing any file of the same name.
    pub async fn store_midi(&self, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let path = self.midi_dir.join(filename);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Store uploaded audio as `<stem>_<YYYYMMDD_HHMMSS>.<ext>` and return
    /// that name.
    pub async fn store_audio(
        &self,
        filename: &str,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> io::Result<String> {
        let path = Path::new(filename);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(filename);
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let base = format!("{}_{}", stem, timestamp(now));
        let stored = write_unique(&self.upload_dir, &base, ext, bytes).await?;
        Ok(stored)
    }

    /// Copy a converter artifact into the MIDI directory as
    /// `<original stem>_<YYYYMMDD_HHMMSS>.mid` (with `_<n>` appended on
    /// collision) and return the new file name.
    pub async fn import_artifact(
        &self,
        artifact: &Path,
        original_filename: &str,
        now: DateTime<Utc>,
    ) -> io::Result<String> {
        let bytes = tokio::fs::read(artifact).await?;
        let stem = Path::new(original_filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("converted");

        let base = format!("{}_{}", stem, timestamp(now));
        write_unique(&self.midi_dir, &base, "mid", &bytes).await
    }
}

/// Create `<dir>/<base>.<ext>`, or `<base>_1.<ext>`, `<base>_2.<ext>`, ...
/// if taken. `create_new` makes the claim atomic.
async fn write_unique(dir: &Path, base: &str, ext: &str, bytes: &[u8]) -> io::Result<String> {
    let mut attempt = 0u32;
    loop {
        let stem = if attempt == 0 {
            base.to_string()
        } else {
            format!("{}_{}", base, attempt)
        };
        let name = if ext.is_empty() {
            stem
        } else {
            format!("{}.{}", stem, ext)
        };

        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(&name))
            .await;

        match opened {
            Ok(mut file) => {
                file.write_all(bytes).await?;
                file.flush().await?;
                return Ok(name);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Stem of a MIDI file path, the name `list` reports it under.
fn midi_stem(path: &Path) -> Option<&str> {
    if !is_midi_path(path) {
        return None;
    }
    path.file_stem().and_then(|s| s.to_str())
}

/// Whether a request for `name` addresses the file at `path`: either by
/// its listed stem or by its full name with the extension in any case.
fn requested_as(path: &Path, name: &str) -> bool {
    let Some(stem) = midi_stem(path) else {
        return false;
    };
    if stem == name {
        return true;
    }
    let requested = Path::new(name);
    is_midi_path(requested)
        && requested.file_stem().and_then(|s| s.to_str()) == Some(stem)
        && path.extension().map(|e| e.to_ascii_lowercase())
            == requested.extension().map(|e| e.to_ascii_lowercase())
}

/// A single normal path component with no separators.
fn is_plain_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Whether the path ends in `.mid` or `.midi` (any case).
pub fn is_midi_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MIDI_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Lowercase extension without the dot, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Reduce a client-supplied file name to something safe to join onto a
/// store directory.
///
/// Path components are dropped, characters outside `[A-Za-z0-9._-]` become
/// `_` and leading dots are stripped. Returns None if nothing is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

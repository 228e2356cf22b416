//! Configuration sections. Everything here is fixed for the life of the process.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// File store for container (.mid) files.
    /// Default: midi_files
    #[serde(default = "PathsConfig::default_midi_dir")]
    pub midi_dir: PathBuf,

    /// Where uploaded audio is kept.
    /// Default: uploads
    #[serde(default = "PathsConfig::default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Working directory of the converter. Audio paths are passed to it
    /// relative to this root.
    /// Default: .
    #[serde(default = "PathsConfig::default_work_root")]
    pub work_root: PathBuf,

    /// Parent of the per-job working directories.
    /// Default: <system temp>/keyfall
    #[serde(default = "PathsConfig::default_scratch_dir")]
    pub scratch_dir: PathBuf,
}

impl PathsConfig {
    fn default_midi_dir() -> PathBuf {
        PathBuf::from("midi_files")
    }

    fn default_upload_dir() -> PathBuf {
        PathBuf::from("uploads")
    }

    fn default_work_root() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_scratch_dir() -> PathBuf {
        std::env::temp_dir().join("keyfall")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            midi_dir: Self::default_midi_dir(),
            upload_dir: Self::default_upload_dir(),
            work_root: Self::default_work_root(),
            scratch_dir: Self::default_scratch_dir(),
        }
    }
}

/// HTTP listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 0.0.0.0
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Default: 5000
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_http_port() -> u16 {
        5000
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

/// External audio-to-MIDI converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Program invoked as `<command> --input_audio <path> --output_dir <dir>`.
    /// Default: piano-transcribe
    #[serde(default = "ConverterConfig::default_command")]
    pub command: String,

    /// File the converter must leave in its output directory.
    /// Default: piano.mid
    #[serde(default = "ConverterConfig::default_artifact_name")]
    pub artifact_name: String,

    /// Kill the converter after this many seconds. Unset waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ConverterConfig {
    fn default_command() -> String {
        "piano-transcribe".to_string()
    }

    fn default_artifact_name() -> String {
        "piano.mid".to_string()
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            command: Self::default_command(),
            artifact_name: Self::default_artifact_name(),
            timeout_secs: None,
        }
    }
}

/// Upload acceptance rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Lowercase extensions without the dot.
    #[serde(default = "UploadConfig::default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Largest accepted request body.
    /// Default: 50 MiB
    #[serde(default = "UploadConfig::default_max_bytes")]
    pub max_bytes: usize,

    /// Name served when a fetch names no file.
    /// Default: sample
    #[serde(default = "UploadConfig::default_sample_name")]
    pub sample_name: String,
}

impl UploadConfig {
    fn default_allowed_extensions() -> Vec<String> {
        ["mid", "midi", "mp3", "wav", "flac", "ogg", "m4a"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn default_max_bytes() -> usize {
        50 * 1024 * 1024
    }

    fn default_sample_name() -> String {
        "sample".to_string()
    }

    /// Whether `extension` (any case, no dot) may be uploaded.
    pub fn allows(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|e| *e == extension)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: Self::default_allowed_extensions(),
            max_bytes: Self::default_max_bytes(),
            sample_name: Self::default_sample_name(),
        }
    }
}

/// Logging and OpenTelemetry export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint. Unset keeps logging local.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}

//! Configuration loading for Keyfall.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/keyfall/config.toml` (system)
//! 2. `~/.config/keyfall/config.toml` (user)
//! 3. `./keyfall.toml`, or the path given on the command line
//! 4. Environment variables (`KEYFALL_*`)
//!
//! Files are merged key by key, so a later file only needs the keys it
//! changes.
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! midi_dir = "~/keyfall/midi_files"
//! upload_dir = "~/keyfall/uploads"
//!
//! [bind]
//! http_port = 5000
//!
//! [converter]
//! command = "piano-transcribe"
//! timeout_secs = 900
//!
//! [telemetry]
//! log_level = "debug"
//! ```

pub mod infra;
pub mod loader;

pub use infra::{BindConfig, ConverterConfig, PathsConfig, TelemetryConfig, UploadConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete Keyfall configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KeyfallConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub converter: ConverterConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl KeyfallConfig {
    /// Load configuration from all standard sources, letting `config_path`
    /// replace `./keyfall.toml`, and report which files and env vars
    /// contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        loader::load_layers(&files)
    }

    /// Render as TOML, e.g. for `show-config`.
    pub fn to_toml(&self) -> String {
        let mut output = String::from("# Keyfall Configuration\n\n");
        match toml::to_string_pretty(self) {
            Ok(body) => output.push_str(&body),
            Err(e) => output.push_str(&format!("# failed to render config: {}\n", e)),
        }
        output
    }
}

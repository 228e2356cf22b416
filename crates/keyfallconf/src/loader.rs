//! Config file discovery, layered loading, and environment variable overlay.

use crate::{ConfigError, KeyfallConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/keyfall/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("keyfall/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("keyfall.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load `files` in order, later keys winning, then apply process env overrides.
pub fn load_layers(files: &[PathBuf]) -> Result<(KeyfallConfig, ConfigSources), ConfigError> {
    load_layers_with(files, |key| env::var(key).ok())
}

/// `load_layers` with every environment read going through `lookup`:
/// both the `KEYFALL_*` overrides and `~`/`$VAR` path expansion.
fn load_layers_with<F>(
    files: &[PathBuf],
    lookup: F,
) -> Result<(KeyfallConfig, ConfigSources), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in files {
        let table = read_table(path)?;
        merge_tables(&mut merged, table);
        sources.files.push(path.clone());
    }

    let origin = sources
        .files
        .last()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("<defaults>"));
    let mut config = from_table(merged, &origin)?;

    apply_env_overrides(&mut config, &mut sources, &lookup);
    config.paths = expand_paths(config.paths, &lookup);

    Ok((config, sources))
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    // Type errors are attributed to the file that introduced them.
    from_table(table.clone(), path)?;
    Ok(table)
}

fn from_table(table: toml::Table, path: &Path) -> Result<KeyfallConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Recursively merge `overlay` into `base`; overlay wins on conflicts.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply `KEYFALL_*` (and a few standard) environment overrides.
///
/// `lookup` returns the value of a variable; the process environment in
/// production, a fixed map in tests.
pub fn apply_env_overrides<F>(config: &mut KeyfallConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut take = |key: &str| {
        let value = lookup(key)?;
        sources.env_overrides.push(key.to_string());
        Some(value)
    };

    // Paths
    if let Some(v) = take("KEYFALL_MIDI_DIR") {
        config.paths.midi_dir = PathBuf::from(v);
    }
    if let Some(v) = take("KEYFALL_UPLOAD_DIR") {
        config.paths.upload_dir = PathBuf::from(v);
    }
    if let Some(v) = take("KEYFALL_WORK_ROOT") {
        config.paths.work_root = PathBuf::from(v);
    }
    if let Some(v) = take("KEYFALL_SCRATCH_DIR") {
        config.paths.scratch_dir = PathBuf::from(v);
    }

    // Bind
    if let Some(v) = take("KEYFALL_HOST") {
        config.bind.host = v;
    }
    if let Some(port) = take("KEYFALL_HTTP_PORT").and_then(|v| v.parse().ok()) {
        config.bind.http_port = port;
    }

    // Converter
    if let Some(v) = take("KEYFALL_CONVERTER") {
        config.converter.command = v;
    }
    if let Some(secs) = take("KEYFALL_CONVERTER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.converter.timeout_secs = Some(secs);
    }

    // Telemetry
    if let Some(v) = take("KEYFALL_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    // Also support RUST_LOG
    if let Some(v) = take("RUST_LOG") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = take("KEYFALL_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    // Also support standard OTEL env var
    if let Some(v) = take("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
}

fn expand_paths<F>(mut paths: crate::PathsConfig, lookup: &F) -> crate::PathsConfig
where
    F: Fn(&str) -> Option<String>,
{
    paths.midi_dir = expand_path(&paths.midi_dir.to_string_lossy(), lookup);
    paths.upload_dir = expand_path(&paths.upload_dir.to_string_lossy(), lookup);
    paths.work_root = expand_path(&paths.work_root.to_string_lossy(), lookup);
    paths.scratch_dir = expand_path(&paths.scratch_dir.to_string_lossy(), lookup);
    paths
}

/// Expand `~/` and a leading `$VAR` in a path, reading variables through
/// `lookup`. Unknown variables leave the path untouched.
pub fn expand_path<F>(path: &str, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(stripped) = path.strip_prefix("~/") {
        let home = lookup("HOME")
            .map(PathBuf::from)
            .or_else(|| directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()));
        match home {
            Some(home) => home.join(stripped),
            None => PathBuf::from(path),
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        let (var_name, rest) = match stripped.find('/') {
            Some(slash_pos) => (&stripped[..slash_pos], Some(&stripped[slash_pos + 1..])),
            None => (stripped, None),
        };
        match (lookup(var_name), rest) {
            (Some(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Some(value), None) => PathBuf::from(value),
            (None, _) => PathBuf::from(path),
        }
    } else {
        PathBuf::from(path)
    }
}

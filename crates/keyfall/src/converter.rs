//! External audio-to-MIDI converter.
//!
//! The converter is an opaque program: it gets an input audio path and an
//! output directory, and succeeds by exiting 0 after writing its artifact
//! into that directory. The [`Converter`] trait is the seam the job engine
//! talks to, so tests can substitute an in-process fake.

use anyhow::{Context, Result};
use async_trait::async_trait;
use keyfallconf::KeyfallConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// What the converter process reported when it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConverterOutput {
    /// None when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stderr: String,
    pub timed_out: bool,
}

impl ConverterOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Diagnostic text for a failed run.
    pub fn failure_text(&self) -> String {
        let head = if self.timed_out {
            "converter timed out".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("converter exited with code {}", code),
                None => "converter was terminated by a signal".to_string(),
            }
        };

        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            head
        } else {
            format!("{}: {}", head, stderr)
        }
    }
}

#[async_trait]
pub trait Converter: Send + Sync {
    /// Run one conversion of `audio` into `output_dir` and wait for it.
    ///
    /// `Err` means the converter could not be run at all; a run that
    /// started and failed is an `Ok` with a non-success output.
    async fn convert(&self, audio: &Path, output_dir: &Path) -> Result<ConverterOutput>;
}

/// Runs the converter as a child process:
/// `<command> --input_audio <audio> --output_dir <dir>` with `work_root`
/// as its working directory.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    command: String,
    work_root: PathBuf,
    timeout: Option<Duration>,
}

impl CommandConverter {
    pub fn new(command: impl Into<String>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_root: work_root.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(config: &KeyfallConfig) -> Self {
        Self::new(&config.converter.command, &config.paths.work_root)
            .with_timeout(config.converter.timeout_secs.map(Duration::from_secs))
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, audio: &Path, output_dir: &Path) -> Result<ConverterOutput> {
        tracing::debug!(
            converter.command = %self.command,
            converter.input = %audio.display(),
            converter.output_dir = %output_dir.display(),
            "Spawning converter"
        );

        let child = Command::new(&self.command)
            .arg("--input_audio")
            .arg(audio)
            .arg("--output_dir")
            .arg(output_dir)
            .current_dir(&self.work_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start converter '{}'", self.command))?;

        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, waited).await {
                Ok(result) => result,
                // Dropping the wait future drops the child, which kills it.
                Err(_) => {
                    return Ok(ConverterOutput {
                        exit_code: None,
                        stderr: format!("no exit after {}s", limit.as_secs()),
                        timed_out: true,
                    })
                }
            },
            None => waited.await,
        }
        .context("Failed to wait for converter")?;

        Ok(ConverterOutput {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_text_includes_code_and_stderr() {
        let output = ConverterOutput {
            exit_code: Some(2),
            stderr: "model weights not found\n".to_string(),
            timed_out: false,
        };
        assert!(!output.succeeded());
        assert_eq!(
            output.failure_text(),
            "converter exited with code 2: model weights not found"
        );
    }

    #[test]
    fn timeout_is_never_success() {
        let output = ConverterOutput {
            exit_code: Some(0),
            stderr: String::new(),
            timed_out: true,
        };
        assert!(!output.succeeded());
        assert_eq!(output.failure_text(), "converter timed out");
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let converter = CommandConverter::new("keyfall-no-such-converter", ".");
        let result = converter
            .convert(Path::new("in.wav"), Path::new("/tmp"))
            .await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_and_stderr_are_captured() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-converter.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"bad input: $2\" >&2\nexit 3\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let converter = CommandConverter::new(script.to_string_lossy(), dir.path());
        let output = converter
            .convert(Path::new("song.wav"), dir.path())
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stderr.trim(), "bad input: song.wav");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("slow-converter.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let converter = CommandConverter::new(script.to_string_lossy(), dir.path())
            .with_timeout(Some(Duration::from_millis(200)));
        let output = converter
            .convert(Path::new("song.wav"), dir.path())
            .await
            .unwrap();

        assert!(output.timed_out);
        assert!(!output.succeeded());
    }
}

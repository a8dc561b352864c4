//! Codex CLI leg: completions and transcription through a local `codex`
//! subprocess. Slowest leg in every chain, but works without API keys.

use super::Provider;
use crate::error::ProviderError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const CLI_TIMEOUT: Duration = Duration::from_secs(45);
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CodexCliProvider {
    binary: String,
    model: String,
}

impl CodexCliProvider {
    pub fn new(model: &str) -> Self {
        Self {
            binary: "codex".into(),
            model: model.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Run the CLI with the prompt on stdin, bounded by `timeout`. The child
    /// is killed when the deadline passes.
    async fn run(&self, prompt: &str, timeout: Duration) -> Result<String, ProviderError> {
        let mut child = Command::new(&self.binary)
            .arg("exec")
            .arg("--model")
            .arg(&self.model)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProviderError::Io {
                provider: "codex_cli",
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits before reading closes the pipe; the exit
            // status tells the real story.
            let _ = stdin.write_all(prompt.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ProviderError::Io {
                provider: "codex_cli",
                source,
            })?,
            Err(_) => {
                return Err(ProviderError::Timeout {
                    provider: "codex_cli",
                    seconds: timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .trim()
                .chars()
                .take(400)
                .collect();
            return Err(ProviderError::CliExit {
                provider: "codex_cli",
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            Err(ProviderError::Empty {
                provider: "codex_cli",
            })
        } else {
            Ok(stdout)
        }
    }
}

#[async_trait]
impl Provider for CodexCliProvider {
    fn name(&self) -> &'static str {
        "codex_cli"
    }

    async fn complete_json(&self, system: &str, user: &str) -> Result<String, ProviderError> {
        let prompt = format!("{system}\n\nRespond with a single JSON object only.\n\n{user}");
        self.run(&prompt, CLI_TIMEOUT).await
    }

    async fn complete_text(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> Result<String, ProviderError> {
        let prompt = match system {
            Some(system) => format!("{system}\n\n{user}"),
            None => user.to_string(),
        };
        self.run(&prompt, CLI_TIMEOUT).await
    }

    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String, ProviderError> {
        // The CLI reads the audio from a temp file that lives for the call.
        let extension = crate::providers::openai::extension_for_mime(mime);
        let file = tempfile::Builder::new()
            .prefix("senseboard-audio-")
            .suffix(&format!(".{extension}"))
            .tempfile()
            .map_err(|source| ProviderError::Io {
                provider: "codex_cli",
                source,
            })?;
        tokio::fs::write(file.path(), audio)
            .await
            .map_err(|source| ProviderError::Io {
                provider: "codex_cli",
                source,
            })?;

        let prompt = format!(
            "Transcribe the audio file at {} verbatim. Reply with the spoken words only, no commentary.",
            file.path().display()
        );
        let result = self.run(&prompt, CLI_TIMEOUT).await;
        drop(file);
        result
    }

    async fn preflight(&self) -> Result<(), ProviderError> {
        self.run("Reply with the single word: pong", PREFLIGHT_TIMEOUT)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_an_io_error() {
        let provider =
            CodexCliProvider::new("test-model").with_binary("definitely-not-a-real-binary");
        let err = provider.complete_text(None, "hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::Io { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_success_is_an_empty_error() {
        let provider = CodexCliProvider::new("m").with_binary("true");
        let err = provider.complete_text(None, "hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::Empty { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_maps_to_cli_exit() {
        let provider = CodexCliProvider::new("m").with_binary("false");
        let err = provider.complete_text(None, "hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::CliExit { .. }));
    }
}

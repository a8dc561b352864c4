use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which provider heads the AI generation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AiProviderKind {
    Deterministic,
    Openai,
    Anthropic,
    CodexCli,
    #[default]
    Auto,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".into()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".into()
}

fn default_codex_model() -> String {
    "gpt-5-codex".into()
}

fn default_transcription_model() -> String {
    "whisper-1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AiConfigSection {
    pub provider: AiProviderKind,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_codex_model")]
    pub codex_model: String,
    #[serde(default = "default_transcription_model")]
    pub openai_transcription_model: String,
    pub review: ReviewConfig,
}

impl Default for AiConfigSection {
    fn default() -> Self {
        Self {
            provider: AiProviderKind::Auto,
            openai_api_key: None,
            anthropic_api_key: None,
            openai_model: default_openai_model(),
            anthropic_model: default_anthropic_model(),
            codex_model: default_codex_model(),
            openai_transcription_model: default_transcription_model(),
            review: ReviewConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub max_revisions: u32,
    pub confidence_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_revisions: 2,
            confidence_threshold: 0.62,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// The server tries `[port, port + port_scan_span)` until a bind succeeds.
    pub port_scan_span: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            port_scan_span: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CaptureConfig {
    pub transcription_chunks: ChunkCaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkCaptureConfig {
    pub enabled: bool,
    pub directory: String,
}

impl Default for ChunkCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "data/capture".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalizationConfig {
    pub sqlite_path: String,
    pub max_context_lines: usize,
}

impl Default for PersonalizationConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "data/personalization.sqlite".into(),
            max_context_lines: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub ai: AiConfigSection,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub capture: CaptureConfig,
    pub personalization: PersonalizationConfig,
    /// Directory holding system/delta/visual prompt template overrides.
    pub prompts_dir: Option<String>,
}

impl Config {
    /// Load from an explicit path, or fall back to `senseboard.toml` in the
    /// working directory, then the platform config dir. A missing file is
    /// not an error; defaults apply.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let candidate = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let cwd = PathBuf::from("senseboard.toml");
                if cwd.exists() {
                    Some(cwd)
                } else {
                    directories::ProjectDirs::from("dev", "senseboard", "senseboard")
                        .map(|d| d.config_dir().join("senseboard.toml"))
                        .filter(|p| p.exists())
                }
            }
        };

        let mut config = match candidate {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.expand_paths();
        Ok(config)
    }

    /// `SENSEBOARD_` + upper-snake of the dotted key path overrides the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SENSEBOARD_AI_PROVIDER") {
            if let Ok(kind) = toml::Value::String(v).try_into() {
                self.ai.provider = kind;
            }
        }
        if let Ok(v) = std::env::var("SENSEBOARD_AI_OPENAI_API_KEY") {
            self.ai.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SENSEBOARD_AI_ANTHROPIC_API_KEY") {
            self.ai.anthropic_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SENSEBOARD_AI_OPENAI_MODEL") {
            self.ai.openai_model = v;
        }
        if let Ok(v) = std::env::var("SENSEBOARD_AI_ANTHROPIC_MODEL") {
            self.ai.anthropic_model = v;
        }
        if let Ok(v) = std::env::var("SENSEBOARD_AI_CODEX_MODEL") {
            self.ai.codex_model = v;
        }
        if let Ok(v) = std::env::var("SENSEBOARD_SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("SENSEBOARD_SERVER_PORT_SCAN_SPAN") {
            if let Ok(span) = v.parse() {
                self.server.port_scan_span = span;
            }
        }
        if let Ok(v) = std::env::var("SENSEBOARD_LOGGING_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("SENSEBOARD_PERSONALIZATION_SQLITE_PATH") {
            self.personalization.sqlite_path = v;
        }
    }

    fn expand_paths(&mut self) {
        self.personalization.sqlite_path =
            shellexpand::tilde(&self.personalization.sqlite_path).into_owned();
        self.capture.transcription_chunks.directory =
            shellexpand::tilde(&self.capture.transcription_chunks.directory).into_owned();
        if let Some(dir) = &self.prompts_dir {
            self.prompts_dir = Some(shellexpand::tilde(dir).into_owned());
        }
    }
}

/// `SENSEBOARD_ENABLE_CODEX_TRANSCRIBE_FALLBACK=0` disables the Codex leg
/// of the transcription chain.
pub fn codex_transcribe_enabled() -> bool {
    std::env::var("SENSEBOARD_ENABLE_CODEX_TRANSCRIBE_FALLBACK")
        .map(|v| v != "0")
        .unwrap_or(true)
}

/// `SENSEBOARD_TRANSCRIPT_ARCHIVE_ENABLED` in {1, true} enables the JSONL
/// transcript archive under data/transcripts/.
pub fn transcript_archive_enabled() -> bool {
    std::env::var("SENSEBOARD_TRANSCRIPT_ARCHIVE_ENABLED")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.ai.provider, AiProviderKind::Auto);
        assert!(config.ai.review.confidence_threshold > 0.0);
        assert!(config.ai.review.confidence_threshold < 1.0);
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
            [ai]
            provider = "anthropic"
            anthropic_api_key = "sk-test"

            [server]
            port = 9000
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.ai.provider, AiProviderKind::Anthropic);
        assert_eq!(config.ai.anthropic_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.server.port, 9000);
        // Untouched sections keep defaults
        assert_eq!(config.personalization.max_context_lines, 24);
    }

    #[test]
    fn parses_review_section() {
        let raw = r#"
            [ai.review]
            max_revisions = 3
            confidence_threshold = 0.8
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.ai.review.max_revisions, 3);
        assert!((config.ai.review.confidence_threshold - 0.8).abs() < 1e-9);
    }
}

//! Opt-in capture paths: a JSONL transcript archive per (room, speaker) and
//! raw audio chunk dumps for debugging the transcription chain.

use crate::config::ChunkCaptureConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

const TRANSCRIPT_DIR: &str = "data/transcripts";

#[derive(Debug, Serialize)]
struct TranscriptRow<'a> {
    at: DateTime<Utc>,
    room: &'a str,
    speaker: &'a str,
    text: &'a str,
    source: &'a str,
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".into()
    } else {
        cleaned
    }
}

fn transcript_path(base: &Path, room: &str, speaker: &str) -> PathBuf {
    base.join(format!(
        "{}_{}.jsonl",
        sanitize_component(room),
        sanitize_component(speaker)
    ))
}

/// Append one transcript row. Failures are logged, never propagated; the
/// archive is best-effort.
pub fn archive_transcript_row(
    base_dir: Option<&Path>,
    room: &str,
    speaker: &str,
    text: &str,
    source: &str,
    at: DateTime<Utc>,
) {
    let base = base_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(TRANSCRIPT_DIR));
    if let Err(err) = append_row(&base, room, speaker, text, source, at) {
        tracing::warn!(error = %err, "transcript archive write failed");
    }
}

fn append_row(
    base: &Path,
    room: &str,
    speaker: &str,
    text: &str,
    source: &str,
    at: DateTime<Utc>,
) -> std::io::Result<()> {
    use std::io::Write;

    std::fs::create_dir_all(base)?;
    let row = TranscriptRow {
        at,
        room,
        speaker,
        text,
        source,
    };
    let line = serde_json::to_string(&row)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(transcript_path(base, room, speaker))?;
    writeln!(file, "{line}")
}

/// Dump a raw audio blob when chunk capture is enabled. Returns the path
/// written, mostly for logging.
pub fn capture_audio_chunk(
    config: &ChunkCaptureConfig,
    room: &str,
    speaker: &str,
    extension: &str,
    bytes: &[u8],
    at: DateTime<Utc>,
) -> Option<PathBuf> {
    if !config.enabled {
        return None;
    }
    let dir = PathBuf::from(&config.directory);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        tracing::warn!(error = %err, "audio capture dir create failed");
        return None;
    }
    let path = dir.join(format!(
        "{}_{}_{}.{}",
        at.format("%Y%m%dT%H%M%S%3f"),
        sanitize_component(room),
        sanitize_component(speaker),
        extension
    ));
    match std::fs::write(&path, bytes) {
        Ok(()) => Some(path),
        Err(err) => {
            tracing::warn!(error = %err, "audio capture write failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        for text in ["first line", "second line"] {
            archive_transcript_row(
                Some(dir.path()),
                "R1",
                "Host",
                text,
                "mic",
                Utc::now(),
            );
        }
        let content =
            std::fs::read_to_string(dir.path().join("R1_Host.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let row: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(row["speaker"], "Host");
        assert_eq!(row["text"], "first line");
    }

    #[test]
    fn path_components_are_sanitized() {
        assert_eq!(sanitize_component("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_component(""), "unknown");
    }

    #[test]
    fn capture_disabled_is_a_noop() {
        let config = ChunkCaptureConfig {
            enabled: false,
            directory: "/nonexistent".into(),
        };
        assert!(capture_audio_chunk(&config, "R", "S", "wav", &[1], Utc::now()).is_none());
    }

    #[test]
    fn capture_writes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let config = ChunkCaptureConfig {
            enabled: true,
            directory: dir.path().display().to_string(),
        };
        let path = capture_audio_chunk(&config, "R1", "Host", "wav", &[9, 9], Utc::now()).unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![9, 9]);
    }
}

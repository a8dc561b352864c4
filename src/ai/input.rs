//! Deterministic snapshot of everything an AI job may look at, plus the
//! transcript normalization pipeline that feeds it.

use crate::diagram::builders::is_hint_keyword;
use crate::room::{AiStatus, ChatKind, ContextPriority, RoomState, TranscriptChunk};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const TRANSCRIPT_WINDOW_LINES: usize = 24;
pub const TRANSCRIPT_CONTEXT_CHUNKS: usize = 72;
pub const RECENT_CHAT_LINES: usize = 12;
pub const CONTEXT_DIRECTIVE_LINES: usize = 12;

const FILLER_TOKENS: &[&str] = &["uh", "um", "hmm", "erm", "ah", "mm"];
const FILLER_STRIP_PASSES: usize = 3;
const STUTTER_MIN_TOKENS: usize = 5;
const STUTTER_UNIQUE_RATIO: f64 = 0.25;
const NEAR_DUP_MARGIN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiReason {
    Manual,
    Tick,
    Regenerate,
}

impl AiReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Tick => "tick",
            Self::Regenerate => "regenerate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiTrigger {
    pub reason: AiReason,
    pub regenerate: bool,
    pub transcript_chunk_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfigView {
    pub frozen: bool,
    pub focus_mode: bool,
    pub status: AiStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiInput {
    pub room_id: String,
    /// Stripped before fingerprinting.
    pub now_iso: String,
    pub reason: AiReason,
    pub regenerate: bool,
    pub window_seconds: u64,
    pub transcript_window: Vec<String>,
    pub transcript_context: Vec<String>,
    pub recent_chat: Vec<String>,
    pub corrections: Vec<String>,
    pub correction_directives: Vec<String>,
    pub context_pinned_high: Vec<String>,
    pub context_pinned_normal: Vec<String>,
    pub context_directive_lines: Vec<String>,
    pub visual_hint: String,
    pub current_diagram_summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_diagram_snapshot: Option<serde_json::Value>,
    pub ai_config: AiConfigView,
    pub high_priority_bypassed: bool,
}

impl AiInput {
    /// Anything for the AI to act on this tick.
    pub fn has_signal(&self) -> bool {
        !self.transcript_window.is_empty()
            || !self.recent_chat.is_empty()
            || !self.context_pinned_high.is_empty()
            || !self.context_pinned_normal.is_empty()
            || !self.visual_hint.trim().is_empty()
    }

    /// Raw material for the deterministic diagram engine, ordered by the
    /// context modality priority.
    pub fn fallback_text(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        parts.extend(self.corrections.iter().cloned());
        parts.extend(self.context_pinned_high.iter().cloned());
        parts.extend(self.context_pinned_normal.iter().cloned());
        parts.extend(self.recent_chat.iter().cloned());
        parts.extend(self.transcript_window.iter().cloned());
        if !self.visual_hint.trim().is_empty() {
            parts.push(self.visual_hint.clone());
        }
        parts.join("\n")
    }
}

/// Strip up to three passes of leading filler tokens and collapse runs of
/// whitespace.
pub fn normalize_transcript_text(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    for _ in 0..FILLER_STRIP_PASSES {
        let lower = text.to_lowercase();
        let Some(first) = lower.split_whitespace().next() else {
            break;
        };
        let bare = first.trim_matches(|c: char| !c.is_alphanumeric());
        if !FILLER_TOKENS.contains(&bare) {
            break;
        }
        text = text
            .split_whitespace()
            .skip(1)
            .collect::<Vec<_>>()
            .join(" ");
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Line filter: empty lines go, single tokens without a keyword hint go,
/// and long lines dominated by repeated tokens (stutter) go.
pub fn keep_transcript_line(text: &str) -> bool {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return false;
    }
    let has_keyword = tokens.iter().any(|t| {
        is_hint_keyword(t.trim_matches(|c: char| !c.is_alphanumeric()))
    });
    if tokens.len() == 1 {
        return has_keyword;
    }
    if tokens.len() >= STUTTER_MIN_TOKENS && !has_keyword {
        let unique: std::collections::HashSet<String> =
            tokens.iter().map(|t| t.to_lowercase()).collect();
        let ratio = unique.len() as f64 / tokens.len() as f64;
        if ratio < STUTTER_UNIQUE_RATIO {
            return false;
        }
    }
    true
}

/// Is `next` a repeat of `prev` from the same speaker: equal, or one is a
/// prefix/suffix of the other with at most `NEAR_DUP_MARGIN` extra chars.
fn is_near_duplicate(prev: &str, next: &str) -> bool {
    if prev == next {
        return true;
    }
    let (short, long) = if prev.len() <= next.len() {
        (prev, next)
    } else {
        (next, prev)
    };
    if long.len() - short.len() > NEAR_DUP_MARGIN {
        return false;
    }
    long.starts_with(short) || long.ends_with(short)
}

struct NormalizedLine {
    speaker: String,
    text: String,
    created_at: DateTime<Utc>,
}

/// Full pipeline over chunks: normalize, filter, and merge consecutive
/// near-duplicates from the same speaker (the longer text wins).
fn normalized_lines(chunks: &[TranscriptChunk]) -> Vec<NormalizedLine> {
    let mut lines: Vec<NormalizedLine> = Vec::new();
    for chunk in chunks {
        let text = normalize_transcript_text(&chunk.text);
        if !keep_transcript_line(&text) {
            continue;
        }
        if let Some(last) = lines.last_mut() {
            if last.speaker == chunk.speaker && is_near_duplicate(&last.text, &text) {
                if text.len() > last.text.len() {
                    last.text = text;
                    last.created_at = chunk.created_at;
                }
                continue;
            }
        }
        lines.push(NormalizedLine {
            speaker: chunk.speaker.clone(),
            text,
            created_at: chunk.created_at,
        });
    }
    lines
}

fn speaker_prefixed(line: &NormalizedLine) -> String {
    format!("{}: {}", line.speaker, line.text)
}

/// Correction text that bypasses high-priority pinned context for one tick.
fn bypasses_high_priority(corrections: &[String]) -> bool {
    corrections.iter().any(|text| {
        let lower = text.to_lowercase();
        lower.contains("context update:") || lower.contains("override high")
    })
}

/// Build the deterministic snapshot for one job.
pub fn assemble_ai_input(
    room: &RoomState,
    window_seconds: u64,
    trigger: &AiTrigger,
    now: DateTime<Utc>,
) -> AiInput {
    let chunk_limit = trigger
        .transcript_chunk_count
        .unwrap_or(room.transcript_chunks.len())
        .min(room.transcript_chunks.len());
    let chunks = &room.transcript_chunks[..chunk_limit];
    let lines = normalized_lines(chunks);

    let window_start = now - Duration::milliseconds((window_seconds as i64).saturating_mul(1000));
    let window: Vec<String> = lines
        .iter()
        .filter(|l| l.created_at >= window_start)
        .map(speaker_prefixed)
        .collect();
    let transcript_window: Vec<String> = window
        .iter()
        .skip(window.len().saturating_sub(TRANSCRIPT_WINDOW_LINES))
        .cloned()
        .collect();

    let transcript_context: Vec<String> = lines
        .iter()
        .skip(lines.len().saturating_sub(TRANSCRIPT_CONTEXT_CHUNKS))
        .map(speaker_prefixed)
        .collect();

    let recent_chat: Vec<String> = room
        .chat_messages
        .iter()
        .skip(room.chat_messages.len().saturating_sub(RECENT_CHAT_LINES))
        .map(|m| format!("{}: {}", m.author, m.text))
        .collect();

    let corrections: Vec<String> = room
        .chat_messages
        .iter()
        .filter(|m| m.kind == ChatKind::Correction)
        .map(|m| m.text.clone())
        .collect();
    let correction_directives: Vec<String> = corrections
        .iter()
        .map(|text| format!("Correction: {text}"))
        .collect();

    let high_priority_bypassed = bypasses_high_priority(&corrections);
    let context_pinned_high: Vec<String> = if high_priority_bypassed {
        Vec::new()
    } else {
        room.context_items
            .iter()
            .filter(|c| c.pinned && c.priority == ContextPriority::High)
            .map(|c| c.text.clone())
            .collect()
    };
    let context_pinned_normal: Vec<String> = room
        .context_items
        .iter()
        .filter(|c| c.pinned && c.priority == ContextPriority::Normal)
        .map(|c| c.text.clone())
        .collect();

    let context_directive_lines: Vec<String> = room
        .context_items
        .iter()
        .take(CONTEXT_DIRECTIVE_LINES)
        .map(|c| {
            let tag = match c.priority {
                ContextPriority::High => "high",
                ContextPriority::Normal => "normal",
            };
            format!("[{tag}] {}", c.text)
        })
        .collect();

    let (current_diagram_summary, active_diagram_snapshot) = match room.active_group() {
        Some(group) => (
            format!(
                "{:?} \"{}\": {} nodes, {} edges",
                group.diagram_type,
                group.topic,
                group.nodes.len(),
                group.edges.len()
            ),
            serde_json::to_value(group).ok(),
        ),
        None => (String::new(), None),
    };

    AiInput {
        room_id: room.id.clone(),
        now_iso: now.to_rfc3339(),
        reason: trigger.reason,
        regenerate: trigger.regenerate,
        window_seconds,
        transcript_window,
        transcript_context,
        recent_chat,
        corrections,
        correction_directives,
        context_pinned_high,
        context_pinned_normal,
        context_directive_lines,
        visual_hint: room.visual_hint.clone(),
        current_diagram_summary,
        active_diagram_snapshot,
        ai_config: AiConfigView {
            frozen: room.ai_config.frozen,
            focus_mode: room.ai_config.focus_mode,
            status: room.ai_config.status,
        },
        high_priority_bypassed,
    }
}

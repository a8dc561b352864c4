pub mod registry;

use crate::board::BoardState;
use crate::diagram::DiagramGroup;
use crate::error::ClientMessageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_CHAT_MESSAGES: usize = 300;
pub const MAX_CONTEXT_ITEMS: usize = 200;
pub const MAX_TRANSCRIPT_CHUNKS: usize = 400;
pub const MAX_AI_HISTORY: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub name: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    #[default]
    Chat,
    Correction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub text: String,
    pub kind: ChatKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextPriority {
    High,
    #[default]
    Normal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextItem {
    pub id: String,
    pub text: String,
    pub priority: ContextPriority,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptChunk {
    pub id: String,
    pub speaker: String,
    pub text: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiStatus {
    #[default]
    Idle,
    Listening,
    Updating,
    Frozen,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    pub frozen: bool,
    pub focus_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_box: Option<crate::diagram::FocusBox>,
    pub pinned_group_ids: Vec<String>,
    pub status: AiStatus,
}

/// Snapshot of a diagram group taken before an AI patch lands, so
/// `diagram:undoAi` can restore it byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiHistoryEntry {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<DiagramGroup>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub id: String,
    pub members: Vec<Member>,
    pub chat_messages: Vec<ChatMessage>,
    pub context_items: Vec<ContextItem>,
    pub transcript_chunks: Vec<TranscriptChunk>,
    pub visual_hint: String,
    pub board: BoardState,
    pub diagram_groups: HashMap<String, DiagramGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_group_id: Option<String>,
    pub archived_groups: Vec<DiagramGroup>,
    pub ai_config: AiConfig,
    pub ai_history: Vec<AiHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ai_patch_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ai_fingerprint: Option<String>,
    #[serde(skip)]
    pub last_transcript_by_speaker: HashMap<String, String>,
}

impl RoomState {
    pub fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            members: Vec::new(),
            chat_messages: Vec::new(),
            context_items: Vec::new(),
            transcript_chunks: Vec::new(),
            visual_hint: String::new(),
            board: BoardState::new(now),
            diagram_groups: HashMap::new(),
            active_group_id: None,
            archived_groups: Vec::new(),
            ai_config: AiConfig::default(),
            ai_history: Vec::new(),
            last_ai_patch_at: None,
            last_ai_fingerprint: None,
            last_transcript_by_speaker: HashMap::new(),
        }
    }

    pub fn join(&mut self, name: &str, now: DateTime<Utc>) -> Member {
        let member = Member {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            joined_at: now,
        };
        self.members.push(member.clone());
        member
    }

    pub fn leave(&mut self, member_id: &str) {
        self.members.retain(|m| m.id != member_id);
    }

    pub fn active_group(&self) -> Option<&DiagramGroup> {
        self.active_group_id
            .as_deref()
            .and_then(|id| self.diagram_groups.get(id))
    }

    pub fn active_group_mut(&mut self) -> Option<&mut DiagramGroup> {
        let id = self.active_group_id.clone()?;
        self.diagram_groups.get_mut(&id)
    }

    /// Anything for the AI to work with: transcript, chat, pinned context,
    /// or a visual hint.
    pub fn has_ai_signal(&self) -> bool {
        !self.transcript_chunks.is_empty()
            || !self.chat_messages.is_empty()
            || self.context_items.iter().any(|c| c.pinned)
            || !self.visual_hint.trim().is_empty()
    }

    pub fn add_transcript_chunk(
        &mut self,
        speaker: &str,
        text: &str,
        source: &str,
        now: DateTime<Utc>,
    ) -> Option<&TranscriptChunk> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        // Repeated identical text from the same speaker is dropped at the door.
        if self
            .last_transcript_by_speaker
            .get(speaker)
            .is_some_and(|last| last == trimmed)
        {
            return None;
        }
        self.last_transcript_by_speaker
            .insert(speaker.to_string(), trimmed.to_string());
        push_bounded(
            &mut self.transcript_chunks,
            TranscriptChunk {
                id: uuid::Uuid::new_v4().to_string(),
                speaker: speaker.to_string(),
                text: trimmed.to_string(),
                source: source.to_string(),
                created_at: now,
            },
            MAX_TRANSCRIPT_CHUNKS,
        );
        self.transcript_chunks.last()
    }

    pub fn record_ai_history(&mut self, entry: AiHistoryEntry) {
        push_bounded(&mut self.ai_history, entry, MAX_AI_HISTORY);
    }
}

pub fn push_bounded<T>(items: &mut Vec<T>, item: T, cap: usize) {
    items.push(item);
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

/// Wire vocabulary for client mutations. `client:ack` is the handshake gate
/// and mutates nothing.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "client:ack")]
    Ack {
        protocol: String,
        #[serde(default)]
        sent_at: Option<DateTime<Utc>>,
    },
    #[serde(rename = "chat:add")]
    ChatAdd {
        text: String,
        #[serde(default)]
        kind: ChatKind,
    },
    #[serde(rename = "context:add")]
    ContextAdd {
        text: String,
        #[serde(default)]
        priority: ContextPriority,
        #[serde(default)]
        pinned: bool,
    },
    #[serde(rename = "context:update")]
    ContextUpdate {
        id: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        priority: Option<ContextPriority>,
        #[serde(default)]
        pinned: Option<bool>,
    },
    #[serde(rename = "context:delete")]
    ContextDelete { id: String },
    #[serde(rename = "transcript:add")]
    TranscriptAdd {
        text: String,
        #[serde(default)]
        source: Option<String>,
    },
    #[serde(rename = "visualHint:set")]
    VisualHintSet { value: String },
    #[serde(rename = "aiConfig:update")]
    AiConfigUpdate {
        #[serde(default)]
        frozen: Option<bool>,
        #[serde(default)]
        focus_mode: Option<bool>,
        #[serde(default)]
        focus_box: Option<crate::diagram::FocusBox>,
        #[serde(default)]
        status: Option<AiStatus>,
    },
    #[serde(rename = "diagram:pinCurrent")]
    DiagramPinCurrent,
    #[serde(rename = "diagram:undoAi")]
    DiagramUndoAi,
    #[serde(rename = "diagram:restoreArchived")]
    DiagramRestoreArchived {
        #[serde(default)]
        id: Option<String>,
    },
}

/// What a handled client message asks of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub kind: &'static str,
    pub broadcast: bool,
    pub schedule_tick: bool,
}

impl Applied {
    fn mutated(kind: &'static str, schedule_tick: bool) -> Self {
        Self {
            kind,
            broadcast: true,
            schedule_tick,
        }
    }
}

/// The single mutation entry point for client-originated room changes.
pub fn apply_client_message(
    room: &mut RoomState,
    sender: &Member,
    msg: &ClientMessage,
    now: DateTime<Utc>,
) -> Result<Applied, ClientMessageError> {
    match msg {
        ClientMessage::Ack { .. } => Ok(Applied {
            kind: "client:ack",
            broadcast: false,
            schedule_tick: false,
        }),
        ClientMessage::ChatAdd { text, kind } => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(ClientMessageError::Invalid("Chat text is required.".into()));
            }
            push_bounded(
                &mut room.chat_messages,
                ChatMessage {
                    id: uuid::Uuid::new_v4().to_string(),
                    author: sender.name.clone(),
                    text: trimmed.to_string(),
                    kind: *kind,
                    created_at: now,
                },
                MAX_CHAT_MESSAGES,
            );
            Ok(Applied::mutated("chat:add", true))
        }
        ClientMessage::ContextAdd {
            text,
            priority,
            pinned,
        } => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(ClientMessageError::Invalid(
                    "Context text is required.".into(),
                ));
            }
            push_bounded(
                &mut room.context_items,
                ContextItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    text: trimmed.to_string(),
                    priority: *priority,
                    pinned: *pinned,
                    created_at: now,
                    updated_at: now,
                },
                MAX_CONTEXT_ITEMS,
            );
            Ok(Applied::mutated("context:add", true))
        }
        ClientMessage::ContextUpdate {
            id,
            text,
            priority,
            pinned,
        } => {
            let Some(item) = room.context_items.iter_mut().find(|c| &c.id == id) else {
                return Err(ClientMessageError::UnknownTarget {
                    kind: "context item",
                    id: id.clone(),
                });
            };
            if let Some(text) = text {
                item.text = text.trim().to_string();
            }
            if let Some(priority) = priority {
                item.priority = *priority;
            }
            if let Some(pinned) = pinned {
                item.pinned = *pinned;
            }
            item.updated_at = now;
            Ok(Applied::mutated("context:update", true))
        }
        ClientMessage::ContextDelete { id } => {
            let before = room.context_items.len();
            room.context_items.retain(|c| &c.id != id);
            if room.context_items.len() == before {
                return Err(ClientMessageError::UnknownTarget {
                    kind: "context item",
                    id: id.clone(),
                });
            }
            Ok(Applied::mutated("context:delete", false))
        }
        ClientMessage::TranscriptAdd { text, source } => {
            let source = source.as_deref().unwrap_or("ws");
            let added = room
                .add_transcript_chunk(&sender.name, text, source, now)
                .is_some();
            Ok(Applied::mutated("transcript:add", added))
        }
        ClientMessage::VisualHintSet { value } => {
            room.visual_hint = value.trim().to_string();
            Ok(Applied::mutated("visualHint:set", true))
        }
        ClientMessage::AiConfigUpdate {
            frozen,
            focus_mode,
            focus_box,
            status,
        } => {
            if let Some(frozen) = frozen {
                room.ai_config.frozen = *frozen;
                room.ai_config.status = if *frozen {
                    AiStatus::Frozen
                } else {
                    AiStatus::Idle
                };
            }
            if let Some(focus_mode) = focus_mode {
                room.ai_config.focus_mode = *focus_mode;
            }
            if let Some(focus_box) = focus_box {
                room.ai_config.focus_box = Some(*focus_box);
            }
            if let Some(status) = status {
                if !room.ai_config.frozen {
                    room.ai_config.status = *status;
                }
            }
            Ok(Applied::mutated("aiConfig:update", false))
        }
        ClientMessage::DiagramPinCurrent => {
            let Some(group) = room.active_group_mut() else {
                return Err(ClientMessageError::Invalid(
                    "No active diagram to pin.".into(),
                ));
            };
            group.pinned = true;
            let id = group.id.clone();
            if !room.ai_config.pinned_group_ids.contains(&id) {
                room.ai_config.pinned_group_ids.push(id);
            }
            Ok(Applied::mutated("diagram:pinCurrent", false))
        }
        ClientMessage::DiagramUndoAi => {
            let Some(entry) = room.ai_history.pop() else {
                return Err(ClientMessageError::Invalid("Nothing to undo.".into()));
            };
            match (entry.group_id, entry.snapshot) {
                (Some(group_id), Some(snapshot)) => {
                    room.diagram_groups.insert(group_id.clone(), snapshot);
                    room.active_group_id = Some(group_id);
                }
                (Some(group_id), None) => {
                    // The patch created the group; undo removes it.
                    room.diagram_groups.remove(&group_id);
                    if room.active_group_id.as_deref() == Some(group_id.as_str()) {
                        room.active_group_id = None;
                    }
                }
                _ => {}
            }
            Ok(Applied::mutated("diagram:undoAi", false))
        }
        ClientMessage::DiagramRestoreArchived { id } => {
            let index = match id {
                Some(id) => room.archived_groups.iter().position(|g| &g.id == id),
                None => room.archived_groups.len().checked_sub(1),
            };
            let Some(index) = index else {
                return Err(ClientMessageError::UnknownTarget {
                    kind: "archived group",
                    id: id.clone().unwrap_or_else(|| "latest".into()),
                });
            };
            let source = room.archived_groups[index].clone();
            let new_id = uuid::Uuid::new_v4().to_string();
            let restored = crate::diagram::restored_clone(&source, new_id.clone(), now);
            room.diagram_groups.insert(new_id.clone(), restored);
            room.active_group_id = Some(new_id);
            Ok(Applied::mutated("diagram:restoreArchived", false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{DiagramGroup, DiagramType};

    fn room() -> RoomState {
        RoomState::new("ROOM1".into(), Utc::now())
    }

    fn member(name: &str) -> Member {
        Member {
            id: "m1".into(),
            name: name.into(),
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn chat_capacity_drops_oldest() {
        let mut r = room();
        let sender = member("Ana");
        for i in 0..(MAX_CHAT_MESSAGES + 10) {
            apply_client_message(
                &mut r,
                &sender,
                &ClientMessage::ChatAdd {
                    text: format!("msg {i}"),
                    kind: ChatKind::Chat,
                },
                Utc::now(),
            )
            .unwrap();
        }
        assert_eq!(r.chat_messages.len(), MAX_CHAT_MESSAGES);
        assert_eq!(r.chat_messages[0].text, "msg 10");
    }

    #[test]
    fn empty_chat_is_rejected() {
        let mut r = room();
        let err = apply_client_message(
            &mut r,
            &member("Ana"),
            &ClientMessage::ChatAdd {
                text: "   ".into(),
                kind: ChatKind::Chat,
            },
            Utc::now(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn transcript_dedups_consecutive_identical_text() {
        let mut r = room();
        let sender = member("Host");
        for _ in 0..3 {
            apply_client_message(
                &mut r,
                &sender,
                &ClientMessage::TranscriptAdd {
                    text: "same words".into(),
                    source: None,
                },
                Utc::now(),
            )
            .unwrap();
        }
        assert_eq!(r.transcript_chunks.len(), 1);
    }

    #[test]
    fn transcript_add_requests_tick_only_when_stored() {
        let mut r = room();
        let sender = member("Host");
        let first = apply_client_message(
            &mut r,
            &sender,
            &ClientMessage::TranscriptAdd {
                text: "hello".into(),
                source: Some("mic".into()),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(first.schedule_tick);

        let repeat = apply_client_message(
            &mut r,
            &sender,
            &ClientMessage::TranscriptAdd {
                text: "hello".into(),
                source: Some("mic".into()),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(!repeat.schedule_tick);
    }

    #[test]
    fn context_update_unknown_id_errors() {
        let mut r = room();
        let err = apply_client_message(
            &mut r,
            &member("Ana"),
            &ClientMessage::ContextUpdate {
                id: "missing".into(),
                text: None,
                priority: None,
                pinned: None,
            },
            Utc::now(),
        );
        assert!(matches!(
            err,
            Err(ClientMessageError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn freeze_moves_status_and_unfreeze_returns_to_idle() {
        let mut r = room();
        let sender = member("Ana");
        apply_client_message(
            &mut r,
            &sender,
            &ClientMessage::AiConfigUpdate {
                frozen: Some(true),
                focus_mode: None,
                focus_box: None,
                status: None,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(r.ai_config.status, AiStatus::Frozen);

        apply_client_message(
            &mut r,
            &sender,
            &ClientMessage::AiConfigUpdate {
                frozen: Some(false),
                focus_mode: None,
                focus_box: None,
                status: None,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(r.ai_config.status, AiStatus::Idle);
    }

    #[test]
    fn undo_restores_previous_group_snapshot() {
        let now = Utc::now();
        let mut r = room();
        let mut group = DiagramGroup::new("g1".into(), "topic".into(), DiagramType::Tree, now);
        group.title = "Before".into();
        r.diagram_groups.insert("g1".into(), group.clone());
        r.active_group_id = Some("g1".into());
        r.record_ai_history(AiHistoryEntry {
            at: now,
            group_id: Some("g1".into()),
            snapshot: Some(group.clone()),
            fingerprint: "fp".into(),
        });
        r.diagram_groups.get_mut("g1").unwrap().title = "After".into();

        apply_client_message(&mut r, &member("Ana"), &ClientMessage::DiagramUndoAi, now).unwrap();
        assert_eq!(r.diagram_groups["g1"], group);
    }

    #[test]
    fn restore_archived_uses_latest_by_default() {
        let now = Utc::now();
        let mut r = room();
        let mut g = DiagramGroup::new("old".into(), "t".into(), DiagramType::Tree, now);
        g.title = "Sprint".into();
        r.archived_groups.push(g);

        apply_client_message(
            &mut r,
            &member("Ana"),
            &ClientMessage::DiagramRestoreArchived { id: None },
            now,
        )
        .unwrap();
        let restored = r.active_group().unwrap();
        assert!(restored.pinned);
        assert_eq!(restored.title, "[Restored] Sprint");
        assert_ne!(restored.id, "old");
    }

    #[test]
    fn wire_names_round_trip() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"chat:add","text":"hi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::ChatAdd { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"visualHint:set","value":"timeline"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::VisualHintSet { .. }));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"client:ack","protocol":"senseboard-ws-v1","sentAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Ack { .. }));
    }

    #[test]
    fn has_ai_signal_reflects_inputs() {
        let mut r = room();
        assert!(!r.has_ai_signal());
        r.visual_hint = "timeline".into();
        assert!(r.has_ai_signal());
    }
}

pub mod fingerprint;
pub mod generate;
pub mod input;
pub mod layering;
pub mod personal;

use crate::archive;
use crate::config::{transcript_archive_enabled, Config};
use crate::diagram::{
    apply_patch_to_group, cleanup_actions, is_topic_shift, render::render_group, DiagramGroup,
    DiagramPatch, MAX_ARCHIVED_GROUPS,
};
use crate::error::RouterExhausted;
use crate::metrics::metrics;
use crate::personalization::PersonalizationStore;
use crate::prompts::PromptSet;
use crate::providers::{resolve_agent, Agent};
use crate::room::registry::{RoomHandle, Rooms};
use crate::room::{push_bounded, AiHistoryEntry, AiStatus};
use crate::transcribe::{normalize_mime, TranscriptionRouter};
use chrono::Utc;
use fingerprint::fingerprint_of;
use generate::{generate_board_ops, generate_diagram_patch};
use input::{assemble_ai_input, AiReason, AiTrigger};
use layering::stack_ai_ops;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

pub const AI_MIN_INTERVAL_MS: i64 = 1400;
pub const AI_IDLE_AFTER_INACTIVITY_MS: u64 = 600_000;
pub const AI_QUEUE_CAP: usize = 120;
pub const DEFAULT_WINDOW_SECONDS: u64 = 90;
pub const MIN_AUDIO_BYTES: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchInfo {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPatchOutcome {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchInfo>,
}

impl AiPatchOutcome {
    pub fn skipped(reason: &'static str) -> Self {
        Self {
            applied: false,
            reason: Some(reason),
            patch: None,
        }
    }

    pub fn applied(kind: &'static str, summary: Option<String>) -> Self {
        Self {
            applied: true,
            reason: None,
            patch: Some(PatchInfo { kind, summary }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AiJobRequest {
    pub reason: AiReason,
    pub regenerate: bool,
    pub window_seconds: u64,
    pub transcript_chunk_count: Option<usize>,
}

impl Default for AiJobRequest {
    fn default() -> Self {
        Self {
            reason: AiReason::Manual,
            regenerate: false,
            window_seconds: DEFAULT_WINDOW_SECONDS,
            transcript_chunk_count: None,
        }
    }
}

impl AiJobRequest {
    fn trigger(&self) -> AiTrigger {
        AiTrigger {
            reason: self.reason,
            regenerate: self.regenerate,
            transcript_chunk_count: self.transcript_chunk_count,
        }
    }
}

struct AiJob {
    request: AiJobRequest,
    responders: Vec<oneshot::Sender<AiPatchOutcome>>,
}

/// FIFO queue with a single consumer task. `active` is true while a drain
/// task owns the queue.
pub(crate) struct JobQueue {
    jobs: Mutex<VecDeque<AiJob>>,
    active: AtomicBool,
}

impl JobQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(false),
        })
    }

    pub(crate) async fn is_drained(&self) -> bool {
        !self.active.load(Ordering::SeqCst) && self.jobs.lock().await.is_empty()
    }
}

enum JobTarget {
    Main {
        room_id: String,
    },
    Personal {
        room_id: String,
        member_name: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TranscribeOutcome {
    fn accepted(text: String) -> Self {
        Self {
            ok: true,
            text: Some(text),
            accepted: Some(true),
            reason: None,
            error: None,
        }
    }

    fn skipped(reason: &'static str) -> Self {
        Self {
            ok: true,
            text: Some(String::new()),
            accepted: Some(false),
            reason: Some(reason),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            text: None,
            accepted: None,
            reason: None,
            error: Some(error),
        }
    }
}

/// Process-wide engine: rooms, provider chains, per-room AI queues, idle
/// timers, and the personalized board machinery.
pub struct Engine {
    pub config: Config,
    pub rooms: Rooms,
    pub agent: Agent,
    pub transcriber: TranscriptionRouter,
    pub prompts: PromptSet,
    pub personalization: PersonalizationStore,
    pub started_at: chrono::DateTime<Utc>,
    pub instance_id: String,
    queues: Mutex<HashMap<String, Arc<JobQueue>>>,
    idle_generation: Mutex<HashMap<String, u64>>,
    pub(crate) personal: personal::PersonalEngine,
}

impl Engine {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let agent = resolve_agent(&config);
        let transcriber = TranscriptionRouter::from_config(&config);
        let prompts = PromptSet::load(config.prompts_dir.as_deref().map(std::path::Path::new));
        let personalization = PersonalizationStore::open(
            std::path::Path::new(&config.personalization.sqlite_path),
            config.personalization.max_context_lines,
        )?;
        Ok(Arc::new(Self {
            config,
            rooms: Rooms::new(),
            agent,
            transcriber,
            prompts,
            personalization,
            started_at: Utc::now(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            queues: Mutex::new(HashMap::new()),
            idle_generation: Mutex::new(HashMap::new()),
            personal: personal::PersonalEngine::default(),
        }))
    }

    #[cfg(test)]
    pub fn for_tests(agent: Agent, transcriber: TranscriptionRouter) -> Arc<Self> {
        Arc::new(Self {
            config: Config::default(),
            rooms: Rooms::new(),
            agent,
            transcriber,
            prompts: PromptSet::default(),
            personalization: PersonalizationStore::open_in_memory(24).unwrap(),
            started_at: Utc::now(),
            instance_id: "test-instance".into(),
            queues: Mutex::new(HashMap::new()),
            idle_generation: Mutex::new(HashMap::new()),
            personal: personal::PersonalEngine::default(),
        })
    }

    pub(crate) async fn queue_for(&self, room_id: &str) -> Arc<JobQueue> {
        let key = room_id.trim().to_uppercase();
        self.queues
            .lock()
            .await
            .entry(key)
            .or_insert_with(JobQueue::new)
            .clone()
    }

    /// Enqueue a main AI job. Mergeable ticks coalesce into an already
    /// queued tick instead of growing the backlog; the queue caps at 120
    /// with oldest-first overflow.
    pub async fn schedule_ai_patch(
        self: &Arc<Self>,
        room_id: &str,
        request: AiJobRequest,
    ) -> oneshot::Receiver<AiPatchOutcome> {
        let queue = self.queue_for(room_id).await;
        let (tx, rx) = oneshot::channel();

        {
            let mut jobs = queue.jobs.lock().await;
            if request.reason == AiReason::Tick && !request.regenerate {
                if let Some(existing) = jobs
                    .iter_mut()
                    .find(|j| j.request.reason == AiReason::Tick && !j.request.regenerate)
                {
                    existing.request.transcript_chunk_count =
                        match (existing.request.transcript_chunk_count, request.transcript_chunk_count)
                        {
                            (Some(a), Some(b)) => Some(a.max(b)),
                            _ => None,
                        };
                    existing.request.window_seconds = request.window_seconds;
                    existing.responders.push(tx);
                    return rx;
                }
            }
            if jobs.len() >= AI_QUEUE_CAP {
                if let Some(dropped) = jobs.pop_front() {
                    metrics()
                        .ai_jobs_total
                        .with_label_values(&["main", "queue_overflow"])
                        .inc();
                    for responder in dropped.responders {
                        let _ = responder.send(AiPatchOutcome::skipped("queue_overflow"));
                    }
                }
            }
            jobs.push_back(AiJob {
                request,
                responders: vec![tx],
            });
        }

        self.ensure_drain(
            queue,
            JobTarget::Main {
                room_id: room_id.trim().to_uppercase(),
            },
        );
        rx
    }

    /// Fire-and-forget tick after new transcript/chat/context input.
    pub async fn schedule_tick(self: &Arc<Self>, room_id: &str, transcript_chunk_count: usize) {
        let _ = self
            .schedule_ai_patch(
                room_id,
                AiJobRequest {
                    reason: AiReason::Tick,
                    regenerate: false,
                    window_seconds: DEFAULT_WINDOW_SECONDS,
                    transcript_chunk_count: Some(transcript_chunk_count),
                },
            )
            .await;
    }

    fn ensure_drain(self: &Arc<Self>, queue: Arc<JobQueue>, target: JobTarget) {
        if queue.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let job = { queue.jobs.lock().await.pop_front() };
                match job {
                    Some(job) => {
                        let outcome = match &target {
                            JobTarget::Main { room_id } => {
                                engine.run_main_job(room_id, &job.request).await
                            }
                            JobTarget::Personal {
                                room_id,
                                member_name,
                            } => {
                                engine
                                    .run_personal_job(room_id, member_name, &job.request)
                                    .await
                            }
                        };
                        for responder in job.responders {
                            let _ = responder.send(outcome.clone());
                        }
                    }
                    None => {
                        queue.active.store(false, Ordering::SeqCst);
                        if queue.jobs.lock().await.is_empty() {
                            break;
                        }
                        // A job slipped in while we were deactivating.
                        if queue.active.swap(true, Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn set_status(&self, handle: &RoomHandle, status: AiStatus) {
        let mut room = handle.lock().await;
        if !room.ai_config.frozen {
            room.ai_config.status = status;
        }
    }

    async fn run_main_job(self: &Arc<Self>, room_id: &str, request: &AiJobRequest) -> AiPatchOutcome {
        let outcome = self.run_main_job_inner(room_id, request).await;
        let label = match &outcome {
            Ok(outcome) => outcome
                .patch
                .as_ref()
                .map(|p| p.kind)
                .or(outcome.reason)
                .unwrap_or("unknown"),
            Err(_) => "ai_error",
        };
        metrics()
            .ai_jobs_total
            .with_label_values(&["main", label])
            .inc();
        match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(room = room_id, error = %err, "ai job failed");
                AiPatchOutcome::skipped("ai_error")
            }
        }
    }

    async fn run_main_job_inner(
        self: &Arc<Self>,
        room_id: &str,
        request: &AiJobRequest,
    ) -> anyhow::Result<AiPatchOutcome> {
        self.record_activity(room_id).await;
        let handle = self.rooms.get_or_create(room_id).await;
        let now = Utc::now();

        let (input, frozen, last_patch_at, last_fingerprint) = {
            let room = handle.lock().await;
            (
                assemble_ai_input(&room, request.window_seconds, &request.trigger(), now),
                room.ai_config.frozen,
                room.last_ai_patch_at,
                room.last_ai_fingerprint.clone(),
            )
        };

        if frozen && !request.regenerate {
            return Ok(AiPatchOutcome::skipped("frozen"));
        }

        if !request.regenerate {
            if let Some(last) = last_patch_at {
                let wait = AI_MIN_INTERVAL_MS - (now - last).num_milliseconds();
                if wait > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(wait as u64)).await;
                }
            }
        }

        if request.reason == AiReason::Tick && !input.has_signal() {
            self.set_status(&handle, AiStatus::Listening).await;
            self.rooms.broadcast_snapshot(room_id).await;
            return Ok(AiPatchOutcome::skipped("no_signal"));
        }

        let base_fingerprint = fingerprint_of(&input);
        let board_fingerprint = format!("{base_fingerprint}:board_ops");
        let diagram_fingerprint = format!("{base_fingerprint}:diagram_patch");
        if request.reason == AiReason::Tick
            && (last_fingerprint.as_deref() == Some(board_fingerprint.as_str())
                || last_fingerprint.as_deref() == Some(diagram_fingerprint.as_str()))
        {
            return Ok(AiPatchOutcome::skipped("no_change"));
        }

        self.set_status(&handle, AiStatus::Updating).await;
        self.rooms.broadcast_snapshot(room_id).await;

        let mut applied: Option<(&'static str, Option<String>, String)> = None;

        match generate_board_ops(&self.agent, &self.prompts, &input, now).await {
            Ok(patch) if !patch.ops.is_empty() => {
                let stack = {
                    let mut room = handle.lock().await;
                    stack_ai_ops(&mut room.board, &patch.ops, Utc::now())
                };
                if stack.revision_changed && stack.renderable {
                    applied = Some(("board_ops", patch.summary, board_fingerprint));
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(room = room_id, error = %err, "board ops providers exhausted");
            }
        }

        if applied.is_none() {
            let patch = generate_diagram_patch(
                &self.agent,
                &input,
                self.config.ai.review.confidence_threshold,
                self.config.ai.review.max_revisions,
            )
            .await;
            if !patch.actions.is_empty() {
                let topic = patch.topic.clone();
                self.apply_diagram_patch(&handle, patch, &diagram_fingerprint)
                    .await;
                applied = Some(("diagram_patch", Some(topic), diagram_fingerprint));
            }
        }

        match applied {
            Some((kind, summary, fingerprint)) => {
                {
                    let mut room = handle.lock().await;
                    room.last_ai_patch_at = Some(Utc::now());
                    room.last_ai_fingerprint = Some(fingerprint);
                    if !room.ai_config.frozen {
                        room.ai_config.status = AiStatus::Listening;
                    }
                }
                self.rooms.broadcast_snapshot(room_id).await;
                self.record_activity(room_id).await;
                Ok(AiPatchOutcome::applied(kind, summary))
            }
            None => {
                self.set_status(&handle, AiStatus::Listening).await;
                self.rooms.broadcast_snapshot(room_id).await;
                Ok(AiPatchOutcome::skipped(
                    if request.reason == AiReason::Tick {
                        "no_change"
                    } else {
                        "ai_no_response"
                    },
                ))
            }
        }
    }

    /// Apply a diagram patch to its target group: undo snapshot, topic-shift
    /// archival, stale-shape cleanup, then render onto the board.
    async fn apply_diagram_patch(
        &self,
        handle: &RoomHandle,
        mut patch: DiagramPatch,
        fingerprint: &str,
    ) {
        let now = Utc::now();
        let mut room = handle.lock().await;

        let group_id = patch
            .target_group_id
            .clone()
            .filter(|id| room.diagram_groups.contains_key(id))
            .or_else(|| {
                room.active_group()
                    .filter(|g| !g.pinned)
                    .map(|g| g.id.clone())
            })
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let snapshot = room.diagram_groups.get(&group_id).cloned();
        room.record_ai_history(AiHistoryEntry {
            at: now,
            group_id: Some(group_id.clone()),
            snapshot: snapshot.clone(),
            fingerprint: fingerprint.to_string(),
        });

        // Cleanup is computed against the group as it stands, so its stale
        // shape ids reach the board even when a topic shift clears the group.
        let mut cleanup = snapshot
            .as_ref()
            .map(|group| cleanup_actions(group, &patch))
            .unwrap_or_default();
        let stale_ids: Vec<String> = cleanup
            .iter()
            .filter_map(|action| match action {
                crate::diagram::DiagramPatchAction::DeleteShape { id } => Some(id.clone()),
                _ => None,
            })
            .collect();

        match snapshot {
            Some(existing) if is_topic_shift(&existing, &patch) => {
                push_bounded(&mut room.archived_groups, existing, MAX_ARCHIVED_GROUPS);
                room.diagram_groups.insert(
                    group_id.clone(),
                    DiagramGroup::new(group_id.clone(), patch.topic.clone(), patch.diagram_type, now),
                );
            }
            Some(_) => {}
            None => {
                room.diagram_groups.insert(
                    group_id.clone(),
                    DiagramGroup::new(group_id.clone(), patch.topic.clone(), patch.diagram_type, now),
                );
            }
        }

        cleanup.append(&mut patch.actions);
        patch.actions = cleanup;

        let Some(group) = room.diagram_groups.get_mut(&group_id) else {
            return;
        };
        let mut deleted = apply_patch_to_group(group, &patch, now);
        for id in stale_ids {
            if !deleted.contains(&id) {
                deleted.push(id);
            }
        }
        let ops = render_group(group, &deleted, now);
        room.active_group_id = Some(group_id);
        crate::board::apply_ops(&mut room.board, &ops, now);
    }

    /// Stamp activity and re-arm the idle timer; a room with no AI activity
    /// for ten minutes drifts back to `idle`.
    pub async fn record_activity(self: &Arc<Self>, room_id: &str) {
        let key = room_id.trim().to_uppercase();
        let generation = {
            let mut map = self.idle_generation.lock().await;
            let slot = map.entry(key.clone()).or_insert(0);
            *slot += 1;
            *slot
        };
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(AI_IDLE_AFTER_INACTIVITY_MS))
                .await;
            let current = engine.idle_generation.lock().await.get(&key).copied();
            if current != Some(generation) {
                return;
            }
            let Some(handle) = engine.rooms.get(&key).await else {
                return;
            };
            {
                let mut room = handle.lock().await;
                if room.ai_config.frozen {
                    return;
                }
                room.ai_config.status = AiStatus::Idle;
            }
            engine.rooms.broadcast_snapshot(&key).await;
        });
    }

    /// Main-AI preflight over the generation chain.
    pub async fn ai_preflight(&self) -> Result<&'static str, RouterExhausted> {
        if self.agent.is_empty() {
            return Ok("deterministic");
        }
        self.agent.preflight().await
    }

    /// The transcription endpoint's whole pipeline: size gate, optional raw
    /// capture, router, room update, archive, broadcast, tick scheduling.
    pub async fn handle_transcribe(
        self: &Arc<Self>,
        room_id: &str,
        speaker: &str,
        bytes: &[u8],
        mime: &str,
    ) -> TranscribeOutcome {
        if bytes.len() < MIN_AUDIO_BYTES {
            return TranscribeOutcome::skipped("audio_too_small");
        }
        let mime = normalize_mime(mime);
        let now = Utc::now();
        archive::capture_audio_chunk(
            &self.config.capture.transcription_chunks,
            room_id,
            speaker,
            crate::providers::openai::extension_for_mime(mime),
            bytes,
            now,
        );

        let (text, _provider) = match self.transcriber.transcribe(bytes, mime).await {
            Ok(result) => result,
            Err(err) => return TranscribeOutcome::failed(err.joined),
        };

        let handle = self.rooms.get_or_create(room_id).await;
        let (stored, chunk_count) = {
            let mut room = handle.lock().await;
            let stored = room
                .add_transcript_chunk(speaker, &text, "mic", now)
                .is_some();
            if stored && !room.ai_config.frozen && room.ai_config.status == AiStatus::Idle {
                room.ai_config.status = AiStatus::Listening;
            }
            (stored, room.transcript_chunks.len())
        };
        if !stored {
            return TranscribeOutcome::skipped("empty_transcript");
        }

        if transcript_archive_enabled() {
            archive::archive_transcript_row(None, room_id, speaker, &text, "mic", now);
        }

        self.rooms.broadcast_snapshot(room_id).await;
        self.record_activity(room_id).await;
        self.schedule_tick(room_id, chunk_count).await;
        self.schedule_deferred_personal(room_id, false, Some(chunk_count), DEFAULT_WINDOW_SECONDS)
            .await;

        TranscribeOutcome::accepted(text)
    }

    /// Disarm timers and drop queued (unstarted) jobs. In-flight jobs run to
    /// completion; their responders resolve normally.
    pub async fn shutdown(&self) {
        for generation in self.idle_generation.lock().await.values_mut() {
            *generation += 1;
        }
        self.personal.clear().await;
        let queues = self.queues.lock().await;
        for queue in queues.values() {
            queue.jobs.lock().await.clear();
        }
    }

    /// Prompt preview for debugging: what one manual job would send.
    pub async fn prompt_preview(&self, room_id: &str) -> serde_json::Value {
        let handle = self.rooms.get_or_create(room_id).await;
        let room = handle.lock().await;
        let input = assemble_ai_input(
            &room,
            DEFAULT_WINDOW_SECONDS,
            &AiTrigger {
                reason: AiReason::Manual,
                regenerate: false,
                transcript_chunk_count: None,
            },
            Utc::now(),
        );
        let payload = serde_json::to_value(&input).unwrap_or_default();
        serde_json::json!({
            "id": room.id,
            "request": { "reason": "manual", "windowSeconds": DEFAULT_WINDOW_SECONDS },
            "systemPrompt": self.prompts.board_system(),
            "userPrompt": self.prompts.board_user(&payload.to_string()),
            "payload": payload,
        })
    }
}


#[cfg(test)]
mod run_state_tests {
    use super::*;

    #[tokio::test]
    async fn board_revision_is_monotonic_across_jobs() {
        let provider = Arc::new(crate::providers::mock::MockProvider::scripted(vec![
            Ok(serde_json::json!({"ops":[{"type":"upsertElement","element":{"id":"a","kind":"rect","x":0,"y":0,"w":10,"h":10}}]}).to_string()),
            Ok(serde_json::json!({"ops":[{"type":"upsertElement","element":{"id":"b","kind":"rect","x":0,"y":0,"w":10,"h":10}}]}).to_string()),
        ]));
        let engine = Engine::for_tests(
            Agent::new(vec![provider]),
            TranscriptionRouter::new(vec![]),
        );
        {
            let handle = engine.rooms.get_or_create("RM").await;
            let mut room = handle.lock().await;
            room.add_transcript_chunk("Host", "keep the diagram fresh", "mic", Utc::now());
        }

        let mut last = 0;
        for _ in 0..2 {
            let _ = engine
                .schedule_ai_patch(
                    "RM",
                    AiJobRequest {
                        regenerate: true,
                        ..Default::default()
                    },
                )
                .await
                .await;
            let handle = engine.rooms.get_or_create("RM").await;
            let revision = handle.lock().await.board.revision;
            assert!(revision >= last);
            last = revision;
        }
        assert!(last > 0);
    }

    #[tokio::test]
    async fn room_state_survives_ai_error() {
        // Provider returns unusable JSON -> falls into fallback paths; the
        // room stays consistent either way.
        let provider = Arc::new(crate::providers::mock::MockProvider::scripted(vec![Ok(
            "complete nonsense".into(),
        )]));
        let engine = Engine::for_tests(
            Agent::new(vec![provider]),
            TranscriptionRouter::new(vec![]),
        );
        {
            let handle = engine.rooms.get_or_create("RE").await;
            let mut room = handle.lock().await;
            room.add_transcript_chunk("Host", "some words to work with", "mic", Utc::now());
        }
        let outcome = engine
            .schedule_ai_patch("RE", AiJobRequest::default())
            .await
            .await
            .unwrap();
        // Unusable provider output still yields the transcript fallback.
        assert!(outcome.applied);
        let handle = engine.rooms.get_or_create("RE").await;
        assert!(handle.lock().await.board.is_consistent());
    }
}

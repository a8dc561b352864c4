//! Per-(room, member) side boards: own state, own queue, deferred behind the
//! main board so personalized output reflects the freshly updated room.

use super::generate::generate_with_system;
use super::input::{assemble_ai_input, AiReason};
use super::layering::stack_ai_ops;
use super::{AiJob, AiJobRequest, AiPatchOutcome, Engine, JobQueue, JobTarget, AI_QUEUE_CAP};
use crate::board::BoardState;
use crate::metrics::metrics;
use crate::personalization::name_key;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

pub const PERSONAL_AI_DEFER_AFTER_MAIN_MS: u64 = 240;
const MAIN_QUEUE_WAIT_SLICE_MS: u64 = 20;
const MAIN_QUEUE_WAIT_MAX_MS: u64 = 1500;
const PERSONAL_CONTEXT_LINES: usize = 12;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalBoardState {
    pub board: BoardState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ai_patch_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ai_fingerprint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PersonalBoardState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            board: BoardState::new(now),
            last_ai_patch_at: None,
            last_ai_fingerprint: None,
            updated_at: now,
        }
    }
}

struct DeferredPersonal {
    generation: u64,
    regenerate: bool,
    transcript_chunk_count: Option<usize>,
    window_seconds: u64,
}

#[derive(Default)]
pub(crate) struct PersonalEngine {
    states: Mutex<HashMap<String, PersonalBoardState>>,
    queues: Mutex<HashMap<String, Arc<JobQueue>>>,
    deferred: Mutex<HashMap<String, DeferredPersonal>>,
}

fn personal_key(room_id: &str, member_name: &str) -> String {
    format!("{}:{}", room_id.trim().to_uppercase(), name_key(member_name))
}

impl PersonalEngine {
    /// Drop pending deferred flushes and queued personal jobs.
    pub(crate) async fn clear(&self) {
        self.deferred.lock().await.clear();
        for queue in self.queues.lock().await.values() {
            queue.jobs.lock().await.clear();
        }
    }
}

impl Engine {
    /// Current personalized board for a member, default-empty when none has
    /// been generated yet.
    pub async fn personal_board(&self, room_id: &str, member_name: &str) -> PersonalBoardState {
        let key = personal_key(room_id, member_name);
        self.personal
            .states
            .lock()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_else(|| PersonalBoardState::new(Utc::now()))
    }

    async fn personal_queue_for(&self, key: &str) -> Arc<JobQueue> {
        self.personal
            .queues
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(JobQueue::new)
            .clone()
    }

    /// Enqueue a personalized job; the HTTP surface replies `queued`
    /// immediately and clients pick the result up from the board endpoint.
    pub async fn schedule_personal_patch(
        self: &Arc<Self>,
        room_id: &str,
        member_name: &str,
        request: AiJobRequest,
    ) -> oneshot::Receiver<AiPatchOutcome> {
        let key = personal_key(room_id, member_name);
        let queue = self.personal_queue_for(&key).await;
        let (tx, rx) = oneshot::channel();
        {
            let mut jobs = queue.jobs.lock().await;
            if jobs.len() >= AI_QUEUE_CAP {
                if let Some(dropped) = jobs.pop_front() {
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
            JobTarget::Personal {
                room_id: room_id.trim().to_uppercase(),
                member_name: member_name.to_string(),
            },
        );
        rx
    }

    /// Consolidate personalized ticks behind one short timer per room. A new
    /// trigger merges into the pending one and re-arms the delay.
    pub async fn schedule_deferred_personal(
        self: &Arc<Self>,
        room_id: &str,
        regenerate: bool,
        transcript_chunk_count: Option<usize>,
        window_seconds: u64,
    ) {
        let key = room_id.trim().to_uppercase();
        let generation = {
            let mut deferred = self.personal.deferred.lock().await;
            let entry = deferred.entry(key.clone()).or_insert(DeferredPersonal {
                generation: 0,
                regenerate: false,
                transcript_chunk_count: None,
                window_seconds,
            });
            entry.generation += 1;
            entry.regenerate |= regenerate;
            entry.transcript_chunk_count =
                match (entry.transcript_chunk_count, transcript_chunk_count) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (None, b @ Some(_)) => b,
                    (a, None) => a,
                };
            entry.window_seconds = window_seconds;
            entry.generation
        };

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(
                PERSONAL_AI_DEFER_AFTER_MAIN_MS,
            ))
            .await;

            let request = {
                let mut deferred = engine.personal.deferred.lock().await;
                match deferred.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        let request = AiJobRequest {
                            reason: AiReason::Tick,
                            regenerate: entry.regenerate,
                            window_seconds: entry.window_seconds,
                            transcript_chunk_count: entry.transcript_chunk_count,
                        };
                        deferred.remove(&key);
                        request
                    }
                    _ => return,
                }
            };

            let member_names: Vec<String> = match engine.rooms.get(&key).await {
                Some(handle) => {
                    let room = handle.lock().await;
                    room.members.iter().map(|m| m.name.clone()).collect()
                }
                None => return,
            };
            for name in member_names {
                let _ = engine
                    .schedule_personal_patch(&key, &name, request.clone())
                    .await;
            }
        });
    }

    /// Wait for the sibling main queue to drain, in small slices, bounded.
    async fn wait_for_main_queue(&self, room_id: &str) {
        let queue = self.queue_for(room_id).await;
        let mut waited = 0;
        while waited < MAIN_QUEUE_WAIT_MAX_MS {
            if queue.is_drained().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(MAIN_QUEUE_WAIT_SLICE_MS)).await;
            waited += MAIN_QUEUE_WAIT_SLICE_MS;
        }
    }

    pub(super) async fn run_personal_job(
        self: &Arc<Self>,
        room_id: &str,
        member_name: &str,
        request: &AiJobRequest,
    ) -> AiPatchOutcome {
        let outcome = self
            .run_personal_job_inner(room_id, member_name, request)
            .await;
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
            .with_label_values(&["personal", label])
            .inc();
        match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(room = room_id, member = member_name, error = %err, "personal ai job failed");
                AiPatchOutcome::skipped("ai_error")
            }
        }
    }

    async fn run_personal_job_inner(
        self: &Arc<Self>,
        room_id: &str,
        member_name: &str,
        request: &AiJobRequest,
    ) -> anyhow::Result<AiPatchOutcome> {
        self.wait_for_main_queue(room_id).await;

        let handle = self.rooms.get_or_create(room_id).await;
        let now = Utc::now();
        let (input, frozen) = {
            let room = handle.lock().await;
            (
                assemble_ai_input(&room, request.window_seconds, &request.trigger(), now),
                room.ai_config.frozen,
            )
        };
        if frozen && !request.regenerate {
            return Ok(AiPatchOutcome::skipped("frozen"));
        }
        if request.reason == AiReason::Tick && !input.has_signal() {
            return Ok(AiPatchOutcome::skipped("no_signal"));
        }

        let context_lines = self
            .personalization
            .prompt_lines(member_name, PERSONAL_CONTEXT_LINES)
            .await
            .unwrap_or_default();
        let member_salt = super::fingerprint_of(&serde_json::json!({
            "memberKey": name_key(member_name),
            "contextLines": context_lines,
        }));
        let fingerprint = format!(
            "{}:{}:personal_board_ops",
            super::fingerprint_of(&input),
            member_salt
        );

        let key = personal_key(room_id, member_name);
        if request.reason == AiReason::Tick {
            let states = self.personal.states.lock().await;
            if states
                .get(&key)
                .and_then(|s| s.last_ai_fingerprint.as_deref())
                == Some(fingerprint.as_str())
            {
                return Ok(AiPatchOutcome::skipped("no_change"));
            }
        }

        let system = self
            .prompts
            .personal_board_system(member_name, &context_lines);
        let payload = serde_json::to_string(&input).unwrap_or_default();
        let user = self.prompts.board_user(&payload);

        let (envelope, _provider) = match generate_with_system(
            &self.agent,
            &system,
            &user,
            &input.transcript_window,
            now,
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(room = room_id, member = member_name, error = %err, "personal providers exhausted");
                (
                    super::generate::BoardOpsEnvelope {
                        summary: None,
                        text: None,
                        ops: super::generate::transcript_fallback_ops(
                            &input.transcript_window,
                            now,
                        ),
                    },
                    None,
                )
            }
        };

        if envelope.ops.is_empty() {
            return Ok(AiPatchOutcome::skipped(
                if request.reason == AiReason::Tick {
                    "no_change"
                } else {
                    "ai_no_response"
                },
            ));
        }

        let mut states = self.personal.states.lock().await;
        let state = states
            .entry(key)
            .or_insert_with(|| PersonalBoardState::new(now));
        let stack = stack_ai_ops(&mut state.board, &envelope.ops, Utc::now());
        if !(stack.revision_changed && stack.renderable) {
            return Ok(AiPatchOutcome::skipped(
                if request.reason == AiReason::Tick {
                    "no_change"
                } else {
                    "ai_no_response"
                },
            ));
        }
        state.last_ai_patch_at = Some(Utc::now());
        state.last_ai_fingerprint = Some(fingerprint);
        state.updated_at = Utc::now();

        Ok(AiPatchOutcome::applied("personal_board_ops", envelope.summary))
    }
}

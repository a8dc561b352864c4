//! Turning provider responses into board ops: strict parse first, then a
//! forgiving coercion layer (alias keys, alias op names), then a balanced-
//! brace salvage scan over the raw text. Whatever survives is auto-labeled
//! and capped; when nothing survives, a deterministic transcript rendering
//! takes over.

use super::fingerprint::fingerprint_of;
use super::input::AiInput;
use crate::board::{BoardOp, ElementKind};
use crate::diagram::builders::build_diagram_patch;
use crate::diagram::review::review_and_revise;
use crate::diagram::DiagramPatch;
use crate::error::RouterExhausted;
use crate::prompts::PromptSet;
use crate::providers::Agent;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

pub const MAX_TOP_OPS: usize = 900;
pub const MAX_NESTED_OPS: usize = 600;
const MAX_AUTO_LABELS: usize = 10;
const FALLBACK_LINES: usize = 6;

#[derive(Debug, Clone, Default)]
pub struct BoardOpsEnvelope {
    pub summary: Option<String>,
    pub text: Option<String>,
    pub ops: Vec<BoardOp>,
}

#[derive(Debug, Clone)]
pub struct GeneratedPatch {
    pub ops: Vec<BoardOp>,
    pub fingerprint: String,
    pub summary: Option<String>,
    pub text: Option<String>,
    pub provider: Option<&'static str>,
}

// ── Coercion ────────────────────────────────────────────────────────────────

/// Map a sloppy op name onto the canonical vocabulary.
fn canonical_op_name(raw: &str) -> Option<&'static str> {
    let folded: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    Some(match folded.as_str() {
        "upsertelement" | "upsert" | "addelement" | "createelement" => "upsertElement",
        "clearboard" | "clear" | "reset" => "clearBoard",
        "appendstrokepoints" | "appendpoints" | "addpoints" => "appendStrokePoints",
        "deleteelement" | "delete" | "remove" | "removeelement" => "deleteElement",
        "offsetelement" | "offset" | "move" | "translate" => "offsetElement",
        "setelementgeometry" | "setgeometry" | "resize" => "setElementGeometry",
        "setelementstyle" | "setstyle" => "setElementStyle",
        "setelementtext" | "settext" => "setElementText",
        "duplicateelement" | "duplicate" | "clone" => "duplicateElement",
        "setelementzindex" | "setzindex" | "zindex" => "setElementZIndex",
        "alignelements" | "align" => "alignElements",
        "distributeelements" | "distribute" => "distributeElements",
        "setviewport" | "viewport" => "setViewport",
        "batch" => "batch",
        _ => return None,
    })
}

const OPS_KEYS: &[&str] = &["ops", "operations", "items", "build_ops", "buildOps", "boardOps"];
const TYPE_KEYS: &[&str] = &["type", "op", "action"];

fn op_type_of(map: &Map<String, Value>) -> Option<&'static str> {
    TYPE_KEYS
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_str))
        .and_then(canonical_op_name)
}

fn ops_array_of(map: &Map<String, Value>) -> Option<&Vec<Value>> {
    OPS_KEYS.iter().find_map(|key| map.get(*key).and_then(Value::as_array))
}

/// Fill the fields serde requires but models habitually omit.
fn normalize_element(element: &mut Map<String, Value>, now: DateTime<Utc>) {
    if !element.contains_key("createdAt") {
        element.insert("createdAt".into(), Value::String(now.to_rfc3339()));
    }
    if !element.contains_key("createdBy") {
        element.insert("createdBy".into(), Value::String("ai".into()));
    }
    // "shape" is a common alias for "kind".
    if !element.contains_key("kind") {
        if let Some(shape) = element.remove("shape") {
            element.insert("kind".into(), shape);
        }
    }
    if let Some(Value::String(kind)) = element.get_mut("kind") {
        *kind = kind.to_lowercase();
    }
}

/// Coerce one op-shaped value into a [`BoardOp`]; returns `None` when the
/// value is beyond repair.
pub fn coerce_op(value: &Value, now: DateTime<Utc>) -> Option<BoardOp> {
    let map = value.as_object()?;
    let op_type = op_type_of(map)?;

    let mut normalized = map.clone();
    for key in TYPE_KEYS {
        normalized.remove(*key);
    }
    normalized.insert("type".into(), Value::String(op_type.into()));

    match op_type {
        "upsertElement" => {
            let mut element = match normalized.remove("element") {
                Some(Value::Object(element)) => element,
                Some(_) => return None,
                None => {
                    // Inline form: the op object doubles as the element.
                    let mut inline = normalized.clone();
                    inline.remove("type");
                    inline
                }
            };
            normalize_element(&mut element, now);
            element.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())?;
            normalized.retain(|key, _| key == "type");
            normalized.insert("element".into(), Value::Object(element));
        }
        "batch" => {
            let nested = ops_array_of(&normalized)
                .cloned()
                .unwrap_or_default();
            for key in OPS_KEYS {
                normalized.remove(*key);
            }
            let coerced: Vec<Value> = nested
                .iter()
                .take(MAX_NESTED_OPS)
                .filter_map(|v| coerce_op(v, now))
                .filter_map(|op| serde_json::to_value(op).ok())
                .collect();
            normalized.insert("ops".into(), Value::Array(coerced));
        }
        _ => {}
    }

    serde_json::from_value(Value::Object(normalized)).ok()
}

/// Coerce a whole response value into a board-ops envelope.
pub fn coerce_envelope(value: &Value, now: DateTime<Utc>) -> Option<BoardOpsEnvelope> {
    let raw_ops: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => {
            // A bare op object is accepted as a one-op envelope.
            match ops_array_of(map) {
                Some(ops) => ops.clone(),
                None if op_type_of(map).is_some() => vec![value.clone()],
                None => return None,
            }
        }
        _ => return None,
    };

    let mut envelope = BoardOpsEnvelope::default();
    if let Value::Object(map) = value {
        envelope.summary = map
            .get("summary")
            .or_else(|| map.get("description"))
            .and_then(Value::as_str)
            .map(str::to_string);
        envelope.text = map.get("text").and_then(Value::as_str).map(str::to_string);
    }

    envelope.ops = raw_ops
        .iter()
        .take(MAX_TOP_OPS)
        .filter_map(|v| coerce_op(v, now))
        .collect();

    synthesize_text_panel(&mut envelope, now);
    Some(envelope)
}

/// A payload `text` with no text element anywhere becomes a panel of text
/// lines so the words are not silently lost.
fn synthesize_text_panel(envelope: &mut BoardOpsEnvelope, now: DateTime<Utc>) {
    let Some(text) = envelope.text.clone().filter(|t| !t.trim().is_empty()) else {
        return;
    };
    let has_text_element = envelope.ops.iter().any(|op| match op {
        BoardOp::UpsertElement { element } => {
            element.kind == ElementKind::Text
                || element.text.as_deref().is_some_and(|t| !t.is_empty())
        }
        BoardOp::SetElementText { .. } => true,
        _ => false,
    });
    if has_text_element {
        return;
    }
    for (i, line) in text.lines().filter(|l| !l.trim().is_empty()).take(8).enumerate() {
        envelope.ops.push(BoardOp::UpsertElement {
            element: crate::board::BoardElement {
                id: format!("text_panel_{i}"),
                kind: ElementKind::Text,
                x: Some(40.0),
                y: Some(80.0 + i as f64 * 36.0),
                w: None,
                h: None,
                text: Some(line.trim().to_string()),
                title: None,
                points: None,
                style: None,
                created_at: now,
                created_by: "ai".into(),
            },
        });
    }
}

// ── Salvage ─────────────────────────────────────────────────────────────────

/// Top-level balanced `{…}` slices, string- and escape-aware.
pub fn balanced_json_slices(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut slices = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        slices.push(&raw[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }
    slices
}

fn looks_like_board_ops(raw: &str) -> bool {
    let lower = raw.to_lowercase();
    lower.contains("board_ops")
        || lower.contains("upsertelement")
        || lower.contains("clearboard")
        || lower.contains("\"ops\"")
}

fn extract_quoted_field(raw: &str, field: &str) -> Option<String> {
    static CACHE: OnceLock<std::sync::Mutex<std::collections::HashMap<String, Regex>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(Default::default);
    let regex = {
        let mut cache = cache.lock().unwrap();
        cache
            .entry(field.to_string())
            .or_insert_with(|| {
                Regex::new(&format!(
                    r#""{field}"\s*:\s*"((?:[^"\\]|\\.)*)""#
                ))
                .unwrap()
            })
            .clone()
    };
    let captured = regex.captures(raw)?.get(1)?.as_str().to_string();
    serde_json::from_str::<String>(&format!("\"{captured}\"")).ok()
}

/// Scavenge ops out of non-JSON provider output. Collected ops are deduped
/// by canonical serialization; summary/text are reconstructed by regex.
pub fn salvage_board_ops(raw: &str, now: DateTime<Utc>) -> Option<BoardOpsEnvelope> {
    if !looks_like_board_ops(raw) {
        return None;
    }

    let mut envelope = BoardOpsEnvelope {
        summary: extract_quoted_field(raw, "summary"),
        text: extract_quoted_field(raw, "text"),
        ops: Vec::new(),
    };

    let mut seen = std::collections::HashSet::new();
    for slice in balanced_json_slices(raw) {
        let Ok(value) = serde_json::from_str::<Value>(slice) else {
            continue;
        };
        let ops = match coerce_envelope(&value, now) {
            Some(inner) => inner.ops,
            None => coerce_op(&value, now).into_iter().collect(),
        };
        for op in ops {
            let key = serde_json::to_string(&op).unwrap_or_default();
            if seen.insert(key) {
                envelope.ops.push(op);
            }
        }
        if envelope.ops.len() >= MAX_TOP_OPS {
            envelope.ops.truncate(MAX_TOP_OPS);
            break;
        }
    }

    synthesize_text_panel(&mut envelope, now);
    if envelope.ops.is_empty() {
        None
    } else {
        Some(envelope)
    }
}

// ── Auto-labeling ───────────────────────────────────────────────────────────

struct Anchor {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
    labeled: bool,
}

fn upserted_anchors(ops: &[BoardOp]) -> (Vec<Anchor>, usize) {
    let mut visuals = Vec::new();
    let mut text_anchors: Vec<(f64, f64)> = Vec::new();
    fn walk<'a>(ops: &'a [BoardOp], visuals: &mut Vec<Anchor>, texts: &mut Vec<(f64, f64)>) {
        for op in ops {
            match op {
                BoardOp::UpsertElement { element } => {
                    let has_text = element.text.as_deref().is_some_and(|t| !t.trim().is_empty());
                    if element.kind == ElementKind::Text {
                        if let (Some(x), Some(y)) = (element.x, element.y) {
                            texts.push((x, y));
                        }
                    } else if element.kind.is_filled_shape() {
                        if has_text {
                            if let (Some(x), Some(y)) = (element.x, element.y) {
                                texts.push((x, y));
                            }
                        }
                        if let (Some(x), Some(y)) = (element.x, element.y) {
                            visuals.push(Anchor {
                                x,
                                y,
                                w: element.w.unwrap_or(0.0),
                                h: element.h.unwrap_or(0.0),
                                labeled: has_text,
                            });
                        }
                    }
                }
                BoardOp::Batch { ops } => walk(ops, visuals, texts),
                _ => {}
            }
        }
    }
    walk(ops, &mut visuals, &mut text_anchors);

    // A visual anchor counts as labeled when a text anchor sits within its
    // margin box: max(120, 0.55w) by max(90, 0.45h).
    for anchor in &mut visuals {
        if anchor.labeled {
            continue;
        }
        let mx = (0.55 * anchor.w).max(120.0);
        let my = (0.45 * anchor.h).max(90.0);
        anchor.labeled = text_anchors.iter().any(|(tx, ty)| {
            *tx >= anchor.x - mx
                && *tx <= anchor.x + anchor.w + mx
                && *ty >= anchor.y - my
                && *ty <= anchor.y + anchor.h + my
        });
    }
    let labeled = visuals.iter().filter(|a| a.labeled).count();
    (visuals, labeled)
}

fn short_label(raw: &str) -> String {
    let cleaned = raw.trim();
    if cleaned.chars().count() <= 60 {
        cleaned.to_string()
    } else {
        let cut: String = cleaned.chars().take(59).collect();
        format!("{}…", cut.trim_end())
    }
}

/// When visual shapes outnumber nearby text anchors, synthesize short labels
/// from the summary, the payload text, then recent transcript lines.
pub fn auto_label_ops(
    ops: &mut Vec<BoardOp>,
    summary: Option<&str>,
    text: Option<&str>,
    transcript_window: &[String],
    now: DateTime<Utc>,
) {
    let (visuals, labeled) = upserted_anchors(ops);
    if visuals.is_empty() {
        return;
    }
    let needed = (0.75 * visuals.len() as f64).ceil() as usize;
    if labeled >= needed {
        return;
    }

    let mut sources: Vec<String> = Vec::new();
    if let Some(summary) = summary {
        sources.extend(summary.lines().map(str::to_string));
    }
    if let Some(text) = text {
        sources.extend(text.lines().map(str::to_string));
    }
    sources.extend(transcript_window.iter().rev().cloned());
    let mut sources = sources
        .into_iter()
        .map(|s| short_label(&s))
        .filter(|s| !s.is_empty());

    let mut added = 0;
    for anchor in visuals.iter().filter(|a| !a.labeled) {
        if added >= MAX_AUTO_LABELS {
            break;
        }
        let Some(label) = sources.next() else { break };
        ops.push(BoardOp::UpsertElement {
            element: crate::board::BoardElement {
                id: format!("autolabel_{added}"),
                kind: ElementKind::Text,
                x: Some(anchor.x + 8.0),
                y: Some(anchor.y - 28.0),
                w: None,
                h: None,
                text: Some(label),
                title: None,
                points: None,
                style: None,
                created_at: now,
                created_by: "ai".into(),
            },
        });
        added += 1;
    }
}

// ── Deterministic transcript fallback ───────────────────────────────────────

const SLOT_W: f64 = 980.0;
const SLOT_H: f64 = 120.0;
const SLOT_GAP: f64 = 56.0;

/// Render the last transcript lines as a titled column of connected boxes.
/// Slots have fixed ids, so repeated renders overwrite in place and unused
/// slots are deleted: a fixed-capacity ring.
pub fn transcript_fallback_ops(lines: &[String], now: DateTime<Utc>) -> Vec<BoardOp> {
    let recent: Vec<&String> = lines
        .iter()
        .skip(lines.len().saturating_sub(FALLBACK_LINES))
        .collect();
    if recent.is_empty() {
        return Vec::new();
    }

    let mut ops = vec![BoardOp::UpsertElement {
        element: crate::board::BoardElement {
            id: "transcript_title".into(),
            kind: ElementKind::Text,
            x: Some(40.0),
            y: Some(48.0),
            w: None,
            h: None,
            text: Some("Live transcript".into()),
            title: None,
            points: None,
            style: None,
            created_at: now,
            created_by: "ai".into(),
        },
    }];

    for (i, line) in recent.iter().enumerate() {
        let y = 120.0 + i as f64 * (SLOT_H + SLOT_GAP);
        let mut text = (*line).clone();
        if text.chars().count() > 180 {
            text = text.chars().take(179).collect::<String>() + "…";
        }
        ops.push(BoardOp::UpsertElement {
            element: crate::board::BoardElement {
                id: format!("transcript_slot_{i}"),
                kind: ElementKind::Rect,
                x: Some(40.0),
                y: Some(y),
                w: Some(SLOT_W),
                h: Some(SLOT_H),
                text: Some(text),
                title: None,
                points: None,
                style: None,
                created_at: now,
                created_by: "ai".into(),
            },
        });
        if i > 0 {
            let prev_bottom = 120.0 + (i as f64 - 1.0) * (SLOT_H + SLOT_GAP) + SLOT_H;
            ops.push(BoardOp::UpsertElement {
                element: crate::board::BoardElement {
                    id: format!("transcript_arrow_{}", i - 1),
                    kind: ElementKind::Arrow,
                    x: None,
                    y: None,
                    w: None,
                    h: None,
                    text: None,
                    title: None,
                    points: Some(vec![
                        [40.0 + SLOT_W / 2.0, prev_bottom],
                        [40.0 + SLOT_W / 2.0, y],
                    ]),
                    style: None,
                    created_at: now,
                    created_by: "ai".into(),
                },
            });
        }
    }

    for i in recent.len()..FALLBACK_LINES {
        ops.push(BoardOp::DeleteElement {
            id: format!("transcript_slot_{i}"),
        });
    }
    for i in recent.len().saturating_sub(1)..FALLBACK_LINES.saturating_sub(1) {
        ops.push(BoardOp::DeleteElement {
            id: format!("transcript_arrow_{i}"),
        });
    }

    ops
}

// ── Generation entry points ─────────────────────────────────────────────────

/// Core generation path with explicit prompts: provider first, salvage
/// second, deterministic transcript rendering last. The fingerprint is the
/// caller's business. An `Err` means every provider leg failed; the caller
/// decides whether to try the diagram-patch engine.
pub async fn generate_with_system(
    agent: &Agent,
    system: &str,
    user: &str,
    transcript_window: &[String],
    now: DateTime<Utc>,
) -> Result<(BoardOpsEnvelope, Option<&'static str>), RouterExhausted> {
    if agent.is_empty() {
        return Ok((
            BoardOpsEnvelope {
                summary: None,
                text: None,
                ops: transcript_fallback_ops(transcript_window, now),
            },
            None,
        ));
    }

    let (provider, raw) = agent.complete_json(system, user).await?;

    let envelope = match serde_json::from_str::<Value>(&raw) {
        Ok(value) => coerce_envelope(&value, now),
        Err(_) => None,
    }
    .or_else(|| salvage_board_ops(&raw, now));

    let mut envelope = match envelope {
        Some(envelope) if !envelope.ops.is_empty() => envelope,
        _ => BoardOpsEnvelope {
            summary: None,
            text: None,
            ops: transcript_fallback_ops(transcript_window, now),
        },
    };

    auto_label_ops(
        &mut envelope.ops,
        envelope.summary.as_deref(),
        envelope.text.as_deref(),
        transcript_window,
        now,
    );
    envelope.ops.truncate(MAX_TOP_OPS);

    Ok((envelope, Some(provider)))
}

/// Produce main-board ops for one job.
pub async fn generate_board_ops(
    agent: &Agent,
    prompts: &PromptSet,
    input: &AiInput,
    now: DateTime<Utc>,
) -> Result<GeneratedPatch, RouterExhausted> {
    let fingerprint = format!("{}:board_ops", fingerprint_of(input));
    let system = prompts.board_system();
    let payload = serde_json::to_string(input).unwrap_or_default();
    let user = prompts.board_user(&payload);

    let (envelope, provider) =
        generate_with_system(agent, &system, &user, &input.transcript_window, now).await?;

    Ok(GeneratedPatch {
        ops: envelope.ops,
        fingerprint,
        summary: envelope.summary,
        text: envelope.text,
        provider,
    })
}

// ── Diagram patch coercion + generation ─────────────────────────────────────

fn canonical_action_name(raw: &str) -> Option<&'static str> {
    let folded: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    Some(match folded.as_str() {
        "upsertnode" | "node" | "addnode" => "upsertNode",
        "upsertedge" | "edge" | "addedge" => "upsertEdge",
        "deleteshape" | "delete" | "remove" => "deleteShape",
        "settitle" | "title" => "setTitle",
        "setnotes" | "notes" => "setNotes",
        "highlightorder" | "highlight" => "highlightOrder",
        "layouthint" | "layout" => "layoutHint",
        _ => return None,
    })
}

fn canonical_diagram_type(raw: &str) -> &'static str {
    let folded: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase();
    match folded.as_str() {
        "tree" => "tree",
        "systemblocks" | "system" | "blocks" => "system_blocks",
        _ => "flowchart",
    }
}

/// Coerce a provider response into a [`DiagramPatch`].
pub fn coerce_diagram_patch(value: &Value) -> Option<DiagramPatch> {
    let map = value.as_object()?;

    let mut normalized = Map::new();
    normalized.insert(
        "topic".into(),
        Value::String(
            map.get("topic")
                .and_then(Value::as_str)
                .unwrap_or("Untitled")
                .to_string(),
        ),
    );
    normalized.insert(
        "diagramType".into(),
        Value::String(
            canonical_diagram_type(
                map.get("diagramType")
                    .or_else(|| map.get("diagram_type"))
                    .or_else(|| map.get("kind"))
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            )
            .to_string(),
        ),
    );
    normalized.insert(
        "confidence".into(),
        map.get("confidence")
            .cloned()
            .filter(Value::is_number)
            .unwrap_or_else(|| Value::from(0.5)),
    );
    if let Some(questions) = map.get("openQuestions").or_else(|| map.get("open_questions")) {
        normalized.insert("openQuestions".into(), questions.clone());
    }
    if let Some(conflicts) = map.get("conflicts") {
        normalized.insert("conflicts".into(), conflicts.clone());
    }
    if let Some(target) = map.get("targetGroupId").or_else(|| map.get("target_group_id")) {
        normalized.insert("targetGroupId".into(), target.clone());
    }

    let raw_actions = ["actions", "patch", "ops"]
        .iter()
        .find_map(|key| map.get(*key).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default();
    let actions: Vec<Value> = raw_actions
        .iter()
        .filter_map(|action| {
            let action_map = action.as_object()?;
            let name = TYPE_KEYS
                .iter()
                .find_map(|key| action_map.get(*key).and_then(Value::as_str))
                .and_then(canonical_action_name)?;
            let mut normalized_action = action_map.clone();
            for key in TYPE_KEYS {
                normalized_action.remove(*key);
            }
            normalized_action.insert("type".into(), Value::String(name.into()));
            Some(Value::Object(normalized_action))
        })
        .collect();
    normalized.insert("actions".into(), Value::Array(actions));

    let mut patch: DiagramPatch = serde_json::from_value(Value::Object(normalized)).ok()?;
    patch.clamp_limits();
    Some(patch)
}

const DIAGRAM_SYSTEM: &str = r#"You are a diagram planner. From the
conversation snapshot, respond with ONE JSON object:
{"topic":"...","diagramType":"flowchart|system_blocks|tree",
 "confidence":0.0,"actions":[...]}
Action types: upsertNode{id,label,x,y,width,height},
upsertEdge{id,from,to,label}, deleteShape{id}, setTitle{title},
setNotes{notes}, highlightOrder{order}, layoutHint{hint}."#;

/// Produce a diagram patch: provider attempt reviewed against the
/// deterministic reference, or the reference itself when the provider is
/// unavailable or unusable.
pub async fn generate_diagram_patch(
    agent: &Agent,
    input: &AiInput,
    confidence_threshold: f64,
    max_revisions: u32,
) -> DiagramPatch {
    let text = input.fallback_text();
    let reference = build_diagram_patch(&text);

    if agent.is_empty() {
        return reference;
    }

    let payload = serde_json::to_string(input).unwrap_or_default();
    let user = format!("Snapshot:\n{payload}");
    let candidate = match agent.complete_json(DIAGRAM_SYSTEM, &user).await {
        Ok((_, raw)) => serde_json::from_str::<Value>(&raw)
            .ok()
            .as_ref()
            .and_then(coerce_diagram_patch),
        Err(_) => None,
    };

    match candidate {
        Some(candidate) => {
            let window = input.transcript_window.join("\n");
            review_and_revise(
                candidate,
                &reference,
                &window,
                confidence_threshold,
                max_revisions,
            )
        }
        None => reference,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn strict_envelope_parses() {
        let value = json!({
            "kind": "board_ops",
            "schemaVersion": 1,
            "summary": "one box",
            "ops": [{
                "type": "upsertElement",
                "element": {"id": "r1", "kind": "rect", "x": 0, "y": 0, "w": 100, "h": 50}
            }]
        });
        let envelope = coerce_envelope(&value, now()).unwrap();
        assert_eq!(envelope.ops.len(), 1);
        assert_eq!(envelope.summary.as_deref(), Some("one box"));
    }

    #[test]
    fn alias_keys_and_names_coerce() {
        let value = json!({
            "operations": [
                {"op": "upsertelement", "element": {"id": "a", "kind": "RECT", "x": 0, "y": 0, "w": 10, "h": 10}},
                {"action": "clear"},
                {"op": "resize", "id": "a", "w": 50}
            ]
        });
        let envelope = coerce_envelope(&value, now()).unwrap();
        assert_eq!(envelope.ops.len(), 3);
        assert!(matches!(envelope.ops[1], BoardOp::ClearBoard));
        assert!(matches!(
            envelope.ops[2],
            BoardOp::SetElementGeometry { .. }
        ));
    }

    #[test]
    fn inline_element_form_coerces() {
        let value = json!({
            "ops": [{"type": "upsertElement", "id": "x", "kind": "sticky", "x": 1, "y": 2, "w": 80, "h": 80, "text": "hi"}]
        });
        let envelope = coerce_envelope(&value, now()).unwrap();
        match &envelope.ops[0] {
            BoardOp::UpsertElement { element } => {
                assert_eq!(element.id, "x");
                assert_eq!(element.created_by, "ai");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn element_without_id_is_skipped() {
        let value = json!({
            "ops": [{"type": "upsertElement", "element": {"kind": "rect", "x": 0, "y": 0, "w": 1, "h": 1}}]
        });
        let envelope = coerce_envelope(&value, now()).unwrap();
        assert!(envelope.ops.is_empty());
    }

    #[test]
    fn batch_coerces_recursively_and_caps() {
        let nested: Vec<Value> = (0..(MAX_NESTED_OPS + 50))
            .map(|i| json!({"op": "delete", "id": format!("e{i}")}))
            .collect();
        let value = json!({"ops": [{"type": "batch", "items": nested}]});
        let envelope = coerce_envelope(&value, now()).unwrap();
        match &envelope.ops[0] {
            BoardOp::Batch { ops } => assert_eq!(ops.len(), MAX_NESTED_OPS),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn text_panel_synthesized_when_no_text_element() {
        let value = json!({
            "kind": "board_ops",
            "text": "key point one\nkey point two",
            "ops": [{"type": "upsertElement", "element": {"id": "r", "kind": "rect", "x": 0, "y": 0, "w": 10, "h": 10}}]
        });
        let envelope = coerce_envelope(&value, now()).unwrap();
        let texts: Vec<_> = envelope
            .ops
            .iter()
            .filter(|op| matches!(op, BoardOp::UpsertElement { element } if element.kind == ElementKind::Text))
            .collect();
        assert_eq!(texts.len(), 2);
    }

    #[test]
    fn balanced_scanner_respects_strings() {
        let raw = r#"noise {"a": "bra}ce \" quote"} more {"b": 2} trailing"#;
        let slices = balanced_json_slices(raw);
        assert_eq!(slices.len(), 2);
        assert!(serde_json::from_str::<Value>(slices[0]).is_ok());
        assert!(serde_json::from_str::<Value>(slices[1]).is_ok());
    }

    #[test]
    fn salvage_recovers_ops_from_prose() {
        let raw = r#"Sure! Here is the board update you asked for:
{"kind":"board_ops","summary":"two boxes","ops":[
{"type":"upsertElement","element":{"id":"a","kind":"rect","x":0,"y":0,"w":10,"h":10}}]}
and also {"type":"upsertElement","element":{"id":"b","kind":"rect","x":20,"y":0,"w":10,"h":10}}
"#;
        // The outer object fails strict parse as a whole message, so salvage.
        let envelope = salvage_board_ops(raw, now()).unwrap();
        assert_eq!(envelope.ops.len(), 2);
        assert_eq!(envelope.summary.as_deref(), Some("two boxes"));
    }

    #[test]
    fn salvage_dedups_identical_ops() {
        let raw = r#"{"type":"clearBoard"} {"type":"clearBoard"} board_ops"#;
        let envelope = salvage_board_ops(raw, now()).unwrap();
        assert_eq!(envelope.ops.len(), 1);
    }

    #[test]
    fn salvage_ignores_unrelated_text() {
        assert!(salvage_board_ops("just chatting about nothing", now()).is_none());
    }

    #[test]
    fn auto_label_fills_unlabeled_shapes() {
        let mut ops = vec![
            BoardOp::UpsertElement {
                element: crate::board::BoardElement {
                    id: "a".into(),
                    kind: ElementKind::Rect,
                    x: Some(0.0),
                    y: Some(0.0),
                    w: Some(100.0),
                    h: Some(50.0),
                    text: None,
                    title: None,
                    points: None,
                    style: None,
                    created_at: now(),
                    created_by: "ai".into(),
                },
            },
            BoardOp::UpsertElement {
                element: crate::board::BoardElement {
                    id: "b".into(),
                    kind: ElementKind::Rect,
                    x: Some(2000.0),
                    y: Some(0.0),
                    w: Some(100.0),
                    h: Some(50.0),
                    text: None,
                    title: None,
                    points: None,
                    style: None,
                    created_at: now(),
                    created_by: "ai".into(),
                },
            },
        ];
        auto_label_ops(
            &mut ops,
            Some("summary line"),
            None,
            &["Host: a transcript line".into()],
            now(),
        );
        let labels: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, BoardOp::UpsertElement { element } if element.id.starts_with("autolabel_")))
            .collect();
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn auto_label_skips_when_enough_text() {
        let mut ops = vec![BoardOp::UpsertElement {
            element: crate::board::BoardElement {
                id: "a".into(),
                kind: ElementKind::Rect,
                x: Some(0.0),
                y: Some(0.0),
                w: Some(100.0),
                h: Some(50.0),
                text: Some("already labeled".into()),
                title: None,
                points: None,
                style: None,
                created_at: now(),
                created_by: "ai".into(),
            },
        }];
        let before = ops.len();
        auto_label_ops(&mut ops, Some("s"), None, &[], now());
        assert_eq!(ops.len(), before);
    }

    #[test]
    fn transcript_fallback_is_a_fixed_ring() {
        let lines: Vec<String> = (0..3).map(|i| format!("Host: line {i}")).collect();
        let ops = transcript_fallback_ops(&lines, now());

        let slots = ops
            .iter()
            .filter(|op| matches!(op, BoardOp::UpsertElement { element } if element.id.starts_with("transcript_slot_")))
            .count();
        let arrows = ops
            .iter()
            .filter(|op| matches!(op, BoardOp::UpsertElement { element } if element.id.starts_with("transcript_arrow_")))
            .count();
        let deletes = ops
            .iter()
            .filter(|op| matches!(op, BoardOp::DeleteElement { .. }))
            .count();
        assert_eq!(slots, 3);
        assert_eq!(arrows, 2);
        // Unused slots 3..6 and arrows 2..5 are cleared.
        assert_eq!(deletes, 6);
    }

    #[test]
    fn transcript_fallback_takes_last_six() {
        let lines: Vec<String> = (0..10).map(|i| format!("Host: line {i}")).collect();
        let ops = transcript_fallback_ops(&lines, now());
        let texts: Vec<String> = ops
            .iter()
            .filter_map(|op| match op {
                BoardOp::UpsertElement { element } if element.id.starts_with("transcript_slot_") => {
                    element.text.clone()
                }
                _ => None,
            })
            .collect();
        assert_eq!(texts.len(), 6);
        assert_eq!(texts[0], "Host: line 4");
        assert_eq!(texts[5], "Host: line 9");
    }

    #[test]
    fn diagram_patch_coercion_tolerates_aliases() {
        let value = json!({
            "topic": "orders",
            "diagram_type": "system-blocks",
            "patch": [
                {"op": "upsert_node", "id": "n1", "label": "Client"},
                {"op": "layout", "hint": "left-to-right"}
            ]
        });
        let patch = coerce_diagram_patch(&value).unwrap();
        assert_eq!(patch.diagram_type, crate::diagram::DiagramType::SystemBlocks);
        assert_eq!(patch.node_labels(), vec!["Client"]);
    }

    #[tokio::test]
    async fn empty_agent_falls_back_to_transcript_render() {
        let agent = Agent::default();
        let mut room = crate::room::RoomState::new("R1".into(), now());
        room.add_transcript_chunk("Host", "sketch the checkout flow", "mic", now());
        let input = crate::ai::input::assemble_ai_input(
            &room,
            300,
            &crate::ai::input::AiTrigger {
                reason: crate::ai::input::AiReason::Manual,
                regenerate: false,
                transcript_chunk_count: None,
            },
            now(),
        );
        let patch = generate_board_ops(&agent, &PromptSet::default(), &input, now())
            .await
            .unwrap();
        assert!(patch.fingerprint.ends_with(":board_ops"));
        assert!(!patch.ops.is_empty());
        assert!(patch.provider.is_none());
    }
}

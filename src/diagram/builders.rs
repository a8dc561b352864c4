//! Deterministic structural inference from free text. This is both the final
//! fallback when providers fail and the reference a provider patch is
//! reviewed against.

use super::{DiagramPatch, DiagramPatchAction, DiagramType, LayoutHint};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

pub const TREE_WORDS: &[&str] = &[
    "tree", "trees", "root", "node", "leaf", "leaves", "child", "children", "parent", "branch",
    "subtree", "bst", "traversal", "preorder", "postorder", "inorder", "bfs", "dfs",
];

pub const SYSTEM_WORDS: &[&str] = &[
    "api", "gateway", "service", "server", "client", "database", "db", "cache", "redis", "queue",
    "frontend", "backend", "postgres", "microservice", "load", "balancer", "proxy", "broker",
];

/// Keyword hints that rescue single-token transcript lines from the filter.
pub fn is_hint_keyword(token: &str) -> bool {
    let lower = token.to_lowercase();
    TREE_WORDS.contains(&lower.as_str())
        || SYSTEM_WORDS.contains(&lower.as_str())
        || matches!(lower.as_str(), "flowchart" | "diagram" | "context" | "correction")
}

fn count_hits(text_lower: &str, words: &[&str]) -> usize {
    text_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| words.contains(t))
        .count()
}

/// Score keyword families; tree wins ties when positive, then system blocks,
/// else flowchart.
pub fn detect_diagram_type(text: &str) -> DiagramType {
    let lower = text.to_lowercase();
    let tree = count_hits(&lower, TREE_WORDS);
    let system = count_hits(&lower, SYSTEM_WORDS);
    if tree > 0 && tree >= system {
        DiagramType::Tree
    } else if system > 0 {
        DiagramType::SystemBlocks
    } else {
        DiagramType::Flowchart
    }
}

/// Entry point: infer a full patch from raw text.
pub fn build_diagram_patch(text: &str) -> DiagramPatch {
    let mut patch = match detect_diagram_type(text) {
        DiagramType::Tree => build_tree_patch(text),
        DiagramType::SystemBlocks => build_system_blocks_patch(text),
        DiagramType::Flowchart => build_flowchart_patch(text),
    };
    patch.clamp_limits();
    patch
}

fn node_id(label: &str) -> String {
    let slug: String = label
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("node_{}", slug.trim_matches('_'))
}

fn edge_id(from: &str, to: &str) -> String {
    format!("edge_{from}_{to}")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn split_name_list(raw: &str) -> Vec<String> {
    static SEP: OnceLock<Regex> = OnceLock::new();
    let sep = SEP.get_or_init(|| Regex::new(r"(?i)\s*(?:,|\band\b)\s*").unwrap());
    sep.split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(capitalize)
        .collect()
}

/// Short topic derived from the first sentence.
fn derive_topic(text: &str, fallback: &str) -> String {
    let first = text
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or("");
    let mut words: Vec<&str> = first.split_whitespace().take(6).collect();
    if words.is_empty() {
        return fallback.to_string();
    }
    if words.len() == 6 {
        words.push("…");
    }
    words.join(" ")
}

// ── Tree builder ────────────────────────────────────────────────────────────

#[derive(Default)]
struct TreeSpec {
    root: Option<String>,
    /// parent -> ordered children
    children: HashMap<String, Vec<String>>,
    /// insertion order of every mentioned label
    mentioned: Vec<String>,
}

impl TreeSpec {
    fn mention(&mut self, label: &str) {
        if !self.mentioned.iter().any(|m| m == label) {
            self.mentioned.push(label.to_string());
        }
    }

    fn add_child(&mut self, parent: &str, child: &str) {
        if parent == child {
            return;
        }
        self.mention(parent);
        self.mention(child);
        let kids = self.children.entry(parent.to_string()).or_default();
        if !kids.iter().any(|k| k == child) {
            kids.push(child.to_string());
        }
    }

    fn resolve_root(&self) -> Option<String> {
        if let Some(root) = &self.root {
            return Some(root.clone());
        }
        // First mentioned label nobody points at.
        let is_child = |label: &str| {
            self.children
                .values()
                .any(|kids| kids.iter().any(|k| k == label))
        };
        self.mentioned.iter().find(|m| !is_child(m)).cloned()
    }
}

const TREE_ALIAS_STOPWORDS: &[&str] = &[
    "a", "an", "the", "this", "that", "my", "our", "your", "binary", "search", "spanning",
    "decision", "syntax", "parse", "avl", "red", "black", "b",
];

fn parse_tree_relations(text: &str) -> TreeSpec {
    static ROOT_RE: OnceLock<Regex> = OnceLock::new();
    static HAS_RE: OnceLock<Regex> = OnceLock::new();
    static CHILDREN_RE: OnceLock<Regex> = OnceLock::new();
    static ALIAS_RE: OnceLock<Regex> = OnceLock::new();
    static TREES_RE: OnceLock<Regex> = OnceLock::new();

    let root_re =
        ROOT_RE.get_or_init(|| Regex::new(r"(?i)\broot(?:\s+is)?\s+([A-Za-z][A-Za-z0-9]*)").unwrap());
    let has_re = HAS_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b([A-Za-z][A-Za-z0-9]*)\s+has(?:\s+children)?\s+((?:[A-Za-z][A-Za-z0-9]*)(?:\s*(?:,|\band\b)\s*[A-Za-z][A-Za-z0-9]*)*)",
        )
        .unwrap()
    });
    let children_re = CHILDREN_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\bchildren\s+(?:of\s+([A-Za-z][A-Za-z0-9]*)\s+)?(?:are\s+)?((?:[A-Za-z][A-Za-z0-9]*)(?:\s*(?:,|\band\b)\s*[A-Za-z][A-Za-z0-9]*)*)",
        )
        .unwrap()
    });
    let alias_re =
        ALIAS_RE.get_or_init(|| Regex::new(r"(?i)\b([A-Za-z][A-Za-z0-9]*)\s+tree\b").unwrap());
    let trees_re = TREES_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\btrees\s+((?:[A-Za-z][A-Za-z0-9]*)(?:\s*(?:,|\band\b)\s*[A-Za-z][A-Za-z0-9]*)*)",
        )
        .unwrap()
    });

    let mut spec = TreeSpec::default();

    if let Some(cap) = root_re.captures(text) {
        let root = capitalize(&cap[1]);
        spec.mention(&root);
        spec.root = Some(root);
    }

    for cap in has_re.captures_iter(text) {
        let parent = capitalize(&cap[1]);
        if parent.eq_ignore_ascii_case("root") {
            continue;
        }
        for child in split_name_list(&cap[2]) {
            spec.add_child(&parent, &child);
        }
    }

    for cap in children_re.captures_iter(text) {
        let parent = cap
            .get(1)
            .map(|m| capitalize(m.as_str()))
            .or_else(|| spec.resolve_root());
        let Some(parent) = parent else { continue };
        for child in split_name_list(&cap[2]) {
            spec.add_child(&parent, &child);
        }
    }

    // Alias forms: "oak tree and maple tree", "trees oak and maple".
    // Two or more aliases imply a shared parent node.
    let mut aliases: Vec<String> = Vec::new();
    for cap in alias_re.captures_iter(text) {
        let noun = cap[1].to_lowercase();
        if TREE_ALIAS_STOPWORDS.contains(&noun.as_str()) {
            continue;
        }
        let label = capitalize(&noun);
        if !aliases.iter().any(|a| a == &label) {
            aliases.push(label);
        }
    }
    for cap in trees_re.captures_iter(text) {
        for label in split_name_list(&cap[1]) {
            if TREE_ALIAS_STOPWORDS.contains(&label.to_lowercase().as_str()) {
                continue;
            }
            if !aliases.iter().any(|a| a == &label) {
                aliases.push(label);
            }
        }
    }
    if aliases.len() >= 2 && spec.mentioned.is_empty() {
        let shared = "Trees".to_string();
        spec.mention(&shared);
        spec.root = Some(shared.clone());
        for alias in aliases {
            spec.add_child(&shared, &alias);
        }
    }

    spec
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraversalIntent {
    Pre,
    Post,
    Bfs,
}

fn traversal_intent(text: &str) -> Option<TraversalIntent> {
    let lower = text.to_lowercase();
    if lower.contains("preorder") || lower.contains("pre-order") || lower.contains("pre order") {
        Some(TraversalIntent::Pre)
    } else if lower.contains("postorder")
        || lower.contains("post-order")
        || lower.contains("post order")
    {
        Some(TraversalIntent::Post)
    } else if lower.contains("bfs") || lower.contains("level order") || lower.contains("breadth") {
        Some(TraversalIntent::Bfs)
    } else {
        None
    }
}

fn traversal_order(spec: &TreeSpec, root: &str, intent: TraversalIntent) -> Vec<String> {
    match intent {
        TraversalIntent::Bfs => {
            let mut order = Vec::new();
            let mut queue = std::collections::VecDeque::from([root.to_string()]);
            while let Some(label) = queue.pop_front() {
                if order.contains(&label) {
                    continue;
                }
                order.push(label.clone());
                if let Some(kids) = spec.children.get(&label) {
                    queue.extend(kids.iter().cloned());
                }
            }
            order
        }
        TraversalIntent::Pre | TraversalIntent::Post => {
            fn walk(
                spec: &TreeSpec,
                label: &str,
                pre: bool,
                seen: &mut Vec<String>,
                out: &mut Vec<String>,
            ) {
                if seen.contains(&label.to_string()) {
                    return;
                }
                seen.push(label.to_string());
                if pre {
                    out.push(label.to_string());
                }
                if let Some(kids) = spec.children.get(label) {
                    for kid in kids {
                        walk(spec, kid, pre, seen, out);
                    }
                }
                if !pre {
                    out.push(label.to_string());
                }
            }
            let mut seen = Vec::new();
            let mut out = Vec::new();
            walk(spec, root, intent == TraversalIntent::Pre, &mut seen, &mut out);
            out
        }
    }
}

/// BFS levels of `(label, level)` starting at the root.
fn bfs_levels(spec: &TreeSpec, root: &str) -> Vec<Vec<String>> {
    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut current = vec![root.to_string()];
    let mut seen = std::collections::HashSet::new();
    while !current.is_empty() {
        let mut next = Vec::new();
        let mut row = Vec::new();
        for label in current {
            if !seen.insert(label.clone()) {
                continue;
            }
            if let Some(kids) = spec.children.get(&label) {
                next.extend(kids.iter().cloned());
            }
            row.push(label);
        }
        if !row.is_empty() {
            levels.push(row);
        }
        current = next;
    }
    levels
}

const TREE_NODE_W: f64 = 140.0;
const TREE_NODE_H: f64 = 64.0;
const TREE_GAP_X: f64 = 180.0;
const TREE_GAP_Y: f64 = 150.0;

pub fn build_tree_patch(text: &str) -> DiagramPatch {
    let mut spec = parse_tree_relations(text);
    let mut confidence = 0.7;

    if spec.mentioned.is_empty() {
        // Canonical five-node tree when nothing parsed.
        confidence = 0.35;
        spec.root = Some("A".into());
        for (parent, child) in [("A", "B"), ("A", "C"), ("B", "D"), ("B", "E")] {
            spec.add_child(parent, child);
        }
    } else if spec.children.is_empty() {
        confidence = 0.45;
    }

    let root = spec.resolve_root().unwrap_or_else(|| "A".into());
    let levels = bfs_levels(&spec, &root);

    // Orphans never reached from the root still get a row of their own.
    let placed: std::collections::HashSet<&String> = levels.iter().flatten().collect();
    let orphans: Vec<String> = spec
        .mentioned
        .iter()
        .filter(|m| !placed.contains(m))
        .cloned()
        .collect();
    drop(placed);
    let mut levels = levels;
    if !orphans.is_empty() {
        levels.push(orphans);
    }

    let widest = levels.iter().map(Vec::len).max().unwrap_or(1);
    let center_x = 40.0 + ((widest as f64 - 1.0) * TREE_GAP_X + TREE_NODE_W) / 2.0;

    let mut actions = vec![DiagramPatchAction::SetTitle {
        title: derive_topic(text, "Tree"),
    }];
    for (level, row) in levels.iter().enumerate() {
        let row_width = (row.len() as f64 - 1.0) * TREE_GAP_X + TREE_NODE_W;
        let start_x = center_x - row_width / 2.0;
        for (i, label) in row.iter().enumerate() {
            actions.push(DiagramPatchAction::UpsertNode {
                id: node_id(label),
                label: label.clone(),
                x: Some(start_x + i as f64 * TREE_GAP_X),
                y: Some(120.0 + level as f64 * TREE_GAP_Y),
                width: Some(TREE_NODE_W),
                height: Some(TREE_NODE_H),
            });
        }
    }
    let mut parents: Vec<&String> = spec.children.keys().collect();
    parents.sort();
    for parent in parents {
        for child in &spec.children[parent] {
            let from = node_id(parent);
            let to = node_id(child);
            actions.push(DiagramPatchAction::UpsertEdge {
                id: edge_id(&from, &to),
                from,
                to,
                label: None,
            });
        }
    }

    if let Some(intent) = traversal_intent(text) {
        let order = traversal_order(&spec, &root, intent)
            .iter()
            .map(|label| node_id(label))
            .collect();
        actions.push(DiagramPatchAction::HighlightOrder { order });
        let name = match intent {
            TraversalIntent::Pre => "preorder",
            TraversalIntent::Post => "postorder",
            TraversalIntent::Bfs => "level-order",
        };
        actions.push(DiagramPatchAction::SetNotes {
            notes: vec![format!("Highlight follows {name} traversal.")],
        });
    }

    actions.push(DiagramPatchAction::LayoutHint {
        hint: LayoutHint::Tree,
    });

    DiagramPatch {
        topic: derive_topic(text, "Tree"),
        diagram_type: DiagramType::Tree,
        confidence,
        actions,
        open_questions: Vec::new(),
        conflicts: Vec::new(),
        target_group_id: None,
    }
}

// ── System-blocks builder ───────────────────────────────────────────────────

const BLOCK_W: f64 = 170.0;
const BLOCK_H: f64 = 90.0;
const BLOCK_STEP_X: f64 = 190.0;
const BLOCK_Y: f64 = 220.0;

const DB_WORDS: &[&str] = &["postgres", "db", "database", "mysql", "mongo", "sqlite"];

pub fn build_system_blocks_patch(text: &str) -> DiagramPatch {
    let mut blocks: Vec<String> = Vec::new();
    let mut confidence = 0.65;

    for line in text.lines() {
        if !line.contains("->") {
            continue;
        }
        for (i, part) in line.split("->").enumerate() {
            // A chain segment ends at the sentence boundary; the segment left
            // of the first arrow starts at one.
            let part = if i == 0 {
                part.split(['.', '!', '?']).next_back().unwrap_or("")
            } else {
                part.split(['.', '!', '?']).next().unwrap_or("")
            };
            let cleaned: String = part
                .trim()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != ' ')
                .split_whitespace()
                .take(3)
                .collect::<Vec<_>>()
                .join(" ");
            if cleaned.is_empty() {
                continue;
            }
            let label = cleaned
                .split_whitespace()
                .map(capitalize)
                .collect::<Vec<_>>()
                .join(" ");
            if !blocks.iter().any(|b| b.eq_ignore_ascii_case(&label)) {
                blocks.push(label);
            }
        }
    }

    if blocks.len() < 2 {
        blocks = vec![
            "Client".into(),
            "API Gateway".into(),
            "Service".into(),
            "Postgres".into(),
        ];
        confidence = 0.35;
    }

    // Redis goes in front of the datastore when mentioned but missing.
    let mentions_redis = text.to_lowercase().contains("redis");
    let has_redis = blocks.iter().any(|b| b.to_lowercase().contains("redis"));
    if mentions_redis && !has_redis {
        let db_index = blocks
            .iter()
            .position(|b| {
                let lower = b.to_lowercase();
                DB_WORDS.iter().any(|w| lower.contains(w))
            })
            .unwrap_or(blocks.len() - 1);
        blocks.insert(db_index, "Redis Cache".into());
    }

    let mut actions = vec![DiagramPatchAction::SetTitle {
        title: derive_topic(text, "System overview"),
    }];
    for (i, label) in blocks.iter().enumerate() {
        actions.push(DiagramPatchAction::UpsertNode {
            id: node_id(label),
            label: label.clone(),
            x: Some(40.0 + i as f64 * BLOCK_STEP_X),
            y: Some(BLOCK_Y),
            width: Some(BLOCK_W),
            height: Some(BLOCK_H),
        });
    }
    for pair in blocks.windows(2) {
        let from = node_id(&pair[0]);
        let to = node_id(&pair[1]);
        actions.push(DiagramPatchAction::UpsertEdge {
            id: edge_id(&from, &to),
            from,
            to,
            label: Some("request".into()),
        });
    }
    actions.push(DiagramPatchAction::LayoutHint {
        hint: LayoutHint::LeftToRight,
    });

    DiagramPatch {
        topic: derive_topic(text, "System overview"),
        diagram_type: DiagramType::SystemBlocks,
        confidence,
        actions,
        open_questions: Vec::new(),
        conflicts: Vec::new(),
        target_group_id: None,
    }
}

// ── Flowchart builder ───────────────────────────────────────────────────────

const EMOJI_TOPICS: &[(&[&str], &str)] = &[
    (&["launch", "deploy", "release", "ship"], "🚀"),
    (&["idea", "brainstorm", "concept"], "💡"),
    (&["bug", "issue", "error", "incident"], "🐛"),
    (&["goal", "target", "plan", "milestone"], "🎯"),
    (&["data", "metric", "report", "chart"], "📊"),
    (&["meeting", "standup", "sync", "agenda"], "🗓️"),
];

fn topic_emoji(text_lower: &str) -> &'static str {
    for (words, emoji) in EMOJI_TOPICS {
        if words.iter().any(|w| text_lower.contains(w)) {
            return emoji;
        }
    }
    "📝"
}

fn truncate_phrase(phrase: &str, max: usize) -> String {
    if phrase.chars().count() <= max {
        return phrase.to_string();
    }
    let cut: String = phrase.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

pub fn build_flowchart_patch(text: &str) -> DiagramPatch {
    let phrases: Vec<String> = text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(3)
        .map(|s| truncate_phrase(s, 120))
        .collect();

    let lower = text.to_lowercase();
    let emoji = topic_emoji(&lower);
    let main = phrases
        .first()
        .cloned()
        .unwrap_or_else(|| "Listening…".into());

    let mut actions = vec![
        DiagramPatchAction::SetTitle {
            title: derive_topic(text, "Notes"),
        },
        DiagramPatchAction::UpsertNode {
            id: "node_main".into(),
            label: format!("{emoji} {main}"),
            x: Some(40.0),
            y: Some(120.0),
            width: Some(620.0),
            height: Some(190.0),
        },
    ];
    for (i, detail) in phrases.iter().skip(1).take(2).enumerate() {
        let id = format!("node_detail_{}", i + 1);
        actions.push(DiagramPatchAction::UpsertNode {
            id: id.clone(),
            label: truncate_phrase(detail, 80),
            x: Some(40.0 + i as f64 * 320.0),
            y: Some(350.0),
            width: Some(280.0),
            height: Some(100.0),
        });
        actions.push(DiagramPatchAction::UpsertEdge {
            id: edge_id("node_main", &id),
            from: "node_main".into(),
            to: id,
            label: None,
        });
    }
    actions.push(DiagramPatchAction::LayoutHint {
        hint: LayoutHint::TopDown,
    });

    DiagramPatch {
        topic: derive_topic(text, "Notes"),
        diagram_type: DiagramType::Flowchart,
        confidence: if phrases.is_empty() { 0.1 } else { 0.4 },
        actions,
        open_questions: Vec::new(),
        conflicts: Vec::new(),
        target_group_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(patch: &DiagramPatch) -> Vec<String> {
        patch.node_labels().iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn detection_prefers_tree_on_ties() {
        assert_eq!(detect_diagram_type("a tree with an api"), DiagramType::Tree);
        assert_eq!(
            detect_diagram_type("the api calls the database"),
            DiagramType::SystemBlocks
        );
        assert_eq!(
            detect_diagram_type("let's plan the offsite"),
            DiagramType::Flowchart
        );
    }

    #[test]
    fn tree_parses_root_and_children() {
        let patch = build_tree_patch("root is Alpha. Alpha has Beta and Gamma. Beta has Delta.");
        let l = labels(&patch);
        assert!(l.contains(&"Alpha".to_string()));
        assert!(l.contains(&"Delta".to_string()));
        assert_eq!(patch.edge_endpoints().len(), 3);
        assert!(patch.confidence > 0.6);
    }

    #[test]
    fn tree_children_of_syntax() {
        let patch = build_tree_patch("root X. children of X are P and Q");
        let l = labels(&patch);
        assert!(l.contains(&"P".to_string()));
        assert!(l.contains(&"Q".to_string()));
    }

    #[test]
    fn tree_alias_inference_shares_a_root() {
        let patch = build_tree_patch("we looked at the oak tree and the maple tree today");
        let l = labels(&patch);
        assert!(l.contains(&"Trees".to_string()));
        assert!(l.contains(&"Oak".to_string()));
        assert!(l.contains(&"Maple".to_string()));
    }

    #[test]
    fn tree_alias_stopwords_do_not_become_nodes() {
        let patch = build_tree_patch("draw a binary tree");
        assert!(!labels(&patch).contains(&"Binary".to_string()));
    }

    #[test]
    fn tree_falls_back_to_canonical_five_nodes() {
        let patch = build_tree_patch("show me a tree please");
        let l = labels(&patch);
        assert_eq!(l.len(), 5);
        for expected in ["A", "B", "C", "D", "E"] {
            assert!(l.contains(&expected.to_string()));
        }
        assert!(patch.confidence < 0.5);
    }

    #[test]
    fn tree_layout_uses_bfs_rows() {
        let patch = build_tree_patch("root A. A has B and C.");
        let mut rows: HashMap<i64, usize> = HashMap::new();
        for action in &patch.actions {
            if let DiagramPatchAction::UpsertNode { y, .. } = action {
                *rows.entry(y.unwrap() as i64).or_default() += 1;
            }
        }
        assert_eq!(rows[&120], 1);
        assert_eq!(rows[&270], 2);
    }

    #[test]
    fn traversal_intent_emits_highlight_order() {
        let patch = build_tree_patch("root A. A has B and C. show the preorder traversal");
        let order = patch.actions.iter().find_map(|a| match a {
            DiagramPatchAction::HighlightOrder { order } => Some(order.clone()),
            _ => None,
        });
        assert_eq!(
            order,
            Some(vec!["node_a".into(), "node_b".into(), "node_c".into()])
        );
    }

    #[test]
    fn system_blocks_parses_arrow_chains() {
        let patch = build_system_blocks_patch("browser -> edge proxy -> orders api -> postgres");
        let l = labels(&patch);
        assert_eq!(l[0], "Browser");
        assert!(l.contains(&"Postgres".to_string()));
        let edges = patch.edge_endpoints();
        assert_eq!(edges.len(), 3);
    }

    #[test]
    fn system_blocks_defaults_when_no_chain() {
        let patch = build_system_blocks_patch("we need the api and the database sketched");
        assert_eq!(
            labels(&patch),
            vec!["Client", "API Gateway", "Service", "Postgres"]
        );
    }

    #[test]
    fn redis_inserted_before_datastore() {
        let patch =
            build_system_blocks_patch("client -> api -> postgres. add redis in front of the db");
        let l = labels(&patch);
        let redis = l.iter().position(|b| b.contains("Redis")).unwrap();
        let pg = l.iter().position(|b| b.contains("Postgres")).unwrap();
        assert!(redis < pg);
    }

    #[test]
    fn system_block_positions_step_by_190() {
        let patch = build_system_blocks_patch("a -> b -> c");
        let xs: Vec<f64> = patch
            .actions
            .iter()
            .filter_map(|a| match a {
                DiagramPatchAction::UpsertNode { x, y, .. } => {
                    assert_eq!(*y, Some(220.0));
                    *x
                }
                _ => None,
            })
            .collect();
        assert_eq!(xs, vec![40.0, 230.0, 420.0]);
    }

    #[test]
    fn flowchart_caps_at_three_phrases() {
        let patch = build_flowchart_patch("One. Two. Three. Four. Five.");
        assert_eq!(labels(&patch).len(), 3);
        let hints: Vec<_> = patch
            .actions
            .iter()
            .filter(|a| matches!(a, DiagramPatchAction::LayoutHint { hint: LayoutHint::TopDown }))
            .collect();
        assert_eq!(hints.len(), 1);
    }

    #[test]
    fn flowchart_emoji_matches_topic() {
        let patch = build_flowchart_patch("We deploy the new release on Friday");
        assert!(labels(&patch)[0].starts_with("🚀"));
    }

    #[test]
    fn builder_output_respects_limits() {
        let patch = build_diagram_patch("root A. A has B and C.");
        assert!(patch.confidence >= 0.1 && patch.confidence <= 0.99);
        assert!(patch.open_questions.len() <= 2);
    }
}

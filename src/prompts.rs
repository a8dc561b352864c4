//! Prompt templates are external collaborators: built-in defaults here,
//! overridable by files in a configured directory. The engine consumes the
//! strings opaquely.

use std::path::Path;

const DEFAULT_SYSTEM: &str = r#"You are the sketching engine behind a shared whiteboard.
You receive a snapshot of a live conversation (transcript window, chat,
pinned context, corrections, visual hint, current diagram) and respond with
ONE JSON object describing board operations:

{"kind":"board_ops","schemaVersion":1,"summary":"...","ops":[...]}

Allowed op types: clearBoard, upsertElement, appendStrokePoints,
deleteElement, offsetElement, setElementGeometry, setElementStyle,
setElementText, duplicateElement, setElementZIndex, alignElements,
distributeElements, setViewport, batch.

Element kinds: text, rect, ellipse, diamond, triangle, sticky, frame,
stroke, line, arrow. Boxy kinds need x, y, w, h. Linear kinds need points.
Keep output compact: a handful of labeled shapes beats a wall of boxes.
Corrections outrank pinned context; pinned context outranks the transcript."#;

const DEFAULT_DELTA: &str = r#"Update the board for the latest snapshot below.
Prefer adding or adjusting a small number of elements over redrawing
everything. Never emit clearBoard unless explicitly asked to start over."#;

const DEFAULT_VISUAL_SKILL: &str = r#"Sketching skill: lay shapes on a grid,
leave 40px gutters, connect related shapes with arrows, and give every
non-text shape a short text label nearby."#;

const DEFAULT_PERSONAL_SYSTEM: &str = r#"You produce a PERSONAL side-board for one
named participant. Respond with the same board_ops JSON envelope. Be
bullet-forward: mostly short text elements summarizing what matters to this
person, using their stored context lines to decide emphasis."#;

#[derive(Debug, Clone)]
pub struct PromptSet {
    pub system: String,
    pub delta: String,
    pub visual_skill: String,
    pub personal_system: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM.to_string(),
            delta: DEFAULT_DELTA.to_string(),
            visual_skill: DEFAULT_VISUAL_SKILL.to_string(),
            personal_system: DEFAULT_PERSONAL_SYSTEM.to_string(),
        }
    }
}

impl PromptSet {
    /// Built-in defaults, with any present file in `dir` taking precedence.
    pub fn load(dir: Option<&Path>) -> Self {
        let mut set = Self::default();
        let Some(dir) = dir else {
            return set;
        };
        let overrides = [
            ("system.md", &mut set.system),
            ("delta.md", &mut set.delta),
            ("visual_skill.md", &mut set.visual_skill),
            ("personal_system.md", &mut set.personal_system),
        ];
        for (file, slot) in overrides {
            let path = dir.join(file);
            if let Ok(content) = std::fs::read_to_string(&path) {
                let trimmed = content.trim();
                if !trimmed.is_empty() {
                    *slot = trimmed.to_string();
                }
            }
        }
        set
    }

    /// System prompt for the main board.
    pub fn board_system(&self) -> String {
        format!("{}\n\n{}", self.system, self.visual_skill)
    }

    /// System prompt for a personalized board.
    pub fn personal_board_system(&self, member_name: &str, context_lines: &[String]) -> String {
        let mut prompt = format!(
            "{}\n\nParticipant: {member_name}",
            self.personal_system
        );
        if !context_lines.is_empty() {
            prompt.push_str("\nStored context:\n");
            for line in context_lines {
                prompt.push_str("- ");
                prompt.push_str(line);
                prompt.push('\n');
            }
        }
        prompt
    }

    /// User prompt: delta instructions plus the serialized snapshot payload.
    pub fn board_user(&self, payload_json: &str) -> String {
        format!("{}\n\nSnapshot:\n{}", self.delta, payload_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mention_the_envelope() {
        let set = PromptSet::default();
        assert!(set.system.contains("board_ops"));
        assert!(set.board_system().contains("Sketching skill"));
    }

    #[test]
    fn file_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system.md"), "custom system prompt").unwrap();
        let set = PromptSet::load(Some(dir.path()));
        assert_eq!(set.system, "custom system prompt");
        // Untouched slots keep defaults
        assert!(set.delta.contains("Update the board"));
    }

    #[test]
    fn personal_system_lists_context() {
        let set = PromptSet::default();
        let prompt =
            set.personal_board_system("Casey", &["likes timelines".into(), "hates red".into()]);
        assert!(prompt.contains("Participant: Casey"));
        assert!(prompt.contains("- likes timelines"));
    }
}

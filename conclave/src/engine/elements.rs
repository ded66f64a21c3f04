//! Incremental detection of inline elements in streamed content.
//!
//! A rolling scan over the accumulated buffer surfaces, as they appear:
//! ```plan blocks (`plan_start` / `plan_step`), the first previewable
//! html/jsx/tsx block or raw HTML document (`jsx_preview`), and streaming
//! `<artifact>` tags (`artifact` events with `is_complete` tracking).
//! Artifacts take precedence over previews.

use std::collections::HashMap;

use sse_event::StreamEvent;

use crate::artifact::{scan_artifacts, EditTarget};

/// Stateful per-round element scanner.
pub struct ElementScanner {
    content: String,
    edit_target: Option<EditTarget>,
    plan_started: bool,
    /// Artifact id → (content, is_complete) last emitted.
    emitted: HashMap<String, (String, bool)>,
    last_preview: Option<(String, bool)>,
}

impl ElementScanner {
    pub fn new(edit_target: Option<EditTarget>) -> Self {
        Self {
            content: String::new(),
            edit_target,
            plan_started: false,
            emitted: HashMap::new(),
            last_preview: None,
        }
    }

    /// Accumulated content so far.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// True when a plan block was opened (its `plan_end` is emitted by the
    /// loop once the final reply is known).
    pub fn plan_open(&self) -> bool {
        self.plan_started
    }

    /// Clears per-round state for the next tool round.
    pub fn reset(&mut self) {
        self.content.clear();
        self.plan_started = false;
        self.emitted.clear();
        self.last_preview = None;
    }

    /// Appends one delta and returns any newly detectable element events.
    pub fn push(&mut self, delta: &str) -> Vec<StreamEvent> {
        let prev_len = self.content.len();
        self.content.push_str(delta);
        let mut events = Vec::new();

        // Plan block: open once, then step lines from the fresh chunk.
        if !self.plan_started && self.content.contains("```plan") {
            self.plan_started = true;
            events.push(StreamEvent::PlanStart {
                title: "Execution Plan".into(),
            });
        }
        if self.plan_started {
            for line in self.content[prev_len..].lines() {
                let trimmed = line.trim();
                if let Some(step) = trimmed
                    .strip_prefix("- ")
                    .or_else(|| trimmed.strip_prefix("* "))
                {
                    events.push(StreamEvent::PlanStep {
                        step: step.trim().to_string(),
                    });
                }
            }
        }

        // Preview block, only while no artifact tag is present.
        if !self.content.contains("<artifact") {
            if let Some((jsx, is_complete)) = extract_preview_block(&self.content) {
                let changed = match &self.last_preview {
                    Some((prev, prev_complete)) => prev != &jsx || (is_complete && !prev_complete),
                    None => true,
                };
                if changed {
                    self.last_preview = Some((jsx.clone(), is_complete));
                    events.push(StreamEvent::JsxPreview { jsx, is_complete });
                }
            }
        }

        // Artifacts: emit on new content or completion transitions.
        for artifact in scan_artifacts(&self.content, self.edit_target.as_ref()) {
            let state = (artifact.content.clone(), artifact.is_complete);
            if self.emitted.get(&artifact.id) != Some(&state) {
                self.emitted.insert(artifact.id.clone(), state);
                events.push(StreamEvent::Artifact {
                    id: artifact.id,
                    title: artifact.title,
                    artifact_type: artifact.artifact_type,
                    content: artifact.content,
                    is_complete: artifact.is_complete,
                });
            }
        }

        events
    }
}

/// Finds the first previewable block: a ```html/```jsx/```tsx fence, else a
/// raw document starting `<!DOCTYPE`/`<html`. Raw documents only surface once
/// usefully large (>100 chars) or complete (`</html>` seen).
fn extract_preview_block(content: &str) -> Option<(String, bool)> {
    for fence in ["```html", "```jsx", "```tsx"] {
        if let Some(fence_pos) = content.find(fence) {
            let mut start = fence_pos + fence.len();
            if let Some(newline) = content[start..].find('\n') {
                start += newline + 1;
            }
            return Some(match content[start..].find("```") {
                Some(end) => (content[start..start + end].trim().to_string(), true),
                None => (content[start..].trim().to_string(), false),
            });
        }
    }

    let stripped = content.trim_start();
    // ASCII lowering keeps byte offsets aligned with `stripped`.
    let lower = stripped.to_ascii_lowercase();
    if lower.starts_with("<!doctype") || lower.starts_with("<html") {
        if let Some(end) = lower.rfind("</html>") {
            return Some((stripped[..end + "</html>".len()].to_string(), true));
        }
        if stripped.len() > 100 {
            return Some((stripped.to_string(), false));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_of(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    /// **Scenario**: a plan fence opens once and step lines emit as they
    /// stream in.
    #[test]
    fn plan_block_events() {
        let mut scanner = ElementScanner::new(None);
        let mut events = scanner.push("Here is the plan:\n```plan\n");
        events.extend(scanner.push("- fetch data\n- analyze\n"));
        let names = names_of(&events);
        assert_eq!(names[0], "plan_start");
        assert_eq!(names.iter().filter(|n| **n == "plan_step").count(), 2);
        assert!(scanner.plan_open());

        // No duplicate plan_start on further content.
        let more = scanner.push("* summarize\n");
        assert_eq!(names_of(&more), vec!["plan_step"]);
    }

    /// **Scenario**: an html fence yields an incomplete preview, then a
    /// complete one when the fence closes.
    #[test]
    fn preview_fence_completion() {
        let mut scanner = ElementScanner::new(None);
        let events = scanner.push("```html\n<h1>Hi</h1>");
        match &events[0] {
            StreamEvent::JsxPreview { jsx, is_complete } => {
                assert_eq!(jsx, "<h1>Hi</h1>");
                assert!(!is_complete);
            }
            other => panic!("expected jsx_preview, got {:?}", other),
        }
        let events = scanner.push("\n```");
        match &events[0] {
            StreamEvent::JsxPreview { is_complete, .. } => assert!(is_complete),
            other => panic!("expected jsx_preview, got {:?}", other),
        }
    }

    /// **Scenario**: a raw HTML document needs >100 chars before previewing.
    #[test]
    fn raw_html_document_threshold() {
        let mut scanner = ElementScanner::new(None);
        assert!(scanner.push("<!DOCTYPE html><html>").is_empty());
        let body = "x".repeat(120);
        let events = scanner.push(&body);
        assert_eq!(names_of(&events), vec!["jsx_preview"]);
    }

    /// **Scenario**: artifacts suppress jsx_preview and stream partial →
    /// complete.
    #[test]
    fn artifact_takes_precedence_and_streams() {
        let mut scanner = ElementScanner::new(None);
        let events =
            scanner.push("<artifact id=\"lp\" title=\"L\" type=\"html\">```html\n<h1>");
        let names = names_of(&events);
        assert!(names.contains(&"artifact"));
        assert!(!names.contains(&"jsx_preview"));

        let events = scanner.push("</h1></artifact>");
        match events.last() {
            Some(StreamEvent::Artifact {
                is_complete: true, ..
            }) => {}
            other => panic!("expected complete artifact, got {:?}", other),
        }
    }

    /// **Scenario**: unchanged artifact content does not re-emit.
    #[test]
    fn artifact_deduplicates() {
        let mut scanner = ElementScanner::new(None);
        let _ = scanner.push("<artifact id=\"a\" title=\"t\" type=\"text\">body</artifact>");
        let again = scanner.push(" trailing prose");
        assert!(names_of(&again).is_empty());
    }

    /// **Scenario**: reset clears all per-round state.
    #[test]
    fn reset_clears_state() {
        let mut scanner = ElementScanner::new(None);
        let _ = scanner.push("```plan\n- a\n");
        scanner.reset();
        assert!(!scanner.plan_open());
        assert!(scanner.content().is_empty());
        let events = scanner.push("```plan\n");
        assert_eq!(names_of(&events), vec!["plan_start"]);
    }
}

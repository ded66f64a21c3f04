//! Artifact protocol: `<artifact id=.. title=.. type=..>` blocks, the
//! SEARCH/REPLACE patch form, and the `[EDIT ARTIFACT ...]` intent prefix.
//!
//! Artifacts are reusable content blocks the model references by stable id
//! across turns. Patches are resolved against the most recent full artifact
//! of the same id from history and substituted with a full tag, so the
//! streaming artifact machinery downstream never sees the patch form.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static ARTIFACT_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<artifact\s+([^>]*)>(.*?)</artifact>").expect("artifact regex"));
static ARTIFACT_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<artifact\s+([^>]*)>").expect("artifact open regex"));
static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w[\w-]*)\s*=\s*"([^"]*)""#).expect("attr regex"));
static PATCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<artifact_patch\s+([^>]*)>(.*?)</artifact_patch>").expect("patch regex")
});
static PATCH_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<<<SEARCH>>>(.*?)<<<REPLACE>>>(.*?)<<<END>>>").expect("patch block regex")
});
static EDIT_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\[EDIT ARTIFACT\s+id="([^"]*)"\s+title="([^"]*)"\s+type="([^"]*)"\]\s*"#)
        .expect("edit prefix regex")
});
static ARTIFACT_STRIP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<artifact(?:_patch)?\b[^>]*>.*?</artifact(?:_patch)?>")
        .expect("artifact strip regex")
});

/// Target of an artifact edit: `(id, title, type)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditTarget {
    pub id: String,
    pub title: String,
    pub artifact_type: String,
}

/// One artifact found in content.
#[derive(Clone, Debug, PartialEq)]
pub struct FoundArtifact {
    pub id: String,
    pub title: String,
    pub artifact_type: String,
    pub content: String,
    pub is_complete: bool,
}

pub fn parse_attrs(attrs: &str) -> HashMap<String, String> {
    ATTR_RE
        .captures_iter(attrs)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

/// If `message` starts with the edit-intent prefix, returns the target.
pub fn extract_edit_target(message: &str) -> Option<EditTarget> {
    EDIT_PREFIX_RE.captures(message).map(|c| EditTarget {
        id: c[1].to_string(),
        title: c[2].to_string(),
        artifact_type: c[3].to_string(),
    })
}

/// Strips the edit-intent prefix, returning the bare instruction.
pub fn strip_edit_prefix(message: &str) -> String {
    EDIT_PREFIX_RE.replace(message, "").into_owned()
}

/// Scans content for complete and still-open artifact tags.
///
/// Complete tags win; an open tag without a close yet yields a partial
/// artifact holding everything after the open tag. `edit_target` overrides
/// id/title/type on every result.
pub fn scan_artifacts(content: &str, edit_target: Option<&EditTarget>) -> Vec<FoundArtifact> {
    let apply = |id: String, title: String, atype: String| match edit_target {
        Some(t) => (t.id.clone(), t.title.clone(), t.artifact_type.clone()),
        None => (id, title, atype),
    };

    let mut found = Vec::new();
    let mut seen_ids = Vec::new();
    for cap in ARTIFACT_TAG_RE.captures_iter(content) {
        let attrs = parse_attrs(&cap[1]);
        let Some(id) = attrs.get("id").filter(|s| !s.is_empty()) else {
            continue;
        };
        seen_ids.push(id.clone());
        let (id, title, atype) = apply(
            id.clone(),
            attrs.get("title").cloned().unwrap_or_else(|| "Artifact".into()),
            attrs.get("type").cloned().unwrap_or_else(|| "text".into()),
        );
        found.push(FoundArtifact {
            id,
            title,
            artifact_type: atype,
            content: cap[2].trim().to_string(),
            is_complete: true,
        });
    }

    for cap in ARTIFACT_OPEN_RE.captures_iter(content) {
        let attrs = parse_attrs(&cap[1]);
        let Some(id) = attrs.get("id").filter(|s| !s.is_empty()) else {
            continue;
        };
        if seen_ids.contains(id) {
            continue;
        }
        let open_end = cap.get(0).map(|m| m.end()).unwrap_or(0);
        let partial = content[open_end..].trim();
        if partial.is_empty() {
            continue;
        }
        let (id, title, atype) = apply(
            id.clone(),
            attrs.get("title").cloned().unwrap_or_else(|| "Artifact".into()),
            attrs.get("type").cloned().unwrap_or_else(|| "text".into()),
        );
        found.push(FoundArtifact {
            id,
            title,
            artifact_type: atype,
            content: partial.to_string(),
            is_complete: false,
        });
    }

    found
}

/// Latest content of artifact `id` across prior assistant texts, scanning
/// newest first.
pub fn latest_artifact_content(history_texts: &[String], id: &str) -> Option<String> {
    for text in history_texts.iter().rev() {
        if !text.contains("<artifact") {
            continue;
        }
        for cap in ARTIFACT_TAG_RE.captures_iter(text) {
            if parse_attrs(&cap[1]).get("id").map(String::as_str) == Some(id) {
                return Some(cap[2].to_string());
            }
        }
    }
    None
}

/// Applies SEARCH/REPLACE blocks to `original`. Each block replaces the first
/// exact occurrence; when exact matching fails, a line-wise
/// whitespace-insensitive pass is tried. Unmatched blocks leave the text
/// unchanged.
pub fn apply_patch(original: &str, patch_body: &str) -> String {
    let mut result = original.to_string();
    for cap in PATCH_BLOCK_RE.captures_iter(patch_body) {
        let search = cap[1].trim_matches('\n');
        let replace = cap[2].trim_matches('\n');
        if let Some(pos) = result.find(search) {
            result.replace_range(pos..pos + search.len(), replace);
            continue;
        }
        // Whitespace-insensitive fallback: slide a line window.
        let orig_lines: Vec<&str> = result.lines().collect();
        let search_lines: Vec<&str> = search.lines().map(str::trim).collect();
        if search_lines.is_empty() || orig_lines.len() < search_lines.len() {
            continue;
        }
        for i in 0..=orig_lines.len() - search_lines.len() {
            let window: Vec<&str> = orig_lines[i..i + search_lines.len()]
                .iter()
                .map(|l| l.trim())
                .collect();
            if window == search_lines {
                let mut lines: Vec<&str> = Vec::new();
                lines.extend(&orig_lines[..i]);
                lines.extend(replace.lines());
                lines.extend(&orig_lines[i + search_lines.len()..]);
                result = lines.join("\n");
                break;
            }
        }
    }
    result
}

/// Replaces every `<artifact_patch>` block with the full patched
/// `<artifact>` tag, resolving originals from `history_texts`. Patches whose
/// id has no prior artifact are left untouched.
pub fn process_patches(content: &str, history_texts: &[String]) -> String {
    if !content.contains("<artifact_patch") {
        return content.to_string();
    }
    PATCH_RE
        .replace_all(content, |cap: &regex::Captures| {
            let attrs = parse_attrs(&cap[1]);
            let Some(id) = attrs.get("id").filter(|s| !s.is_empty()) else {
                return cap[0].to_string();
            };
            let Some(original) = latest_artifact_content(history_texts, id) else {
                return cap[0].to_string();
            };
            let patched = apply_patch(&original, &cap[2]);
            let title = attrs.get("title").cloned().unwrap_or_else(|| "Artifact".into());
            let atype = attrs.get("type").cloned().unwrap_or_else(|| "text".into());
            format!(
                "<artifact id=\"{}\" title=\"{}\" type=\"{}\">\n{}\n</artifact>",
                id, title, atype, patched
            )
        })
        .into_owned()
}

/// Rewrites any artifact tag's id/title/type to the edit target so the
/// client deduplicates correctly even when the model invented new ones.
pub fn enforce_artifact_target(content: &str, target: &EditTarget) -> String {
    static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\bid\s*=\s*"[^"]*""#).expect("id re"));
    static TITLE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"\btitle\s*=\s*"[^"]*""#).expect("title re"));
    static TYPE_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"\btype\s*=\s*"[^"]*""#).expect("type re"));

    ARTIFACT_TAG_RE
        .replace_all(content, |cap: &regex::Captures| {
            let mut attrs = cap[1].to_string();
            attrs = ID_RE
                .replace(&attrs, format!("id=\"{}\"", target.id).as_str())
                .into_owned();
            attrs = TITLE_RE
                .replace(&attrs, format!("title=\"{}\"", target.title).as_str())
                .into_owned();
            attrs = TYPE_RE
                .replace(&attrs, format!("type=\"{}\"", target.artifact_type).as_str())
                .into_owned();
            format!("<artifact {}>{}</artifact>", attrs, &cap[2])
        })
        .into_owned()
}

/// Removes artifact and patch XML entirely; used before memory reflection so
/// session-scoped artifact content never enters durable memory.
pub fn strip_artifact_blocks(text: &str) -> String {
    ARTIFACT_STRIP_RE
        .replace_all(text, "[artifact content omitted]")
        .trim()
        .to_string()
}

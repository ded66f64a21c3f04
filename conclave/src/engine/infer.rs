//! Element events inferred from tool shape after a tool completes.
//!
//! Terminal-like tools surface their output as `terminal_output`; listing
//! tools become a `file_tree` parsed from JSON or ls-style lines; search-like
//! tools yield up to six `source_url` events for http(s) URLs found in the
//! result.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use sse_event::StreamEvent;

const TERMINAL_PATTERNS: &[&str] = &[
    "run_", "execute", "bash", "shell", "terminal", "command", "cmd",
];
const FILE_PATTERNS: &[&str] = &["list_file", "file_tree", "directory", "ls_", "tree", "ls "];
const SEARCH_PATTERNS: &[&str] = &[
    "search",
    "browse",
    "fetch_url",
    "web_search",
    "google",
    "bing",
    "duckduck",
];

/// URL extraction cap per tool result.
const MAX_SOURCE_URLS: usize = 6;

fn matches_any(name: &str, patterns: &[&str]) -> bool {
    let lower = name.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// Events derived from one completed tool call.
pub fn tool_element_events(tool_name: &str, result: &str) -> Vec<StreamEvent> {
    if matches_any(tool_name, TERMINAL_PATTERNS) {
        return vec![StreamEvent::TerminalOutput {
            content: result.to_string(),
            is_complete: true,
        }];
    }
    if matches_any(tool_name, FILE_PATTERNS) {
        return vec![StreamEvent::FileTree {
            tree: parse_file_tree(result),
        }];
    }
    if matches_any(tool_name, SEARCH_PATTERNS) {
        return extract_urls(result)
            .into_iter()
            .map(|url| StreamEvent::SourceUrl { url })
            .collect();
    }
    Vec::new()
}

/// Converts ls/tree output or a JSON array into a file-node list.
pub fn parse_file_tree(text: &str) -> Value {
    if let Ok(parsed) = serde_json::from_str::<Value>(text) {
        if parsed.is_array() {
            return parsed;
        }
    }
    static DIR_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[dD]").expect("dir line re"));

    let nodes: Vec<Value> = text
        .lines()
        .filter_map(|raw| {
            let line = raw
                .trim()
                .trim_start_matches(|c| matches!(c, '-' | '\\' | '/' | ' '));
            if line.is_empty() {
                return None;
            }
            let name = line.rsplit('/').find(|s| !s.is_empty()).unwrap_or(line);
            let is_dir = line.ends_with('/') || DIR_LINE_RE.is_match(raw);
            Some(json!({
                "name": name,
                "path": line,
                "type": if is_dir { "directory" } else { "file" },
                "children": Value::Null,
            }))
        })
        .collect();
    Value::Array(nodes)
}

/// Unique http(s) URLs in `text`, trailing punctuation trimmed, capped at 6.
pub fn extract_urls(text: &str) -> Vec<String> {
    static URL_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]]+"#).expect("url re"));

    let mut seen = Vec::new();
    for m in URL_RE.find_iter(text) {
        let url = m
            .as_str()
            .trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | ')'));
        if !seen.iter().any(|u| u == url) {
            seen.push(url.to_string());
        }
        if seen.len() >= MAX_SOURCE_URLS {
            break;
        }
    }
    seen
}

//! Tool-name sanitization for OpenAI-compatible endpoints.
//!
//! OpenAI requires function names matching `[A-Za-z0-9_-]{1,64}`. MCP-prefixed
//! names (`mcp__server__tool`) already conform, but arbitrary server or tool
//! names may not. Sanitized names are mapped back per request so callers and
//! the tool executor only ever see original names.

use std::collections::HashMap;

/// Replaces disallowed characters with `_` and truncates to 64 chars.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(64);
    out
}

/// Per-request reverse map: sanitized name → original name.
///
/// Scoped to one chat call, matching the injectivity guarantee: within one
/// request, every sanitized name restores to exactly the original that
/// produced it (first writer wins on collisions).
#[derive(Debug, Default)]
pub struct NameMap {
    reverse: HashMap<String, String>,
}

impl NameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitizes `name`, recording the mapping when it changed.
    pub fn sanitize(&mut self, name: &str) -> String {
        let sanitized = sanitize_tool_name(name);
        if sanitized != name {
            self.reverse
                .entry(sanitized.clone())
                .or_insert_with(|| name.to_string());
        }
        sanitized
    }

    /// Restores an inbound name to its original form.
    pub fn restore<'a>(&'a self, name: &'a str) -> &'a str {
        self.reverse.get(name).map(String::as_str).unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: disallowed characters become underscores; length caps at 64.
    #[test]
    fn sanitize_replaces_and_truncates() {
        assert_eq!(sanitize_tool_name("søk.web"), "s_k_web");
        assert_eq!(sanitize_tool_name("mcp__files__read"), "mcp__files__read");
        let long = "x".repeat(100);
        assert_eq!(sanitize_tool_name(&long).len(), 64);
    }

    /// **Scenario**: restore is the inverse of sanitize within one request.
    #[test]
    fn round_trip_within_request() {
        let mut map = NameMap::new();
        let s = map.sanitize("weather.lookup");
        assert_eq!(s, "weather_lookup");
        assert_eq!(map.restore(&s), "weather.lookup");
        // Unchanged names restore to themselves without a map entry.
        let s2 = map.sanitize("plain_name");
        assert_eq!(map.restore(&s2), "plain_name");
    }

    /// **Scenario**: unknown inbound names pass through untouched.
    #[test]
    fn restore_passthrough_for_unknown() {
        let map = NameMap::new();
        assert_eq!(map.restore("anything"), "anything");
    }
}

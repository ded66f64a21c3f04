//! Fixed prompts used by the engine: tool-result follow-up, compaction
//! summarization, memory reflection, handler codegen, artifact protocol
//! hint, and team routing/synthesis.

/// Appended after every tool result fed back to the model.
pub const TOOL_RESULT_PROMPT: &str = "Use this information to answer the user's question.";

/// System prompt of the compaction summarization call.
pub const SUMMARIZATION_PROMPT: &str = "You are summarizing a conversation to free up context window space. \
Produce a concise but complete summary covering: key topics discussed, \
decisions made, important facts established, tool calls and their results, \
and any ongoing tasks. Write in third-person past tense. Be thorough but concise.";

/// System prompt of the memory reflection call. Demands a strict JSON array
/// and bans artifact references.
pub const MEMORY_REFLECTION_PROMPT: &str = "You are a memory distillation assistant. Your only job is to extract durable, \
reusable facts from a conversation that would be useful to remember in future \
conversations with this user.\n\n\
Rules:\n\
- Extract at most 5 memories per session.\n\
- Only keep facts that persist across time: preferences, project context, \
decisions made, corrections the user gave.\n\
- Skip pleasantries, greetings, one-off questions, and transient content.\n\
- NEVER memorize artifact IDs, artifact titles, artifact content, or any \
reference to specific artifacts (e.g. do not store 'user created artifact X'). \
Artifacts are session-scoped and must not leak into future sessions.\n\
- If a new fact contradicts an existing memory with the same key, include it \
anyway — it will overwrite the old one.\n\
- Output ONLY a valid JSON array (no markdown, no explanation):\n\
  [{\"key\": \"short_snake_case_key\", \"value\": \"human readable fact\", \
\"confidence\": 0.0-1.0, \"category\": \"preference|context|decision|correction\"}]\n\
- If nothing is worth remembering, output an empty array: []";

/// System prompt for auto-generating a python handler when a proposal lacks
/// one.
pub const TOOL_CODEGEN_PROMPT: &str = "You are a Python tool implementation expert. Given a tool name, description, and parameter schema, write a complete working Python handler function.\n\n\
Rules:\n\
- The function MUST be named exactly `handler` and accept one argument: `params` (a dict).\n\
- Access parameters via `params.get('key', default)` or `params['key']`.\n\
- Use only Python standard library (json, math, datetime, re, urllib, base64, hashlib, etc.). No third-party packages.\n\
- For HTTP calls use `urllib.request`, not `requests`.\n\
- Always return a dict or a string. Never return None.\n\
- Handle errors with try/except and return `{\"error\": \"...\"}`.\n\
- Write complete, working code — not stubs or placeholders.\n\n\
Respond with ONLY valid JSON in this exact format (no explanation, no markdown fences):\n\
{\"code\": \"def handler(params):\\n    ...\"}";

/// Artifact protocol hint appended to every agent system prompt.
pub const ARTIFACT_SYSTEM_HINT: &str = r#"
## Artifacts
When you produce substantial standalone content (HTML pages, code files, SVGs, JSON data, markdown docs, etc.), wrap it in an artifact tag instead of a code block:

<artifact id="unique_snake_case_id" title="Human-readable title" type="html|jsx|tsx|css|javascript|typescript|python|markdown|json|svg|latex|text">
...content...
</artifact>

Rules:
- `id`: snake_case, unique per artifact
- `type`: choose the most specific matching type — use `latex` for mathematical/scientific content with LaTeX notation (supports `$...$`, `$$...$$`, `\(...\)`, `\[...\]`)
- Use artifacts for content the user might want to edit, save, or reuse
- You may reference the artifact by title in your surrounding explanation
- Do NOT wrap artifacts in markdown code fences

## Editing existing artifacts — PATCHES ONLY (NEVER rewrite the full artifact)
When the user message contains [EDIT ARTIFACT id="..." title="..." type="..."] followed by the current content, you MUST respond with a patch. NEVER output a full <artifact> tag when editing an existing artifact.

<artifact_patch id="EXACT_SAME_ID" title="EXACT_SAME_TITLE" type="EXACT_SAME_TYPE">
<<<SEARCH>>>
exact lines to find and replace (copy verbatim from the shown content)
<<<REPLACE>>>
replacement lines
<<<END>>>
</artifact_patch>

Rules for patches:
- Use the EXACT id, title, and type from the [EDIT ARTIFACT] prefix
- SEARCH text must match the shown artifact content exactly
- You may include multiple SEARCH/REPLACE blocks for multiple changes
- Only include lines that actually change — do NOT output the full file
- ALWAYS use a patch. Even for large edits, use SEARCH/REPLACE blocks covering the changed sections.
- NEVER rewrite the whole artifact — this wastes tokens and defeats the purpose of patching.
"#;

/// Team coordinate mode: the router's system prompt.
pub fn router_prompt(agent_lines: &str) -> String {
    format!(
        "You are a routing assistant. Your job is to select the single best agent to handle the user's query.\n\n\
Available agents:\n{}\n\n\
Reply with ONLY the agent name (exactly as shown) that should handle this query. Nothing else.",
        agent_lines
    )
}

/// Team route mode: the synthesizer's system prompt.
pub const SYNTHESIS_PROMPT: &str = "You are a synthesis assistant. Multiple agents have responded to a user query. \
Review all responses and produce the single best, comprehensive answer. \
You may combine insights from multiple agents or choose the best response.\n\n\
Do NOT mention that multiple agents responded. Just provide the best answer directly.";

/// Workflow condition node: the classifier's system prompt.
pub fn condition_prompt(branch_list: &str) -> String {
    format!(
        "You are a routing classifier. Your job is to read content and select exactly one branch label from the list: [{}].\n\
Respond with ONLY the branch label — no explanation, no punctuation, just the label.",
        branch_list
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: generated prompts embed their dynamic parts.
    #[test]
    fn dynamic_prompts_embed_inputs() {
        let r = router_prompt("- **Researcher**: finds things");
        assert!(r.contains("Researcher"));
        assert!(r.contains("ONLY the agent name"));

        let c = condition_prompt("\"positive\", \"negative\"");
        assert!(c.contains("positive"));
        assert!(c.contains("ONLY the branch label"));
    }

    /// **Scenario**: the reflection prompt pins the JSON contract.
    #[test]
    fn reflection_prompt_demands_json_array() {
        assert!(MEMORY_REFLECTION_PROMPT.contains("JSON array"));
        assert!(MEMORY_REFLECTION_PROMPT.contains("at most 5"));
        assert!(MEMORY_REFLECTION_PROMPT.contains("NEVER memorize artifact"));
    }
}

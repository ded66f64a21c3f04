//! Tool schema presentation for the LLM.
//!
//! Stored definitions convert to OpenAI function form; agents with
//! `allow_tool_creation` additionally see the virtual `create_tool` schema,
//! whose description teaches the model the handler contract.

use serde_json::json;

use crate::entity::ToolDefinition;
use crate::provider::ToolSchema;

/// Name of the virtual tool-creation tool.
pub const CREATE_TOOL_NAME: &str = "create_tool";

/// Converts a stored definition to the schema offered to the LLM.
pub fn tool_to_schema(tool: &ToolDefinition) -> ToolSchema {
    ToolSchema {
        name: tool.name.clone(),
        description: tool.description.clone().unwrap_or_default(),
        parameters: if tool.parameters.is_object() {
            tool.parameters.clone()
        } else {
            json!({"type": "object", "properties": {}})
        },
    }
}

const CREATE_TOOL_DESCRIPTION: &str = "Propose a new tool to be saved to the toolkit. The user will review and approve before it is saved. Use this when you need a capability that doesn't exist yet.\n\n\
IMPORTANT RULES FOR PYTHON HANDLERS:\n\
1. The handler must be a function named exactly 'handler' that accepts a single dict argument called 'params'.\n\
2. Access parameters via params['key'] or params.get('key', default).\n\
3. The function MUST return a value — a string, number, dict, or list. Never return None.\n\
4. Use only Python standard library modules (json, math, datetime, re, urllib, base64, etc.). Do NOT import third-party packages.\n\
5. For HTTP calls use urllib.request, not requests.\n\
6. Always handle errors with try/except and return a descriptive error string.\n\n\
PYTHON HANDLER EXAMPLE (reverse_string tool):\n\
  def handler(params):\n\
      text = params.get('text', '')\n\
      return text[::-1]\n\n\
PYTHON HANDLER EXAMPLE (fetch_url tool):\n\
  def handler(params):\n\
      import urllib.request, json\n\
      url = params['url']\n\
      try:\n\
          with urllib.request.urlopen(url, timeout=10) as r:\n\
              return r.read().decode()\n\
      except Exception as e:\n\
          return f'Error: {e}'\n\n\
PARAMETERS FIELD must be a valid JSON Schema object. Example for a tool with one required string param:\n\
  {\"type\": \"object\", \"properties\": {\"text\": {\"type\": \"string\", \"description\": \"Input text\"}}, \"required\": [\"text\"]}\n\n\
HTTP HANDLER CONFIG EXAMPLE:\n\
  {\"url\": \"https://api.example.com/data\", \"method\": \"GET\", \"headers\": {\"Accept\": \"application/json\"}}";

/// The virtual `create_tool` schema injected when the agent allows dynamic
/// tool creation.
pub fn create_tool_schema() -> ToolSchema {
    ToolSchema {
        name: CREATE_TOOL_NAME.to_string(),
        description: CREATE_TOOL_DESCRIPTION.to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Snake_case tool name, must be unique in the toolkit. Example: 'reverse_string', 'fetch_weather'.",
                },
                "description": {
                    "type": "string",
                    "description": "Clear one-sentence description of what the tool does. The agent reads this to decide when to use it.",
                },
                "handler_type": {
                    "type": "string",
                    "enum": ["python", "http"],
                    "description": "Use 'python' to run Python code, 'http' to call an external REST API.",
                },
                "parameters": {
                    "type": "object",
                    "description": "Valid JSON Schema object for the tool's input parameters. Must include 'type': 'object', 'properties' dict, and 'required' list. Example: {\"type\": \"object\", \"properties\": {\"text\": {\"type\": \"string\", \"description\": \"The input\"}}, \"required\": [\"text\"]}",
                },
                "handler_config": {
                    "type": "object",
                    "description": "REQUIRED — must never be empty {}.\nFor python handler_type: {\"code\": \"def handler(params):\\n    # full implementation here\\n    return result\"}. The 'code' key is mandatory and must contain the complete working implementation — not a placeholder or stub.\nFor http handler_type: {\"url\": \"https://api.example.com/endpoint\", \"method\": \"GET\", \"headers\": {\"Accept\": \"application/json\"}}. The 'url' key is mandatory.",
                },
            },
            "required": ["name", "description", "handler_type", "parameters", "handler_config"],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{new_id, HandlerKind};

    /// **Scenario**: stored definitions convert with description defaulted.
    #[test]
    fn tool_to_schema_defaults() {
        let tool = ToolDefinition {
            id: new_id(),
            owner_id: "u1".into(),
            name: "send_email".into(),
            description: None,
            parameters: json!({"type": "object", "properties": {"to": {"type": "string"}}}),
            handler_kind: HandlerKind::Http,
            handler_config: json!({"url": "https://mail.example.com"}),
            requires_confirmation: true,
            is_active: true,
        };
        let schema = tool_to_schema(&tool);
        assert_eq!(schema.name, "send_email");
        assert!(schema.description.is_empty());
        assert!(schema.parameters["properties"]["to"].is_object());
    }

    /// **Scenario**: non-object parameters degrade to an empty object schema.
    #[test]
    fn malformed_parameters_degrade() {
        let tool = ToolDefinition {
            id: new_id(),
            owner_id: "u1".into(),
            name: "t".into(),
            description: Some("d".into()),
            parameters: json!("not a schema"),
            handler_kind: HandlerKind::Python,
            handler_config: json!({"code": ""}),
            requires_confirmation: false,
            is_active: true,
        };
        assert_eq!(
            tool_to_schema(&tool).parameters,
            json!({"type": "object", "properties": {}})
        );
    }

    /// **Scenario**: the create_tool schema requires the full proposal shape.
    #[test]
    fn create_tool_schema_shape() {
        let schema = create_tool_schema();
        assert_eq!(schema.name, CREATE_TOOL_NAME);
        let required = schema.parameters["required"].as_array().unwrap();
        for field in ["name", "description", "handler_type", "parameters", "handler_config"] {
            assert!(required.iter().any(|v| v == field), "missing {}", field);
        }
        assert_eq!(
            schema.parameters["properties"]["handler_type"]["enum"],
            json!(["python", "http"])
        );
    }
}

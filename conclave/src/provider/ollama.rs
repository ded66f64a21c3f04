//! Ollama adapter (`/api/chat`, NDJSON streaming).
//!
//! Local models frequently emit `<think>` reasoning inline; the stream path
//! routes content through [`ThinkSplitter`] so partial tags crossing chunk
//! boundaries never leak. Vision content splits into text plus a bare base64
//! image list, per the Ollama message format.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::entity::SamplingConfig;
use crate::message::{ChatMessage, ContentPart, MessageContent};
use crate::provider::sse::LineBuffer;
use crate::provider::think::{strip_think_tags, Piece, ThinkSplitter};
use crate::provider::{
    chunk_stream, ChatProvider, ChunkStream, ModelInfo, ProviderError, ProviderResponse,
    StreamChunk, TokenUsage, ToolCallRequest, ToolSchema, CHUNK_CHANNEL_CAPACITY,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama local-model provider.
#[derive(Clone)]
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
    model_id: String,
    sampling: SamplingConfig,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl OllamaProvider {
    pub fn new(
        base_url: Option<String>,
        model_id: impl Into<String>,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model_id: model_id.into(),
            sampling,
            request_timeout: Duration::from_secs(120),
            health_timeout: Duration::from_secs(15),
        }
    }


    pub fn with_timeouts(mut self, request: Duration, health: Duration) -> Self {
        self.request_timeout = request;
        self.health_timeout = health;
        self
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url.trim_end_matches('/'))
    }

    fn tags_endpoint(&self) -> String {
        format!("{}/api/tags", self.base_url.trim_end_matches('/'))
    }

    fn build_messages(messages: &[ChatMessage], system_prompt: Option<&str>) -> Vec<Value> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(sp) = system_prompt {
            out.push(json!({"role": "system", "content": sp}));
        }
        for m in messages {
            match &m.content {
                MessageContent::Text(s) => {
                    out.push(json!({"role": m.role.as_str(), "content": s}));
                }
                MessageContent::Parts(parts) => {
                    let mut texts: Vec<&str> = Vec::new();
                    let mut images: Vec<String> = Vec::new();
                    for p in parts {
                        match p {
                            ContentPart::Text { text } => texts.push(text),
                            ContentPart::ImageUrl { image_url } => {
                                if let Some((_, data)) = image_url
                                    .strip_prefix("data:")
                                    .and_then(|rest| rest.split_once(','))
                                {
                                    images.push(data.to_string());
                                }
                            }
                        }
                    }
                    let mut msg = json!({"role": m.role.as_str(), "content": texts.join("\n")});
                    if !images.is_empty() {
                        msg["images"] = json!(images);
                    }
                    out.push(msg);
                }
            }
        }
        out
    }

    fn build_payload(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
        stream: bool,
    ) -> Value {
        let mut payload = json!({
            "model": self.model_id,
            "messages": Self::build_messages(messages, system_prompt),
            "stream": stream,
        });
        if let Some(t) = self.sampling.temperature {
            payload["options"] = json!({"temperature": t});
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(ToolSchema::to_openai).collect());
        }
        payload
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        ProviderError::Api { status, message }
    }

    fn parse_tool_calls(message: &Value) -> Vec<ToolCallRequest> {
        message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .enumerate()
                    .map(|(i, tc)| {
                        let func = tc.get("function").cloned().unwrap_or_default();
                        let args = func.get("arguments").cloned().unwrap_or_else(|| json!({}));
                        ToolCallRequest {
                            id: tc
                                .get("id")
                                .and_then(Value::as_str)
                                .map(str::to_string)
                                .unwrap_or_else(|| format!("call_{}", i)),
                            name: func
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                            // Ollama sends arguments as an object, not a string.
                            arguments: if args.is_string() {
                                args.as_str().unwrap_or("{}").to_string()
                            } else {
                                args.to_string()
                            },
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_usage(chunk: &Value) -> Option<TokenUsage> {
        let input = chunk.get("prompt_eval_count").and_then(Value::as_u64);
        let output = chunk.get("eval_count").and_then(Value::as_u64);
        if input.is_none() && output.is_none() {
            return None;
        }
        Some(TokenUsage {
            input_tokens: input.unwrap_or(0) as u32,
            output_tokens: output.unwrap_or(0) as u32,
        })
    }

    async fn run_stream(
        self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<String>,
        tools: Vec<ToolSchema>,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let payload = self.build_payload(&messages, system_prompt.as_deref(), &tools, true);
        debug!(model = %self.model_id, tools = tools.len(), "ollama stream request");

        let response = self
            .client
            .post(self.chat_endpoint())
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut splitter = ThinkSplitter::new();

        loop {
            let batch = match body.next().await {
                Some(chunk) => {
                    let bytes = chunk.map_err(|e| ProviderError::Http(e.to_string()))?;
                    lines.push(&bytes)
                }
                None => {
                    // NDJSON: a final object may arrive without a trailing newline.
                    match lines.take_rest() {
                        Some(rest) => vec![rest],
                        None => break,
                    }
                }
            };
            for line in batch {
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                if parsed.get("done").and_then(Value::as_bool).unwrap_or(false) {
                    if let Some(piece) = splitter.finish() {
                        send_piece(&tx, piece).await;
                    }
                    let _ = tx.send(StreamChunk::Done(Self::parse_usage(&parsed))).await;
                    return Ok(());
                }
                let message = parsed.get("message").cloned().unwrap_or_default();
                for tc in Self::parse_tool_calls(&message) {
                    let _ = tx.send(StreamChunk::ToolCall(tc)).await;
                }
                if let Some(text) = message.get("content").and_then(Value::as_str) {
                    if !text.is_empty() {
                        for piece in splitter.push(text) {
                            send_piece(&tx, piece).await;
                        }
                    }
                }
            }
        }
        if let Some(piece) = splitter.finish() {
            send_piece(&tx, piece).await;
        }
        let _ = tx.send(StreamChunk::Done(None)).await;
        Ok(())
    }
}

async fn send_piece(tx: &mpsc::Sender<StreamChunk>, piece: Piece) {
    let chunk = match piece {
        Piece::Content(t) => StreamChunk::Content(t),
        Piece::Reasoning(t) => StreamChunk::Reasoning(t),
    };
    let _ = tx.send(chunk).await;
}

#[async_trait]
impl ChatProvider for OllamaProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        let payload = self.build_payload(messages, system_prompt, tools, false);
        debug!(model = %self.model_id, tools = tools.len(), "ollama chat request");

        let response = self
            .client
            .post(self.chat_endpoint())
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let data: Value = response.json().await?;
        let message = data.get("message").cloned().unwrap_or_default();
        let raw_content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (content, _) = strip_think_tags(raw_content);

        Ok(ProviderResponse {
            content,
            tool_calls: Self::parse_tool_calls(&message),
            usage: Self::parse_usage(&data),
        })
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let this = self.clone();
        let messages = messages.to_vec();
        let system_prompt = system_prompt.map(str::to_string);
        let tools = tools.to_vec();
        tokio::spawn(async move {
            let err_tx = tx.clone();
            if let Err(e) = this.run_stream(messages, system_prompt, tools, tx).await {
                let _ = err_tx.send(StreamChunk::Error(e.to_string())).await;
            }
        });
        chunk_stream(rx)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let response = self
            .client
            .get(self.tags_endpoint())
            .timeout(self.health_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let data: Value = response.json().await?;
        let models = data
            .get("models")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(|name| ModelInfo {
                        id: name.to_string(),
                        name: name.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    async fn test_connection(&self) -> bool {
        let result = self
            .client
            .get(self.tags_endpoint())
            .timeout(self.health_timeout)
            .send()
            .await;
        matches!(result, Ok(r) if r.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: vision parts split into joined text plus bare base64 images.
    #[test]
    fn vision_parts_split() {
        let msgs = vec![ChatMessage::user_parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::Text { text: "b".into() },
            ContentPart::ImageUrl {
                image_url: "data:image/png;base64,QUJD".into(),
            },
        ])];
        let wire = OllamaProvider::build_messages(&msgs, None);
        assert_eq!(wire[0]["content"], "a\nb");
        assert_eq!(wire[0]["images"][0], "QUJD");
    }

    /// **Scenario**: object-form tool arguments re-serialize to a JSON string.
    #[test]
    fn tool_call_arguments_object_form() {
        let message = json!({
            "tool_calls": [
                {"function": {"name": "reverse_string", "arguments": {"text": "hello"}}}
            ]
        });
        let calls = OllamaProvider::parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "reverse_string");
        assert_eq!(calls[0].id, "call_0");
        let parsed: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["text"], "hello");
    }

    /// **Scenario**: eval counts normalize to input/output tokens.
    #[test]
    fn usage_normalization() {
        let usage =
            OllamaProvider::parse_usage(&json!({"prompt_eval_count": 7, "eval_count": 3}))
                .unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
        assert!(OllamaProvider::parse_usage(&json!({})).is_none());
    }

    /// **Scenario**: temperature lands under options.
    #[test]
    fn temperature_in_options() {
        let p = OllamaProvider::new(
            None,
            "llama3.2",
            SamplingConfig {
                temperature: Some(0.1),
                ..Default::default()
            },
        );
        let payload = p.build_payload(&[ChatMessage::user("hi")], None, &[], true);
        assert_eq!(payload["options"]["temperature"], 0.1);
        assert_eq!(payload["stream"], true);
    }
}

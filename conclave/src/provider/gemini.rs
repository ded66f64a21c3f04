//! Google Gemini adapter.
//!
//! Role mapping: everything non-user becomes `model`; the system prompt goes
//! in `system_instruction`. Function calls map bidirectionally between the
//! OpenAI function form and Gemini `function_declarations` / `functionCall`
//! parts. The API key travels as a query parameter.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::entity::SamplingConfig;
use crate::message::{ChatMessage, ContentPart, MessageContent, Role};
use crate::provider::sse::{data_payload, LineBuffer};
use crate::provider::{
    chunk_stream, ChatProvider, ChunkStream, ModelInfo, ProviderError, ProviderResponse,
    StreamChunk, TokenUsage, ToolCallRequest, ToolSchema, CHUNK_CHANNEL_CAPACITY,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini provider.
#[derive(Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model_id: String,
    sampling: SamplingConfig,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl GeminiProvider {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        model_id: impl Into<String>,
        sampling: SamplingConfig,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
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

    fn key(&self) -> &str {
        self.api_key.as_deref().unwrap_or("")
    }

    fn generate_url(&self, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                base,
                self.model_id,
                self.key()
            )
        } else {
            format!(
                "{}/models/{}:generateContent?key={}",
                base,
                self.model_id,
                self.key()
            )
        }
    }

    fn build_contents(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User | Role::Tool | Role::System => "user",
                    Role::Assistant => "model",
                };
                let parts = match &m.content {
                    MessageContent::Text(s) => vec![json!({"text": s})],
                    MessageContent::Parts(parts) => parts
                        .iter()
                        .filter_map(|p| match p {
                            ContentPart::Text { text } => Some(json!({"text": text})),
                            ContentPart::ImageUrl { image_url } => {
                                let rest = image_url.strip_prefix("data:")?;
                                let (header, data) = rest.split_once(',')?;
                                let mime = header.split(';').next().unwrap_or("");
                                Some(json!({
                                    "inline_data": {"mime_type": mime, "data": data}
                                }))
                            }
                        })
                        .collect(),
                };
                json!({"role": role, "parts": parts})
            })
            .collect()
    }

    fn build_payload(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Value {
        let mut payload = json!({"contents": Self::build_contents(messages)});
        if let Some(sp) = system_prompt {
            payload["system_instruction"] = json!({"parts": [{"text": sp}]});
        }
        let mut generation_config = serde_json::Map::new();
        if let Some(t) = self.sampling.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(mt) = self.sampling.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(mt));
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }
        if !tools.is_empty() {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            payload["tools"] = json!([{"function_declarations": declarations}]);
        }
        payload
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| {
                v.pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or(body);
        ProviderError::Api { status, message }
    }

    async fn run_stream(
        self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<String>,
        tools: Vec<ToolSchema>,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<(), ProviderError> {
        let payload = self.build_payload(&messages, system_prompt.as_deref(), &tools);
        debug!(model = %self.model_id, tools = tools.len(), "gemini stream request");

        let response = self
            .client
            .post(self.generate_url(true))
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut call_seq = 0u32;

        while let Some(chunk) = body.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Http(e.to_string()))?;
            for line in lines.push(&bytes) {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                let Ok(event) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                let candidate = event.pointer("/candidates/0");
                if let Some(parts) = candidate
                    .and_then(|c| c.pointer("/content/parts"))
                    .and_then(Value::as_array)
                {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            let _ = tx.send(StreamChunk::Content(text.to_string())).await;
                        } else if let Some(fc) = part.get("functionCall") {
                            let name = fc
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string();
                            let args = fc.get("args").cloned().unwrap_or_else(|| json!({}));
                            call_seq += 1;
                            let _ = tx
                                .send(StreamChunk::ToolCall(ToolCallRequest {
                                    id: format!("call_{}_{}", name, call_seq),
                                    name,
                                    arguments: args.to_string(),
                                }))
                                .await;
                        }
                    }
                }
                if candidate
                    .and_then(|c| c.get("finishReason"))
                    .and_then(Value::as_str)
                    .is_some()
                {
                    let usage = event.get("usageMetadata").map(|u| TokenUsage {
                        input_tokens: u["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                        output_tokens: u["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                    });
                    let _ = tx.send(StreamChunk::Done(usage)).await;
                    return Ok(());
                }
            }
        }
        let _ = tx.send(StreamChunk::Done(None)).await;
        Ok(())
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        system_prompt: Option<&str>,
        tools: &[ToolSchema],
    ) -> Result<ProviderResponse, ProviderError> {
        let payload = self.build_payload(messages, system_prompt, tools);
        debug!(model = %self.model_id, tools = tools.len(), "gemini chat request");

        let response = self
            .client
            .post(self.generate_url(false))
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let data: Value = response.json().await?;
        let parts = data
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let content: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();

        let tool_calls: Vec<ToolCallRequest> = parts
            .iter()
            .filter_map(|p| p.get("functionCall"))
            .enumerate()
            .map(|(i, fc)| ToolCallRequest {
                id: format!("call_{}", i),
                name: fc
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                arguments: fc
                    .get("args")
                    .cloned()
                    .unwrap_or_else(|| json!({}))
                    .to_string(),
            })
            .collect();

        let usage = data.get("usageMetadata").map(|u| TokenUsage {
            input_tokens: u["promptTokenCount"].as_u64().unwrap_or(0) as u32,
            output_tokens: u["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        });

        Ok(ProviderResponse {
            content,
            tool_calls,
            usage,
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
        Ok([
            ("gemini-2.0-flash", "Gemini 2.0 Flash"),
            ("gemini-2.0-flash-lite", "Gemini 2.0 Flash Lite"),
            ("gemini-2.5-pro-preview-05-06", "Gemini 2.5 Pro"),
            ("gemini-2.5-flash-preview-04-17", "Gemini 2.5 Flash"),
        ]
        .into_iter()
        .map(|(id, name)| ModelInfo {
            id: id.to_string(),
            name: name.to_string(),
        })
        .collect())
    }

    async fn test_connection(&self) -> bool {
        let url = format!(
            "{}/models?key={}",
            self.base_url.trim_end_matches('/'),
            self.key()
        );
        let result = self
            .client
            .get(url)
            .timeout(self.health_timeout)
            .send()
            .await;
        matches!(result, Ok(r) if r.status().is_success())
    }
}

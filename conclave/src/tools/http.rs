//! HTTP handler execution.
//!
//! Config shape: `{"url": ..., "method": "GET"|..., "headers": {...}}`.
//! GET sends the arguments object as query parameters; any other method
//! sends it as a JSON body. The raw response text is the tool result,
//! whatever the status code; transport failures convert to error JSON.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

fn query_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Issues the configured request and returns the response body.
pub async fn run_http_handler(config: &Value, arguments: &Value, timeout: Duration) -> String {
    let url = config.get("url").and_then(Value::as_str).unwrap_or("");
    if url.is_empty() {
        return json!({"error": "No URL configured for this tool"}).to_string();
    }
    let method = config
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("POST")
        .to_uppercase();

    let client = reqwest::Client::new();
    let mut request = match method.as_str() {
        "GET" => {
            let params: Vec<(String, String)> = arguments
                .as_object()
                .map(|o| {
                    o.iter()
                        .map(|(k, v)| (k.clone(), query_value(v)))
                        .collect()
                })
                .unwrap_or_default();
            client.get(url).query(&params)
        }
        other => {
            let method = match reqwest::Method::from_bytes(other.as_bytes()) {
                Ok(m) => m,
                Err(_) => {
                    return json!({"error": format!("Unsupported method: {}", other)}).to_string()
                }
            };
            client.request(method, url).json(arguments)
        }
    };

    if let Some(headers) = config.get("headers").and_then(Value::as_object) {
        for (k, v) in headers {
            if let Some(value) = v.as_str() {
                request = request.header(k.as_str(), value);
            }
        }
    }

    match request.timeout(timeout).send().await {
        Ok(response) => response.text().await.unwrap_or_default(),
        Err(e) => {
            warn!(url = url, error = %e, "http tool request failed");
            json!({"error": format!("HTTP request failed: {}", e)}).to_string()
        }
    }
}

//! OpenAI-compatible chat completions adapter.
//!
//! Also covers any endpoint speaking the same wire shape when constructed
//! with a custom base URL.

use crate::types::{
    CompletionRequest, CompletionResponse, Role, StopReason, ToolCall, ToolChoice, Usage,
};
use crate::LlmProvider;
use atelier_types::{CoreError, CoreResult, Ctx};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireToolFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireToolFunction,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<Value>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> CoreResult<Self> {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> CoreResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CoreError::TransientProvider(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: resolve_chat_endpoint(&endpoint.into()),
            api_key: api_key.into(),
        })
    }

    fn build_payload(&self, request: &CompletionRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = request.system.as_deref() {
            if !system.trim().is_empty() {
                messages.push(json!({"role": "system", "content": system}));
            }
        }
        for message in &request.messages {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            messages.push(json!({"role": role, "content": message.content}));
        }

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(choice) = &request.tool_choice {
            payload["tool_choice"] = match choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Tool(name) => {
                    json!({"type": "function", "function": {"name": name}})
                }
            };
        }
        payload
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &Ctx,
    ) -> CoreResult<CompletionResponse> {
        ctx.checkpoint()?;
        let started = Instant::now();

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.build_payload(request))
            .send()
            .await
            .map_err(|e| CoreError::TransientProvider(format!("openai request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error("openai", status, &body));
        }

        let body: WireResponse = response
            .json()
            .await
            .map_err(|e| CoreError::TransientProvider(format!("invalid openai response: {e}")))?;

        let choice = body.choices.first().ok_or_else(|| {
            CoreError::TransientProvider("openai response did not include choices".to_string())
        })?;

        let content = choice
            .message
            .content
            .as_ref()
            .map(extract_text)
            .unwrap_or_default();
        let tool_calls = choice
            .message
            .tool_calls
            .iter()
            .map(|call| ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::Null),
            })
            .collect();

        let usage = body
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens.unwrap_or(0),
                output_tokens: u.completion_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content,
            tool_calls,
            stop_reason: map_finish_reason(choice.finish_reason.as_deref()),
            usage,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn resolve_chat_endpoint(endpoint: &str) -> String {
    if endpoint.contains("/chat/completions") {
        endpoint.to_string()
    } else {
        format!("{}/chat/completions", endpoint.trim_end_matches('/'))
    }
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::EndTurn,
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        Some("content_filter") => StopReason::StopSequence,
        _ => StopReason::Other,
    }
}

fn extract_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Convert an HTTP failure into the core taxonomy.
pub(crate) fn classify_http_error(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> CoreError {
    let snippet = truncate(body, 320);
    if status.as_u16() == 429 {
        CoreError::RateLimited {
            scope: format!("{provider} api"),
            retry_after: Duration::from_secs(5),
        }
    } else if status.is_server_error() {
        CoreError::TransientProvider(format!("{provider} error {status}: {snippet}"))
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        CoreError::AuthorizationDenied(format!("{provider} rejected credentials: {snippet}"))
    } else {
        CoreError::Validation(format!("{provider} error {status}: {snippet}"))
    }
}

pub(crate) fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{truncated}...")
    } else {
        truncated
    }
}

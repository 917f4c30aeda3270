//! Anthropic messages API adapter.

use crate::openai::{classify_http_error, truncate};
use crate::types::{
    CompletionRequest, CompletionResponse, Role, StopReason, ToolCall, ToolChoice, Usage,
};
use crate::LlmProvider;
use atelier_types::{CoreError, CoreResult, Ctx};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    content_type: String,
    text: Option<String>,
    id: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireContent>,
    stop_reason: Option<String>,
    usage: Option<WireUsage>,
    model: Option<String>,
}

impl AnthropicProvider {
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
            endpoint: resolve_messages_endpoint(&endpoint.into()),
            api_key: api_key.into(),
        })
    }

    fn build_payload(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let mut payload = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }

        // System text may arrive either as the dedicated field or as system
        // messages; both fold into the payload's system string.
        let mut system_parts: Vec<String> = Vec::new();
        if let Some(system) = request.system.as_deref() {
            if !system.trim().is_empty() {
                system_parts.push(system.to_string());
            }
        }
        for message in request.messages.iter().filter(|m| m.role == Role::System) {
            system_parts.push(message.content.clone());
        }
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n"));
        }

        if !request.tools.is_empty() {
            payload["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        if let Some(choice) = &request.tool_choice {
            payload["tool_choice"] = match choice {
                ToolChoice::Auto => json!({"type": "auto"}),
                ToolChoice::None => json!({"type": "none"}),
                ToolChoice::Required => json!({"type": "any"}),
                ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
            };
        }
        payload
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_payload(request))
            .send()
            .await
            .map_err(|e| CoreError::TransientProvider(format!("anthropic request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error("anthropic", status, &truncate(&body, 320)));
        }

        let body: WireResponse = response.json().await.map_err(|e| {
            CoreError::TransientProvider(format!("invalid anthropic response: {e}"))
        })?;

        let content = body
            .content
            .iter()
            .filter(|part| part.content_type == "text")
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        let tool_calls = body
            .content
            .iter()
            .filter(|part| part.content_type == "tool_use")
            .map(|part| ToolCall {
                id: part.id.clone().unwrap_or_default(),
                name: part.name.clone().unwrap_or_default(),
                arguments: part.input.clone().unwrap_or(Value::Null),
            })
            .collect();

        let usage = body
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens.unwrap_or(0),
                output_tokens: u.output_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: content.trim().to_string(),
            tool_calls,
            stop_reason: map_stop_reason(body.stop_reason.as_deref()),
            usage,
            model: body.model.unwrap_or_else(|| request.model.clone()),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn resolve_messages_endpoint(endpoint: &str) -> String {
    if endpoint.ends_with("/messages") {
        endpoint.to_string()
    } else {
        format!("{}/messages", endpoint.trim_end_matches('/'))
    }
}

fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("end_turn") => StopReason::EndTurn,
        Some("max_tokens") => StopReason::MaxTokens,
        Some("tool_use") => StopReason::ToolUse,
        Some("stop_sequence") => StopReason::StopSequence,
        _ => StopReason::Other,
    }
}

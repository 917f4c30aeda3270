//! Plan generation.
//!
//! The planner asks the routed model for a JSON plan; the worker meters the
//! call through billing using the usage the planner reports. Repair rounds
//! feed the scorer's typed suggestions back into the prompt.

use atelier_llm::{CompletionRequest, LlmGateway, Message, Usage};
use atelier_scorer::RepairSuggestion;
use atelier_types::{CoreError, CoreResult, Ctx, Plan};
use async_trait::async_trait;
use serde::Deserialize;

/// A generated plan plus what producing it cost.
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: Plan,
    pub usage: Usage,
    pub model: String,
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Generate (or regenerate) a plan for the prompt. `suggestions` carries
    /// the scorer's repair advice from the previous round, empty on the
    /// first attempt.
    async fn generate(
        &self,
        prompt: &str,
        suggestions: &[RepairSuggestion],
        attempt: usize,
        ctx: &Ctx,
    ) -> CoreResult<PlannerOutput>;

    /// The text the planner will send, for pre-call estimation.
    fn request_text(&self, prompt: &str, suggestions: &[RepairSuggestion]) -> String;
}

const PLANNER_SYSTEM: &str = "You are a task planner. Respond with a single JSON object: \
{\"id\": string, \"goal\": string, \"phases\": [{\"id\": string, \"name\": string, \
\"description\": string, \"required_tools\": [string], \"dependencies\": [string], \
\"expected_outputs\": [string], \"estimated_duration_ms\": number, \"risk_level\": number}]}. \
No prose, no code fences.";

#[derive(Debug, Deserialize)]
struct WirePlan {
    #[serde(default)]
    id: Option<String>,
    goal: String,
    phases: Vec<atelier_types::PlanPhase>,
}

/// Planner backed by the LLM gateway.
pub struct LlmPlanner {
    gateway: std::sync::Arc<LlmGateway>,
    model: String,
    max_tokens: u32,
}

impl LlmPlanner {
    pub fn new(gateway: std::sync::Arc<LlmGateway>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            gateway,
            model: model.into(),
            max_tokens,
        }
    }

    fn user_prompt(prompt: &str, suggestions: &[RepairSuggestion]) -> String {
        if suggestions.is_empty() {
            format!("Plan this task:\n{prompt}")
        } else {
            let advice: Vec<String> = suggestions
                .iter()
                .map(|s| format!("- {:?}: {}", s.repair_type, s.reason))
                .collect();
            format!(
                "Plan this task:\n{prompt}\n\nYour previous plan needs repair:\n{}",
                advice.join("\n")
            )
        }
    }

    /// Tolerates models that wrap the JSON in code fences despite the
    /// instructions.
    fn extract_json(content: &str) -> &str {
        let trimmed = content.trim();
        let trimmed = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .unwrap_or(trimmed);
        trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn generate(
        &self,
        prompt: &str,
        suggestions: &[RepairSuggestion],
        attempt: usize,
        ctx: &Ctx,
    ) -> CoreResult<PlannerOutput> {
        let request = CompletionRequest::new(
            self.model.clone(),
            vec![Message::user(Self::user_prompt(prompt, suggestions))],
        )
        .with_system(PLANNER_SYSTEM)
        .with_max_tokens(self.max_tokens);

        let response = self.gateway.complete(&request, ctx).await?;
        let body = Self::extract_json(&response.content);
        let wire: WirePlan = serde_json::from_str(body).map_err(|e| {
            CoreError::PlanRejected(format!("planner returned malformed plan JSON: {e}"))
        })?;

        let plan = Plan {
            id: wire
                .id
                .unwrap_or_else(|| format!("plan-{}", attempt + 1)),
            goal: wire.goal,
            phases: wire.phases,
        };

        Ok(PlannerOutput {
            plan,
            usage: response.usage,
            model: response.model,
        })
    }

    fn request_text(&self, prompt: &str, suggestions: &[RepairSuggestion]) -> String {
        format!(
            "{PLANNER_SYSTEM}\n{}",
            Self::user_prompt(prompt, suggestions)
        )
    }
}

//! The scorer proper: decisions, repair suggestions, and session tracking.

use crate::score::{score_plan, PlanScore, ScoringContext};
use crate::session::{plan_budget_violation, AbortReason, PlannerSession, RepairAttempt};
use crate::{PlanDecision, ACCEPT_THRESHOLD, REPAIR_THRESHOLD};
use atelier_types::Plan;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Typed repair suggestions, keyed off the weakest sub-score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairType {
    /// Substitute a missing tool or fix a dangling dependency.
    ModifyPhase,
    /// Cover more of the goal.
    AddPhase,
    /// Drop a redundant phase.
    RemovePhase,
    /// Break a risky phase into safer parts.
    SplitPhase,
}

/// An advisory suggestion to the planner. The planner may reject it, but each
/// repair attempt still consumes budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairSuggestion {
    pub repair_type: RepairType,
    pub reason: String,
}

/// Generate suggestions from the sub-score profile.
pub fn generate_repair_suggestions(_plan: &Plan, score: &PlanScore) -> Vec<RepairSuggestion> {
    let mut suggestions = Vec::new();

    if score.feasibility < 0.6 {
        suggestions.push(RepairSuggestion {
            repair_type: RepairType::ModifyPhase,
            reason: format!(
                "Feasibility {:.2}: substitute unavailable tools or fix dangling dependencies",
                score.feasibility
            ),
        });
    }
    if score.completeness < 0.6 {
        suggestions.push(RepairSuggestion {
            repair_type: RepairType::AddPhase,
            reason: format!(
                "Completeness {:.2}: goal keywords are not covered by any phase",
                score.completeness
            ),
        });
    }
    if score.redundant_phases > 0 {
        suggestions.push(RepairSuggestion {
            repair_type: RepairType::RemovePhase,
            reason: format!("{} redundant phase(s) detected", score.redundant_phases),
        });
    }
    if score.avg_risk > 0.5 {
        suggestions.push(RepairSuggestion {
            repair_type: RepairType::SplitPhase,
            reason: format!(
                "Average risk {:.2}: split high-risk phases into smaller steps",
                score.avg_risk
            ),
        });
    }

    suggestions
}

/// Decide what the planner should do with a scored plan.
///
/// Session budgets are checked first (exhausted budgets abort), then the
/// feasibility-zero override, then the composite thresholds.
pub fn make_decision(
    score: &PlanScore,
    session: Option<&PlannerSession>,
) -> (PlanDecision, Option<String>) {
    if let Some(session) = session {
        if session.repair_attempts.len() >= crate::budgets::MAX_REPAIR_ATTEMPTS
            && score.composite < ACCEPT_THRESHOLD
        {
            return (
                PlanDecision::Abort,
                Some(format!(
                    "Max repair attempts ({}) reached without an acceptable plan",
                    crate::budgets::MAX_REPAIR_ATTEMPTS
                )),
            );
        }
        if session.regeneration_count > crate::budgets::MAX_REGENERATION_ATTEMPTS {
            return (
                PlanDecision::Abort,
                Some(format!(
                    "Max regeneration attempts ({}) exceeded",
                    crate::budgets::MAX_REGENERATION_ATTEMPTS
                )),
            );
        }
    }

    if score.feasibility == 0.0 {
        return (
            PlanDecision::Regenerate,
            Some("Zero feasibility: no required tool or dependency can be satisfied".to_string()),
        );
    }

    if score.composite >= ACCEPT_THRESHOLD {
        (PlanDecision::Accept, None)
    } else if score.composite >= REPAIR_THRESHOLD {
        (
            PlanDecision::Repair,
            Some(format!(
                "Composite {:.2} in repair band [{:.2}, {:.2})",
                score.composite, REPAIR_THRESHOLD, ACCEPT_THRESHOLD
            )),
        )
    } else {
        (
            PlanDecision::Regenerate,
            Some(format!(
                "Composite {:.2} below regenerate floor {:.2}",
                score.composite, REPAIR_THRESHOLD
            )),
        )
    }
}

/// The outcome of scoring one plan once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResult {
    pub plan_id: String,
    pub score: PlanScore,
    pub decision: PlanDecision,
    pub reason: Option<String>,
    pub abort_reason: Option<AbortReason>,
    pub suggestions: Vec<RepairSuggestion>,
    /// Unique per scoring pass; lets callers deduplicate downstream writes.
    pub idempotency_key: String,
    pub scoring_duration: Duration,
}

/// Scores plans and tracks planning sessions.
pub struct PlanScorer {
    context: ScoringContext,
    sessions: HashMap<String, PlannerSession>,
}

impl PlanScorer {
    pub fn new(context: ScoringContext) -> Self {
        Self {
            context,
            sessions: HashMap::new(),
        }
    }

    /// Score a plan, optionally under a session whose budgets constrain the
    /// decision.
    pub fn score(&mut self, plan: &Plan, session_id: Option<&str>) -> ScoringResult {
        let started = Instant::now();
        let score = score_plan(plan, &self.context);

        let session = session_id.map(|id| {
            self.sessions
                .entry(id.to_string())
                .or_insert_with(|| PlannerSession::new(id, plan.id.clone()))
        });

        // Shape budgets abort regardless of score.
        let shape_violation = plan_budget_violation(plan);
        let (decision, reason, abort_reason) = if let Some(violation) = shape_violation {
            (
                PlanDecision::Abort,
                Some(violation.message.clone()),
                Some(violation),
            )
        } else {
            let (decision, reason) = make_decision(&score, session.as_deref());
            let abort = (decision == PlanDecision::Abort).then(|| AbortReason {
                code: "budget_exhausted".to_string(),
                message: reason.clone().unwrap_or_default(),
            });
            (decision, reason, abort)
        };

        if let Some(session) = session {
            session.plan_id = plan.id.clone();
            session.final_score = Some(score.composite);
            session.final_decision = Some(decision);
            session.decision_history.push(decision);
        }

        let suggestions = if decision == PlanDecision::Repair {
            generate_repair_suggestions(plan, &score)
        } else {
            Vec::new()
        };

        tracing::debug!(
            plan_id = %plan.id,
            composite = score.composite,
            decision = ?decision,
            "Plan scored"
        );

        ScoringResult {
            plan_id: plan.id.clone(),
            score,
            decision,
            reason,
            abort_reason,
            suggestions,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            scoring_duration: started.elapsed(),
        }
    }

    /// Record a repair attempt against a session.
    pub fn record_repair_attempt(
        &mut self,
        session_id: &str,
        repair_type: RepairType,
        score_before: f64,
        score_after: f64,
        duration: Duration,
    ) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.repair_attempts.push(RepairAttempt {
                repair_type,
                score_before,
                score_after,
                duration,
            });
        }
    }

    /// Record a full plan regeneration against a session.
    pub fn record_regeneration(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.regeneration_count += 1;
        }
    }

    /// Evaluate all abort budgets for a session given elapsed planning time.
    pub fn should_abort(&self, session_id: &str, elapsed: Duration) -> Option<AbortReason> {
        match self.sessions.get(session_id) {
            Some(session) => session.check_budgets(elapsed),
            // No session yet: only the wall-clock budget applies.
            None => PlannerSession::new(session_id, "").check_budgets(elapsed),
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<&PlannerSession> {
        self.sessions.get(session_id)
    }

    pub fn clear_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

//! Per-plan planning sessions and abort budgets.

use crate::{budgets, PlanDecision};
use atelier_types::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Why a planning session was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    pub code: String,
    pub message: String,
}

impl AbortReason {
    fn new(code: &str, message: String) -> Self {
        Self {
            code: code.to_string(),
            message,
        }
    }
}

/// One recorded repair attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub repair_type: crate::RepairType,
    pub score_before: f64,
    pub score_after: f64,
    pub duration: Duration,
}

/// Bookkeeping for one plan's journey through the scoring loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSession {
    pub session_id: String,
    pub plan_id: String,
    pub started_at: DateTime<Utc>,
    pub repair_attempts: Vec<RepairAttempt>,
    pub regeneration_count: usize,
    pub decision_history: Vec<PlanDecision>,
    pub final_score: Option<f64>,
    pub final_decision: Option<PlanDecision>,
}

impl PlannerSession {
    pub fn new(session_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            plan_id: plan_id.into(),
            started_at: Utc::now(),
            repair_attempts: Vec::new(),
            regeneration_count: 0,
            decision_history: Vec::new(),
            final_score: None,
            final_decision: None,
        }
    }

    pub fn total_repair_time(&self) -> Duration {
        self.repair_attempts.iter().map(|a| a.duration).sum()
    }

    /// Budget checks that depend on session history and elapsed time.
    pub fn check_budgets(&self, elapsed: Duration) -> Option<AbortReason> {
        if elapsed > budgets::MAX_PLANNING_TIME {
            return Some(AbortReason::new(
                "planning_time_limit",
                format!(
                    "Planning time limit exceeded: {:?} > {:?}",
                    elapsed,
                    budgets::MAX_PLANNING_TIME
                ),
            ));
        }
        let repair_time = self.total_repair_time();
        if repair_time > budgets::MAX_TOTAL_REPAIR_TIME {
            return Some(AbortReason::new(
                "repair_time_limit",
                format!(
                    "Cumulative repair time exceeded: {:?} > {:?}",
                    repair_time,
                    budgets::MAX_TOTAL_REPAIR_TIME
                ),
            ));
        }
        if let Some(attempt) = self
            .repair_attempts
            .iter()
            .find(|a| a.duration > budgets::MAX_SINGLE_REPAIR_TIME)
        {
            return Some(AbortReason::new(
                "single_repair_limit",
                format!(
                    "A single repair took {:?}, over the {:?} limit",
                    attempt.duration,
                    budgets::MAX_SINGLE_REPAIR_TIME
                ),
            ));
        }
        if self.repair_attempts.len() > budgets::MAX_REPAIR_ATTEMPTS {
            return Some(AbortReason::new(
                "max_repair_attempts",
                format!(
                    "Max repair attempts exceeded: {} > {}",
                    self.repair_attempts.len(),
                    budgets::MAX_REPAIR_ATTEMPTS
                ),
            ));
        }
        if self.regeneration_count > budgets::MAX_REGENERATION_ATTEMPTS {
            return Some(AbortReason::new(
                "max_regeneration_attempts",
                format!(
                    "Max regeneration attempts exceeded: {} > {}",
                    self.regeneration_count,
                    budgets::MAX_REGENERATION_ATTEMPTS
                ),
            ));
        }
        None
    }

    /// Whether further repairs are allowed at all.
    pub fn repairs_exhausted(&self) -> bool {
        self.repair_attempts.len() >= budgets::MAX_REPAIR_ATTEMPTS
    }

    pub fn regenerations_exhausted(&self) -> bool {
        self.regeneration_count >= budgets::MAX_REGENERATION_ATTEMPTS
    }
}

/// Budget checks that depend only on the plan's shape.
pub fn plan_budget_violation(plan: &Plan) -> Option<AbortReason> {
    if plan.phases.len() > budgets::MAX_PHASES {
        return Some(AbortReason::new(
            "max_phases",
            format!(
                "Plan has {} phases, over the {} limit",
                plan.phases.len(),
                budgets::MAX_PHASES
            ),
        ));
    }
    if let Some(phase) = plan
        .phases
        .iter()
        .find(|p| p.estimated_duration_ms > budgets::MAX_PHASE_DURATION_MS)
    {
        return Some(AbortReason::new(
            "max_phase_duration",
            format!(
                "Phase '{}' estimates {} ms, over the {} ms limit",
                phase.name,
                phase.estimated_duration_ms,
                budgets::MAX_PHASE_DURATION_MS
            ),
        ));
    }
    let total = plan.total_estimated_duration_ms();
    if total > budgets::MAX_TOTAL_DURATION_MS {
        return Some(AbortReason::new(
            "max_total_duration",
            format!(
                "Plan estimates {} ms total, over the {} ms limit",
                total,
                budgets::MAX_TOTAL_DURATION_MS
            ),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepairType;
    use atelier_types::PlanPhase;

    fn attempt(duration: Duration) -> RepairAttempt {
        RepairAttempt {
            repair_type: RepairType::ModifyPhase,
            score_before: 0.5,
            score_after: 0.55,
            duration,
        }
    }

    #[test]
    fn planning_time_limit_aborts() {
        let session = PlannerSession::new("s1", "p1");
        let reason = session.check_budgets(Duration::from_secs(35)).unwrap();
        assert_eq!(reason.code, "planning_time_limit");
    }

    #[test]
    fn cumulative_repair_time_aborts() {
        let mut session = PlannerSession::new("s1", "p1");
        // Five 14s repairs stay under the single-repair cap but blow the total.
        for _ in 0..5 {
            session.repair_attempts.push(attempt(Duration::from_secs(14)));
        }
        let reason = session.check_budgets(Duration::from_secs(1)).unwrap();
        assert_eq!(reason.code, "repair_time_limit");
    }

    #[test]
    fn single_slow_repair_aborts() {
        let mut session = PlannerSession::new("s1", "p1");
        session.repair_attempts.push(attempt(Duration::from_secs(16)));
        let reason = session.check_budgets(Duration::from_secs(1)).unwrap();
        assert_eq!(reason.code, "single_repair_limit");
    }

    #[test]
    fn repair_attempt_count_aborts() {
        let mut session = PlannerSession::new("s1", "p1");
        for _ in 0..4 {
            session.repair_attempts.push(attempt(Duration::from_secs(1)));
        }
        let reason = session.check_budgets(Duration::from_secs(1)).unwrap();
        assert_eq!(reason.code, "max_repair_attempts");
    }

    #[test]
    fn within_budget_passes() {
        let mut session = PlannerSession::new("s1", "p1");
        session.repair_attempts.push(attempt(Duration::from_secs(2)));
        assert!(session.check_budgets(Duration::from_secs(5)).is_none());
    }

    #[test]
    fn oversized_plans_violate_shape_budgets() {
        let phases: Vec<PlanPhase> = (0..16)
            .map(|i| PlanPhase::new(format!("ph{i}"), format!("Phase {i}"), ""))
            .collect();
        let plan = Plan::new("p1", "goal", phases);
        assert_eq!(plan_budget_violation(&plan).unwrap().code, "max_phases");

        let plan = Plan::new(
            "p2",
            "goal",
            vec![PlanPhase::new("ph1", "Slow", "").with_duration_ms(700_000)],
        );
        assert_eq!(
            plan_budget_violation(&plan).unwrap().code,
            "max_phase_duration"
        );

        let phases: Vec<PlanPhase> = (0..10)
            .map(|i| PlanPhase::new(format!("ph{i}"), format!("P{i}"), "").with_duration_ms(400_000))
            .collect();
        let plan = Plan::new("p3", "goal", phases);
        assert_eq!(
            plan_budget_violation(&plan).unwrap().code,
            "max_total_duration"
        );
    }
}

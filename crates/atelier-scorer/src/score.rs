//! Sub-score calculations.

use crate::{WEIGHT_COMPLETENESS, WEIGHT_EFFICIENCY, WEIGHT_FEASIBILITY, WEIGHT_RISK};
use atelier_types::{Plan, PlanPhase};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What the scorer knows about the execution environment.
#[derive(Debug, Clone, Default)]
pub struct ScoringContext {
    /// Tool names the executor can actually dispatch.
    pub available_tools: Vec<String>,
}

impl ScoringContext {
    pub fn with_tools(tools: Vec<String>) -> Self {
        Self {
            available_tools: tools,
        }
    }
}

/// The four sub-scores plus the weighted composite and supporting metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanScore {
    pub feasibility: f64,
    pub completeness: f64,
    pub efficiency: f64,
    pub risk_adjusted: f64,
    pub composite: f64,
    pub phase_count: usize,
    pub total_duration_ms: u64,
    pub avg_risk: f64,
    pub redundant_phases: usize,
}

/// Feasibility: how much of the plan the executor can actually run.
///
/// The fraction of required tools that exist and the fraction of phase
/// dependencies that reference real phases, equally weighted. A dimension
/// with nothing to check drops out of the average. Empty plans score zero.
pub fn calculate_feasibility(plan: &Plan, context: &ScoringContext) -> f64 {
    if plan.phases.is_empty() {
        return 0.0;
    }

    let available: HashSet<&str> = context.available_tools.iter().map(String::as_str).collect();
    let known_phases: HashSet<&str> = plan.phases.iter().map(|p| p.id.as_str()).collect();

    let mut total_tools = 0usize;
    let mut found_tools = 0usize;
    let mut total_deps = 0usize;
    let mut valid_deps = 0usize;

    for phase in &plan.phases {
        for tool in &phase.required_tools {
            total_tools += 1;
            if available.contains(tool.as_str()) {
                found_tools += 1;
            }
        }
        for dep in &phase.dependencies {
            total_deps += 1;
            if known_phases.contains(dep.as_str()) {
                valid_deps += 1;
            }
        }
    }

    let mut fractions = Vec::with_capacity(2);
    if total_tools > 0 {
        fractions.push(found_tools as f64 / total_tools as f64);
    }
    if total_deps > 0 {
        fractions.push(valid_deps as f64 / total_deps as f64);
    }

    if fractions.is_empty() {
        1.0
    } else {
        fractions.iter().sum::<f64>() / fractions.len() as f64
    }
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "into", "onto", "then", "them", "its",
    "all", "any", "are", "was", "has", "have", "will", "can", "per", "each", "using", "about",
];

fn keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(w))
        .map(|w| w.trim_end_matches('s').to_string())
        .collect()
}

/// Completeness: normalized coverage of the goal's meaningful keywords by the
/// union of phase names and descriptions. Empty goals score zero.
pub fn measure_goal_coverage(goal: &str, phases: &[PlanPhase]) -> f64 {
    let goal_keywords: HashSet<String> = keywords(goal).into_iter().collect();
    if goal_keywords.is_empty() {
        return 0.0;
    }

    let mut covered: HashSet<&String> = HashSet::new();
    for phase in phases {
        for word in keywords(&phase.name)
            .into_iter()
            .chain(keywords(&phase.description))
        {
            if let Some(keyword) = goal_keywords.get(&word) {
                covered.insert(keyword);
            }
        }
    }

    covered.len() as f64 / goal_keywords.len() as f64
}

/// Redundant phases: duplicate names (case-insensitive) or identical
/// non-empty expected-output sets.
pub fn count_redundant_phases(plan: &Plan) -> usize {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut seen_outputs: HashSet<Vec<String>> = HashSet::new();
    let mut redundant = 0;

    for phase in &plan.phases {
        let name = phase.name.to_lowercase();
        if !seen_names.insert(name) {
            redundant += 1;
            continue;
        }
        if !phase.expected_outputs.is_empty() {
            let mut outputs: Vec<String> =
                phase.expected_outputs.iter().map(|o| o.to_lowercase()).collect();
            outputs.sort();
            if !seen_outputs.insert(outputs) {
                redundant += 1;
            }
        }
    }
    redundant
}

/// Mean phase risk; zero for empty plans.
pub fn calculate_average_risk(phases: &[PlanPhase]) -> f64 {
    if phases.is_empty() {
        return 0.0;
    }
    phases.iter().map(|p| p.risk_level).sum::<f64>() / phases.len() as f64
}

/// Score a plan: four sub-scores and the weighted composite.
pub fn score_plan(plan: &Plan, context: &ScoringContext) -> PlanScore {
    let feasibility = calculate_feasibility(plan, context);
    let completeness = measure_goal_coverage(&plan.goal, &plan.phases);
    let redundant = count_redundant_phases(plan);
    let avg_risk = calculate_average_risk(&plan.phases);

    let (efficiency, risk_adjusted) = if plan.phases.is_empty() {
        (0.0, 0.0)
    } else {
        (
            1.0 - redundant as f64 / plan.phases.len() as f64,
            1.0 - avg_risk,
        )
    };

    let composite = WEIGHT_FEASIBILITY * feasibility
        + WEIGHT_COMPLETENESS * completeness
        + WEIGHT_EFFICIENCY * efficiency
        + WEIGHT_RISK * risk_adjusted;

    PlanScore {
        feasibility,
        completeness,
        efficiency,
        risk_adjusted,
        composite,
        phase_count: plan.phases.len(),
        total_duration_ms: plan.total_estimated_duration_ms(),
        avg_risk,
        redundant_phases: redundant,
    }
}

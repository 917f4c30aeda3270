//! The plan model produced by the planner and consumed by the scorer and the
//! orchestrator. Plans are versioned by replacement: a repair or regeneration
//! yields a whole new `Plan` value.

use serde::{Deserialize, Serialize};

/// One planner-produced segment of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Phase ids that must complete before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
    #[serde(default)]
    pub estimated_duration_ms: u64,
    /// Risk in [0, 1]; clamped on construction.
    #[serde(default)]
    pub risk_level: f64,
}

impl PlanPhase {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            required_tools: Vec::new(),
            dependencies: Vec::new(),
            expected_outputs: Vec::new(),
            estimated_duration_ms: 0,
            risk_level: 0.0,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.required_tools = tools;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<String>) -> Self {
        self.expected_outputs = outputs;
        self
    }

    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.estimated_duration_ms = ms;
        self
    }

    pub fn with_risk(mut self, risk: f64) -> Self {
        self.risk_level = risk.clamp(0.0, 1.0);
        self
    }
}

/// A goal plus an ordered sequence of phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub phases: Vec<PlanPhase>,
}

impl Plan {
    pub fn new(id: impl Into<String>, goal: impl Into<String>, phases: Vec<PlanPhase>) -> Self {
        Self {
            id: id.into(),
            goal: goal.into(),
            phases,
        }
    }

    pub fn total_estimated_duration_ms(&self) -> u64 {
        self.phases.iter().map(|p| p.estimated_duration_ms).sum()
    }

    /// Phase indices in dependency order.
    ///
    /// Phases whose dependencies are all satisfied come first; ties keep the
    /// planner's original ordering. Unsatisfiable dependencies (cycles or
    /// references to unknown phases) leave the remaining phases in original
    /// order at the tail so execution can still surface the failure.
    pub fn execution_order(&self) -> Vec<usize> {
        let mut ordered = Vec::with_capacity(self.phases.len());
        let mut done: std::collections::HashSet<&str> = std::collections::HashSet::new();
        let known: std::collections::HashSet<&str> =
            self.phases.iter().map(|p| p.id.as_str()).collect();
        let mut remaining: Vec<usize> = (0..self.phases.len()).collect();

        while !remaining.is_empty() {
            let mut progressed = false;
            let mut next_remaining = Vec::new();
            for idx in remaining {
                let phase = &self.phases[idx];
                let ready = phase
                    .dependencies
                    .iter()
                    .all(|d| done.contains(d.as_str()) || !known.contains(d.as_str()));
                if ready {
                    done.insert(phase.id.as_str());
                    ordered.push(idx);
                    progressed = true;
                } else {
                    next_remaining.push(idx);
                }
            }
            if !progressed {
                ordered.extend(next_remaining);
                break;
            }
            remaining = next_remaining;
        }
        ordered
    }
}

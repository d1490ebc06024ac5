//! Budget accounting for one run.
//!
//! Three resources are tracked independently: tokens, cost and completed
//! tasks. Each has an optional ceiling; a missing or zero ceiling means
//! unlimited. Counters only move forward.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A budgeted resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Tokens,
    Cost,
    Tasks,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Tokens, Resource::Cost, Resource::Tasks];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Tokens => "tokens",
            Resource::Cost => "cost",
            Resource::Tasks => "tasks",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured ceilings. `None` or zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_tokens: Option<u64>,
    pub max_cost: Option<f64>,
    pub max_tasks: Option<u32>,
}

impl BudgetLimits {
    fn ceiling(&self, resource: Resource) -> Option<f64> {
        let raw = match resource {
            Resource::Tokens => self.max_tokens.map(|v| v as f64),
            Resource::Cost => self.max_cost,
            Resource::Tasks => self.max_tasks.map(f64::from),
        };
        raw.filter(|v| *v > 0.0)
    }
}

/// Utilization of one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Utilization {
    Unlimited,
    /// Used / ceiling; may exceed 1.0 once the ceiling is crossed.
    Fraction(f64),
}

/// Cumulative consumption for one run, checked against its limits.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    limits: BudgetLimits,
    tokens_used: u64,
    cost_used: f64,
    tasks_completed: u32,
    warned: bool,
}

impl BudgetState {
    pub fn new(limits: BudgetLimits) -> Self {
        Self {
            limits,
            tokens_used: 0,
            cost_used: 0.0,
            tasks_completed: 0,
            warned: false,
        }
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn cost_used(&self) -> f64 {
        self.cost_used
    }

    pub fn tasks_completed(&self) -> u32 {
        self.tasks_completed
    }

    /// Add usage from one attempt. Negative or non-finite cost is ignored.
    pub fn record_usage(&mut self, tokens: u64, cost: f64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        if cost.is_finite() && cost > 0.0 {
            self.cost_used += cost;
        }
    }

    pub fn record_task_completion(&mut self) {
        self.tasks_completed = self.tasks_completed.saturating_add(1);
    }

    /// Return the first resource whose counter has met or exceeded its ceiling.
    pub fn check_limit(&self) -> Option<Resource> {
        Resource::ALL.into_iter().find(|resource| {
            self.limits
                .ceiling(*resource)
                .is_some_and(|ceiling| self.used(*resource) >= ceiling)
        })
    }

    pub fn percentage(&self, resource: Resource) -> Utilization {
        match self.limits.ceiling(resource) {
            Some(ceiling) => Utilization::Fraction(self.used(resource) / ceiling),
            None => Utilization::Unlimited,
        }
    }

    /// Remaining capacity, or `None` when unlimited. Never negative.
    pub fn remaining(&self, resource: Resource) -> Option<f64> {
        self.limits
            .ceiling(resource)
            .map(|ceiling| (ceiling - self.used(resource)).max(0.0))
    }

    /// Fire once per run, the first time any utilization reaches `fraction`.
    pub fn check_warning_threshold(&mut self, fraction: f64) -> Option<(Resource, f64)> {
        if self.warned {
            return None;
        }
        let crossed = Resource::ALL.into_iter().find_map(|resource| {
            match self.percentage(resource) {
                Utilization::Fraction(used) if used >= fraction => Some((resource, used)),
                _ => None,
            }
        });
        if crossed.is_some() {
            self.warned = true;
        }
        crossed
    }

    fn used(&self, resource: Resource) -> f64 {
        match resource {
            Resource::Tokens => self.tokens_used as f64,
            Resource::Cost => self.cost_used,
            Resource::Tasks => f64::from(self.tasks_completed),
        }
    }
}

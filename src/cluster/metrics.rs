//! Resolver metrics
//!
//! Counters exposed to health endpoints alongside the current view.

use serde::{Deserialize, Serialize};

use super::strategy::StrategyDecision;

/// Resolver counters
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverMetrics {
    /// Membership events applied to the view
    pub events_applied: u64,
    /// Membership events rejected by the view store
    pub events_rejected: u64,
    /// Episodes cancelled because the cluster healed before the timer fired
    pub episodes_cancelled: u64,
    /// Decisions produced
    pub decisions: u64,
    /// Decisions that took a safe-default path
    pub safe_default_decisions: u64,
    /// Down-commands acknowledged by the membership layer
    pub downs_issued: u64,
    /// Down-command attempts that failed and were retried
    pub down_retries: u64,
    /// Decisions whose execution was exhausted
    pub executions_failed: u64,
    /// View version of the last decision
    pub last_decision_version: Option<u64>,
}

impl ResolverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decision(&mut self, decision: &StrategyDecision) {
        self.decisions += 1;
        if decision.reason.is_safe_default() {
            self.safe_default_decisions += 1;
        }
        self.last_decision_version = Some(decision.version);
    }
}

//! Optimizer configuration.

use serde::{Deserialize, Serialize};

/// What to do when a rewrite meets a construct it cannot handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedPolicy {
    /// Roll the rewrite back, record it in the report and keep going.
    Skip,
    /// Fail the whole optimize call.
    #[default]
    Reject,
}

/// Configuration for one optimizer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Run the predicate pushdown pass.
    pub predicate_pushdown: bool,
    /// Run the decorrelation pass.
    pub decorrelation: bool,
    pub on_unsupported: UnsupportedPolicy,
    /// Check the output contract (complete nodes, no dependent joins, no dangling
    /// markers) after the passes.
    pub verify_output: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            predicate_pushdown: true,
            decorrelation: true,
            on_unsupported: UnsupportedPolicy::default(),
            verify_output: true,
        }
    }
}

//! Run state, progress and outcome types.

use serde::{Deserialize, Serialize};

use super::{ProgramRecord, Scores};

/// Lifecycle of a search run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    /// Reached the iteration limit.
    StoppedByLimit,
    /// A budgeted resource ran out.
    StoppedByBudget,
    /// The best program met every target score.
    StoppedByTarget,
    /// Stop was requested through the stop handle.
    StoppedManually,
}

impl RunState {
    pub fn is_stopped(self) -> bool {
        !matches!(self, RunState::Idle | RunState::Running)
    }
}

/// Generator usage at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// `generate` calls made.
    pub calls: u64,
    /// Tokens reported by the backend.
    pub tokens: u64,
    /// Calls whose primary model exhausted its retries.
    pub failed_calls: u64,
    /// Share of calls whose primary model succeeded.
    pub success_rate: f64,
}

/// Snapshot reported after every iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchProgress {
    /// Iterations started so far.
    pub iteration: usize,
    pub max_iterations: usize,
    /// Iterations abandoned before producing a child.
    pub failed_iterations: usize,
    /// Programs evaluated, seeds included.
    pub evaluations: usize,
    /// Live population size.
    pub population: usize,
    /// Current best program by primary metric.
    pub best_id: Option<String>,
    /// Primary metric of the best program.
    pub best_score: f64,
    /// Scores of the most recent child.
    pub last_scores: Option<Scores>,
    pub usage: UsageStats,
    pub state: RunState,
}

/// Statistics from a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchStats {
    pub iterations: usize,
    pub failed_iterations: usize,
    pub evaluations: usize,
    /// Time taken (in seconds).
    pub elapsed_seconds: f64,
    pub usage: UsageStats,
}

/// Final result of a search run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Terminal state.
    pub state: RunState,
    /// Best programs, best first.
    pub best: Vec<ProgramRecord>,
    pub stats: SearchStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_serialization() {
        let json = serde_json::to_string(&RunState::StoppedByTarget).unwrap();
        assert_eq!(json, "\"stopped_by_target\"");
        assert!(RunState::StoppedManually.is_stopped());
        assert!(!RunState::Running.is_stopped());
        assert_eq!(RunState::default(), RunState::Idle);
    }
}

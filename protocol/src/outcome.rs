use serde::Deserialize;
use serde::Serialize;

/// Terminal result of one operation, delivered to the chat transport exactly
/// once. Output buffered before the terminal transition always rides along;
/// a timeout or error never discards what the user was already shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationOutcome {
    Completed(CompletedOutcome),
    Cancelled(CancelledOutcome),
    TimedOut(TimedOutOutcome),
    Failed(FailedOutcome),
}

impl OperationOutcome {
    /// The buffered output carried by this outcome, whatever the status.
    pub fn output(&self) -> &str {
        match self {
            OperationOutcome::Completed(outcome) => &outcome.output,
            OperationOutcome::Cancelled(outcome) => &outcome.partial_output,
            OperationOutcome::TimedOut(outcome) => &outcome.partial_output,
            OperationOutcome::Failed(outcome) => &outcome.partial_output,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedOutcome {
    pub output: String,
    pub duration_ms: u64,
    /// How many times the budget was extended automatically along the way.
    pub auto_extensions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelledOutcome {
    pub partial_output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedOutOutcome {
    pub partial_output: String,
    /// The full budget that was exhausted: original duration plus every
    /// extension that landed.
    pub effective_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOutcome {
    pub message: String,
    pub partial_output: String,
}

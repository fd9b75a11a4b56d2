use serde::Deserialize;
use serde::Serialize;

/// One event on the ordered stream the assistant session delivers for an
/// in-flight operation. The engine interprets nothing beyond the fields
/// declared here; richer payloads stay in the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantEvent {
    /// Incremental chunk of user-visible output.
    ContentDelta(ContentDeltaEvent),

    /// The assistant is reasoning without producing output. Counts as
    /// activity for timeout purposes but is not buffered.
    Reasoning(ReasoningEvent),

    /// The session began compacting its context.
    CompactionStarted,

    /// The session finished (or abandoned) a compaction pass.
    CompactionCompleted(CompactionCompletedEvent),

    /// Terminal: the assistant went idle, the operation is complete.
    Idle,

    /// Terminal: the session reported a fatal error.
    Error(AssistantErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDeltaEvent {
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningEvent {
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionCompletedEvent {
    pub success: bool,
    /// Context tokens reclaimed, when the session reports it.
    pub tokens_saved: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantErrorEvent {
    pub message: String,
}

//! Types exchanged between the steward engine and its two transports: the
//! chat layer that starts/extends/cancels operations, and the assistant
//! session that produces the event stream the engine consumes.
//!
//! This crate owns no I/O. Everything here is plain serde-serializable data.

mod events;
mod ids;
mod outcome;

pub use events::AssistantErrorEvent;
pub use events::AssistantEvent;
pub use events::CompactionCompletedEvent;
pub use events::ContentDeltaEvent;
pub use events::ReasoningEvent;
pub use ids::OperationId;
pub use ids::UserId;
pub use outcome::CancelledOutcome;
pub use outcome::CompletedOutcome;
pub use outcome::FailedOutcome;
pub use outcome::OperationOutcome;
pub use outcome::TimedOutOutcome;

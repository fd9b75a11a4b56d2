//! Per-user timeout/extension engine for chat-mediated assistant
//! operations.
//!
//! One user gets at most one in-flight operation. The engine arms a
//! deadline when an operation starts, consumes the assistant's event stream
//! to track liveness, extends the budget automatically while the operation
//! shows recent activity, accepts user-confirmed manual extensions, and
//! guarantees the two extension paths can never both land in the same
//! contention window. Everything is owned by [`OperationManager`]; there
//! are no globals and no state survives the process.

mod config;
mod error;
mod extension;
mod keyed_mutex;
mod manager;
mod operation;
pub mod policy;
mod registry;
mod report;
mod timeout;
mod util;

pub use config::TimingConfig;
pub use error::Result;
pub use error::StewardErr;
pub use extension::ExtensionAttempt;
pub use extension::ExtensionGate;
pub use extension::ExtensionKey;
pub use extension::ExtensionTrigger;
pub use keyed_mutex::KeyedGuard;
pub use keyed_mutex::KeyedMutex;
pub use manager::ManualExtension;
pub use manager::OperationManager;
pub use registry::OperationDescriptor;
pub use registry::OperationEvent;
pub use registry::OperationEventKind;
pub use registry::OperationPhase;
pub use report::ProgressReporter;
pub use timeout::FiredDeadline;
pub use timeout::TimeoutScheduler;

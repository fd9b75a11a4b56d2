use steward_protocol::UserId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StewardErr>;

#[derive(Debug, Error)]
pub enum StewardErr {
    /// Each user gets at most one in-flight operation; callers must wait for
    /// the current one to reach a terminal outcome.
    #[error("user {user_id} already has an operation in flight")]
    OperationInFlight { user_id: UserId },

    /// The assistant transport dropped its end of the event channel without
    /// delivering a terminal event.
    #[error("assistant event stream closed before a terminal event")]
    StreamClosed,
}

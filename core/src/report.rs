use async_trait::async_trait;
use steward_protocol::UserId;

/// Progress surface the chat transport implements. The engine logs and
/// swallows failures; a lost progress edit never affects the operation.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Replace the rolling progress message for this user.
    async fn update_progress(&self, user_id: UserId, text: &str) -> anyhow::Result<()>;

    /// Post a standalone notice: extension granted, slow compaction, still
    /// running.
    async fn notify(&self, user_id: UserId, text: &str) -> anyhow::Result<()>;
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::models::{MessageStatus, NewMessage, QueueStats, QueuedMessage, Transition};

/// The persisted `email_queue` table.
///
/// Single-statement operations run in their own transaction. Work that must
/// hold row locks across several statements goes through [`QueueStore::begin`].
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Whether claim selection can lock rows and skip rows locked by others.
    /// Resolved once when the store is built.
    fn supports_skip_locked(&self) -> bool;

    async fn insert(&self, message: NewMessage) -> anyhow::Result<i64>;

    async fn get(&self, id: i64) -> anyhow::Result<Option<QueuedMessage>>;

    async fn count_by_status(&self) -> anyhow::Result<QueueStats>;

    async fn begin(&self) -> anyhow::Result<Box<dyn QueueTransaction>>;
}

/// An open transaction on the queue.
///
/// Dropping it without calling [`QueueTransaction::commit`] rolls back every
/// change and releases every lock it holds.
#[async_trait]
pub trait QueueTransaction: Send {
    /// Selects up to `limit` rows with `status = pending AND attempt_count < max_attempts`,
    /// oldest `created_at` first. Rows are locked for the rest of the
    /// transaction when the store supports skip-locked selection.
    async fn select_pending_batch(
        &mut self,
        limit: u32,
        max_attempts: u32,
    ) -> anyhow::Result<Vec<QueuedMessage>>;

    /// Applies `transition` to a row that is still `pending`.
    /// Returns `false` when the row was missing or already terminal.
    async fn update_status(&mut self, id: i64, transition: &Transition) -> anyhow::Result<bool>;

    /// Deletes rows in `status` created before `older_than`, returning how many went.
    async fn delete_where(
        &mut self,
        status: MessageStatus,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<u64>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

use tracing::{debug, warn};

use crate::domain::{models::QueuedMessage, repositories::QueueTransaction};

/// Reserves the next batch of deliverable rows for one worker.
pub struct BatchClaimer {
    batch_size: u32,
    max_attempts: u32,
}

impl BatchClaimer {
    /// `skip_locked` is the store capability. Without it two workers running at
    /// the same time can select the same rows and deliver them twice.
    pub fn new(batch_size: u32, max_attempts: u32, skip_locked: bool) -> Self {
        if !skip_locked {
            warn!(
                "queue store cannot skip locked rows; concurrent workers may claim the same messages"
            );
        }
        Self {
            batch_size,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Selects up to `batch_size` pending rows below the attempt limit, oldest first.
    ///
    /// The rows stay claimed until `tx` commits or rolls back.
    pub async fn claim(&self, tx: &mut dyn QueueTransaction) -> anyhow::Result<Vec<QueuedMessage>> {
        let batch = tx
            .select_pending_batch(self.batch_size, self.max_attempts)
            .await?;
        debug!(claimed = batch.len(), limit = self.batch_size, "claimed batch");
        Ok(batch)
    }
}

use std::sync::Arc;

use crate::domain::{errors::RelayError, models::QueueStats, repositories::QueueStore};

pub struct QueueStatsUseCase {
    store: Arc<dyn QueueStore>,
}

impl QueueStatsUseCase {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn execute(&self) -> Result<QueueStats, RelayError> {
        self.store
            .count_by_status()
            .await
            .map_err(RelayError::Persistence)
    }
}

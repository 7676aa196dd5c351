use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::{errors::RelayError, models::NewMessage, repositories::QueueStore};

pub struct EnqueueMessageRequest {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

pub struct EnqueueMessageUseCase {
    store: Arc<dyn QueueStore>,
}

impl EnqueueMessageUseCase {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Persists one pending row. A message without recipients is still
    /// accepted; its first delivery attempt will fail it.
    pub async fn execute(&self, request: EnqueueMessageRequest) -> Result<i64, RelayError> {
        let message = NewMessage::new(&request.sender, &request.recipients, request.body);
        if !message.has_recipients() {
            warn!("no recipients found in arguments or headers, queueing anyway");
        }

        let id = self
            .store
            .insert(message)
            .await
            .map_err(RelayError::Persistence)?;
        info!(message_id = id, "queued email");
        Ok(id)
    }
}

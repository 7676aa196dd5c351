use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    application::services::transport::{MailTransport, TransportSession},
    domain::{
        models::{MessageStatus, NewMessage, QueueStats, QueuedMessage, Transition},
        repositories::{QueueStore, QueueTransaction},
    },
    infrastructure::repositories::in_memory::InMemoryQueueStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub sender: String,
    pub recipients: Vec<String>,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct StubState {
    sent: Vec<SentMail>,
    attempts: usize,
    connects: usize,
    closes: usize,
    connect_error: Option<String>,
    send_error: Option<String>,
    rejected_recipient: Option<String>,
    delay: Option<Duration>,
}

/// Scripted transport recording every attempted delivery.
#[derive(Clone, Default)]
pub struct StubTransport {
    state: Arc<Mutex<StubState>>,
}

impl StubTransport {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn failing(error: &str) -> Self {
        let stub = Self::default();
        stub.state.lock().unwrap().send_error = Some(error.to_string());
        stub
    }

    pub fn unreachable(error: &str) -> Self {
        let stub = Self::default();
        stub.state.lock().unwrap().connect_error = Some(error.to_string());
        stub
    }

    pub fn rejecting(recipient: &str) -> Self {
        let stub = Self::default();
        stub.state.lock().unwrap().rejected_recipient = Some(recipient.to_string());
        stub
    }

    pub fn slow(delay: Duration) -> Self {
        let stub = Self::default();
        stub.state.lock().unwrap().delay = Some(delay);
        stub
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl MailTransport for StubTransport {
    async fn connect(&self) -> anyhow::Result<Box<dyn TransportSession>> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if let Some(error) = &state.connect_error {
            anyhow::bail!("{error}");
        }
        Ok(Box::new(StubSession {
            state: self.state.clone(),
        }))
    }
}

struct StubSession {
    state: Arc<Mutex<StubState>>,
}

#[async_trait]
impl TransportSession for StubSession {
    async fn send(
        &mut self,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> anyhow::Result<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.send_error {
            anyhow::bail!("{error}");
        }
        if recipients.is_empty() {
            anyhow::bail!("missing destination address");
        }
        if let Some(rejected) = &state.rejected_recipient {
            if recipients.iter().any(|r| r == rejected) {
                anyhow::bail!("550 5.1.1 <{rejected}>: recipient rejected");
            }
        }
        state.sent.push(SentMail {
            sender: sender.to_string(),
            recipients: recipients.to_vec(),
            body: body.to_vec(),
        });
        Ok(())
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

pub fn queued(recipients: &str, attempt_count: u32, created_at: DateTime<Utc>) -> QueuedMessage {
    QueuedMessage {
        id: 0,
        created_at,
        status: MessageStatus::Pending,
        attempt_count,
        last_attempt_at: None,
        error_message: None,
        sender: "s@ex.com".to_string(),
        recipients: recipients.to_string(),
        body: b"test".to_vec(),
    }
}

/// Which store call breaks.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Begin,
    Insert,
    /// The n-th status update of every transaction, counting from 1.
    Update(usize),
    /// Deleting rows in this status.
    Delete(MessageStatus),
}

/// In-memory store with one scripted failure.
pub struct FaultyStore {
    inner: InMemoryQueueStore,
    fault: Fault,
}

impl FaultyStore {
    pub fn new(inner: InMemoryQueueStore, fault: Fault) -> Arc<Self> {
        Arc::new(Self { inner, fault })
    }
}

struct FaultyTransaction {
    inner: Box<dyn QueueTransaction>,
    fault: Fault,
    updates: usize,
}

#[async_trait]
impl QueueStore for FaultyStore {
    fn supports_skip_locked(&self) -> bool {
        self.inner.supports_skip_locked()
    }

    async fn insert(&self, message: NewMessage) -> anyhow::Result<i64> {
        if let Fault::Insert = self.fault {
            anyhow::bail!("duplicate key value violates unique constraint");
        }
        self.inner.insert(message).await
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<QueuedMessage>> {
        self.inner.get(id).await
    }

    async fn count_by_status(&self) -> anyhow::Result<QueueStats> {
        self.inner.count_by_status().await
    }

    async fn begin(&self) -> anyhow::Result<Box<dyn QueueTransaction>> {
        if let Fault::Begin = self.fault {
            anyhow::bail!("connection refused");
        }
        Ok(Box::new(FaultyTransaction {
            inner: self.inner.begin().await?,
            fault: self.fault,
            updates: 0,
        }))
    }
}

#[async_trait]
impl QueueTransaction for FaultyTransaction {
    async fn select_pending_batch(
        &mut self,
        limit: u32,
        max_attempts: u32,
    ) -> anyhow::Result<Vec<QueuedMessage>> {
        self.inner.select_pending_batch(limit, max_attempts).await
    }

    async fn update_status(&mut self, id: i64, transition: &Transition) -> anyhow::Result<bool> {
        self.updates += 1;
        if let Fault::Update(n) = self.fault {
            if n == self.updates {
                anyhow::bail!("connection reset by peer");
            }
        }
        self.inner.update_status(id, transition).await
    }

    async fn delete_where(
        &mut self,
        status: MessageStatus,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        if let Fault::Delete(broken) = self.fault {
            if broken == status {
                anyhow::bail!("canceling statement due to lock timeout");
            }
        }
        self.inner.delete_where(status, older_than).await
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.inner.rollback().await
    }
}

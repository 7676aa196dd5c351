use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    models::{MessageStatus, NewMessage, QueueStats, QueuedMessage, Transition},
    repositories::{QueueStore, QueueTransaction},
};

#[derive(Default)]
struct State {
    rows: BTreeMap<i64, QueuedMessage>,
    next_id: i64,
    locked: HashSet<i64>,
}

/// Process-local queue with transactional semantics close to the SQL store.
///
/// Rows selected by a claim are locked until the transaction ends. With
/// skip-locked disabled, claims ignore each other's locks, like a plain `SELECT`.
#[derive(Clone)]
pub struct InMemoryQueueStore {
    state: Arc<Mutex<State>>,
    skip_locked: bool,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            skip_locked: true,
        }
    }

    pub fn without_skip_locked() -> Self {
        Self {
            skip_locked: false,
            ..Self::new()
        }
    }

    /// Inserts a fully specified row, keeping its timestamps and counters.
    /// The id is reassigned. Used to stage fixtures.
    pub fn insert_row(&self, mut message: QueuedMessage) -> i64 {
        let mut state = lock(&self.state);
        state.next_id += 1;
        message.id = state.next_id;
        state.rows.insert(message.id, message);
        state.next_id
    }

    pub fn rows(&self) -> Vec<QueuedMessage> {
        lock(&self.state).rows.values().cloned().collect()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    fn supports_skip_locked(&self) -> bool {
        self.skip_locked
    }

    async fn insert(&self, message: NewMessage) -> anyhow::Result<i64> {
        Ok(self.insert_row(QueuedMessage {
            id: 0,
            created_at: Utc::now(),
            status: MessageStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            error_message: None,
            sender: message.sender,
            recipients: message.recipients,
            body: message.body,
        }))
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<QueuedMessage>> {
        Ok(lock(&self.state).rows.get(&id).cloned())
    }

    async fn count_by_status(&self) -> anyhow::Result<QueueStats> {
        let state = lock(&self.state);
        let mut stats = QueueStats::default();
        for row in state.rows.values() {
            match row.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Sent => stats.sent += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn begin(&self) -> anyhow::Result<Box<dyn QueueTransaction>> {
        Ok(Box::new(InMemoryQueueTransaction {
            state: self.state.clone(),
            skip_locked: self.skip_locked,
            held: Vec::new(),
            undo: Vec::new(),
        }))
    }
}

pub struct InMemoryQueueTransaction {
    state: Arc<Mutex<State>>,
    skip_locked: bool,
    held: Vec<i64>,
    // Previous version of every row touched, oldest first.
    undo: Vec<(i64, Option<QueuedMessage>)>,
}

impl InMemoryQueueTransaction {
    fn finish(&mut self, keep_changes: bool) {
        let mut state = lock(&self.state);
        if !keep_changes {
            for (id, previous) in self.undo.drain(..).rev() {
                match previous {
                    Some(row) => {
                        state.rows.insert(id, row);
                    }
                    None => {
                        state.rows.remove(&id);
                    }
                }
            }
        }
        self.undo.clear();
        for id in self.held.drain(..) {
            state.locked.remove(&id);
        }
    }
}

#[async_trait]
impl QueueTransaction for InMemoryQueueTransaction {
    async fn select_pending_batch(
        &mut self,
        limit: u32,
        max_attempts: u32,
    ) -> anyhow::Result<Vec<QueuedMessage>> {
        let mut state = lock(&self.state);
        let mut eligible: Vec<&QueuedMessage> = state
            .rows
            .values()
            .filter(|row| row.status == MessageStatus::Pending && row.attempt_count < max_attempts)
            .filter(|row| !self.skip_locked || !state.locked.contains(&row.id))
            .collect();
        eligible.sort_by_key(|row| (row.created_at, row.id));

        let batch: Vec<QueuedMessage> = eligible
            .into_iter()
            .take(limit as usize)
            .cloned()
            .collect();

        if self.skip_locked {
            for row in &batch {
                state.locked.insert(row.id);
                self.held.push(row.id);
            }
        }
        Ok(batch)
    }

    async fn update_status(&mut self, id: i64, transition: &Transition) -> anyhow::Result<bool> {
        let mut state = lock(&self.state);
        let Some(row) = state.rows.get_mut(&id) else {
            return Ok(false);
        };
        if row.status.is_terminal() {
            return Ok(false);
        }
        self.undo.push((id, Some(row.clone())));
        transition.apply(row);
        Ok(true)
    }

    async fn delete_where(
        &mut self,
        status: MessageStatus,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let mut state = lock(&self.state);
        let doomed: Vec<i64> = state
            .rows
            .values()
            .filter(|row| row.status == status && row.created_at < older_than)
            .map(|row| row.id)
            .collect();
        for id in &doomed {
            let previous = state.rows.remove(id);
            self.undo.push((*id, previous));
        }
        Ok(doomed.len() as u64)
    }

    async fn commit(mut self: Box<Self>) -> anyhow::Result<()> {
        self.finish(true);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> anyhow::Result<()> {
        self.finish(false);
        Ok(())
    }
}

impl Drop for InMemoryQueueTransaction {
    fn drop(&mut self) {
        if !self.undo.is_empty() || !self.held.is_empty() {
            self.finish(false);
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Postgres, Transaction};

use crate::domain::{
    models::{MessageStatus, NewMessage, QueueStats, QueuedMessage, Transition},
    repositories::{QueueStore, QueueTransaction},
};

pub type PgPool = Pool<Postgres>;

const SELECT_PENDING: &str = r#"
    SELECT id, created_at, status, attempt_count, last_attempt_at, error_message,
           sender, recipients, body
    FROM email_queue
    WHERE status = 'pending'
      AND attempt_count < $1
    ORDER BY created_at ASC, id ASC
    LIMIT $2
"#;

#[derive(Clone)]
pub struct PostgresQueueStore {
    pool: PgPool,
    skip_locked: bool,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool, skip_locked: bool) -> Arc<Self> {
        Arc::new(Self { pool, skip_locked })
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    fn supports_skip_locked(&self) -> bool {
        self.skip_locked
    }

    async fn insert(&self, message: NewMessage) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO email_queue (sender, recipients, body, status, attempt_count)
            VALUES ($1, $2, $3, 'pending', 0)
            RETURNING id
            "#,
        )
        .bind(&message.sender)
        .bind(&message.recipients)
        .bind(&message.body)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: i64) -> anyhow::Result<Option<QueuedMessage>> {
        let record = sqlx::query_as::<_, QueuedMessageRecord>(
            r#"
            SELECT id, created_at, status, attempt_count, last_attempt_at, error_message,
                   sender, recipients, body
            FROM email_queue
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(QueuedMessage::try_from).transpose()
    }

    async fn count_by_status(&self) -> anyhow::Result<QueueStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"SELECT status, COUNT(*) FROM email_queue GROUP BY status"#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = u64::try_from(count)?;
            match MessageStatus::from_str(&status) {
                Some(MessageStatus::Pending) => stats.pending = count,
                Some(MessageStatus::Sent) => stats.sent = count,
                Some(MessageStatus::Failed) => stats.failed = count,
                None => anyhow::bail!("unknown message status {status}"),
            }
        }
        Ok(stats)
    }

    async fn begin(&self) -> anyhow::Result<Box<dyn QueueTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresQueueTransaction {
            tx,
            skip_locked: self.skip_locked,
        }))
    }
}

pub struct PostgresQueueTransaction {
    tx: Transaction<'static, Postgres>,
    skip_locked: bool,
}

#[async_trait]
impl QueueTransaction for PostgresQueueTransaction {
    async fn select_pending_batch(
        &mut self,
        limit: u32,
        max_attempts: u32,
    ) -> anyhow::Result<Vec<QueuedMessage>> {
        let sql = if self.skip_locked {
            format!("{SELECT_PENDING} FOR UPDATE SKIP LOCKED")
        } else {
            SELECT_PENDING.to_string()
        };

        let rows = sqlx::query_as::<_, QueuedMessageRecord>(&sql)
            .bind(i32::try_from(max_attempts)?)
            .bind(i64::from(limit))
            .fetch_all(&mut *self.tx)
            .await?;
        rows.into_iter().map(QueuedMessage::try_from).collect()
    }

    async fn update_status(&mut self, id: i64, transition: &Transition) -> anyhow::Result<bool> {
        let result = match transition {
            Transition::Sent { at } => {
                sqlx::query(
                    r#"
                    UPDATE email_queue
                    SET status = 'sent',
                        last_attempt_at = $2
                    WHERE id = $1
                      AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(at)
                .execute(&mut *self.tx)
                .await?
            }
            Transition::Retry {
                attempt_count,
                at,
                error_message,
            }
            | Transition::Failed {
                attempt_count,
                at,
                error_message,
            } => {
                sqlx::query(
                    r#"
                    UPDATE email_queue
                    SET status = $2,
                        attempt_count = $3,
                        last_attempt_at = $4,
                        error_message = $5
                    WHERE id = $1
                      AND status = 'pending'
                    "#,
                )
                .bind(id)
                .bind(transition.status().as_str())
                .bind(i32::try_from(*attempt_count)?)
                .bind(at)
                .bind(error_message)
                .execute(&mut *self.tx)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn delete_where(
        &mut self,
        status: MessageStatus,
        older_than: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM email_queue
            WHERE status = $1
              AND created_at < $2
            "#,
        )
        .bind(status.as_str())
        .bind(older_than)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[derive(FromRow)]
struct QueuedMessageRecord {
    id: i64,
    created_at: DateTime<Utc>,
    status: String,
    attempt_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    sender: String,
    recipients: String,
    body: Vec<u8>,
}

impl TryFrom<QueuedMessageRecord> for QueuedMessage {
    type Error = anyhow::Error;

    fn try_from(value: QueuedMessageRecord) -> Result<Self, Self::Error> {
        let status = MessageStatus::from_str(&value.status)
            .ok_or_else(|| anyhow::anyhow!("unknown message status {}", value.status))?;
        Ok(Self {
            id: value.id,
            created_at: value.created_at,
            status,
            attempt_count: u32::try_from(value.attempt_count)?,
            last_attempt_at: value.last_attempt_at,
            error_message: value.error_message,
            sender: value.sender,
            recipients: value.recipients,
            body: value.body,
        })
    }
}

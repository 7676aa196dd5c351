use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    application::{
        handlers::batch_claimer::BatchClaimer,
        services::transport::{MailTransport, TransportSession},
    },
    domain::{
        errors::RelayError,
        models::{QueuedMessage, Transition},
        repositories::{QueueStore, QueueTransaction},
    },
};

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub batch_size: u32,
    pub max_attempts: u32,
    /// Upper bound on a single delivery; expiry counts as a failed attempt.
    pub send_timeout: Duration,
}

/// What one dispatch pass did to its claimed rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Rows that were no longer pending when their update ran.
    pub skipped: usize,
}

impl BatchReport {
    fn record(&mut self, transition: &Transition) {
        match transition {
            Transition::Sent { .. } => self.sent += 1,
            Transition::Retry { .. } => self.retrying += 1,
            Transition::Failed { .. } => self.failed += 1,
        }
    }
}

pub struct BatchDispatcher {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn MailTransport>,
    claimer: BatchClaimer,
    send_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn MailTransport>,
        config: DispatchConfig,
    ) -> Self {
        let claimer = BatchClaimer::new(
            config.batch_size,
            config.max_attempts,
            store.supports_skip_locked(),
        );
        Self {
            store,
            transport,
            claimer,
            send_timeout: config.send_timeout,
        }
    }

    /// Claims one batch, delivers it over a single transport session and
    /// commits every row update together.
    ///
    /// A transport connection failure or any storage failure rolls the whole
    /// batch back. Failed deliveries are recorded on their rows instead.
    /// Dropping the returned future before it resolves also rolls back.
    pub async fn run_once(&self) -> Result<BatchReport, RelayError> {
        let mut tx = self.store.begin().await.map_err(RelayError::Persistence)?;

        let batch = match self.claimer.claim(tx.as_mut()).await {
            Ok(batch) => batch,
            Err(err) => {
                rollback_quietly(tx).await;
                return Err(RelayError::Persistence(err));
            }
        };

        if batch.is_empty() {
            info!("no pending emails to process");
            tx.commit().await.map_err(RelayError::Persistence)?;
            return Ok(BatchReport::default());
        }

        info!(batch_size = batch.len(), "processing batch");

        let mut session = match self.transport.connect().await {
            Ok(session) => session,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to connect to mail transport");
                rollback_quietly(tx).await;
                return Err(RelayError::TransportConnection(err));
            }
        };

        let report = match self.deliver_all(tx.as_mut(), session.as_mut(), &batch).await {
            Ok(report) => report,
            Err(err) => {
                error!(error = %format!("{err:#}"), "batch aborted, rolling back");
                rollback_quietly(tx).await;
                close_quietly(session).await;
                return Err(RelayError::Persistence(err));
            }
        };

        close_quietly(session).await;
        tx.commit().await.map_err(RelayError::Persistence)?;

        info!(
            sent = report.sent,
            retrying = report.retrying,
            failed = report.failed,
            "batch committed"
        );
        Ok(report)
    }

    async fn deliver_all(
        &self,
        tx: &mut dyn QueueTransaction,
        session: &mut dyn TransportSession,
        batch: &[QueuedMessage],
    ) -> anyhow::Result<BatchReport> {
        let mut report = BatchReport {
            claimed: batch.len(),
            ..BatchReport::default()
        };

        for message in batch {
            let transition = self.deliver(session, message).await;
            if tx.update_status(message.id, &transition).await? {
                report.record(&transition);
            } else {
                warn!(message_id = message.id, "message left pending state mid-batch, not updated");
                report.skipped += 1;
            }
        }

        Ok(report)
    }

    async fn deliver(&self, session: &mut dyn TransportSession, message: &QueuedMessage) -> Transition {
        let recipients = message.recipient_list();
        let send = session.send(&message.sender, &recipients, &message.body);
        let outcome = match tokio::time::timeout(self.send_timeout, send).await {
            Ok(outcome) => outcome,
            Err(_) => Err(anyhow::anyhow!(
                "delivery timed out after {}s",
                self.send_timeout.as_secs_f32()
            )),
        };

        match outcome {
            Ok(()) => {
                info!(message_id = message.id, "sent email");
                message.delivered(Utc::now())
            }
            Err(err) => {
                let reason = format!("{err:#}");
                let transition =
                    message.delivery_failed(Utc::now(), &reason, self.claimer.max_attempts());
                error!(
                    message_id = message.id,
                    attempt_count = message.attempt_count.saturating_add(1),
                    status = transition.status().as_str(),
                    error = %reason,
                    "failed to send email"
                );
                transition
            }
        }
    }
}

async fn rollback_quietly(tx: Box<dyn QueueTransaction>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %format!("{err:#}"), "rollback failed");
    }
}

async fn close_quietly(session: Box<dyn TransportSession>) {
    if let Err(err) = session.close().await {
        warn!(error = %format!("{err:#}"), "failed to close transport session");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        domain::models::{MessageStatus, NewMessage, QueueStats},
        infrastructure::repositories::in_memory::InMemoryQueueStore,
        test_support::{Fault, FaultyStore, SentMail, StubTransport, queued},
    };

    fn dispatcher(store: &InMemoryQueueStore, transport: &StubTransport) -> BatchDispatcher {
        dispatcher_with(store, transport, Duration::from_secs(5))
    }

    fn dispatcher_with(
        store: &InMemoryQueueStore,
        transport: &StubTransport,
        send_timeout: Duration,
    ) -> BatchDispatcher {
        BatchDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            DispatchConfig {
                batch_size: 10,
                max_attempts: 3,
                send_timeout,
            },
        )
    }

    async fn enqueue(store: &InMemoryQueueStore, recipient: &str) -> i64 {
        store
            .insert(NewMessage::new("s@ex.com", &[recipient.to_string()], b"test".to_vec()))
            .await
            .unwrap()
    }

    async fn row(store: &InMemoryQueueStore, id: i64) -> QueuedMessage {
        store.get(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_marks_row_sent() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::accepting();
        let id = enqueue(&store, "r@ex.com").await;

        let report = dispatcher(&store, &transport).run_once().await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(
            transport.sent(),
            vec![SentMail {
                sender: "s@ex.com".into(),
                recipients: vec!["r@ex.com".into()],
                body: b"test".to_vec(),
            }]
        );
        let stored = row(&store, id).await;
        assert_eq!(stored.status, MessageStatus::Sent);
        assert!(stored.last_attempt_at.is_some());
        assert_eq!(stored.attempt_count, 0);
        assert_eq!((transport.connects(), transport.closes()), (1, 1));
    }

    #[tokio::test]
    async fn failed_delivery_stays_pending_for_retry() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::failing("SMTP Error");
        let id = enqueue(&store, "r@ex.com").await;

        let report = dispatcher(&store, &transport).run_once().await.unwrap();

        assert_eq!(report.retrying, 1);
        let stored = row(&store, id).await;
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.last_attempt_at.is_some());
        assert!(stored.error_message.unwrap().contains("SMTP Error"));
    }

    #[tokio::test]
    async fn last_allowed_failure_is_terminal() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::failing("Final Error");
        let id = store.insert_row(queued("r@ex.com", 2, Utc::now()));

        let report = dispatcher(&store, &transport).run_once().await.unwrap();

        assert_eq!(report.failed, 1);
        let stored = row(&store, id).await;
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert!(stored.error_message.unwrap().contains("Final Error"));
    }

    #[tokio::test]
    async fn each_pass_counts_exactly_one_attempt_until_the_limit() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::failing("421 try later");
        let id = enqueue(&store, "r@ex.com").await;
        let dispatcher = dispatcher(&store, &transport);

        for expected in 1..=2 {
            dispatcher.run_once().await.unwrap();
            let stored = row(&store, id).await;
            assert_eq!(stored.attempt_count, expected);
            assert_eq!(stored.status, MessageStatus::Pending);
        }

        dispatcher.run_once().await.unwrap();
        let stored = row(&store, id).await;
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.status, MessageStatus::Failed);

        let report = dispatcher.run_once().await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(row(&store, id).await.attempt_count, 3);
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn sent_rows_are_never_delivered_again() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::accepting();
        let id = enqueue(&store, "r@ex.com").await;
        let dispatcher = dispatcher(&store, &transport);

        dispatcher.run_once().await.unwrap();
        let first = row(&store, id).await;
        dispatcher.run_once().await.unwrap();
        let second = row(&store, id).await;

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(first.last_attempt_at, second.last_attempt_at);
        assert_eq!(second.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn connection_failure_leaves_every_row_untouched() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::unreachable("connection refused");
        let first = enqueue(&store, "a@ex.com").await;
        let second = enqueue(&store, "b@ex.com").await;

        let err = dispatcher(&store, &transport).run_once().await.unwrap_err();

        assert!(err.is_transport_connection());
        assert_eq!(transport.attempts(), 0);
        for id in [first, second] {
            let stored = row(&store, id).await;
            assert_eq!(stored.status, MessageStatus::Pending);
            assert_eq!(stored.attempt_count, 0);
            assert!(stored.last_attempt_at.is_none());
        }

        // The claim was released with the rollback.
        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.select_pending_batch(10, 3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn one_rejected_message_does_not_stop_the_batch() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::rejecting("bad@ex.com");
        let now = Utc::now();
        let first = store.insert_row(queued("a@ex.com", 0, now - ChronoDuration::seconds(3)));
        let rejected = store.insert_row(queued("bad@ex.com", 0, now - ChronoDuration::seconds(2)));
        let last = store.insert_row(queued("c@ex.com", 0, now - ChronoDuration::seconds(1)));

        let report = dispatcher(&store, &transport).run_once().await.unwrap();

        assert_eq!((report.sent, report.retrying), (2, 1));
        assert_eq!(row(&store, first).await.status, MessageStatus::Sent);
        assert_eq!(row(&store, last).await.status, MessageStatus::Sent);
        let stored = row(&store, rejected).await;
        assert_eq!(stored.status, MessageStatus::Pending);
        assert!(stored.error_message.unwrap().contains("recipient rejected"));
        let order: Vec<String> = transport
            .sent()
            .into_iter()
            .map(|mail| mail.recipients[0].clone())
            .collect();
        assert_eq!(order, vec!["a@ex.com", "c@ex.com"]);
    }

    #[tokio::test]
    async fn empty_recipient_list_fails_at_dispatch() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::accepting();
        let id = store
            .insert(NewMessage::new("s@ex.com", &[], b"test".to_vec()))
            .await
            .unwrap();

        dispatcher(&store, &transport).run_once().await.unwrap();

        let stored = row(&store, id).await;
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.error_message.unwrap().contains("missing destination"));
    }

    #[tokio::test]
    async fn empty_queue_does_not_open_a_session() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::accepting();

        let report = dispatcher(&store, &transport).run_once().await.unwrap();

        assert_eq!(report, BatchReport::default());
        assert_eq!(transport.connects(), 0);
    }

    #[tokio::test]
    async fn slow_delivery_times_out_as_a_failed_attempt() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::slow(Duration::from_secs(10));
        let id = enqueue(&store, "r@ex.com").await;

        dispatcher_with(&store, &transport, Duration::from_millis(50))
            .run_once()
            .await
            .unwrap();

        let stored = row(&store, id).await;
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert!(stored.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn batches_are_bounded_and_never_repeat_a_row() {
        let store = InMemoryQueueStore::new();
        let transport = StubTransport::accepting();
        for i in 0..12 {
            enqueue(&store, &format!("r{i}@ex.com")).await;
        }
        let dispatcher = dispatcher(&store, &transport);

        assert_eq!(dispatcher.run_once().await.unwrap().sent, 10);
        assert_eq!(dispatcher.run_once().await.unwrap().sent, 2);

        let recipients: HashSet<String> = transport
            .sent()
            .into_iter()
            .map(|mail| mail.recipients[0].clone())
            .collect();
        assert_eq!(recipients.len(), 12);
        assert_eq!(transport.sent().len(), 12);
        assert_eq!(
            store.count_by_status().await.unwrap(),
            QueueStats {
                pending: 0,
                sent: 12,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn storage_failure_mid_batch_rolls_back_everything() {
        let memory = InMemoryQueueStore::new();
        let transport = StubTransport::accepting();
        for recipient in ["a@ex.com", "b@ex.com", "c@ex.com"] {
            enqueue(&memory, recipient).await;
        }
        let dispatcher = BatchDispatcher::new(
            FaultyStore::new(memory.clone(), Fault::Update(2)),
            Arc::new(transport.clone()),
            DispatchConfig {
                batch_size: 10,
                max_attempts: 3,
                send_timeout: Duration::from_secs(5),
            },
        );

        let err = dispatcher.run_once().await.unwrap_err();

        assert!(matches!(err, RelayError::Persistence(_)));
        assert_eq!(transport.closes(), 1);
        for stored in memory.rows() {
            assert_eq!(stored.status, MessageStatus::Pending);
            assert!(stored.last_attempt_at.is_none());
        }
    }
}

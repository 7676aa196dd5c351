use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::{
    config::ConfigError,
    domain::{
        errors::RelayError,
        models::MessageStatus,
        repositories::{QueueStore, QueueTransaction},
    },
};

#[derive(Debug, Clone)]
pub struct PruneQueueConfig {
    pub sent_retention_days: u32,
    pub failed_retention_days: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub sent_removed: u64,
    pub failed_removed: u64,
}

/// Deletes terminal rows past their retention horizon. `pending` rows are
/// never touched, whatever their age.
pub struct PruneQueueUseCase {
    store: Arc<dyn QueueStore>,
    config: PruneQueueConfig,
}

impl PruneQueueUseCase {
    pub fn new(store: Arc<dyn QueueStore>, config: PruneQueueConfig) -> Self {
        Self { store, config }
    }

    pub async fn execute(&self, now: DateTime<Utc>) -> Result<PruneReport, RelayError> {
        let horizons = Horizons {
            sent_days: self.config.sent_retention_days,
            sent_before: horizon(now, self.config.sent_retention_days, "SENT_RETENTION_DAYS")?,
            failed_days: self.config.failed_retention_days,
            failed_before: horizon(
                now,
                self.config.failed_retention_days,
                "FAILED_RETENTION_DAYS",
            )?,
        };

        let mut tx = self.store.begin().await.map_err(RelayError::Persistence)?;

        match self.sweep(tx.as_mut(), &horizons).await {
            Ok(report) => {
                tx.commit().await.map_err(RelayError::Persistence)?;
                Ok(report)
            }
            Err(err) => {
                // Dropping the transaction also rolls back; this just reports it.
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %format!("{rollback_err:#}"), "rollback failed");
                }
                Err(RelayError::Persistence(err))
            }
        }
    }

    async fn sweep(
        &self,
        tx: &mut dyn QueueTransaction,
        horizons: &Horizons,
    ) -> anyhow::Result<PruneReport> {
        let sent_removed = tx
            .delete_where(MessageStatus::Sent, horizons.sent_before)
            .await?;
        info!(removed = sent_removed, days = horizons.sent_days, "pruned sent emails");

        let failed_removed = tx
            .delete_where(MessageStatus::Failed, horizons.failed_before)
            .await?;
        info!(removed = failed_removed, days = horizons.failed_days, "pruned failed emails");

        Ok(PruneReport {
            sent_removed,
            failed_removed,
        })
    }
}

struct Horizons {
    sent_days: u32,
    sent_before: DateTime<Utc>,
    failed_days: u32,
    failed_before: DateTime<Utc>,
}

fn horizon(now: DateTime<Utc>, days: u32, key: &'static str) -> Result<DateTime<Utc>, RelayError> {
    Duration::try_days(days.into())
        .and_then(|retention| now.checked_sub_signed(retention))
        .ok_or_else(|| {
            RelayError::Config(ConfigError::Invalid {
                key,
                value: days.to_string(),
                reason: "retention horizon is out of range".to_string(),
            })
        })
}

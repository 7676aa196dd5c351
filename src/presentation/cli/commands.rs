use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use crate::{
    application::{
        handlers::batch_dispatcher::{BatchDispatcher, BatchReport, DispatchConfig},
        services::transport::MailTransport,
        usecases::{
            enqueue_message::EnqueueMessageUseCase,
            prune_queue::{PruneQueueConfig, PruneQueueUseCase},
            queue_stats::QueueStatsUseCase,
        },
    },
    config::Config,
    domain::{errors::RelayError, repositories::QueueStore},
    infrastructure::{
        database,
        mail::smtp::SmtpMailTransport,
        repositories::postgres::{PgPool, PostgresQueueStore},
    },
    presentation::cli::{Command, sendmail::SendmailArgs},
};

/// Process outcome of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Success,
    Failure,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        match exit {
            Exit::Success => ExitCode::SUCCESS,
            Exit::Failure => ExitCode::FAILURE,
        }
    }
}

pub async fn execute(command: Command, config: Config) -> ExitCode {
    match command {
        Command::Migrate => migrate(&config).await,
        Command::Enqueue { args } => enqueue(&config, args).await,
        Command::SendBatch => send_batch(&config).await,
        Command::Prune => prune(&config).await,
        Command::Run {
            interval,
            prune_every,
        } => run(&config, Duration::from_secs(interval.max(1)), prune_every.max(1)).await,
        Command::Stats => stats(&config).await,
    }
}

async fn open_store(config: &Config) -> Result<(PgPool, Arc<dyn QueueStore>), RelayError> {
    let pool = database::connect(&config.database)
        .await
        .map_err(RelayError::Persistence)?;
    let store: Arc<dyn QueueStore> = PostgresQueueStore::new(pool.clone(), config.queue.skip_locked);
    Ok((pool, store))
}

fn dispatcher(config: &Config, store: Arc<dyn QueueStore>) -> BatchDispatcher {
    let transport: Arc<dyn MailTransport> = SmtpMailTransport::new(config.smtp.clone());
    BatchDispatcher::new(
        store,
        transport,
        DispatchConfig {
            batch_size: config.queue.batch_size,
            max_attempts: config.queue.max_attempts,
            send_timeout: config.smtp.timeout,
        },
    )
}

fn pruner(config: &Config, store: Arc<dyn QueueStore>) -> PruneQueueUseCase {
    PruneQueueUseCase::new(
        store,
        PruneQueueConfig {
            sent_retention_days: config.queue.sent_retention_days,
            failed_retention_days: config.queue.failed_retention_days,
        },
    )
}

async fn migrate(config: &Config) -> ExitCode {
    info!("starting queue migration");
    let (pool, _) = match open_store(config).await {
        Ok(opened) => opened,
        Err(err) => {
            error!(error = %err, "failed to run migrations");
            return ExitCode::FAILURE;
        }
    };

    let result = database::migrate(&pool).await;
    pool.close().await;

    match result {
        Ok(()) => {
            info!("email_queue table is in place");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "failed to run migrations");
            ExitCode::FAILURE
        }
    }
}

async fn enqueue(config: &Config, args: Vec<String>) -> ExitCode {
    let mut raw = Vec::new();
    if let Err(err) = tokio::io::stdin().read_to_end(&mut raw).await {
        error!(error = %err, "failed to read message from stdin");
        return ExitCode::FAILURE;
    }
    if raw.is_empty() {
        warn!("empty input, nothing queued");
        return ExitCode::SUCCESS;
    }

    let (pool, store) = match open_store(config).await {
        Ok(opened) => opened,
        Err(err) => {
            error!(error = %err, "error enqueuing email");
            return ExitCode::FAILURE;
        }
    };
    let exit = enqueue_into(store, args, raw).await;
    pool.close().await;
    exit.into()
}

/// Any persistence failure is a non-zero exit so the calling MTA keeps the message.
async fn enqueue_into(store: Arc<dyn QueueStore>, args: Vec<String>, raw: Vec<u8>) -> Exit {
    let (request, problems) = SendmailArgs::parse(args).into_request(raw);
    for problem in &problems {
        warn!(error = %problem, "queueing message anyway");
    }

    match EnqueueMessageUseCase::new(store).execute(request).await {
        Ok(_) => Exit::Success,
        Err(err) => {
            error!(error = %err, "error enqueuing email");
            Exit::Failure
        }
    }
}

async fn send_batch(config: &Config) -> ExitCode {
    let (pool, store) = match open_store(config).await {
        Ok(opened) => opened,
        Err(err) => return batch_exit(Some(Err(err))).into(),
    };

    let dispatcher = dispatcher(config, store);
    let outcome = tokio::select! {
        result = dispatcher.run_once() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    pool.close().await;
    batch_exit(outcome).into()
}

/// Only a transport connection failure is a non-zero exit; everything else
/// is either recorded on the rows or retried by the next invocation.
/// `None` means the pass was interrupted before its commit.
fn batch_exit(outcome: Option<Result<BatchReport, RelayError>>) -> Exit {
    match outcome {
        None => {
            warn!("interrupted before commit, batch rolled back");
            Exit::Success
        }
        Some(Ok(_)) => Exit::Success,
        Some(Err(err)) if err.is_transport_connection() => {
            error!(error = %err, "batch not attempted");
            Exit::Failure
        }
        Some(Err(err)) => {
            error!(error = %err, "critical error in batch processing");
            Exit::Success
        }
    }
}

async fn prune(config: &Config) -> ExitCode {
    let (pool, store) = match open_store(config).await {
        Ok(opened) => opened,
        Err(err) => {
            error!(error = %err, "error pruning email queue");
            return ExitCode::SUCCESS;
        }
    };

    let exit = prune_once(&pruner(config, store)).await;
    pool.close().await;
    exit.into()
}

/// Failures are logged; a sweep never fails the process.
async fn prune_once(pruner: &PruneQueueUseCase) -> Exit {
    if let Err(err) = pruner.execute(Utc::now()).await {
        error!(error = %err, "error pruning email queue");
    }
    Exit::Success
}

async fn run(config: &Config, interval: Duration, prune_every: u32) -> ExitCode {
    let (pool, store) = match open_store(config).await {
        Ok(opened) => opened,
        Err(err) => {
            error!(error = %err, "cannot start relay worker");
            return ExitCode::FAILURE;
        }
    };

    let dispatcher = dispatcher(config, store.clone());
    let pruner = pruner(config, store);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut passes: u32 = 0;

    info!(interval_secs = interval.as_secs(), prune_every, "relay worker started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        tokio::select! {
            result = dispatcher.run_once() => {
                if let Err(err) = result {
                    error!(error = %err, "dispatch pass failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted before commit, batch rolled back");
                break;
            }
        }

        passes = passes.wrapping_add(1);
        if passes % prune_every == 0 {
            prune_once(&pruner).await;
        }
    }

    info!("relay worker stopped");
    pool.close().await;
    ExitCode::SUCCESS
}

async fn stats(config: &Config) -> ExitCode {
    let (pool, store) = match open_store(config).await {
        Ok(opened) => opened,
        Err(err) => {
            error!(error = %err, "failed to read queue stats");
            return ExitCode::FAILURE;
        }
    };
    let result = QueueStatsUseCase::new(store).execute().await;
    pool.close().await;

    let stats = match result {
        Ok(stats) => stats,
        Err(err) => {
            error!(error = %err, "failed to read queue stats");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string(&stats) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "failed to encode queue stats");
            ExitCode::FAILURE
        }
    }
}

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::{config::DatabaseConfig, infrastructure::repositories::postgres::PgPool};

/// Opens a pool sized for one operation. Callers close it when the operation ends.
pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let options = match &config.url {
        Some(url) => url
            .parse::<PgConnectOptions>()
            .context("DATABASE_URL is not a valid PostgreSQL URL")?,
        None => PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name),
    };

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .context("failed to connect to the queue database")
}

/// Creates the `email_queue` table and its index when missing.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!()
        .run(pool)
        .await
        .context("failed to apply queue migrations")?;
    Ok(())
}

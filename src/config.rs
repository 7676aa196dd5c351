use std::{env::var, ops::RangeInclusive, str::FromStr, time::Duration};

use dotenvy::dotenv;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub smtp: SmtpConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Takes precedence over the discrete connection fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Plain connection upgraded with a mandatory STARTTLS.
    StartTls,
    /// TLS from the first byte (usually port 465).
    Tls,
    /// No encryption, for relays on a trusted network.
    None,
}

impl FromStr for SmtpSecurity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "starttls" => Ok(SmtpSecurity::StartTls),
            "tls" | "ssl" => Ok(SmtpSecurity::Tls),
            "none" | "plain" => Ok(SmtpSecurity::None),
            other => Err(format!("expected starttls, tls or none, got {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub security: SmtpSecurity,
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Credentials are only used when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        }
    }
}

/// Counters are stored as `INTEGER` columns.
const COUNTER_RANGE: RangeInclusive<u32> = 1..=i32::MAX as u32;

/// A hundred years; longer horizons cannot be subtracted from a timestamp safely.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: u32,
    pub max_attempts: u32,
    pub sent_retention_days: u32,
    pub failed_retention_days: u32,
    pub skip_locked: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_attempts: 3,
            sent_retention_days: 30,
            failed_retention_days: 7,
            skip_locked: true,
        }
    }
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn try_parse() -> Result<Config, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(|key| var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = QueueConfig::default();

        Ok(Config {
            database: DatabaseConfig {
                url: env.optional("DATABASE_URL"),
                host: env.string_or("DB_HOST", "localhost"),
                port: env.parse_or("DB_PORT", 5432)?,
                user: env.string_or("DB_USER", "relay"),
                password: env.string_or("DB_PASSWORD", "relay"),
                name: env.string_or("DB_NAME", "relay"),
                max_connections: env.positive_or("DB_MAX_CONNECTIONS", 4)?,
            },
            smtp: SmtpConfig {
                host: env.string_or("SMTP_HOST", "smtp-relay.gmail.com"),
                port: env.parse_or("SMTP_PORT", 587)?,
                user: env.optional("SMTP_USER"),
                password: env.optional("SMTP_PASSWORD"),
                security: env.parse_or("SMTP_TLS", SmtpSecurity::StartTls)?,
                timeout: Duration::from_secs(env.positive_or("SMTP_TIMEOUT_SECS", 30)?.into()),
            },
            queue: QueueConfig {
                batch_size: env.within_or("BATCH_SIZE", defaults.batch_size, COUNTER_RANGE)?,
                max_attempts: env.within_or("MAX_ATTEMPTS", defaults.max_attempts, COUNTER_RANGE)?,
                sent_retention_days: env.within_or(
                    "SENT_RETENTION_DAYS",
                    defaults.sent_retention_days,
                    0..=MAX_RETENTION_DAYS,
                )?,
                failed_retention_days: env.within_or(
                    "FAILED_RETENTION_DAYS",
                    defaults.failed_retention_days,
                    0..=MAX_RETENTION_DAYS,
                )?,
                skip_locked: env.parse_or("QUEUE_SKIP_LOCKED", defaults.skip_locked)?,
            },
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(value) => value.parse::<T>().map_err(|err| ConfigError::Invalid {
                key,
                reason: err.to_string(),
                value,
            }),
        }
    }

    fn positive_or(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        self.within_or(key, default, 1..=u32::MAX)
    }

    fn within_or(
        &self,
        key: &'static str,
        default: u32,
        range: RangeInclusive<u32>,
    ) -> Result<u32, ConfigError> {
        let parsed = self.parse_or(key, default)?;
        if !range.contains(&parsed) {
            let reason = if *range.end() == u32::MAX {
                format!("must be at least {}", range.start())
            } else {
                format!("must be between {} and {}", range.start(), range.end())
            };
            return Err(ConfigError::Invalid {
                key,
                value: parsed.to_string(),
                reason,
            });
        }
        Ok(parsed)
    }
}

use std::env;

use email_address::EmailAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {detail}")]
    Invalid { name: &'static str, detail: String },
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub from_email: EmailAddress,
    pub from_name: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub daily: i64,
    pub per_minute: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_seconds: f64,
    pub max_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    pub replay_window_seconds: i64,
}

/// The process's whole typed configuration, assembled once at startup and
/// handed to every component that needs it. Never a lazily-initialized
/// global: `Config::from_env` is called exactly once, in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderConfig,
    pub limits: Limits,
    pub retry: RetryConfig,
    pub scheduler_concurrency_default: usize,
    pub webhook: WebhookConfig,
    pub database_url: String,
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_env_or<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            detail: format!("could not parse {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the process environment (after an optional
    /// `.env` file, loaded by the caller via `dotenvy::dotenv()`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = env_var("RESEND_API_KEY")?;
        if api_key.trim().is_empty() {
            return Err(ConfigError::Missing("RESEND_API_KEY"));
        }

        let from_email_raw = env_var("RESEND_FROM_EMAIL")?;
        let from_email = from_email_raw
            .parse::<EmailAddress>()
            .map_err(|e| ConfigError::Invalid {
                name: "RESEND_FROM_EMAIL",
                detail: e.to_string(),
            })?;

        let from_name = env::var("RESEND_FROM_NAME").ok().filter(|s| !s.is_empty());

        let daily = parse_env_or::<i64>("DAILY_EMAIL_LIMIT", 1000)?;
        let per_minute = parse_env_or::<u32>("RATE_LIMIT_PER_MINUTE", 60)?;

        let max_attempts = parse_env_or::<u32>("RETRY_MAX_ATTEMPTS", 3)?;
        let base_seconds = parse_env_or::<f64>("RETRY_BASE_SECONDS", 1.0)?;
        let max_seconds = parse_env_or::<f64>("RETRY_MAX_SECONDS", 30.0)?;

        let scheduler_concurrency_default =
            parse_env_or::<usize>("SCHEDULER_CONCURRENCY_DEFAULT", 10)?;

        let secret = env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty());
        let replay_window_seconds =
            parse_env_or::<i64>("WEBHOOK_REPLAY_WINDOW_SECONDS", 300)?;

        let database_url = env_var("DATABASE_URL")
            .or_else(|_| env_var("STORAGE_PATH"))
            .map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            provider: ProviderConfig {
                api_key,
                from_email,
                from_name,
            },
            limits: Limits { daily, per_minute },
            retry: RetryConfig {
                max_attempts,
                base_seconds,
                max_seconds,
            },
            scheduler_concurrency_default,
            webhook: WebhookConfig {
                secret,
                replay_window_seconds,
            },
            database_url,
        })
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            provider: ProviderConfig {
                api_key: "test_key".to_owned(),
                from_email: "sender@example.com".parse().unwrap(),
                from_name: Some("Example".to_owned()),
            },
            limits: Limits {
                daily: 1000,
                per_minute: 60,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_seconds: 1.0,
                max_seconds: 30.0,
            },
            scheduler_concurrency_default: 10,
            webhook: WebhookConfig {
                secret: Some("test_secret".to_owned()),
                replay_window_seconds: 300,
            },
            database_url: "postgres://localhost/test".to_owned(),
        }
    }
}

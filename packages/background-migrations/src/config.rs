use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Jobs left running longer than this are treated as crashed
    pub stuck_job_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("DATABASE_MAX_CONNECTIONS must be a valid number")?,
            stuck_job_timeout: Duration::from_secs(
                env::var("BACKGROUND_MIGRATIONS_STUCK_JOB_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .context("BACKGROUND_MIGRATIONS_STUCK_JOB_TIMEOUT_SECS must be a valid number")?,
            ),
        })
    }
}

//! Runtime configuration from environment variables.

use std::time::Duration;
use thiserror::Error;

const DEFAULT_TABLE: &str = "chat_sessions";
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
const DEFAULT_PORT: u16 = 4850;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the REST endpoint, e.g. https://xyz.supabase.co
    pub store_url: String,
    /// API key sent as `apikey` and bearer token
    pub store_key: Option<String>,
    pub table: String,
    pub poll_interval: Duration,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store_url = lookup("STORE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("STORE_URL"))?
            .trim_end_matches('/')
            .to_string();

        let store_key = lookup("STORE_KEY").filter(|v| !v.is_empty());
        let table = lookup("STORE_TABLE")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());

        let poll_ms = match lookup("POLL_INTERVAL_MS") {
            Some(value) => match value.parse::<u64>() {
                Ok(ms) if ms > 0 => ms,
                _ => return Err(ConfigError::Invalid { name: "POLL_INTERVAL_MS", value }),
            },
            None => DEFAULT_POLL_INTERVAL_MS,
        };

        let port = match lookup("PORT") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { name: "PORT", value })?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            store_url,
            store_key,
            table,
            poll_interval: Duration::from_millis(poll_ms),
            port,
        })
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::analytics::DEFAULT_RETENTION;

const DEFAULT_API_URL: &str = "http://localhost:5000/api";
const DEFAULT_DATA_DIR: &str = ".site-data";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got `{value}`")]
    InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the REST API, without a trailing slash.
    pub api_base_url: String,
    /// Where persistent client state lives (the equivalent of the browser's origin storage).
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    /// How many events each analytics category keeps.
    pub analytics_retention: usize,
    /// Business number WhatsApp handoffs are addressed to. Without one, WhatsApp asks the user to pick a chat.
    pub whatsapp_number: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            analytics_retention: DEFAULT_RETENTION,
            whatsapp_number: None,
        }
    }
}

impl ClientConfig {
    /// Reads `SITE_*` variables, loading `.env` first if there is one. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SITE_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(dir) = lookup("SITE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = lookup("SITE_REQUEST_TIMEOUT_SECS") {
            config.request_timeout =
                Duration::from_secs(parse_positive("SITE_REQUEST_TIMEOUT_SECS", &secs)? as u64);
        }
        if let Some(retention) = lookup("SITE_ANALYTICS_RETENTION") {
            config.analytics_retention = parse_positive("SITE_ANALYTICS_RETENTION", &retention)?;
        }
        config.whatsapp_number = lookup("SITE_WHATSAPP_NUMBER").filter(|n| !n.trim().is_empty());

        Ok(config)
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

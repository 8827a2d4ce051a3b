//! Runtime settings
//!
//! Loaded once at startup from the process environment (after an optional
//! `.env` file) and handed to constructors. Nothing below `main` reads the
//! environment directly.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::storage::PartitionLayout;
use crate::types::{EtlError, Result};

/// Name of the one required variable
pub const PRICE_API_VAR: &str = "API_GET_BITCOIN_PRICE";

/// Validated settings for the fetcher, storage and triggers
#[derive(Debug, Clone)]
pub struct Settings {
    pub price_api_url: Url,
    pub data_dir: PathBuf,
    pub partition_layout: PartitionLayout,
    pub schedule_interval: Duration,
    pub poll_delay: Duration,
    pub run_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

/// Raw shape as it comes out of the `config` crate (keys are lowercased env names)
#[derive(Debug, Clone, Deserialize)]
struct RawSettings {
    #[serde(default)]
    api_get_bitcoin_price: Option<String>,
    #[serde(default = "default_data_dir")]
    data_dir: PathBuf,
    #[serde(default)]
    partition_layout: PartitionLayout,
    #[serde(default = "default_schedule_interval_secs")]
    schedule_interval_secs: u64,
    #[serde(default = "default_poll_delay_secs")]
    poll_delay_secs: u64,
    #[serde(default = "default_run_retries")]
    run_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    retry_delay_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
}

fn default_data_dir() -> PathBuf { PathBuf::from("data/bitcoin") }
fn default_schedule_interval_secs() -> u64 { 900 }
fn default_poll_delay_secs() -> u64 { 60 }
fn default_run_retries() -> u32 { 1 }
fn default_retry_delay_secs() -> u64 { 300 }
fn default_request_timeout_secs() -> u64 { 10 }

/// A missing `.env` is normal in containers; a broken one is not
fn check_env_file<T>(loaded: dotenvy::Result<T>) -> Result<()> {
    match loaded {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(EtlError::Config(format!("cannot read .env file: {}", e))),
    }
}

impl Settings {
    /// Load `.env` (if any) and then the process environment
    pub fn load(env_file: Option<&std::path::Path>) -> Result<Self> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| {
                    EtlError::Config(format!("cannot read env file {}: {}", path.display(), e))
                })?;
            }
            None => check_env_file(dotenvy::dotenv())?,
        }

        Self::from_environment(::config::Environment::default())
    }

    /// Build settings from explicit key/value pairs instead of the process environment
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: ::config::Map<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self::from_environment(::config::Environment::default().source(Some(map)))
    }

    fn from_environment(env: ::config::Environment) -> Result<Self> {
        let raw: RawSettings = ::config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EtlError::Config(e.to_string()))?;

        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self> {
        let url = raw
            .api_get_bitcoin_price
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| EtlError::Config(format!("{} is not set", PRICE_API_VAR)))?;

        let price_api_url = Url::parse(url.trim())
            .map_err(|e| EtlError::Config(format!("{} is not a valid URL ({}): {}", PRICE_API_VAR, url, e)))?;

        if !matches!(price_api_url.scheme(), "http" | "https") {
            return Err(EtlError::Config(format!(
                "{} must be an http(s) URL, got {}",
                PRICE_API_VAR, price_api_url
            )));
        }

        for (name, secs) in [
            ("SCHEDULE_INTERVAL_SECS", raw.schedule_interval_secs),
            ("POLL_DELAY_SECS", raw.poll_delay_secs),
            ("REQUEST_TIMEOUT_SECS", raw.request_timeout_secs),
        ] {
            if secs == 0 {
                return Err(EtlError::Config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(Self {
            price_api_url,
            data_dir: raw.data_dir,
            partition_layout: raw.partition_layout,
            schedule_interval: Duration::from_secs(raw.schedule_interval_secs),
            poll_delay: Duration::from_secs(raw.poll_delay_secs),
            run_retries: raw.run_retries,
            retry_delay: Duration::from_secs(raw.retry_delay_secs),
            request_timeout: Duration::from_secs(raw.request_timeout_secs),
        })
    }
}

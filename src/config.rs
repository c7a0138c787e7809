use crate::orchestrator::BatchOptions;
use anyhow::Context;
use catalog_client::{ClientOptions, LimiterOptions, RetryPolicy};
use fbt_types::overrides::ManualOverrideSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DB_PATH: &str = "storage/fbt.db";
pub const DEFAULT_OVERRIDES_PATH: &str = "cfg.d/fbt_overrides.yml";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SYNC_PAGE_SIZE: usize = 250;

fn env_or<T>(key: &str, default_value: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    envmnt::get_parse(key).unwrap_or(default_value)
}

fn env_count(key: &str, default_value: usize) -> usize {
    Some(env_or(key, default_value))
        .filter(|v| *v > 0)
        .unwrap_or(default_value)
}

fn env_string(key: &str) -> Option<String> {
    let value: Result<String, _> = envmnt::get_parse(key);
    value
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub catalog: ClientOptions,
    pub batch: BatchOptions,
    pub db_path: PathBuf,
    pub overrides_path: PathBuf,
    pub bind_addr: String,
    pub sync_page_size: usize,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = env_string("CATALOG_BASE_URL").context("CATALOG_BASE_URL not set")?;
        let access_key = env_string("CATALOG_ACCESS_KEY").context("CATALOG_ACCESS_KEY not set")?;
        let retry = RetryPolicy {
            max_retries: env_or("CATALOG_MAX_RETRIES", RetryPolicy::default().max_retries),
            ..Default::default()
        };
        let limiter = LimiterOptions {
            initial: env_count("CATALOG_INITIAL_CONCURRENCY", 50),
            min: env_count("CATALOG_MIN_CONCURRENCY", 10),
            step: env_count("CATALOG_CONCURRENCY_STEP", 5),
            window: Duration::from_secs(env_or("CATALOG_RATE_LIMIT_WINDOW_SECS", 60)),
        };
        let catalog = ClientOptions {
            fallback_url: env_string("CATALOG_FALLBACK_URL"),
            timeout: Duration::from_secs(env_or("CATALOG_TIMEOUT_SECS", 20)),
            limiter,
            retry,
            ..ClientOptions::new(base_url, access_key)
        };
        let batch = BatchOptions {
            limit: env_count("FBT_LIMIT", fbt_types::DEFAULT_LIMIT),
            chunk_size: env_count("FBT_CHUNK_SIZE", 50),
            compute_concurrency: env_count("FBT_COMPUTE_CONCURRENCY", 10),
            push_concurrency: env_count("FBT_PUSH_CONCURRENCY", 5),
        };
        Ok(Self {
            catalog,
            batch,
            db_path: env_string("FBT_DB_PATH")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                .into(),
            overrides_path: env_string("FBT_OVERRIDES_PATH")
                .unwrap_or_else(|| DEFAULT_OVERRIDES_PATH.to_string())
                .into(),
            bind_addr: env_string("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            sync_page_size: env_count("FBT_SYNC_PAGE_SIZE", DEFAULT_SYNC_PAGE_SIZE),
        })
    }
}

/// Missing file means no overrides.
pub async fn load_overrides<P: AsRef<Path>>(path: P) -> anyhow::Result<ManualOverrideSet> {
    let path = path.as_ref();
    match tokio::fs::read_to_string(path).await {
        Ok(data) => ManualOverrideSet::parse(&data)
            .with_context(|| format!("Unable to parse overrides from {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::info!("No overrides file at {}", path.display());
            Ok(ManualOverrideSet::default())
        }
        Err(err) => Err(err).with_context(|| format!("Unable to read {}", path.display())),
    }
}

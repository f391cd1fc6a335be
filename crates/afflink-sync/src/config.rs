use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use afflink_remote::{RestTableConfig, CONVERSION_TIMEOUT, PROBE_TIMEOUT, UPSERT_TIMEOUT};
use afflink_storage::HttpClientConfig;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::Semaphore;

pub const CONFIG_PATH_ENV: &str = "AFFLINK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "afflink.yaml";

/// Optional YAML config file; every key can also come from the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub conversion_url: Option<String>,
    pub referral_tag: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub table: Option<String>,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub batch_delay_ms: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub conversion_url: Option<String>,
    pub referral_tag: Option<String>,
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub table: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub concurrency: usize,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub user_agent: Option<String>,
    pub conversion_timeout: Duration,
    pub probe_timeout: Duration,
    pub upsert_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conversion_url: None,
            referral_tag: None,
            supabase_url: None,
            supabase_key: None,
            table: "db".to_string(),
            input_path: PathBuf::from("links.json"),
            output_path: PathBuf::from("links_converted.json"),
            concurrency: 20,
            batch_size: 50,
            batch_delay: Duration::from_millis(500),
            user_agent: None,
            conversion_timeout: CONVERSION_TIMEOUT,
            probe_timeout: PROBE_TIMEOUT,
            upsert_timeout: UPSERT_TIMEOUT,
        }
    }
}

fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("parsing {key}={raw}")),
        None => Ok(None),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    /// Resolve configuration from the optional YAML file named by
    /// `AFFLINK_CONFIG` (default `afflink.yaml`) plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));
        let file = if path.exists() {
            Self::read_file(&path)?
        } else if explicit.is_some() {
            bail!("config file {} not found", path.display());
        } else {
            ConfigFile::default()
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    pub fn read_file(path: &Path) -> Result<ConfigFile> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Layer environment values over file values over defaults.
    pub fn from_sources(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let env = |key: &str| non_empty(env(key));

        let config = Self {
            conversion_url: env("AFFLINK_CONVERSION_URL").or(non_empty(file.conversion_url)),
            referral_tag: env("AFFLINK_REFERRAL_TAG").or(non_empty(file.referral_tag)),
            supabase_url: env("SUPABASE_URL").or(non_empty(file.supabase_url)),
            supabase_key: env("SUPABASE_KEY").or(non_empty(file.supabase_key)),
            table: env("AFFLINK_TABLE")
                .or(non_empty(file.table))
                .unwrap_or(defaults.table),
            input_path: env("AFFLINK_INPUT")
                .map(PathBuf::from)
                .or(file.input_path)
                .unwrap_or(defaults.input_path),
            output_path: env("AFFLINK_OUTPUT")
                .map(PathBuf::from)
                .or(file.output_path)
                .unwrap_or(defaults.output_path),
            concurrency: env_parse(&env, "AFFLINK_CONCURRENCY")?
                .or(file.concurrency)
                .unwrap_or(defaults.concurrency),
            batch_size: env_parse(&env, "AFFLINK_BATCH_SIZE")?
                .or(file.batch_size)
                .unwrap_or(defaults.batch_size),
            batch_delay: env_parse(&env, "AFFLINK_BATCH_DELAY_MS")?
                .or(file.batch_delay_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            user_agent: env("AFFLINK_USER_AGENT").or(non_empty(file.user_agent)),
            ..defaults
        };

        if config.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if config.concurrency > Semaphore::MAX_PERMITS {
            bail!(
                "concurrency {} exceeds the limit of {}",
                config.concurrency,
                Semaphore::MAX_PERMITS
            );
        }
        if config.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        Ok(config)
    }

    pub fn conversion_url(&self) -> Result<&str> {
        required(&self.conversion_url, "AFFLINK_CONVERSION_URL", "conversion_url")
    }

    pub fn referral_tag(&self) -> Result<&str> {
        required(&self.referral_tag, "AFFLINK_REFERRAL_TAG", "referral_tag")
    }

    pub fn rest_table(&self) -> Result<RestTableConfig> {
        Ok(RestTableConfig {
            base_url: required(&self.supabase_url, "SUPABASE_URL", "supabase_url")?.to_string(),
            api_key: required(&self.supabase_key, "SUPABASE_KEY", "supabase_key")?.to_string(),
            table: self.table.clone(),
            probe_timeout: self.probe_timeout,
            upsert_timeout: self.upsert_timeout,
        })
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            user_agent: self.user_agent.clone(),
            ..Default::default()
        }
    }
}

fn required<'a>(value: &'a Option<String>, env_key: &str, file_key: &str) -> Result<&'a str> {
    value
        .as_deref()
        .with_context(|| format!("missing {env_key} (or `{file_key}` in the config file)"))
}

//! Fns to read variables from the environment more conveniently, and the one place where the
//! binaries turn the environment into explicit configuration for the rest of the crate.

use std::{env, num::NonZeroU32, path::PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::debug;

use crate::flipside::FLIPSIDE_API_URL;

const SECRET_LOG_BLACKLIST: [&str; 1] = ["FLIPSIDE_API_KEY"];

pub const DEFAULT_CACHE_PATH: &str = "metawin_transactions_all_time.csv";
const DEFAULT_PAGE_SIZE: u32 = 10_000;
const DEFAULT_PORT: u16 = 3002;
const DEFAULT_QUERY_TIMEOUT_MINUTES: u32 = 20;
const DEFAULT_STARTING_DATE: &str = "2022-01-01";

fn obfuscate_if_secret(blacklist: &[&str], key: &str, value: &str) -> String {
    if blacklist.contains(&key) {
        let mut last_four = value.to_string();
        last_four.drain(0..value.len().saturating_sub(4));
        format!("****{last_four}")
    } else {
        value.to_string()
    }
}

/// Get an environment variable, encoding found or missing as Option, and panic otherwise.
pub fn get_env_var(key: &str) -> Option<String> {
    let var = match env::var(key) {
        Err(env::VarError::NotPresent) => None,
        Err(e) => panic!("{e}"),
        Ok(var) => Some(var),
    };

    if let Some(ref existing_var) = var {
        let output = obfuscate_if_secret(&SECRET_LOG_BLACKLIST, key, existing_var);
        debug!("env var {key}: {output}");
    } else {
        debug!("env var {key} requested but not found")
    };

    var
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    get_env_var(key).map(|var| match var.to_lowercase().as_str() {
        "true" => true,
        "false" => false,
        "t" => true,
        "f" => false,
        "1" => true,
        "0" => false,
        str => panic!("invalid bool value {str} for {key}"),
    })
}

fn parse_env_var<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get_env_var(key)
        .map(|var| {
            var.parse::<T>()
                .with_context(|| format!("invalid value {var} for {key}"))
        })
        .transpose()
}

/// The part of the configuration the log subscriber needs. Read before everything else so the
/// rest of the environment is read with a subscriber in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub log_json: bool,
    pub log_perf: bool,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub bind_public_interface: bool,
    pub cache_path: PathBuf,
    /// Only needed when the cache file is missing.
    pub flipside_api_key: Option<String>,
    pub flipside_api_url: String,
    pub page_size: NonZeroU32,
    pub port: u16,
    pub query_timeout_minutes: u32,
    pub starting_date: NaiveDate,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        let page_size = parse_env_var::<u32>("QUERY_PAGE_SIZE")?.unwrap_or(DEFAULT_PAGE_SIZE);
        let page_size = NonZeroU32::new(page_size).context("QUERY_PAGE_SIZE must be positive")?;

        let starting_date = get_env_var("QUERY_STARTING_DATE")
            .unwrap_or_else(|| DEFAULT_STARTING_DATE.to_string());
        let starting_date = NaiveDate::parse_from_str(&starting_date, "%Y-%m-%d")
            .with_context(|| format!("invalid QUERY_STARTING_DATE {starting_date}"))?;

        Ok(Self {
            bind_public_interface: get_env_bool("BIND_PUBLIC_INTERFACE").unwrap_or(true),
            cache_path: get_env_var("METAWIN_CACHE_PATH")
                .unwrap_or_else(|| DEFAULT_CACHE_PATH.to_string())
                .into(),
            flipside_api_key: get_env_var("FLIPSIDE_API_KEY"),
            flipside_api_url: get_env_var("FLIPSIDE_API_URL")
                .unwrap_or_else(|| FLIPSIDE_API_URL.to_string()),
            page_size,
            port: parse_env_var("PORT")?.unwrap_or(DEFAULT_PORT),
            query_timeout_minutes: parse_env_var("QUERY_TIMEOUT_MINUTES")?
                .unwrap_or(DEFAULT_QUERY_TIMEOUT_MINUTES),
            starting_date,
        })
    }

    pub fn flipside_api_key(&self) -> Result<&str> {
        self.flipside_api_key
            .as_deref()
            .context("FLIPSIDE_API_KEY is required to fetch the dataset when no cache file exists")
    }
}

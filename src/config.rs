use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::Duration as Window;

use crate::error::{Error, Result};

const DEFAULT_DB_PATH: &str = "observatorio.db";
const DEFAULT_SESSION_FILE: &str = "observatorio.session";

/// Telegram API credentials. Only the collect pass needs these.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_id: i32,
    pub api_hash: String,
    pub session_file: String,
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self> {
        let api_id = env::var("TG_ID")
            .map_err(|_| Error::Config("Please set TG_ID to your Telegram API ID".into()))?
            .trim()
            .parse()
            .map_err(|_| Error::Config("TG_ID must be an integer (your Telegram API ID)".into()))?;
        let api_hash = env::var("TG_HASH")
            .map_err(|_| Error::Config("Please set TG_HASH to your Telegram API hash".into()))?;
        Ok(Self {
            api_id,
            api_hash,
            session_file: env::var("TG_SESSION").unwrap_or_else(|_| DEFAULT_SESSION_FILE.into()),
        })
    }
}

/// Pacing and bounds for the collect pass.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// Messages requested per page.
    pub page_size: usize,
    /// Upper bound on pages read per channel in one pass.
    pub max_pages: usize,
    /// Pause between successive page requests.
    pub page_delay: Duration,
    /// Pause between channels.
    pub channel_delay: Duration,
    /// How far back a channel without a watermark is read.
    pub first_run_window: Window,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 2,
            page_delay: Duration::from_millis(100),
            channel_delay: Duration::from_secs(5),
            first_run_window: Window::days(30),
        }
    }
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub log_level: log::LevelFilter,
    pub collect: CollectConfig,
    /// Maximum number of messages classified per analyze run.
    pub analyze_batch_size: usize,
}

impl Config {
    /// Load settings from the environment, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = CollectConfig::default();
        let collect = CollectConfig {
            page_size: parse_var("COLLECT_PAGE_SIZE", defaults.page_size)?,
            max_pages: parse_var("COLLECT_MAX_PAGES", defaults.max_pages)?,
            page_delay: Duration::from_millis(parse_var("COLLECT_PAGE_DELAY_MS", 100u64)?),
            channel_delay: Duration::from_secs(parse_var("COLLECT_CHANNEL_DELAY_SECS", 5u64)?),
            first_run_window: Window::days(parse_var("FIRST_RUN_WINDOW_DAYS", 30i64)?),
        };
        if collect.page_size == 0 || collect.max_pages == 0 {
            return Err(Error::Config(
                "COLLECT_PAGE_SIZE and COLLECT_MAX_PAGES must be positive".into(),
            ));
        }

        Ok(Self {
            db_path: env::var("OBSERVATORY_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.into()),
            log_level: parse_var("LOG_LEVEL", log::LevelFilter::Info)?,
            collect,
            analyze_batch_size: parse_var("ANALYZE_BATCH_SIZE", 100usize)?,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

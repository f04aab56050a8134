use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use url::Url;

use crate::error::{BotError, Result};
use crate::generator::DEFAULT_SYSTEM_PROMPT;

const DEFAULT_X_API_BASE: &str = "https://api.x.com/2";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "deepseek-r1:1.5b";
const MAX_BACKOFF_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub x_access_token: String,
    pub x_api_base: Url,
    pub ollama_url: Url,
    pub model_name: String,
    pub poll_interval: Duration,
    pub max_reply_chars: usize,
    pub max_context_messages: usize,
    pub max_attempts: u32,
    pub generation_timeout: Duration,
    pub max_prompt_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub request_delay: Duration,
    pub shutdown_grace: Duration,
    pub state_file: Option<PathBuf>,
    pub start_time: DateTime<Utc>,
    pub dedup_capacity: usize,
    pub system_prompt: String,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self> {
        debug!("Loading configuration from environment");
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a required key is missing or a value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let x_access_token = get("X_ACCESS_TOKEN").ok_or_else(|| {
            error!("Failed to load X_ACCESS_TOKEN from environment");
            BotError::Config("Missing required variable X_ACCESS_TOKEN".to_string())
        })?;

        let x_api_base = parse_url(&get, "X_API_BASE", DEFAULT_X_API_BASE)?;
        let ollama_url = parse_url(&get, "OLLAMA_URL", DEFAULT_OLLAMA_URL)?;
        let model_name = get("MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let start_time = match get("START_TIME") {
            Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|time| time.with_timezone(&Utc))
                .map_err(|e| BotError::Config(format!("Invalid START_TIME '{raw}': {e}")))?,
            None => Utc::now(),
        };

        let config = Self {
            x_access_token,
            x_api_base,
            ollama_url,
            model_name,
            poll_interval: parse_secs(&get, "CHECK_INTERVAL", 60)?,
            max_reply_chars: parse_or(&get, "MAX_REPLY_CHARS", 280)?,
            max_context_messages: parse_or(&get, "MAX_CONTEXT_MESSAGES", 5)?,
            max_attempts: parse_or(&get, "MAX_ATTEMPTS", 3)?,
            generation_timeout: parse_secs(&get, "GENERATION_TIMEOUT", 120)?,
            max_prompt_chars: parse_or(&get, "MAX_PROMPT_CHARS", 8000)?,
            max_tokens: parse_or(&get, "MAX_TOKENS", 280)?,
            temperature: parse_or(&get, "TEMPERATURE", 0.7)?,
            backoff_floor: parse_secs(&get, "BACKOFF_FLOOR", 1)?,
            backoff_ceiling: parse_secs(&get, "BACKOFF_CEILING", 900)?,
            request_delay: parse_secs(&get, "REQUEST_DELAY", 2)?,
            shutdown_grace: parse_secs(&get, "SHUTDOWN_GRACE", 5)?,
            state_file: get("STATE_FILE").map(PathBuf::from),
            start_time,
            dedup_capacity: parse_or(&get, "DEDUP_CAPACITY", 10_000)?,
            system_prompt: get("SYSTEM_PROMPT")
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };
        config.validate()?;

        info!("Configuration loaded successfully");
        debug!(
            "X access token length: {} characters",
            config.x_access_token.len()
        );
        debug!("X API base: {}", config.x_api_base);
        debug!("Ollama URL: {}", config.ollama_url);
        debug!("Model: {}", config.model_name);
        debug!("Poll interval: {:?}", config.poll_interval);
        debug!("Start time: {}", config.start_time);

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(BotError::Config(message.to_string()));

        if self.poll_interval.is_zero() {
            return invalid("CHECK_INTERVAL must be greater than zero");
        }
        if self.max_attempts == 0 {
            return invalid("MAX_ATTEMPTS must be greater than zero");
        }
        if self.max_reply_chars == 0 {
            return invalid("MAX_REPLY_CHARS must be greater than zero");
        }
        if self.backoff_floor.is_zero() {
            return invalid("BACKOFF_FLOOR must be greater than zero");
        }
        if self.backoff_floor > self.backoff_ceiling {
            return invalid("BACKOFF_FLOOR must not exceed BACKOFF_CEILING");
        }
        if self.backoff_ceiling > MAX_BACKOFF_CEILING {
            return invalid("BACKOFF_CEILING must not exceed one day");
        }
        if self.generation_timeout.is_zero() {
            return invalid("GENERATION_TIMEOUT must be greater than zero");
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| {
            error!("Failed to parse {key}: {e}");
            BotError::Config(format!("Invalid value for {key} '{raw}': {e}"))
        }),
        None => Ok(default),
    }
}

fn parse_secs<G>(get: &G, key: &str, default: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default).map(Duration::from_secs)
}

fn parse_url<G>(get: &G, key: &str, default: &str) -> Result<Url>
where
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key).unwrap_or_else(|| default.to_string());
    let mut url = Url::parse(raw.trim())
        .map_err(|e| BotError::Config(format!("Invalid value for {key} '{raw}': {e}")))?;

    // Endpoints are joined onto the base, which needs a trailing slash to keep its path.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Social API error ({status}): {message}")]
    SocialApi { status: StatusCode, message: String },

    #[error("Rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("Authentication error: {0}")]
    FatalAuth(String),

    #[error("Failed to fetch mentions: {0}")]
    TransientFetch(String),

    #[error("Failed to publish reply: {0}")]
    TransientPublish(String),

    #[error("Reply rejected by the platform: {0}")]
    FatalPublish(String),

    #[error("Inference API error ({status}): {message}")]
    InferenceApi { status: StatusCode, message: String },

    #[error("Inference backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Inference backend returned an empty generation")]
    EmptyGeneration,

    #[error("Input too large: {0}")]
    InputTooLarge(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Shutdown requested")]
    Shutdown,
}

/// How the mention loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry after backoff, counting against the attempt ceiling.
    Transient,
    /// Retry once the window resets, without an attempt penalty.
    RateLimited(DateTime<Utc>),
    /// Give up on the current mention and move on.
    FatalMention,
    /// Stop the loop and surface the error to the operator.
    FatalProcess,
}

impl BotError {
    /// Classify this error for the mention loop.
    ///
    /// Anything not explicitly recognised is treated as transient.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::Config(_)
            | BotError::Url(_)
            | BotError::FatalAuth(_)
            | BotError::ModelNotFound(_)
            | BotError::Shutdown => ErrorKind::FatalProcess,
            BotError::RateLimited { reset_at } => ErrorKind::RateLimited(*reset_at),
            BotError::FatalPublish(_) | BotError::InputTooLarge(_) => ErrorKind::FatalMention,
            BotError::SocialApi { status, .. } | BotError::InferenceApi { status, .. }
                if *status == StatusCode::UNAUTHORIZED =>
            {
                ErrorKind::FatalProcess
            }
            BotError::Reqwest(_)
            | BotError::Io(_)
            | BotError::Json(_)
            | BotError::SocialApi { .. }
            | BotError::InferenceApi { .. }
            | BotError::TransientFetch(_)
            | BotError::TransientPublish(_)
            | BotError::BackendUnavailable(_)
            | BotError::EmptyGeneration => ErrorKind::Transient,
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

//! Reply generation: prompt building, inference, and output validation.

mod prompt;
mod text;

use std::time::{Duration, Instant};

use log::debug;
use reqwest::StatusCode;

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::ollama::InferenceBackend;
use crate::types::{GeneratedReply, Mention};

pub use prompt::{DEFAULT_SYSTEM_PROMPT, build_prompt, mention_body};
pub use text::{strip_reasoning, truncate_at_whitespace};

#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub system_prompt: String,
    pub max_reply_chars: usize,
    pub max_context_messages: usize,
    pub max_prompt_chars: usize,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl From<&Config> for GeneratorSettings {
    fn from(config: &Config) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            max_reply_chars: config.max_reply_chars,
            max_context_messages: config.max_context_messages,
            max_prompt_chars: config.max_prompt_chars,
            max_tokens: config.max_tokens,
            timeout: config.generation_timeout,
        }
    }
}

pub struct ResponseGenerator<B> {
    backend: B,
    settings: GeneratorSettings,
}

impl<B: InferenceBackend> ResponseGenerator<B> {
    pub fn new(backend: B, settings: GeneratorSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Generate a reply to `mention` that fits the platform character limit.
    ///
    /// # Errors
    ///
    /// - [`BotError::InputTooLarge`] if the prompt exceeds the configured size
    /// - [`BotError::BackendUnavailable`] on connection failure or timeout
    /// - [`BotError::EmptyGeneration`] if the model produced no usable text
    pub async fn generate(&self, mention: &Mention) -> Result<GeneratedReply> {
        let prompt = build_prompt(
            &self.settings.system_prompt,
            mention,
            self.settings.max_context_messages,
            self.settings.max_reply_chars,
        );

        let prompt_chars = prompt.chars().count();
        if prompt_chars > self.settings.max_prompt_chars {
            return Err(BotError::InputTooLarge(format!(
                "prompt for mention {} is {prompt_chars} characters, limit is {}",
                mention.id, self.settings.max_prompt_chars
            )));
        }

        debug!(
            "Generating reply to mention {} ({prompt_chars} prompt characters)",
            mention.id
        );
        let started = Instant::now();
        let raw = tokio::time::timeout(
            self.settings.timeout,
            self.backend.complete(&prompt, self.settings.max_tokens),
        )
        .await
        .map_err(|_| {
            BotError::BackendUnavailable(format!(
                "generation timed out after {:?}",
                self.settings.timeout
            ))
        })?
        .map_err(classify_backend_error)?;
        let latency = started.elapsed();

        let cleaned = strip_reasoning(&raw);
        let cleaned = cleaned.trim();
        if cleaned.is_empty() {
            return Err(BotError::EmptyGeneration);
        }

        let text = truncate_at_whitespace(cleaned, self.settings.max_reply_chars);
        debug!(
            "Generated {} characters for mention {} in {latency:?}",
            text.chars().count(),
            mention.id
        );

        Ok(GeneratedReply {
            mention_id: mention.id.clone(),
            text,
            latency,
        })
    }
}

fn classify_backend_error(err: BotError) -> BotError {
    match err {
        BotError::Reqwest(e) => BotError::BackendUnavailable(e.to_string()),
        BotError::InferenceApi { status, message } if status == StatusCode::PAYLOAD_TOO_LARGE => {
            BotError::InputTooLarge(message)
        }
        BotError::InferenceApi { status, message } if status == StatusCode::NOT_FOUND => {
            BotError::ModelNotFound(message)
        }
        BotError::InferenceApi { status, message } if status.is_server_error() => {
            BotError::BackendUnavailable(format!("{status}: {message}"))
        }
        other => other,
    }
}

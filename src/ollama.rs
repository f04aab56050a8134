//! Inference backend contract and the Ollama client implementing it.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::{BotError, Result};

/// A locally hosted text-generation backend.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Model used for completions.
    fn model(&self) -> &str;

    /// Complete `prompt`, generating at most `max_tokens` tokens.
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;

    /// Names of the models installed on the backend.
    async fn list_models(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

pub struct OllamaClient {
    client: reqwest::Client,
    base_url: Url,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    #[must_use]
    pub fn new(base_url: Url, model: String, temperature: f32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            temperature,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ollama_url.clone(),
            config.model_name.clone(),
            config.temperature,
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let message = response
            .text()
            .await
            .unwrap_or_else(|e| format!("Failed to read error response: {e}"));
        Err(BotError::InferenceApi { status, message })
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        debug!("Sending generate request to Ollama model {}", self.model);

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                num_predict: max_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint("api/generate")?)
            .json(&request)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let body: GenerateResponse = response.json().await?;
        debug!("Received {} bytes from Ollama", body.response.len());
        Ok(body.response)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let response = self.client.get(self.endpoint("api/tags")?).send().await?;
        let response = Self::check_status(response).await?;

        let body: TagsResponse = response.json().await?;
        Ok(body.models.into_iter().map(|model| model.name).collect())
    }
}

/// Verify the backend is reachable and has the configured model installed.
///
/// # Errors
///
/// - [`BotError::BackendUnavailable`] if the backend is down or has no models
/// - [`BotError::ModelNotFound`] if the configured model is not installed
pub async fn ensure_model_available<B: InferenceBackend + ?Sized>(backend: &B) -> Result<()> {
    let available = backend.list_models().await.map_err(|e| {
        BotError::BackendUnavailable(format!(
            "Ollama is not running or unreachable ({e}); start it with `ollama serve`"
        ))
    })?;

    if available.is_empty() {
        return Err(BotError::BackendUnavailable(
            "no models installed; install one with `ollama pull MODEL_NAME`".to_string(),
        ));
    }
    info!("Available models: {}", available.join(", "));

    let model = backend.model();
    let latest = format!("{model}:latest");
    if !available.iter().any(|name| name == model || *name == latest) {
        return Err(BotError::ModelNotFound(format!(
            "{model} is not installed; available models: {}. Set MODEL_NAME or run `ollama pull {model}`",
            available.join(", ")
        )));
    }

    info!("Model {model} is ready");
    Ok(())
}

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a concise, helpful assistant.";

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("cannot reach generation service at {host}: {detail}")]
    Unreachable { host: String, detail: String },

    #[error("generation request timed out")]
    Timeout,

    #[error("model not available: {0}")]
    ModelNotFound(String),

    #[error("generation service returned HTTP {0}")]
    Http(u16),

    #[error("generation service returned invalid JSON: {0}")]
    InvalidResponse(String),

    #[error("generation service returned an empty response")]
    EmptyResponse,
}

/// External answer-generation collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, GenerationError>;
}

/// Ollama client speaking the non-streaming `/api/generate` endpoint.
pub struct OllamaGenerator {
    client: reqwest::Client,
    host: String,
    default_model: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaGenerator {
    pub fn new(
        host: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building generation HTTP client")?;
        Ok(Self {
            client,
            host: host.into().trim_end_matches('/').to_string(),
            default_model: default_model.into(),
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, GenerationError> {
        let model = model.unwrap_or(&self.default_model);
        let url = format!("{}/api/generate", self.host);

        log::debug!("Generation request: model={model}, prompt_len={}", prompt.len());

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model,
                prompt,
                system: system.unwrap_or(DEFAULT_SYSTEM_PROMPT),
                stream: false,
            })
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Unreachable {
                        host: self.host.clone(),
                        detail: err.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(GenerationError::ModelNotFound(model.to_string()));
        }
        if !status.is_success() {
            return Err(GenerationError::Http(status.as_u16()));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|err| GenerationError::InvalidResponse(err.to_string()))?;

        let answer = parsed.response.trim().to_string();
        if answer.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        log::debug!("Generation response received ({} chars)", answer.len());
        Ok(answer)
    }
}

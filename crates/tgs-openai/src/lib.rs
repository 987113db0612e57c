//! OpenAI-compatible chat completions adapter.
//!
//! Serves both the `openai` and `proxyapi` providers: the request and
//! response shapes are the same, only the URL and key differ.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use tgs_core::{
    config::{AiConfig, AiProvider},
    errors::Error,
    ports::ResponseGenerator,
    resilience::ErrorHandler,
    Result,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiGenerator {
    cfg: AiConfig,
    http: reqwest::Client,
    errors: Arc<ErrorHandler>,
}

impl OpenAiGenerator {
    pub fn new(cfg: AiConfig, errors: Arc<ErrorHandler>) -> Result<Self> {
        if cfg.api_key.trim().is_empty() {
            return Err(Error::Config(
                "ai_responder.api_key is required when the responder is enabled".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self { cfg, http, errors })
    }

    fn operation(&self) -> &'static str {
        match self.cfg.provider {
            AiProvider::OpenAi => "openai_api_call",
            AiProvider::ProxyApi => "proxyapi_api_call",
        }
    }

    fn payload<'a>(&'a self, prompt: &'a str) -> CompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !self.cfg.system_prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &self.cfg.system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        CompletionRequest {
            model: &self.cfg.model,
            messages,
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
        }
    }

    async fn request(&self, prompt: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .post(&self.cfg.api_url)
            .bearer_auth(&self.cfg.api_key)
            .json(&self.payload(prompt))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(self.cfg.provider, status, retry_after, &body));
        }

        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("invalid completion response: {e}")))?;
        Ok(first_choice(parsed))
    }
}

fn map_transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("completion request: {e}"))
    } else {
        Error::Network(e.to_string())
    }
}

fn map_status(
    provider: AiProvider,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> Error {
    let detail = format!(
        "{} error {}: {}",
        provider.as_str(),
        status.as_u16(),
        body.chars().take(200).collect::<String>()
    );
    match status {
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            seconds: retry_after.unwrap_or(1),
        },
        StatusCode::UNAUTHORIZED => Error::InvalidCredentials(detail),
        StatusCode::FORBIDDEN => Error::PermissionDenied(detail),
        s if s.is_server_error() => Error::Network(detail),
        _ => Error::External(detail),
    }
}

fn first_choice(resp: CompletionResponse) -> Option<String> {
    resp.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn generate(&self, prompt: &str) -> Result<Option<String>> {
        debug!(
            provider = self.cfg.provider.as_str(),
            model = %self.cfg.model,
            prompt_chars = prompt.chars().count(),
            "requesting completion"
        );
        self.errors
            .with_retry(self.operation(), || self.request(prompt))
            .await
    }
}

//! Text completion backends used by the guessers.
//!
//! [`Completion`] is the seam: the guessers only need "instructions + text
//! in, reply out". Two implementations:
//!
//! * [`ResponsesClient`] talks to an OpenAI-style `/v1/responses` endpoint
//!   directly, with the exact request and reply shape the pipeline expects.
//! * [`ProviderCompletion`] wraps any `edgequake-llm` provider, so Anthropic,
//!   Gemini, Ollama and friends work without extra code.

use crate::config::{LlmBackend, LlmConfig};
use crate::error::{LlmError, ScanflowError};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A single-turn text completion.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, LlmError>;
}

// ── Responses API ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
    instructions: &'a str,
    max_output_tokens: u32,
    store: bool,
}

#[derive(Debug, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    status: String,
    #[serde(default)]
    output: Vec<ReplyOutput>,
}

#[derive(Debug, Deserialize)]
struct ReplyOutput {
    #[serde(default)]
    content: Vec<ReplyContent>,
}

#[derive(Debug, Deserialize)]
struct ReplyContent {
    #[serde(default)]
    text: String,
}

/// Pulls the reply text out of a Responses API body.
///
/// Only `status == "completed"` with a non-empty first text is accepted.
fn reply_text(body: &str) -> Result<String, LlmError> {
    let reply: ResponsesReply =
        serde_json::from_str(body).map_err(|e| LlmError::Malformed(e.to_string()))?;
    if reply.status != "completed" {
        return Err(LlmError::Malformed(format!(
            "status is '{}', expected 'completed'",
            reply.status
        )));
    }
    let text = reply
        .output
        .into_iter()
        .next()
        .and_then(|o| o.content.into_iter().next())
        .map(|c| c.text)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(LlmError::Malformed("reply contains no text".into()));
    }
    Ok(text)
}

/// Client for `POST /v1/responses`.
pub struct ResponsesClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
}

impl ResponsesClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_output_tokens: u32,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_output_tokens,
        })
    }
}

#[async_trait]
impl Completion for ResponsesClient {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, LlmError> {
        let request = ResponsesRequest {
            model: &self.model,
            input,
            instructions,
            max_output_tokens: self.max_output_tokens,
            store: false,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(model = %self.model, bytes = body.len(), "Completion received");
        reply_text(&body)
    }
}

// ── edgequake-llm providers ───────────────────────────────────────────────

/// Completion through an `edgequake-llm` chat provider.
pub struct ProviderCompletion {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl ProviderCompletion {
    pub fn new(provider: Arc<dyn LLMProvider>, max_output_tokens: u32) -> Self {
        Self {
            provider,
            options: build_options(max_output_tokens),
        }
    }
}

/// Low temperature: the reply must follow a strict format.
fn build_options(max_output_tokens: u32) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(0.2),
        max_tokens: Some(max_output_tokens as usize),
        ..Default::default()
    }
}

#[async_trait]
impl Completion for ProviderCompletion {
    async fn complete(&self, instructions: &str, input: &str) -> Result<String, LlmError> {
        let messages = vec![ChatMessage::system(instructions), ChatMessage::user(input)];
        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;
        debug!(
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "Provider completion received"
        );
        Ok(response.content)
    }
}

/// Picks a provider: the configured name, then `EDGEQUAKE_LLM_PROVIDER` +
/// `EDGEQUAKE_MODEL`, then whatever `ProviderFactory::from_env` detects.
fn resolve_provider(config: &LlmConfig) -> Result<Arc<dyn LLMProvider>, ScanflowError> {
    let create = |name: &str, model: &str| {
        ProviderFactory::create_llm_provider(name, model).map_err(|e| {
            ScanflowError::ProviderNotConfigured {
                provider: name.to_string(),
                hint: e.to_string(),
            }
        })
    };

    if !config.provider.is_empty() {
        return create(&config.provider, &config.model);
    }
    if let (Ok(provider), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !provider.is_empty() && !model.is_empty() {
            return create(&provider, &model);
        }
    }
    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ScanflowError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be detected from the environment.\n\
                 Set llm.provider, or OPENAI_API_KEY / ANTHROPIC_API_KEY.\n\
                 Error: {e}"
            ),
        })?;
    Ok(provider)
}

/// Builds the backend selected in the config.
pub fn build_completion(config: &LlmConfig) -> Result<Arc<dyn Completion>, ScanflowError> {
    match config.backend {
        LlmBackend::Responses => {
            let api_key = config
                .resolved_api_key()
                .ok_or_else(|| ScanflowError::ProviderNotConfigured {
                    provider: "responses".into(),
                    hint: "Set llm.api_key or OPENAI_API_KEY.".into(),
                })?;
            let client = ResponsesClient::new(
                &config.endpoint,
                api_key,
                &config.model,
                config.max_output_tokens,
                Duration::from_secs(config.timeout_secs),
            )
            .map_err(|e| ScanflowError::Internal(e.to_string()))?;
            Ok(Arc::new(client))
        }
        LlmBackend::Provider => {
            let provider = resolve_provider(config)?;
            Ok(Arc::new(ProviderCompletion::new(
                provider,
                config.max_output_tokens,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let req = ResponsesRequest {
            model: "gpt-4o-mini",
            input: "text",
            instructions: "do it",
            max_output_tokens: 200,
            store: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "gpt-4o-mini",
                "input": "text",
                "instructions": "do it",
                "max_output_tokens": 200,
                "store": false
            })
        );
    }

    #[test]
    fn test_reply_text_completed() {
        let body = r#"{"status":"completed","output":[{"type":"message","content":[{"type":"output_text","text":"'2024-01-05-Invoice.pdf'"}]}]}"#;
        assert_eq!(reply_text(body).unwrap(), "'2024-01-05-Invoice.pdf'");
    }

    #[test]
    fn test_reply_text_rejects_other_status() {
        let body = r#"{"status":"incomplete","output":[{"content":[{"text":"x"}]}]}"#;
        assert!(matches!(reply_text(body), Err(LlmError::Malformed(_))));
    }

    #[test]
    fn test_reply_text_rejects_missing_text() {
        for body in [
            r#"{"status":"completed","output":[]}"#,
            r#"{"status":"completed","output":[{"content":[]}]}"#,
            r#"{"status":"completed","output":[{"content":[{"text":""}]}]}"#,
            "not json",
        ] {
            assert!(reply_text(body).is_err(), "{body}");
        }
    }

    #[test]
    fn test_build_options() {
        let opts = build_options(200);
        assert_eq!(opts.max_tokens, Some(200));
        assert_eq!(opts.temperature, Some(0.2));
    }
}

#![allow(async_fn_in_trait)]

pub mod claude;
pub mod openai;
pub mod prompt;

pub use claude::ClaudeProvider;
pub use openai::OpenAiProvider;
pub use prompt::{truncate_context, PromptSettings};

use modbot_core::{BotConfig, CoreError, GenerationKind, LlmError, LlmProviderKind};
use reqwest::{header::HeaderMap, StatusCode};
use std::time::Duration;

/// Text produced by a language model plus the tokens it cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Generation {
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

/// Produces bot text for one kind of action from a block of context.
pub trait ContentGenerator {
    async fn generate(&self, kind: GenerationKind, context: &str)
        -> Result<Generation, CoreError>;
}

/// The provider selected in configuration.
pub enum LlmClient {
    OpenAi(OpenAiProvider),
    Claude(ClaudeProvider),
}

impl LlmClient {
    /// Builds the configured provider; the API key comes from the environment.
    pub fn from_config(config: &BotConfig) -> Result<Self, CoreError> {
        let api_key = config.llm_api_key()?;
        let prompts = PromptSettings::from_config(config);
        let client = match config.llm.provider {
            LlmProviderKind::OpenAi => {
                LlmClient::OpenAi(OpenAiProvider::new(api_key, &config.llm, prompts)?)
            }
            LlmProviderKind::Claude => {
                LlmClient::Claude(ClaudeProvider::new(api_key, &config.llm, prompts)?)
            }
        };
        Ok(client)
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            LlmClient::OpenAi(_) => openai::PROVIDER,
            LlmClient::Claude(_) => claude::PROVIDER,
        }
    }
}

impl ContentGenerator for LlmClient {
    async fn generate(
        &self,
        kind: GenerationKind,
        context: &str,
    ) -> Result<Generation, CoreError> {
        match self {
            LlmClient::OpenAi(provider) => provider.generate(kind, context).await,
            LlmClient::Claude(provider) => provider.generate(kind, context).await,
        }
    }
}

pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, CoreError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(CoreError::Network)
}

pub(crate) fn map_send_error(provider: &str, error: reqwest::Error) -> CoreError {
    if error.is_timeout() {
        LlmError::RequestTimeout {
            provider: provider.to_string(),
        }
        .into()
    } else {
        CoreError::Network(error)
    }
}

/// Maps a non-success provider status onto the LLM error taxonomy.
pub(crate) fn map_status(
    provider: &str,
    model: &str,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> LlmError {
    let provider = provider.to_string();
    match status.as_u16() {
        401 => LlmError::InvalidApiKey { provider },
        402 => LlmError::InsufficientCredits { provider },
        403 => LlmError::AuthenticationFailed { provider },
        404 => LlmError::ModelNotAvailable {
            model: model.to_string(),
        },
        429 if body.contains("insufficient_quota") => LlmError::InsufficientCredits { provider },
        429 => LlmError::RateLimitExceeded {
            provider,
            retry_after: retry_after_secs(headers).unwrap_or(30),
        },
        400 | 413 | 422 => LlmError::InvalidPrompt {
            reason: body.chars().take(200).collect(),
        },
        408 => LlmError::RequestTimeout { provider },
        _ => LlmError::ServiceUnavailable { provider },
    }
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, RETRY_AFTER};

    #[test]
    fn test_status_mapping() {
        let empty = HeaderMap::new();
        assert!(matches!(
            map_status("openai", "m", StatusCode::UNAUTHORIZED, &empty, ""),
            LlmError::InvalidApiKey { .. }
        ));
        assert!(matches!(
            map_status("openai", "m", StatusCode::NOT_FOUND, &empty, ""),
            LlmError::ModelNotAvailable { model } if model == "m"
        ));
        assert!(matches!(
            map_status("claude", "m", StatusCode::BAD_GATEWAY, &empty, ""),
            LlmError::ServiceUnavailable { .. }
        ));
        assert!(matches!(
            map_status("openai", "m", StatusCode::TOO_MANY_REQUESTS, &empty, "insufficient_quota"),
            LlmError::InsufficientCredits { .. }
        ));
    }

    #[test]
    fn test_rate_limit_uses_retry_after_header() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        match map_status("openai", "m", StatusCode::TOO_MANY_REQUESTS, &headers, "") {
            LlmError::RateLimitExceeded { retry_after, .. } => assert_eq!(retry_after, 12),
            other => panic!("unexpected error: {other:?}"),
        }

        match map_status("openai", "m", StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "") {
            LlmError::RateLimitExceeded { retry_after, .. } => assert_eq!(retry_after, 30),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_total_tokens() {
        let generation = Generation {
            text: "hi".to_string(),
            prompt_tokens: 100,
            completion_tokens: 20,
        };
        assert_eq!(generation.total_tokens(), 120);
    }
}

use crate::{http_client, map_send_error, map_status, ContentGenerator, Generation, PromptSettings};
use modbot_core::{CoreError, GenerationKind, LlmError, LlmSettings};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub(crate) const PROVIDER: &str = "openai";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_output_tokens: u32,
    prompts: PromptSettings,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(
        api_key: String,
        settings: &LlmSettings,
        prompts: PromptSettings,
    ) -> Result<Self, CoreError> {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            http: http_client(settings.timeout_secs)?,
            api_key,
            model: settings.model.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            max_output_tokens: settings.max_output_tokens,
            prompts,
        })
    }
}

impl ContentGenerator for OpenAiProvider {
    async fn generate(
        &self,
        kind: GenerationKind,
        context: &str,
    ) -> Result<Generation, CoreError> {
        let system = self.prompts.system_prompt(kind);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: self.prompts.user_prompt(context),
                },
            ],
            max_tokens: self.max_output_tokens,
        };

        debug!("Requesting {} generation from {} ({})", kind, PROVIDER, self.model);
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(PROVIDER, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| map_send_error(PROVIDER, e))?;
        if !status.is_success() {
            return Err(map_status(PROVIDER, &self.model, status, &headers, &body).into());
        }

        let parsed: ChatResponse =
            serde_json::from_str(&body).map_err(|_| LlmError::InvalidResponseFormat {
                provider: PROVIDER.to_string(),
            })?;
        Ok(parse_response(parsed)?)
    }
}

pub(crate) fn parse_response(response: ChatResponse) -> Result<Generation, LlmError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::EmptyResponse {
            provider: PROVIDER.to_string(),
        })?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(LlmError::ContentFiltered {
            reason: "completion stopped by content filter".to_string(),
        });
    }

    let text = choice.message.content.unwrap_or_default().trim().to_string();
    if text.is_empty() {
        return Err(LlmError::EmptyResponse {
            provider: PROVIDER.to_string(),
        });
    }

    let (prompt_tokens, completion_tokens) = response
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or((0, 0));
    Ok(Generation {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Generation, LlmError> {
        parse_response(serde_json::from_str(json).expect("valid json"))
    }

    #[test]
    fn test_parse_completion() {
        let generation = parse(
            r#"{"choices":[{"message":{"role":"assistant","content":"  **TLDR:** short.\n"},
                "finish_reason":"stop"}],
               "usage":{"prompt_tokens":420,"completion_tokens":12,"total_tokens":432}}"#,
        )
        .unwrap();
        assert_eq!(generation.text, "**TLDR:** short.");
        assert_eq!(generation.total_tokens(), 432);
    }

    #[test]
    fn test_parse_empty_and_filtered() {
        assert!(matches!(
            parse(r#"{"choices":[]}"#),
            Err(LlmError::EmptyResponse { .. })
        ));
        assert!(matches!(
            parse(r#"{"choices":[{"message":{"content":"   "},"finish_reason":"stop"}]}"#),
            Err(LlmError::EmptyResponse { .. })
        ));
        assert!(matches!(
            parse(r#"{"choices":[{"message":{"content":null},"finish_reason":"content_filter"}]}"#),
            Err(LlmError::ContentFiltered { .. })
        ));
    }

    #[test]
    fn test_missing_usage_counts_zero() {
        let generation =
            parse(r#"{"choices":[{"message":{"content":"ok"},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(generation.total_tokens(), 0);
    }
}

use crate::{http_client, map_send_error, map_status, ContentGenerator, Generation, PromptSettings};
use modbot_core::{CoreError, GenerationKind, LlmError, LlmSettings};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub(crate) const PROVIDER: &str = "claude";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// Messages-API client for Anthropic models.
pub struct ClaudeProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    max_output_tokens: u32,
    prompts: PromptSettings,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl ClaudeProvider {
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

impl ContentGenerator for ClaudeProvider {
    async fn generate(
        &self,
        kind: GenerationKind,
        context: &str,
    ) -> Result<Generation, CoreError> {
        let system = self.prompts.system_prompt(kind);
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_output_tokens,
            system: &system,
            messages: [Message {
                role: "user",
                content: self.prompts.user_prompt(context),
            }],
        };

        debug!("Requesting {} generation from {} ({})", kind, PROVIDER, self.model);
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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

        let parsed: MessagesResponse =
            serde_json::from_str(&body).map_err(|_| LlmError::InvalidResponseFormat {
                provider: PROVIDER.to_string(),
            })?;
        Ok(parse_response(parsed)?)
    }
}

pub(crate) fn parse_response(response: MessagesResponse) -> Result<Generation, LlmError> {
    if response.stop_reason.as_deref() == Some("refusal") {
        return Err(LlmError::ContentFiltered {
            reason: "model refused the request".to_string(),
        });
    }

    let text = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .map(|block| block.text.as_str())
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(LlmError::EmptyResponse {
            provider: PROVIDER.to_string(),
        });
    }

    let (prompt_tokens, completion_tokens) = response
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((0, 0));
    Ok(Generation {
        text,
        prompt_tokens,
        completion_tokens,
    })
}

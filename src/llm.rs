use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ChatPilotError;
use crate::llm_types::{ChatMessage, CompletionRequest, Usage};

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Return the assistant text for `messages`. Empty or missing content is `Ok("")`.
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ChatPilotError>;
}

pub fn create_provider(config: &Config) -> Arc<dyn CompletionProvider> {
    Arc::new(OpenAiCompatProvider::new(config))
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider
// ---------------------------------------------------------------------------

pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    chat_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(config: &Config) -> Self {
        let chat_url = format!(
            "{}/chat/completions",
            config.llm_base_url.trim_end_matches('/')
        );
        OpenAiCompatProvider {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            chat_url,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }
}

#[derive(Debug, Deserialize)]
struct OaiResponse {
    #[serde(default)]
    choices: Vec<OaiChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiErrorResponse {
    error: OaiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail {
    message: String,
}

fn first_choice_text(body: &str) -> Result<(String, Usage), ChatPilotError> {
    let oai: OaiResponse = serde_json::from_str(body).map_err(|e| {
        ChatPilotError::LlmApi(format!("Failed to parse completion response: {e}\nBody: {body}"))
    })?;
    let text = oai
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    Ok((text, oai.usage.unwrap_or_default()))
}

fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<OaiErrorResponse>(body) {
        Ok(err) => err.error.message,
        Err(_) => format!("HTTP {status}: {body}"),
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ChatPilotError> {
        let body = CompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens,
            temperature,
        };

        let mut retries = 0u32;
        let max_retries = 3;

        loop {
            let mut req = self
                .http
                .post(&self.chat_url)
                .header("Content-Type", "application/json")
                .json(&body);
            if !self.api_key.trim().is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.api_key));
            }
            let response = req.send().await?;
            let status = response.status();

            if status.is_success() {
                let text = response.text().await?;
                let (reply, usage) = first_choice_text(&text)?;
                debug!(
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Completion received"
                );
                return Ok(reply);
            }

            if status.as_u16() == 429 && retries < max_retries {
                retries += 1;
                let delay = std::time::Duration::from_secs(2u64.pow(retries));
                warn!(
                    "Rate limited, retrying in {:?} (attempt {retries}/{max_retries})",
                    delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(ChatPilotError::LlmApi(error_message(status, &text)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_from_base() {
        let config = Config {
            llm_base_url: "http://localhost:11434/v1/".into(),
            ..Config::default()
        };
        let provider = OpenAiCompatProvider::new(&config);
        assert_eq!(provider.chat_url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_first_choice_text() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"hey"}}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let (text, usage) = first_choice_text(body).unwrap();
        assert_eq!(text, "hey");
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn test_first_choice_missing_content_is_empty() {
        let (text, _) = first_choice_text(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert_eq!(text, "");
        let (text, _) = first_choice_text(r#"{"choices":[]}"#).unwrap();
        assert_eq!(text, "");
    }

    #[test]
    fn test_first_choice_rejects_garbage() {
        let err = first_choice_text("not json").unwrap_err();
        assert!(matches!(err, ChatPilotError::LlmApi(_)));
    }

    #[test]
    fn test_error_message_prefers_api_detail() {
        let status = reqwest::StatusCode::UNAUTHORIZED;
        assert_eq!(
            error_message(status, r#"{"error":{"message":"bad key"}}"#),
            "bad key"
        );
        assert!(error_message(status, "oops").starts_with("HTTP 401"));
    }
}

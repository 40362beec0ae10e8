//! Reply text generation: one single-shot chat completion per turn.
//!
//! `ChatCompletionsGenerator` talks to any OpenAI-compatible endpoint; the default
//! base URL is Groq's. API key: `GROQ_API_KEY`.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_CHAT_MODEL: &str = "llama3-8b-8192";

/// Backend that turns the caller's utterance into one reply string.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// `max_tokens` bounds the reply length; return the reply text.
    async fn generate(&self, system: &str, user_text: &str, max_tokens: u32) -> VoiceResult<String>;
}

// OpenAI-compatible request/response
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client. Immutable once built; share one per process.
#[derive(Debug, Clone)]
pub struct ChatCompletionsGenerator {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    /// Create a generator against `base_url` (without trailing `/chat/completions`).
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into().trim().to_string(),
            model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: 0.7,
            client,
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ReplyGenerator for ChatCompletionsGenerator {
    async fn generate(&self, system: &str, user_text: &str, max_tokens: u32) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user_text,
                },
            ],
            max_tokens,
            temperature: self.temperature,
        };

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Generation(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Generation(format!(
                "chat API error {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Generation(e.to_string()))?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| VoiceError::Generation("no choices in response".to_string()))?;

        debug!(model = %self.model, chars = reply.len(), "Chat completion received");
        Ok(reply.trim().to_string())
    }
}

/// Placeholder generator: always answers with a fixed line. Use for wiring tests
/// without an LLM key.
#[derive(Debug, Clone)]
pub struct PlaceholderGenerator {
    pub response: String,
}

impl Default for PlaceholderGenerator {
    fn default() -> Self {
        Self {
            response: "I heard you, but no language model is configured.".to_string(),
        }
    }
}

#[async_trait]
impl ReplyGenerator for PlaceholderGenerator {
    async fn generate(&self, _system: &str, _user_text: &str, _max_tokens: u32) -> VoiceResult<String> {
        Ok(self.response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_system_then_user() {
        let body = ChatRequest {
            model: DEFAULT_CHAT_MODEL,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "Be brief.",
                },
                ChatMessage {
                    role: "user",
                    content: "turn the lights on",
                },
            ],
            max_tokens: 100,
            temperature: 0.7,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "llama3-8b-8192");
        assert_eq!(json["max_tokens"], 100);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "turn the lights on");
    }

    #[test]
    fn response_with_null_content_parses() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#)
                .unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[tokio::test]
    async fn placeholder_returns_fixed_line() {
        let generator = PlaceholderGenerator {
            response: "hello".to_string(),
        };
        assert_eq!(generator.generate("sys", "hi", 10).await.unwrap(), "hello");
    }

    #[test]
    fn builder_overrides_model() {
        let generator = ChatCompletionsGenerator::new(GROQ_API_BASE, " key ")
            .unwrap()
            .with_model("llama-3.1-8b-instant")
            .with_temperature(0.2);
        assert_eq!(generator.model(), "llama-3.1-8b-instant");
        assert_eq!(generator.api_key, "key");
    }
}

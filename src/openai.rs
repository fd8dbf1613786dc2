use crate::error::{PleaseError, Result};
use crate::provider::{
    protocol_error, success_body, transport_error, CompletionRequest, ScriptProvider, TaskCategory,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
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
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout_secs,
            client,
        }
    }
}

#[async_trait]
impl ScriptProvider for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self, category: TaskCategory) -> String {
        match category {
            TaskCategory::Coding => "gpt-4".to_string(),
            _ => "gpt-3.5-turbo".to_string(),
        }
    }

    fn supports_model(&self, model: &str) -> bool {
        ["gpt-", "o1", "o3", "o4"]
            .iter()
            .any(|prefix| model.starts_with(prefix))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let Some(api_key) = &self.api_key else {
            return Err(PleaseError::Configuration(
                "OpenAI API key not configured; set OPENAI_API_KEY".to_string(),
            ));
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
        };
        tracing::debug!(model = %request.model, "sending openai chat request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), self.timeout_secs, e))?;
        let text = success_body(self.name(), self.timeout_secs, response).await?;
        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| protocol_error(self.name(), e))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| protocol_error(self.name(), "no message content in choices"))
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(self.api_key.is_some())
    }
}

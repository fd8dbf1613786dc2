use crate::error::{PleaseError, Result};
use crate::provider::{
    protocol_error, success_body, transport_error, CompletionRequest, ScriptProvider, TaskCategory,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicClient {
    base_url: String,
    api_key: Option<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl AnthropicClient {
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
impl ScriptProvider for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self, category: TaskCategory) -> String {
        match category {
            TaskCategory::Coding => "claude-3-sonnet-20240229".to_string(),
            _ => "claude-3-haiku-20240307".to_string(),
        }
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("claude-")
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let Some(api_key) = &self.api_key else {
            return Err(PleaseError::Configuration(
                "Anthropic API key not configured; set ANTHROPIC_API_KEY".to_string(),
            ));
        };

        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };
        tracing::debug!(model = %request.model, "sending anthropic messages request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), self.timeout_secs, e))?;
        let text = success_body(self.name(), self.timeout_secs, response).await?;
        let parsed: MessagesResponse =
            serde_json::from_str(&text).map_err(|e| protocol_error(self.name(), e))?;

        parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .find_map(|block| block.text)
            .ok_or_else(|| protocol_error(self.name(), "no text block in content"))
    }

    async fn is_available(&self) -> Result<bool> {
        Ok(self.api_key.is_some())
    }
}

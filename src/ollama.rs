use crate::error::Result;
use crate::provider::{
    protocol_error, success_body, transport_error, CompletionRequest, ScriptProvider, TaskCategory,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct OllamaGenerate<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

pub struct OllamaClient {
    base_url: String,
    default_model: String,
    timeout_secs: u64,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: &str, default_model: Option<&str>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model: default_model
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(DEFAULT_OLLAMA_MODEL)
                .to_string(),
            timeout_secs,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Names of the models installed on the server.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), PROBE_TIMEOUT.as_secs(), e))?;
        let body = success_body(self.name(), PROBE_TIMEOUT.as_secs(), response).await?;
        let tags: OllamaTags =
            serde_json::from_str(&body).map_err(|e| protocol_error(self.name(), e))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

#[async_trait]
impl ScriptProvider for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn default_model(&self, _category: TaskCategory) -> String {
        self.default_model.clone()
    }

    fn supports_model(&self, model: &str) -> bool {
        !model.trim().is_empty()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let body = OllamaGenerate {
            model: &request.model,
            prompt: &request.prompt,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                top_p: request.top_p,
            },
        };
        tracing::debug!(model = %request.model, "sending ollama generate request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(self.name(), self.timeout_secs, e))?;
        let text = success_body(self.name(), self.timeout_secs, response).await?;
        let parsed: OllamaGenerateResponse =
            serde_json::from_str(&text).map_err(|e| protocol_error(self.name(), e))?;
        Ok(parsed.response)
    }

    async fn is_available(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) if e.is_connect() => Ok(false),
            Err(e) => Err(transport_error(self.name(), PROBE_TIMEOUT.as_secs(), e)),
        }
    }
}

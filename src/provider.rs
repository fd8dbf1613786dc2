use crate::error::{PleaseError, Result};
use async_trait::async_trait;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// Rough kind of work a task asks for; providers use it to pick a default
/// model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Coding,
    Network,
    SysAdmin,
    FileManagement,
    General,
}

impl TaskCategory {
    pub fn of(task: &str) -> Self {
        let task = task.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| task.contains(w));

        if has(&["script", "function", "code", "program"]) {
            TaskCategory::Coding
        } else if has(&["web", "http", "url", "download", "network", "api"]) {
            TaskCategory::Network
        } else if has(&["system", "server", "service", "process", "registry", "install"]) {
            TaskCategory::SysAdmin
        } else if has(&["file", "folder", "directory", "copy", "move", "delete"]) {
            TaskCategory::FileManagement
        } else {
            TaskCategory::General
        }
    }
}

/// Everything a backend needs for one non-streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

/// A text-generation backend. New backends plug in by implementing this and
/// registering with a [`ProviderRegistry`].
#[async_trait]
pub trait ScriptProvider: Send + Sync {
    fn name(&self) -> &str;

    fn default_model(&self, category: TaskCategory) -> String;

    fn supports_model(&self, model: &str) -> bool;

    /// Returns the raw generated text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// Cheap liveness/configuration probe.
    async fn is_available(&self) -> Result<bool>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ScriptProvider>>,
    default: String,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            providers: BTreeMap::new(),
            default: default.into().to_lowercase(),
        }
    }

    pub fn register(mut self, provider: Arc<dyn ScriptProvider>) -> Self {
        self.providers
            .insert(provider.name().to_lowercase(), provider);
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Looks up `name`, or the default provider when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn ScriptProvider>> {
        let key = name.unwrap_or(&self.default).to_lowercase();
        self.providers
            .get(&key)
            .cloned()
            .ok_or(PleaseError::UnknownProvider(key))
    }
}

/// Shapes a reqwest failure into the connectivity / timeout split.
pub(crate) fn transport_error(provider: &str, timeout_secs: u64, err: reqwest::Error) -> PleaseError {
    if err.is_timeout() {
        PleaseError::Timeout {
            provider: provider.to_string(),
            seconds: timeout_secs,
        }
    } else {
        PleaseError::Connectivity {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

/// Reads the body of a response, turning non-2xx statuses into errors.
pub(crate) async fn success_body(
    provider: &str,
    timeout_secs: u64,
    response: reqwest::Response,
) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| transport_error(provider, timeout_secs, e))?;
    if !status.is_success() {
        return Err(PleaseError::Status {
            provider: provider.to_string(),
            status: status.as_u16(),
            body: body_excerpt(&body),
        });
    }
    Ok(body)
}

const EXCERPT_CHARS: usize = 200;

/// Error bodies end up in a one-line message, so they are flattened and cut
/// short. Proxies like to answer with whole HTML pages.
fn body_excerpt(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(EXCERPT_CHARS) {
        Some((end, _)) => format!("{}...", &flat[..end]),
        None => flat,
    }
}

pub(crate) fn protocol_error(provider: &str, message: impl fmt::Display) -> PleaseError {
    PleaseError::Protocol {
        provider: provider.to_string(),
        message: message.to_string(),
    }
}

use crate::error::{PleaseError, Result};
use crate::ollama::DEFAULT_OLLAMA_MODEL;
use crate::provider::{protocol_error, CompletionRequest, ProviderRegistry, ScriptProvider, TaskCategory};
use crate::types::{ScriptRequest, ScriptResponse, ScriptType};
use async_trait::async_trait;
use std::time::Duration;

/// Request parameter carrying a similar earlier task, filled from context.
pub const SIMILAR_REQUEST_PARAM: &str = "similar_request";
/// Script being refined. Its presence turns the prompt into a refinement.
pub const ORIGINAL_SCRIPT_PARAM: &str = "original_script";
pub const REFINEMENT_PARAM: &str = "refinement";

const PREAMBLE_PREFIXES: &[&str] = &[
    "here's",
    "here is",
    "this script will",
    "the following script",
    "sure,",
    "sure!",
];

/// Produces an unassessed [`ScriptResponse`] for a request.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate_script(&self, request: &ScriptRequest) -> Result<ScriptResponse>;

    async fn is_provider_available(&self, request: &ScriptRequest) -> Result<bool>;

    fn fallback_model(&self, request: &ScriptRequest) -> String;
}

#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            max_tokens: 2000,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug)]
pub struct LlmScriptGenerator {
    providers: ProviderRegistry,
    settings: GenerationSettings,
}

impl LlmScriptGenerator {
    pub fn new(providers: ProviderRegistry, settings: GenerationSettings) -> Self {
        Self {
            providers,
            settings,
        }
    }
}

fn model_for(provider: &dyn ScriptProvider, request: &ScriptRequest) -> String {
    match request.model() {
        Some(model) if provider.supports_model(model) => model.to_string(),
        _ => provider.default_model(TaskCategory::of(request.task_description())),
    }
}

#[async_trait]
impl ScriptGenerator for LlmScriptGenerator {
    async fn generate_script(&self, request: &ScriptRequest) -> Result<ScriptResponse> {
        let provider = self.providers.resolve(request.provider())?;
        let script_type = request.script_type().resolve();
        let model = model_for(provider.as_ref(), request);
        if let Some(requested) = request.model().filter(|m| *m != model) {
            tracing::warn!(
                provider = provider.name(),
                requested,
                fallback = %model,
                "requested model is not supported, using fallback"
            );
        }

        let completion = CompletionRequest {
            model: model.clone(),
            prompt: build_prompt(request, script_type),
            temperature: self.settings.temperature,
            top_p: self.settings.top_p,
            max_tokens: self.settings.max_tokens,
        };
        tracing::debug!(provider = provider.name(), %model, %script_type, "generating script");

        let raw = tokio::time::timeout(self.settings.timeout, provider.complete(&completion))
            .await
            .map_err(|_| PleaseError::Timeout {
                provider: provider.name().to_string(),
                seconds: self.settings.timeout.as_secs(),
            })??;

        let cleaned = clean_script(&raw);
        if cleaned.script.is_empty() {
            return Err(protocol_error(provider.name(), "generated text contained no script"));
        }

        let response = ScriptResponse::new(
            cleaned.script,
            request.task_description(),
            provider.name(),
            model,
            script_type,
        )?;
        Ok(match cleaned.explanation {
            Some(explanation) => response.with_explanation(explanation),
            None => response,
        })
    }

    async fn is_provider_available(&self, request: &ScriptRequest) -> Result<bool> {
        let provider = self.providers.resolve(request.provider())?;
        provider.is_available().await
    }

    fn fallback_model(&self, request: &ScriptRequest) -> String {
        let provider = self
            .providers
            .resolve(request.provider())
            .or_else(|_| self.providers.resolve(None));
        match provider {
            Ok(provider) => model_for(provider.as_ref(), request),
            Err(_) => request.model().unwrap_or(DEFAULT_OLLAMA_MODEL).to_string(),
        }
    }
}

fn type_requirements(script_type: ScriptType) -> &'static str {
    match script_type {
        ScriptType::Bash => {
            "- Start with the shebang #!/bin/bash\n- Use `set -euo pipefail` unless it breaks the task"
        }
        ScriptType::PowerShell => {
            "- Use approved PowerShell cmdlets and full parameter names\n- Use try/catch with -ErrorAction Stop for error handling"
        }
        ScriptType::Command => {
            "- Start with @echo off\n- Check %ERRORLEVEL% after commands that can fail"
        }
        ScriptType::Python => {
            "- Start with the shebang #!/usr/bin/env python3\n- Use only the standard library"
        }
        ScriptType::Auto => "- Use the shell most natural for the current platform",
    }
}

pub(crate) fn build_prompt(request: &ScriptRequest, script_type: ScriptType) -> String {
    if let Some(original) = request.parameter(ORIGINAL_SCRIPT_PARAM) {
        let change = request
            .parameter(REFINEMENT_PARAM)
            .unwrap_or(request.task_description());
        return build_refinement_prompt(original, change, script_type);
    }

    let language = script_type.display_name();
    let mut context = String::new();
    if let Some(dir) = request.working_directory() {
        context.push_str(&format!("Current directory: {}\n", dir.display()));
    }
    if let Some(similar) = request.parameter(SIMILAR_REQUEST_PARAM) {
        context.push_str(&format!("A similar earlier request was: {}\n", similar));
    }

    format!(
        r#"You are a {language} expert. Generate a complete, working {language} script to accomplish the following task:

{task}

Requirements:
- Write clean, well-commented {language} code
- Include error handling where appropriate
{type_requirements}
- Do NOT include markdown code blocks, backticks, or formatting
- Do NOT include explanations or descriptions
- Return ONLY the raw {language} script code
- The script should be ready to run as-is

{context}{language} Script:"#,
        language = language,
        task = request.task_description(),
        type_requirements = type_requirements(script_type),
        context = context,
    )
}

pub(crate) fn build_refinement_prompt(
    original: &str,
    change: &str,
    script_type: ScriptType,
) -> String {
    let language = script_type.display_name();
    format!(
        r#"Please refine and improve the following {language} script based on this request: {change}

Original Script:
{original}

Refinement Request: {change}

Requirements:
- Keep the core functionality intact
- Apply the requested improvements/changes
- Maintain {language} best practices
- Include clear comments explaining changes
- Do NOT include markdown code blocks, backticks, or formatting
- Return ONLY the refined script, no explanations

Refined {language} Script:"#
    )
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct CleanedScript {
    pub script: String,
    pub explanation: Option<String>,
}

/// Strips markdown fences and a leading chatty preamble from model output.
/// The first preamble line is kept as the explanation.
pub(crate) fn clean_script(raw: &str) -> CleanedScript {
    let mut explanation = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            continue;
        }
        if lines.is_empty() {
            if trimmed.is_empty() {
                continue;
            }
            let lower = trimmed.to_lowercase();
            if PREAMBLE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
                if explanation.is_none() {
                    explanation = Some(trimmed.trim_end_matches(':').to_string());
                }
                continue;
            }
        }
        lines.push(line);
    }

    CleanedScript {
        script: lines.join("\n").trim_end().to_string(),
        explanation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::StubProvider;
    use crate::types::RiskLevel;
    use std::sync::Arc;

    fn generator(provider: Arc<StubProvider>, timeout: Duration) -> LlmScriptGenerator {
        LlmScriptGenerator::new(
            ProviderRegistry::new("stub").register(provider),
            GenerationSettings {
                timeout,
                ..GenerationSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn wraps_cleaned_output_in_unassessed_response() {
        let stub = Arc::new(StubProvider::replying(
            "stub",
            Ok("Here's a Bash script to list files:\n```bash\n#!/bin/bash\nls -la\n```\n".into()),
        ));
        let planner = generator(stub.clone(), Duration::from_secs(5));
        let request = ScriptRequest::new("List files in current directory")
            .unwrap()
            .with_script_type(ScriptType::Bash);

        let response = planner.generate_script(&request).await.unwrap();

        assert_eq!(response.script(), "#!/bin/bash\nls -la");
        assert_eq!(response.explanation(), Some("Here's a Bash script to list files"));
        assert_eq!(response.task_description(), "List files in current directory");
        assert_eq!(response.provider(), "stub");
        assert_eq!(response.model(), "stub-general");
        assert_eq!(response.script_type(), ScriptType::Bash);
        assert_eq!(response.risk_level(), RiskLevel::Low);
        assert!(response.warnings().is_empty());
        assert!(response.safety_notes().is_empty());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn prompt_carries_task_type_and_context() {
        let stub = Arc::new(StubProvider::replying("stub", Ok("Get-ChildItem".into())));
        let planner = generator(stub.clone(), Duration::from_secs(5));
        let request = ScriptRequest::new("show big files")
            .unwrap()
            .with_script_type(ScriptType::PowerShell)
            .with_model("stub-custom")
            .with_working_directory("/srv/app")
            .with_parameter(SIMILAR_REQUEST_PARAM, "show large files");

        let response = planner.generate_script(&request).await.unwrap();
        assert_eq!(response.model(), "stub-custom");

        let sent = stub.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.model, "stub-custom");
        assert!(sent.prompt.contains("show big files"));
        assert!(sent.prompt.contains("You are a PowerShell expert"));
        assert!(sent.prompt.contains("Current directory: /srv/app"));
        assert!(sent.prompt.contains("A similar earlier request was: show large files"));
        assert!((sent.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn prompt_is_deterministic() {
        let request = ScriptRequest::new("count lines").unwrap();
        assert_eq!(
            build_prompt(&request, ScriptType::Bash),
            build_prompt(&request, ScriptType::Bash)
        );
        assert!(!build_prompt(&request, ScriptType::Bash).contains("Current directory"));
    }

    #[tokio::test]
    async fn refinement_prompt_carries_original_and_change() {
        let stub = Arc::new(StubProvider::replying("stub", Ok("echo \"$(date) hi\"".into())));
        let planner = generator(stub.clone(), Duration::from_secs(5));
        let request = ScriptRequest::new("greet [Refined: add timestamp]")
            .unwrap()
            .with_script_type(ScriptType::Bash)
            .with_parameter(ORIGINAL_SCRIPT_PARAM, "echo 'Hello World'")
            .with_parameter(REFINEMENT_PARAM, "add timestamp");

        let response = planner.generate_script(&request).await.unwrap();
        assert_eq!(response.task_description(), "greet [Refined: add timestamp]");

        let prompt = stub.last_request.lock().unwrap().clone().unwrap().prompt;
        assert!(prompt.starts_with("Please refine and improve the following Bash script"));
        assert!(prompt.contains("Original Script:\necho 'Hello World'\n"));
        assert!(prompt.contains("Refinement Request: add timestamp"));
        assert!(prompt.ends_with("Refined Bash Script:"));
        assert!(!prompt.contains("[Refined:"));
    }

    #[tokio::test]
    async fn provider_failures_propagate() {
        let failure = PleaseError::Connectivity {
            provider: "stub".into(),
            message: "connection refused".into(),
        };
        let stub = Arc::new(StubProvider::replying("stub", Err(failure.clone())));
        let planner = generator(stub, Duration::from_secs(5));
        let request = ScriptRequest::new("anything").unwrap();

        assert_eq!(planner.generate_script(&request).await.unwrap_err(), failure);
    }

    #[tokio::test]
    async fn blank_output_is_protocol_failure() {
        let stub = Arc::new(StubProvider::replying("stub", Ok("```\n\n```".into())));
        let planner = generator(stub, Duration::from_secs(5));
        let err = planner
            .generate_script(&ScriptRequest::new("anything").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PleaseError::Protocol { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_provider_is_failure() {
        let stub = Arc::new(StubProvider::replying("stub", Ok("ls".into())));
        let planner = generator(stub.clone(), Duration::from_secs(5));
        let request = ScriptRequest::new("anything").unwrap().with_provider("nope");

        assert_eq!(
            planner.generate_script(&request).await.unwrap_err(),
            PleaseError::UnknownProvider("nope".into())
        );
        assert_eq!(stub.calls(), 0);
    }

    struct SlowProvider;

    #[async_trait]
    impl ScriptProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        fn default_model(&self, _category: TaskCategory) -> String {
            "slow-1".into()
        }
        fn supports_model(&self, _model: &str) -> bool {
            true
        }
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("ls".into())
        }
        async fn is_available(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn generation_is_bounded_by_timeout() {
        let planner = LlmScriptGenerator::new(
            ProviderRegistry::new("slow").register(Arc::new(SlowProvider)),
            GenerationSettings {
                timeout: Duration::from_millis(50),
                ..GenerationSettings::default()
            },
        );
        let err = planner
            .generate_script(&ScriptRequest::new("anything").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, PleaseError::Timeout { ref provider, .. } if provider == "slow"));
        assert!(err.to_string().starts_with("generation exceeded time budget"));
    }

    #[tokio::test]
    async fn availability_is_delegated() {
        let mut stub = StubProvider::replying("stub", Ok("ls".into()));
        stub.available = Err(PleaseError::Connectivity {
            provider: "stub".into(),
            message: "down".into(),
        });
        let planner = generator(Arc::new(stub), Duration::from_secs(5));
        let request = ScriptRequest::new("anything").unwrap();
        assert!(planner.is_provider_available(&request).await.is_err());
        assert!(planner
            .is_provider_available(&request.with_provider("missing"))
            .await
            .is_err());
    }

    #[test]
    fn fallback_model_follows_provider_support() {
        let stub = Arc::new(StubProvider::replying("stub", Ok("ls".into())));
        let planner = generator(stub, Duration::from_secs(5));

        let unspecified = ScriptRequest::new("write a script").unwrap();
        assert_eq!(planner.fallback_model(&unspecified), "stub-coder");

        let supported = ScriptRequest::new("list").unwrap().with_model("stub-x");
        assert_eq!(planner.fallback_model(&supported), "stub-x");

        let unsupported = ScriptRequest::new("list").unwrap().with_model("gpt-4");
        assert_eq!(planner.fallback_model(&unsupported), "stub-general");

        let unknown_provider = ScriptRequest::new("list").unwrap().with_provider("nope");
        assert_eq!(planner.fallback_model(&unknown_provider), "stub-general");
    }

    #[test]
    fn cleaning_keeps_inner_blank_lines() {
        let cleaned = clean_script("\n\nls\n\necho done\n\n");
        assert_eq!(
            cleaned,
            CleanedScript {
                script: "ls\n\necho done".into(),
                explanation: None,
            }
        );
    }
}

use crate::context::ContextService;
use crate::error::{PleaseError, Result};
use crate::planner::{
    ScriptGenerator, ORIGINAL_SCRIPT_PARAM, REFINEMENT_PARAM, SIMILAR_REQUEST_PARAM,
};
use crate::repository::ScriptRepository;
use crate::safety::RiskAssessor;
use crate::types::{CommandExecution, CommandIntent, ScriptRequest, ScriptResponse, ScriptType};
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request settings applied to every command the processor handles.
#[derive(Debug, Clone, Default)]
pub struct RequestDefaults {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub script_type: Option<ScriptType>,
}

/// Runs one command through context lookup, generation, risk assessment and
/// persistence. Each stage short-circuits the rest on failure.
pub struct CommandProcessor {
    context: Arc<dyn ContextService>,
    generator: Arc<dyn ScriptGenerator>,
    assessor: RiskAssessor,
    repository: Arc<dyn ScriptRepository>,
    defaults: RequestDefaults,
}

impl CommandProcessor {
    pub fn new(
        context: Arc<dyn ContextService>,
        generator: Arc<dyn ScriptGenerator>,
        assessor: RiskAssessor,
        repository: Arc<dyn ScriptRepository>,
    ) -> Self {
        Self {
            context,
            generator,
            assessor,
            repository,
            defaults: RequestDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: RequestDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn process(
        &self,
        command_text: &str,
        cancel: &CancellationToken,
    ) -> Result<ScriptResponse> {
        let intent = CommandIntent::new(command_text);

        debug!("looking up context");
        let context = until_cancelled(cancel, self.context.get_context(&intent)).await?;

        let mut request = ScriptRequest::new(&intent.command_text)?
            .with_working_directory(context.working_directory);
        if let Some(provider) = &self.defaults.provider {
            request = request.with_provider(provider.as_str());
        }
        if let Some(model) = &self.defaults.model {
            request = request.with_model(model.as_str());
        }
        if let Some(script_type) = self.defaults.script_type {
            request = request.with_script_type(script_type);
        }
        if let Some(similar) = context.similar_request {
            request = request.with_parameter(SIMILAR_REQUEST_PARAM, similar);
        }

        let response = self.generate_and_save(&request, cancel).await?;
        self.remember(&intent, cancel).await;
        Ok(response)
    }

    /// Asks for a changed version of an earlier script. The new script keeps
    /// the original's script type and, unless overridden by the defaults, its
    /// provider and model. It is assessed and saved like any other; its task
    /// is the original task tagged with the change.
    pub async fn refine(
        &self,
        original: &ScriptResponse,
        change: &str,
        cancel: &CancellationToken,
    ) -> Result<ScriptResponse> {
        let change = change.trim();
        if change.is_empty() {
            return Err(PleaseError::EmptyTask);
        }

        let task = format!("{} [Refined: {}]", original.task_description(), change);
        let provider = self.defaults.provider.as_deref().unwrap_or(original.provider());
        let model = self.defaults.model.as_deref().unwrap_or(original.model());
        let request = ScriptRequest::new(task)?
            .with_provider(provider)
            .with_model(model)
            .with_script_type(original.script_type())
            .with_parameter(ORIGINAL_SCRIPT_PARAM, original.script())
            .with_parameter(REFINEMENT_PARAM, change);

        self.generate_and_save(&request, cancel).await
    }

    async fn generate_and_save(
        &self,
        request: &ScriptRequest,
        cancel: &CancellationToken,
    ) -> Result<ScriptResponse> {
        debug!(task = request.task_description(), "generating script");
        let generated = until_cancelled(cancel, self.generator.generate_script(request)).await?;

        let response = self.assessor.enhance_with_validation(generated);
        debug!(risk = %response.risk_level(), warnings = response.warnings().len(), "script assessed");

        until_cancelled(cancel, self.repository.save_script(&response))
            .await
            .map_err(|e| match e {
                PleaseError::Cancelled => e,
                other => PleaseError::SaveFailed(other.to_string()),
            })?;
        info!(id = %response.id(), "script saved");
        Ok(response)
    }

    /// Pattern storage never fails the command it belongs to.
    async fn remember(&self, intent: &CommandIntent, cancel: &CancellationToken) {
        let execution = CommandExecution::new(intent.command_text.trim());
        match until_cancelled(cancel, self.context.store_pattern(&execution)).await {
            Ok(()) => {}
            Err(PleaseError::Cancelled) => debug!("pattern storage skipped after cancellation"),
            Err(e) => warn!(error = %e, "could not store command pattern"),
        }
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    stage: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PleaseError::Cancelled),
        result = stage => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommandContext, RiskLevel};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::{
        path::PathBuf,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    struct FakeContext {
        failure: Option<PleaseError>,
        store_failure: Option<PleaseError>,
        similar: Option<String>,
        calls: AtomicUsize,
        stored: Mutex<Vec<String>>,
    }

    impl FakeContext {
        fn ok() -> Self {
            Self {
                failure: None,
                store_failure: None,
                similar: None,
                calls: AtomicUsize::new(0),
                stored: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ContextService for FakeContext {
        async fn get_context(&self, _intent: &CommandIntent) -> Result<CommandContext> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.failure {
                Some(err) => Err(err.clone()),
                None => Ok(CommandContext {
                    working_directory: PathBuf::from("/work"),
                    similar_request: self.similar.clone(),
                }),
            }
        }

        async fn store_pattern(&self, execution: &CommandExecution) -> Result<()> {
            if let Some(err) = &self.store_failure {
                return Err(err.clone());
            }
            self.stored.lock().unwrap().push(execution.command_text.clone());
            Ok(())
        }
    }

    struct FakeGenerator {
        script: String,
        failure: Option<PleaseError>,
        hang: bool,
        calls: AtomicUsize,
        last_request: Mutex<Option<ScriptRequest>>,
    }

    impl FakeGenerator {
        fn replying(script: &str) -> Self {
            Self {
                script: script.to_string(),
                failure: None,
                hang: false,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScriptGenerator for FakeGenerator {
        async fn generate_script(&self, request: &ScriptRequest) -> Result<ScriptResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            ScriptResponse::new(
                self.script.clone(),
                request.task_description(),
                "fake",
                "fake-model",
                request.script_type().resolve(),
            )
        }

        async fn is_provider_available(&self, _request: &ScriptRequest) -> Result<bool> {
            Ok(true)
        }

        fn fallback_model(&self, _request: &ScriptRequest) -> String {
            "fake-model".to_string()
        }
    }

    #[derive(Default)]
    struct FakeRepository {
        failure: Option<PleaseError>,
        saved: Mutex<Vec<ScriptResponse>>,
    }

    #[async_trait]
    impl ScriptRepository for FakeRepository {
        async fn save_script(&self, response: &ScriptResponse) -> Result<()> {
            if let Some(err) = &self.failure {
                return Err(err.clone());
            }
            self.saved.lock().unwrap().push(response.clone());
            Ok(())
        }

        async fn get_last_script(&self) -> Result<Option<ScriptResponse>> {
            Ok(self.saved.lock().unwrap().last().cloned())
        }

        async fn get_script_history(
            &self,
            count: Option<usize>,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<ScriptResponse>> {
            let saved = self.saved.lock().unwrap();
            Ok(saved
                .iter()
                .rev()
                .take(count.unwrap_or(usize::MAX))
                .cloned()
                .collect())
        }

        async fn clear_history(&self) -> Result<()> {
            self.saved.lock().unwrap().clear();
            Ok(())
        }

        async fn has_history(&self) -> bool {
            !self.saved.lock().unwrap().is_empty()
        }
    }

    struct Harness {
        context: Arc<FakeContext>,
        generator: Arc<FakeGenerator>,
        repository: Arc<FakeRepository>,
    }

    impl Harness {
        fn new(context: FakeContext, generator: FakeGenerator, repository: FakeRepository) -> Self {
            Self {
                context: Arc::new(context),
                generator: Arc::new(generator),
                repository: Arc::new(repository),
            }
        }

        fn processor(&self) -> CommandProcessor {
            CommandProcessor::new(
                self.context.clone(),
                self.generator.clone(),
                RiskAssessor::new(),
                self.repository.clone(),
            )
        }

        fn saved(&self) -> Vec<ScriptResponse> {
            self.repository.saved.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn dangerous_command_is_flagged_and_saved() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("rm -rf /"),
            FakeRepository::default(),
        );

        let response = harness
            .processor()
            .process("Execute dangerous command", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.risk_level(), RiskLevel::Critical);
        assert!(!response.warnings().is_empty());
        assert!(response.requires_confirmation());
        assert!(response.is_dangerous());
        assert_eq!(harness.saved(), vec![response]);
        assert_eq!(
            *harness.context.stored.lock().unwrap(),
            ["Execute dangerous command"]
        );
    }

    #[tokio::test]
    async fn harmless_command_is_low_risk() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("ls -la"),
            FakeRepository::default(),
        );

        let response = harness
            .processor()
            .process("List files in current directory", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.risk_level(), RiskLevel::Low);
        assert!(response.warnings().is_empty());
        assert!(response.safety_notes().is_empty());
        assert!(!response.requires_confirmation());
    }

    #[tokio::test]
    async fn context_failure_stops_the_pipeline() {
        let context = FakeContext {
            failure: Some(PleaseError::Context("history store is locked".into())),
            ..FakeContext::ok()
        };
        let harness = Harness::new(context, FakeGenerator::replying("ls"), FakeRepository::default());

        let err = harness
            .processor()
            .process("list files", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "history store is locked");
        assert_eq!(harness.generator.calls(), 0);
        assert!(harness.saved().is_empty());
    }

    #[tokio::test]
    async fn save_failure_is_distinguished_from_generation_failure() {
        let repository = FakeRepository {
            failure: Some(PleaseError::Storage("disk I/O error".into())),
            ..FakeRepository::default()
        };
        let harness = Harness::new(FakeContext::ok(), FakeGenerator::replying("ls"), repository);

        let err = harness
            .processor()
            .process("list files", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PleaseError::SaveFailed(_)));
        let message = err.to_string();
        assert!(message.starts_with("Failed to save script:"), "{message}");
        assert!(message.contains("disk I/O error"), "{message}");
        assert_eq!(harness.generator.calls(), 1);
        assert!(harness.context.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn generation_failure_passes_through_untouched() {
        let generator = FakeGenerator {
            failure: Some(PleaseError::Timeout {
                provider: "fake".into(),
                seconds: 120,
            }),
            ..FakeGenerator::replying("ls")
        };
        let harness = Harness::new(FakeContext::ok(), generator, FakeRepository::default());

        let err = harness
            .processor()
            .process("list files", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PleaseError::Timeout {
                provider: "fake".into(),
                seconds: 120,
            }
        );
        assert_eq!(harness.generator.calls(), 1);
        assert!(harness.saved().is_empty());
        assert!(harness.context.stored.lock().unwrap().is_empty());
    }

    fn earlier_script() -> ScriptResponse {
        ScriptResponse::new(
            "Get-ChildItem",
            "list files",
            "openai",
            "gpt-4o",
            ScriptType::PowerShell,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn refinement_reuses_the_original_and_tags_the_task() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("Get-ChildItem -Recurse | Remove-Item -Recurse"),
            FakeRepository::default(),
        );

        let response = harness
            .processor()
            .refine(&earlier_script(), "  include subfolders ", &CancellationToken::new())
            .await
            .unwrap();

        let request = harness.generator.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.task_description(), "list files [Refined: include subfolders]");
        assert_eq!(request.parameter(ORIGINAL_SCRIPT_PARAM), Some("Get-ChildItem"));
        assert_eq!(request.parameter(REFINEMENT_PARAM), Some("include subfolders"));
        assert_eq!(request.provider(), Some("openai"));
        assert_eq!(request.model(), Some("gpt-4o"));
        assert_eq!(request.script_type(), ScriptType::PowerShell);

        assert_eq!(response.task_description(), "list files [Refined: include subfolders]");
        assert_eq!(response.risk_level(), RiskLevel::High);
        assert_eq!(harness.saved(), vec![response]);
        assert_eq!(harness.context.calls.load(Ordering::SeqCst), 0);
        assert!(harness.context.stored.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refinement_honours_provider_override_but_not_script_type() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("Get-ChildItem | Sort-Object Length"),
            FakeRepository::default(),
        );
        let processor = harness.processor().with_defaults(RequestDefaults {
            provider: Some("ollama".into()),
            model: Some("llama3.1".into()),
            script_type: Some(ScriptType::Bash),
        });

        processor
            .refine(&earlier_script(), "sort by size", &CancellationToken::new())
            .await
            .unwrap();

        let request = harness.generator.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.provider(), Some("ollama"));
        assert_eq!(request.model(), Some("llama3.1"));
        assert_eq!(request.script_type(), ScriptType::PowerShell);
    }

    #[tokio::test]
    async fn blank_refinement_is_rejected() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("ls"),
            FakeRepository::default(),
        );

        let err = harness
            .processor()
            .refine(&earlier_script(), " \n ", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, PleaseError::EmptyTask);
        assert_eq!(harness.generator.calls(), 0);
        assert!(harness.saved().is_empty());
    }

    #[tokio::test]
    async fn blank_command_never_reaches_the_generator() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("ls"),
            FakeRepository::default(),
        );

        let err = harness
            .processor()
            .process("   ", &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, PleaseError::EmptyTask);
        assert_eq!(harness.generator.calls(), 0);
    }

    #[tokio::test]
    async fn context_and_defaults_shape_the_request() {
        let context = FakeContext {
            similar: Some("list hidden files".into()),
            ..FakeContext::ok()
        };
        let harness = Harness::new(context, FakeGenerator::replying("ls -a"), FakeRepository::default());
        let processor = harness.processor().with_defaults(RequestDefaults {
            provider: Some("openai".into()),
            model: Some("gpt-4".into()),
            script_type: Some(ScriptType::Python),
        });

        let response = processor
            .process("  list all files  ", &CancellationToken::new())
            .await
            .unwrap();

        let request = harness.generator.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.task_description(), "list all files");
        assert_eq!(request.working_directory(), Some(&PathBuf::from("/work")));
        assert_eq!(request.parameter(SIMILAR_REQUEST_PARAM), Some("list hidden files"));
        assert_eq!(request.provider(), Some("openai"));
        assert_eq!(request.model(), Some("gpt-4"));
        assert_eq!(response.script_type(), ScriptType::Python);
    }

    #[tokio::test]
    async fn pattern_storage_failure_does_not_fail_the_command() {
        let context = FakeContext {
            store_failure: Some(PleaseError::Storage("patterns table missing".into())),
            ..FakeContext::ok()
        };
        let harness = Harness::new(context, FakeGenerator::replying("ls"), FakeRepository::default());

        let response = harness
            .processor()
            .process("list files", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harness.saved(), vec![response]);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let harness = Harness::new(
            FakeContext::ok(),
            FakeGenerator::replying("ls"),
            FakeRepository::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = harness.processor().process("list files", &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(harness.context.calls.load(Ordering::SeqCst), 0);
        assert_eq!(harness.generator.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_generation_saves_nothing() {
        let generator = FakeGenerator {
            hang: true,
            ..FakeGenerator::replying("ls")
        };
        let harness = Harness::new(FakeContext::ok(), generator, FakeRepository::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = harness.processor().process("list files", &cancel).await.unwrap_err();

        assert_eq!(err, PleaseError::Cancelled);
        assert_eq!(harness.generator.calls(), 1);
        assert!(harness.saved().is_empty());
    }
}

use crate::anthropic::AnthropicClient;
use crate::config::{get_config_path, save_config, Config};
use crate::context::HistoryContextService;
use crate::db::{get_db_path, get_script_count, Database};
use crate::ollama::OllamaClient;
use crate::openai::OpenAiClient;
use crate::planner::LlmScriptGenerator;
use crate::processor::{CommandProcessor, RequestDefaults};
use crate::provider::ProviderRegistry;
use crate::repository::{ScriptRepository, SqliteScriptRepository};
use crate::safety::RiskAssessor;
use crate::types::{ScriptResponse, ScriptType};
use crate::ui::{print_history, print_response};
use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use std::{
    env, fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

/// Per-invocation overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub script_type: Option<ScriptType>,
    pub working_directory: Option<PathBuf>,
}

pub fn build_registry(config: &Config) -> ProviderRegistry {
    let llm = &config.llm;
    ProviderRegistry::new(llm.provider.as_str())
        .register(Arc::new(OllamaClient::new(
            &llm.ollama_url,
            None,
            llm.timeout_secs,
        )))
        .register(Arc::new(OpenAiClient::new(
            &llm.openai_url,
            llm.openai_api_key.clone(),
            llm.timeout_secs,
        )))
        .register(Arc::new(AnthropicClient::new(
            &llm.anthropic_url,
            llm.anthropic_api_key.clone(),
            llm.timeout_secs,
        )))
}

fn open_database() -> anyhow::Result<Database> {
    let path = get_db_path();
    Database::open(&path).with_context(|| format!("could not open history at {}", path.display()))
}

/// Opens the history only if it already exists, so read-only commands
/// never create an empty database.
fn existing_repository() -> anyhow::Result<Option<SqliteScriptRepository>> {
    if !get_db_path().exists() {
        return Ok(None);
    }
    Ok(Some(SqliteScriptRepository::new(open_database()?)))
}

pub fn build_processor(
    config: &Config,
    options: GenerateOptions,
    db: Database,
) -> anyhow::Result<CommandProcessor> {
    let registry = build_registry(config);
    registry.resolve(options.provider.as_deref())?;

    let generator = LlmScriptGenerator::new(registry, config.generation_settings()?);
    let script_type = match options.script_type {
        Some(script_type) => script_type,
        None => config.script_type()?,
    };

    let processor = CommandProcessor::new(
        Arc::new(HistoryContextService::new(
            db.clone(),
            options.working_directory,
        )),
        Arc::new(generator),
        RiskAssessor::with_extra_patterns(&config.safety.extra_patterns),
        Arc::new(SqliteScriptRepository::new(db)),
    )
    .with_defaults(RequestDefaults {
        provider: options.provider,
        model: options.model.or_else(|| config.llm.model.clone()),
        script_type: Some(script_type),
    });
    Ok(processor)
}

/// "thinking..." on stderr for as long as the guard lives. Dropping it wipes
/// the line, including when the command future is dropped on Ctrl-C.
struct StatusLine;

const THINKING: &str = "thinking...";

impl StatusLine {
    fn show() -> Self {
        eprint!("{}", THINKING);
        std::io::stderr().flush().ok();
        StatusLine
    }
}

impl Drop for StatusLine {
    fn drop(&mut self) {
        eprint!("{}", clear_line());
        std::io::stderr().flush().ok();
    }
}

fn clear_line() -> String {
    format!("\r{}\r", " ".repeat(THINKING.len()))
}

pub async fn cmd_generate(
    task: &str,
    config: &Config,
    options: GenerateOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let processor = build_processor(config, options, open_database()?)?;

    let status = StatusLine::show();
    let result = processor.process(task, cancel).await;
    drop(status);

    let response = result?;
    print_response(&response);
    Ok(())
}

pub async fn cmd_refine(
    change: &str,
    config: &Config,
    options: GenerateOptions,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let last = match existing_repository()? {
        Some(repository) => repository.get_last_script().await?,
        None => None,
    };
    let Some(original) = last else {
        anyhow::bail!("no script to refine yet; generate one first");
    };

    // Only explicit flags override the original's provider and model.
    let defaults = RequestDefaults {
        provider: options.provider.clone(),
        model: options.model.clone(),
        script_type: None,
    };
    let processor = build_processor(config, options, open_database()?)?.with_defaults(defaults);

    let status = StatusLine::show();
    let result = processor.refine(&original, change, cancel).await;
    drop(status);

    let response = result?;
    print_response(&response);
    Ok(())
}

/// Oldest timestamp `history --since-hours` should show.
fn history_lower_bound(since_hours: Option<i64>) -> anyhow::Result<Option<DateTime<Utc>>> {
    let Some(hours) = since_hours else {
        return Ok(None);
    };
    if hours < 0 {
        anyhow::bail!("--since-hours must not be negative (got {})", hours);
    }
    let since = Duration::try_hours(hours).and_then(|span| Utc::now().checked_sub_signed(span));
    match since {
        Some(since) => Ok(Some(since)),
        None => anyhow::bail!("--since-hours {} is out of range", hours),
    }
}

pub async fn cmd_history(
    config: &Config,
    count: Option<usize>,
    since_hours: Option<i64>,
) -> anyhow::Result<()> {
    let Some(repository) = existing_repository()? else {
        println!("no history yet.");
        return Ok(());
    };

    let since = history_lower_bound(since_hours)?;
    let count = count.unwrap_or(config.behavior.history_window);
    let entries = repository.get_script_history(Some(count), since).await?;
    print_history(&entries);
    Ok(())
}

/// `save` is `None` to print only, `Some(None)` to save under a name derived
/// from the task, `Some(Some(path))` to save to `path`.
pub async fn cmd_last(save: Option<Option<PathBuf>>) -> anyhow::Result<()> {
    let last = match existing_repository()? {
        Some(repository) => repository.get_last_script().await?,
        None => None,
    };
    let Some(response) = last else {
        println!("no history yet.");
        return Ok(());
    };

    print_response(&response);
    if let Some(target) = save {
        let target = target.unwrap_or_else(|| PathBuf::from(suggested_filename(&response)));
        let written = save_script_file(response.script(), &target)?;
        eprintln!("saved to {}", written.display());
    }
    Ok(())
}

const FILENAME_STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "up", "about", "into", "through", "during", "before", "after", "above", "below",
    "between", "is", "are", "was", "were", "be", "have", "has", "had", "do", "does", "did",
    "will", "would", "could", "should", "may", "might",
];

const MAX_FILENAME_STEM: usize = 30;

/// A short file name built from the first meaningful words of the task.
pub fn suggested_filename(response: &ScriptResponse) -> String {
    let task = response.task_description().to_lowercase().replace('-', " ");
    let words: Vec<&str> = task
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|word| word.chars().count() > 2 && !FILENAME_STOP_WORDS.contains(word))
        .take(3)
        .collect();

    let mut stem: String = words
        .join("_")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .take(MAX_FILENAME_STEM)
        .collect();
    if stem.trim_matches('_').is_empty() {
        stem = "script".to_string();
    }

    let extension = match response.script_type() {
        ScriptType::PowerShell => "ps1",
        ScriptType::Command => "bat",
        ScriptType::Python => "py",
        ScriptType::Bash | ScriptType::Auto => "sh",
    };
    format!("{}.{}", stem, extension)
}

/// Writes `script` to `path`. A name without an extension gets `.sh` for
/// scripts with a shell shebang and `.ps1` otherwise. Shell scripts are made
/// executable on Unix.
pub fn save_script_file(script: &str, path: &Path) -> anyhow::Result<PathBuf> {
    let shell_shebang = script.contains("#!/bin/bash") || script.contains("#!/bin/sh");
    let path = if path.extension().is_some() {
        path.to_path_buf()
    } else {
        path.with_extension(if shell_shebang { "sh" } else { "ps1" })
    };

    fs::write(&path, script).with_context(|| format!("could not write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let is_shell = path.extension().is_some_and(|ext| ext == "sh") || script.contains("#!/");
        if is_shell {
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("could not make {} executable", path.display()))?;
        }
    }
    Ok(path)
}

pub async fn cmd_clear() -> anyhow::Result<()> {
    if let Some(repository) = existing_repository()? {
        repository.clear_history().await?;
    }
    println!("history cleared.");
    Ok(())
}

pub async fn cmd_doctor(config: &Config) -> anyhow::Result<()> {
    println!("diagnostics:");
    println!();

    let registry = build_registry(config);
    for name in registry.names() {
        let provider = registry.resolve(Some(name))?;
        let marker = if name == registry.default_name() { " (default)" } else { "" };
        print!("  {}{} ... ", name, marker);
        std::io::stdout().flush().ok();
        match provider.is_available().await {
            Ok(true) => println!("ok"),
            Ok(false) => println!("unavailable"),
            Err(e) => {
                println!("failed");
                println!("    error: {}", e);
            }
        }
    }
    if registry.resolve(None).is_err() {
        println!("  provider '{}' is not known", registry.default_name());
    }

    let ollama = OllamaClient::new(&config.llm.ollama_url, None, config.llm.timeout_secs);
    print!("  ollama models ... ");
    std::io::stdout().flush().ok();
    match ollama.list_models().await {
        Ok(models) if models.is_empty() => {
            println!("none installed");
            println!("    try: ollama pull llama3.1");
        }
        Ok(models) => println!("{}", models.join(", ")),
        Err(e) => {
            println!("failed");
            println!("    url: {}", ollama.base_url());
            println!("    error: {}", e);
            println!("    try: ollama serve");
        }
    }

    print!("  history ... ");
    std::io::stdout().flush().ok();
    if get_db_path().exists() {
        match open_database()?.call(get_script_count).await? {
            0 => println!("empty"),
            count => println!("ok ({} scripts)", count),
        }
    } else {
        println!("not created yet");
    }
    println!("    path: {}", get_db_path().display());

    let config_path = get_config_path();
    print!("  config ... ");
    std::io::stdout().flush().ok();
    if config_path.exists() {
        println!("ok");
    } else {
        println!("using defaults");
    }
    println!("    path: {}", config_path.display());

    println!();
    Ok(())
}

pub fn cmd_config() -> anyhow::Result<()> {
    let config_path = get_config_path();

    if !config_path.exists() {
        save_config(&Config::default(), &config_path)?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = Command::new(&editor)
        .arg(&config_path)
        .status()
        .with_context(|| format!("could not start editor '{}'", editor))?;
    if !status.success() {
        anyhow::bail!("editor '{}' exited with {}", editor, status);
    }
    Ok(())
}

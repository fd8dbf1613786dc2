use crate::error::{PleaseError, Result};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, fmt, path::PathBuf, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    PowerShell,
    Bash,
    Command,
    Python,
    /// Let the platform decide (PowerShell on Windows, Bash elsewhere).
    Auto,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::PowerShell => "powershell",
            ScriptType::Bash => "bash",
            ScriptType::Command => "command",
            ScriptType::Python => "python",
            ScriptType::Auto => "auto",
        }
    }

    pub fn resolve(self) -> ScriptType {
        match self {
            ScriptType::Auto if cfg!(windows) => ScriptType::PowerShell,
            ScriptType::Auto => ScriptType::Bash,
            other => other,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ScriptType::PowerShell => "PowerShell",
            ScriptType::Bash => "Bash",
            ScriptType::Command => "Windows Command Prompt (batch)",
            ScriptType::Python => "Python",
            ScriptType::Auto => "shell",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = PleaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "powershell" | "pwsh" | "ps1" => Ok(ScriptType::PowerShell),
            "bash" | "sh" => Ok(ScriptType::Bash),
            "command" | "cmd" | "batch" => Ok(ScriptType::Command),
            "python" | "py" => Ok(ScriptType::Python),
            "auto" | "" => Ok(ScriptType::Auto),
            other => Err(PleaseError::Configuration(format!(
                "unknown script type '{}'",
                other
            ))),
        }
    }
}

/// Ordered by severity: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = PleaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(PleaseError::storage(format!("unknown risk level '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptId(Uuid);

impl ScriptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScriptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScriptId {
    type Err = PleaseError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(ScriptId)
            .map_err(|e| PleaseError::storage(format!("invalid script id '{}': {}", s, e)))
    }
}

/// One generation ask. Built with [`ScriptRequest::new`] and the `with_*`
/// builders; never changes afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
    task_description: String,
    provider: Option<String>,
    model: Option<String>,
    script_type: ScriptType,
    requested_at: DateTime<Utc>,
    working_directory: Option<PathBuf>,
    force_execution: bool,
    additional_parameters: HashMap<String, String>,
}

impl ScriptRequest {
    pub fn new(task_description: impl AsRef<str>) -> Result<Self> {
        let task = task_description.as_ref().trim();
        if task.is_empty() {
            return Err(PleaseError::EmptyTask);
        }
        Ok(Self {
            task_description: task.to_string(),
            provider: None,
            model: None,
            script_type: ScriptType::Auto,
            requested_at: Utc::now(),
            working_directory: None,
            force_execution: false,
            additional_parameters: HashMap::new(),
        })
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = non_blank(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = non_blank(model.into());
        self
    }

    pub fn with_script_type(mut self, script_type: ScriptType) -> Self {
        self.script_type = script_type;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_force_execution(mut self, force: bool) -> Self {
        self.force_execution = force;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_parameters.insert(key.into(), value.into());
        self
    }

    pub fn task_description(&self) -> &str {
        &self.task_description
    }

    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn working_directory(&self) -> Option<&PathBuf> {
        self.working_directory.as_ref()
    }

    pub fn force_execution(&self) -> bool {
        self.force_execution
    }

    pub fn additional_parameters(&self) -> &HashMap<String, String> {
        &self.additional_parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.additional_parameters.get(key).map(String::as_str)
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// A completed generation.
///
/// Annotations only accumulate: the `with_*` methods consume the value and
/// return a new one with the same identity, so a response handed to a caller
/// can never change under them.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptResponse {
    id: ScriptId,
    script: String,
    task_description: String,
    provider: String,
    model: String,
    script_type: ScriptType,
    created_at: DateTime<Utc>,
    risk_level: RiskLevel,
    warnings: Vec<String>,
    safety_notes: Vec<String>,
    explanation: Option<String>,
}

/// Field-by-field form used when reloading a response from storage.
pub(crate) struct ResponseParts {
    pub id: ScriptId,
    pub script: String,
    pub task_description: String,
    pub provider: String,
    pub model: String,
    pub script_type: ScriptType,
    pub created_at: DateTime<Utc>,
    pub risk_level: RiskLevel,
    pub warnings: Vec<String>,
    pub safety_notes: Vec<String>,
    pub explanation: Option<String>,
}

impl ScriptResponse {
    /// Fresh, unassessed response: risk `Low`, no warnings, no notes.
    pub fn new(
        script: impl Into<String>,
        task_description: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        script_type: ScriptType,
    ) -> Result<Self> {
        Self::from_parts(ResponseParts {
            id: ScriptId::new(),
            script: script.into(),
            task_description: task_description.into(),
            provider: provider.into(),
            model: model.into(),
            script_type,
            created_at: Utc::now(),
            risk_level: RiskLevel::Low,
            warnings: Vec::new(),
            safety_notes: Vec::new(),
            explanation: None,
        })
    }

    pub(crate) fn from_parts(parts: ResponseParts) -> Result<Self> {
        if parts.script.trim().is_empty() {
            return Err(PleaseError::InvalidResponse("script text is empty"));
        }
        if parts.task_description.trim().is_empty() {
            return Err(PleaseError::InvalidResponse("task description is empty"));
        }
        if parts.model.trim().is_empty() {
            return Err(PleaseError::InvalidResponse("model name is empty"));
        }
        Ok(Self {
            id: parts.id,
            script: parts.script,
            task_description: parts.task_description,
            provider: parts.provider,
            model: parts.model,
            script_type: parts.script_type,
            created_at: parts.created_at,
            risk_level: parts.risk_level,
            warnings: parts.warnings,
            safety_notes: parts.safety_notes,
            explanation: parts.explanation,
        })
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_warnings<I, S>(mut self, warnings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warnings.extend(warnings.into_iter().map(Into::into));
        self
    }

    pub fn with_safety_note(mut self, note: impl Into<String>) -> Self {
        self.safety_notes.push(note.into());
        self
    }

    pub fn with_safety_notes<I, S>(mut self, notes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safety_notes.extend(notes.into_iter().map(Into::into));
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = non_blank(explanation.into());
        self
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn task_description(&self) -> &str {
        &self.task_description
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.risk_level
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn safety_notes(&self) -> &[String] {
        &self.safety_notes
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn requires_confirmation(&self) -> bool {
        self.risk_level >= RiskLevel::Medium || !self.warnings.is_empty()
    }

    pub fn is_dangerous(&self) -> bool {
        self.risk_level >= RiskLevel::High
    }
}

/// A raw user command before any context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandIntent {
    pub command_text: String,
}

impl CommandIntent {
    pub fn new(command_text: impl Into<String>) -> Self {
        Self {
            command_text: command_text.into(),
        }
    }
}

/// Per-invocation enrichment for a request; never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub working_directory: PathBuf,
    pub similar_request: Option<String>,
}

/// A processed command, kept so later requests can find similar ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecution {
    pub command_text: String,
    pub executed_at: DateTime<Utc>,
}

impl CommandExecution {
    pub fn new(command_text: impl Into<String>) -> Self {
        Self {
            command_text: command_text.into(),
            executed_at: Utc::now(),
        }
    }
}

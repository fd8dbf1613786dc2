use crate::db::{self, Database};
use crate::error::{PleaseError, Result};
use crate::types::{CommandContext, CommandExecution, CommandIntent};
use async_trait::async_trait;
use std::{collections::HashMap, path::PathBuf};

/// Recent patterns scanned when looking for a similar earlier request.
const PATTERN_WINDOW: usize = 200;
/// Minimum cosine score for an earlier request to count as similar.
const SIMILARITY_THRESHOLD: f32 = 0.5;

#[async_trait]
pub trait ContextService: Send + Sync {
    async fn get_context(&self, intent: &CommandIntent) -> Result<CommandContext>;

    async fn store_pattern(&self, execution: &CommandExecution) -> Result<()>;
}

/// Context drawn from the working directory and earlier requests stored in
/// the history database.
#[derive(Clone)]
pub struct HistoryContextService {
    db: Database,
    working_directory: Option<PathBuf>,
}

impl HistoryContextService {
    pub fn new(db: Database, working_directory: Option<PathBuf>) -> Self {
        Self {
            db,
            working_directory,
        }
    }

    fn resolve_working_directory(&self) -> Result<PathBuf> {
        match &self.working_directory {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir().map_err(|e| {
                PleaseError::Context(format!("could not determine working directory: {}", e))
            }),
        }
    }
}

#[async_trait]
impl ContextService for HistoryContextService {
    async fn get_context(&self, intent: &CommandIntent) -> Result<CommandContext> {
        let working_directory = self.resolve_working_directory()?;
        let patterns = self
            .db
            .call(|conn| db::load_recent_patterns(conn, PATTERN_WINDOW))
            .await
            .map_err(|e| PleaseError::Context(format!("could not read past requests: {}", e)))?;

        let similar_request = most_similar(&intent.command_text, &patterns);
        if let Some(similar) = &similar_request {
            tracing::debug!(similar = %similar, "found similar earlier request");
        }

        Ok(CommandContext {
            working_directory,
            similar_request,
        })
    }

    async fn store_pattern(&self, execution: &CommandExecution) -> Result<()> {
        let execution = execution.clone();
        self.db
            .call(move |conn| db::insert_pattern(conn, &execution))
            .await
    }
}

fn term_counts(text: &str) -> HashMap<String, f32> {
    let mut counts = HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
    {
        *counts.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
    }
    counts
}

fn cosine_similarity(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .filter_map(|(term, x)| b.get(term).map(|y| x * y))
        .sum();
    let norm_a: f32 = a.values().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|x| x * x).sum::<f32>().sqrt();
    dot / (norm_a * norm_b)
}

/// Best-scoring earlier request above the threshold. Exact repeats are
/// skipped since they add nothing to the prompt; ties go to the newest.
fn most_similar(query: &str, patterns: &[CommandExecution]) -> Option<String> {
    let query_terms = term_counts(query);
    let normalized = query.trim().to_lowercase();

    let mut best: Option<(f32, &CommandExecution)> = None;
    for pattern in patterns {
        if pattern.command_text.trim().to_lowercase() == normalized {
            continue;
        }
        let score = cosine_similarity(&query_terms, &term_counts(&pattern.command_text));
        if score < SIMILARITY_THRESHOLD {
            continue;
        }
        if best.map_or(true, |(top, _)| score > top) {
            best = Some((score, pattern));
        }
    }
    best.map(|(_, pattern)| pattern.command_text.clone())
}

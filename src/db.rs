use crate::error::{PleaseError, Result};
use crate::types::{CommandExecution, ResponseParts, ScriptResponse};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const APP_NAME: &str = "please";

fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn get_db_path() -> PathBuf {
    get_data_dir().join("history.db")
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scripts (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            script TEXT NOT NULL,
            task TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            script_type TEXT NOT NULL,
            created_at TEXT NOT NULL,
            risk_level TEXT NOT NULL,
            warnings TEXT NOT NULL,
            safety_notes TEXT NOT NULL,
            explanation TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS scripts_created_at ON scripts (created_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS patterns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            command TEXT NOT NULL,
            executed_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// RFC 3339 with nanoseconds and a `Z` suffix: fixed width, so text order
/// matches time order and the value round-trips exactly.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PleaseError::storage(format!("invalid timestamp '{}': {}", raw, e)))
}

pub fn insert_script(conn: &Connection, response: &ScriptResponse) -> Result<()> {
    let warnings = serde_json::to_string(response.warnings()).map_err(PleaseError::storage)?;
    let notes = serde_json::to_string(response.safety_notes()).map_err(PleaseError::storage)?;

    conn.execute(
        "INSERT INTO scripts (id, script, task, provider, model, script_type, created_at, risk_level, warnings, safety_notes, explanation)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            response.id().to_string(),
            response.script(),
            response.task_description(),
            response.provider(),
            response.model(),
            response.script_type().as_str(),
            format_timestamp(response.created_at()),
            response.risk_level().as_str(),
            warnings,
            notes,
            response.explanation(),
        ],
    )?;
    Ok(())
}

struct ScriptRow {
    id: String,
    script: String,
    task: String,
    provider: String,
    model: String,
    script_type: String,
    created_at: String,
    risk_level: String,
    warnings: String,
    safety_notes: String,
    explanation: Option<String>,
}

const SCRIPT_COLUMNS: &str = "id, script, task, provider, model, script_type, created_at, risk_level, warnings, safety_notes, explanation";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScriptRow> {
    Ok(ScriptRow {
        id: row.get(0)?,
        script: row.get(1)?,
        task: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        script_type: row.get(5)?,
        created_at: row.get(6)?,
        risk_level: row.get(7)?,
        warnings: row.get(8)?,
        safety_notes: row.get(9)?,
        explanation: row.get(10)?,
    })
}

impl TryFrom<ScriptRow> for ScriptResponse {
    type Error = PleaseError;

    fn try_from(row: ScriptRow) -> Result<Self> {
        let list = |raw: &str| -> Result<Vec<String>> {
            serde_json::from_str(raw).map_err(PleaseError::storage)
        };
        ScriptResponse::from_parts(ResponseParts {
            id: row.id.parse()?,
            warnings: list(&row.warnings)?,
            safety_notes: list(&row.safety_notes)?,
            script_type: row.script_type.parse()?,
            created_at: parse_timestamp(&row.created_at)?,
            risk_level: row.risk_level.parse()?,
            script: row.script,
            task_description: row.task,
            provider: row.provider,
            model: row.model,
            explanation: row.explanation,
        })
    }
}

pub fn load_last_script(conn: &Connection) -> Result<Option<ScriptResponse>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM scripts ORDER BY created_at DESC, seq DESC LIMIT 1",
                SCRIPT_COLUMNS
            ),
            [],
            read_row,
        )
        .optional()?;
    row.map(ScriptResponse::try_from).transpose()
}

/// Newest first; `since` filters on creation time, then `count` caps the
/// number returned.
pub fn load_history(
    conn: &Connection,
    count: Option<usize>,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<ScriptResponse>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM scripts WHERE created_at >= ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2",
        SCRIPT_COLUMNS
    ))?;

    let lower_bound = since.map(format_timestamp).unwrap_or_default();
    let limit = count.map(|c| c as i64).unwrap_or(-1);

    let rows = stmt
        .query_map(params![lower_bound, limit], read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(ScriptResponse::try_from).collect()
}

pub fn clear_scripts(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM scripts", [])?;
    Ok(())
}

pub fn get_script_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM scripts", [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

pub fn insert_pattern(conn: &Connection, execution: &CommandExecution) -> Result<()> {
    conn.execute(
        "INSERT INTO patterns (command, executed_at) VALUES (?1, ?2)",
        params![execution.command_text, format_timestamp(execution.executed_at)],
    )?;
    Ok(())
}

pub fn load_recent_patterns(conn: &Connection, limit: usize) -> Result<Vec<CommandExecution>> {
    let mut stmt = conn.prepare(
        "SELECT command, executed_at FROM patterns ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(command_text, executed_at)| {
            Ok(CommandExecution {
                command_text,
                executed_at: parse_timestamp(&executed_at)?,
            })
        })
        .collect()
}

/// Shared, serialised access to the history database from async code.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(PleaseError::storage)?;
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` on the blocking pool while holding the connection lock.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PleaseError::storage("history database lock poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| PleaseError::storage(format!("history task failed: {}", e)))?
    }
}

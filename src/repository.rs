use crate::db::{self, Database};
use crate::error::Result;
use crate::types::ScriptResponse;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Append-only store of generated scripts.
#[async_trait]
pub trait ScriptRepository: Send + Sync {
    async fn save_script(&self, response: &ScriptResponse) -> Result<()>;

    /// The most recently created script, if any.
    async fn get_last_script(&self) -> Result<Option<ScriptResponse>>;

    /// Newest first. `since` drops older entries before `count` caps the rest.
    async fn get_script_history(
        &self,
        count: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScriptResponse>>;

    async fn clear_history(&self) -> Result<()>;

    /// False when the store is empty or cannot be read.
    async fn has_history(&self) -> bool;
}

#[derive(Clone)]
pub struct SqliteScriptRepository {
    db: Database,
}

impl SqliteScriptRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ScriptRepository for SqliteScriptRepository {
    async fn save_script(&self, response: &ScriptResponse) -> Result<()> {
        let response = response.clone();
        self.db
            .call(move |conn| db::insert_script(conn, &response))
            .await?;
        tracing::debug!("script saved to history");
        Ok(())
    }

    async fn get_last_script(&self) -> Result<Option<ScriptResponse>> {
        self.db.call(db::load_last_script).await
    }

    async fn get_script_history(
        &self,
        count: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ScriptResponse>> {
        self.db
            .call(move |conn| db::load_history(conn, count, since))
            .await
    }

    async fn clear_history(&self) -> Result<()> {
        self.db.call(db::clear_scripts).await?;
        tracing::info!("script history cleared");
        Ok(())
    }

    async fn has_history(&self) -> bool {
        match self.db.call(db::get_script_count).await {
            Ok(count) => count > 0,
            Err(e) => {
                tracing::warn!(error = %e, "could not read script history");
                false
            }
        }
    }
}

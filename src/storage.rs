//! Persistence boundary for runs, executions and definitions
//!
//! This module provides:
//! - `RunRepository` trait for durable run and execution records
//! - `DefinitionSource` trait for read-only definition lookup
//! - In-memory implementations of both
//! - SQLite backend (feature `storage`) with migrations and cascade delete

use crate::error::{Error, Result};
use crate::orchestrator::definition::OrchestrationDefinition;
use crate::run::{AgentExecution, OrchestrationRun};
use crate::types::{DefinitionId, RunId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable store for run and execution records
///
/// Writes for one record arrive in order. Deleting a run must delete every
/// execution that belongs to it.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or replace a run record
    async fn save_run(&self, run: &OrchestrationRun) -> Result<()>;

    /// Insert or replace an execution record; its run must exist
    async fn save_execution(&self, execution: &AgentExecution) -> Result<()>;

    /// Load a run
    async fn get_run(&self, run_id: RunId) -> Result<Option<OrchestrationRun>>;

    /// Load all executions of a run, ordered by step index
    async fn list_executions(&self, run_id: RunId) -> Result<Vec<AgentExecution>>;

    /// List runs, newest first, optionally restricted to one definition
    async fn list_runs(&self, definition_id: Option<DefinitionId>) -> Result<Vec<OrchestrationRun>>;

    /// Delete a run and all of its executions; returns whether the run existed
    async fn delete_run(&self, run_id: RunId) -> Result<bool>;
}

/// Read-only lookup of saved definitions
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Load a definition by ID
    async fn read_definition(&self, id: DefinitionId) -> Result<Option<OrchestrationDefinition>>;
}

fn sort_executions(executions: &mut [AgentExecution]) {
    executions.sort_by(|a, b| {
        a.step_index
            .cmp(&b.step_index)
            .then_with(|| a.started_at.cmp(&b.started_at))
    });
}

/// In-memory run repository
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, RunEntry>>,
}

struct RunEntry {
    run: OrchestrationRun,
    executions: Vec<AgentExecution>,
}

impl InMemoryRunStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunStore {
    async fn save_run(&self, run: &OrchestrationRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.id) {
            Some(entry) => entry.run = run.clone(),
            None => {
                runs.insert(
                    run.id,
                    RunEntry {
                        run: run.clone(),
                        executions: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn save_execution(&self, execution: &AgentExecution) -> Result<()> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(&execution.run_id).ok_or_else(|| {
            Error::storage(format!(
                "execution {} references unknown run {}",
                execution.id, execution.run_id
            ))
        })?;

        match entry.executions.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) => *existing = execution.clone(),
            None => entry.executions.push(execution.clone()),
        }
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<OrchestrationRun>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&run_id).map(|entry| entry.run.clone()))
    }

    async fn list_executions(&self, run_id: RunId) -> Result<Vec<AgentExecution>> {
        let runs = self.runs.read().await;
        let mut executions = runs
            .get(&run_id)
            .map(|entry| entry.executions.clone())
            .unwrap_or_default();
        sort_executions(&mut executions);
        Ok(executions)
    }

    async fn list_runs(&self, definition_id: Option<DefinitionId>) -> Result<Vec<OrchestrationRun>> {
        let runs = self.runs.read().await;
        let mut listed: Vec<OrchestrationRun> = runs
            .values()
            .filter(|entry| definition_id.is_none() || entry.run.definition_id == definition_id)
            .map(|entry| entry.run.clone())
            .collect();
        listed.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(listed)
    }

    async fn delete_run(&self, run_id: RunId) -> Result<bool> {
        let mut runs = self.runs.write().await;
        Ok(runs.remove(&run_id).is_some())
    }
}

/// In-memory definition catalogue
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    definitions: RwLock<HashMap<DefinitionId, OrchestrationDefinition>>,
}

impl InMemoryDefinitionStore {
    /// Create an empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a definition, assigning an ID when it has none
    pub async fn insert(&self, mut definition: OrchestrationDefinition) -> DefinitionId {
        let id = *definition.id.get_or_insert_with(DefinitionId::new);
        self.definitions.write().await.insert(id, definition);
        id
    }

    /// Remove a definition
    pub async fn remove(&self, id: DefinitionId) -> Option<OrchestrationDefinition> {
        self.definitions.write().await.remove(&id)
    }
}

#[async_trait]
impl DefinitionSource for InMemoryDefinitionStore {
    async fn read_definition(&self, id: DefinitionId) -> Result<Option<OrchestrationDefinition>> {
        Ok(self.definitions.read().await.get(&id).cloned())
    }
}

#[cfg(feature = "storage")]
pub use sqlite::SqliteRunStore;

#[cfg(feature = "storage")]
mod sqlite {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::{Pool, Row, Sqlite};

    /// SQLite run repository
    ///
    /// Records are stored as JSON documents next to the columns used for
    /// lookups.
    pub struct SqliteRunStore {
        pool: Pool<Sqlite>,
    }

    impl SqliteRunStore {
        /// Connect to a SQLite database and run migrations
        pub async fn new(database_url: &str) -> Result<Self> {
            let pool = sqlx::SqlitePool::connect(database_url)
                .await
                .map_err(|e| Error::storage(format!("Failed to connect to SQLite: {}", e)))?;
            Self::with_pool(pool).await
        }

        /// Private in-memory database on a single connection
        pub async fn in_memory() -> Result<Self> {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await
                .map_err(|e| Error::storage(format!("Failed to open in-memory SQLite: {}", e)))?;
            Self::with_pool(pool).await
        }

        async fn with_pool(pool: Pool<Sqlite>) -> Result<Self> {
            let store = Self { pool };
            store.run_migrations().await?;
            Ok(store)
        }

        async fn run_migrations(&self) -> Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS orchestration_runs (
                    id TEXT PRIMARY KEY,
                    definition_id TEXT,
                    status TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    body TEXT NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to create orchestration_runs table: {}", e)))?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS agent_executions (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL,
                    step_index INTEGER NOT NULL,
                    started_at TEXT,
                    body TEXT NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to create agent_executions table: {}", e)))?;

            sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_run ON agent_executions(run_id)")
                .execute(&self.pool)
                .await
                .map_err(|e| Error::storage(format!("Failed to create index: {}", e)))?;

            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_runs_definition ON orchestration_runs(definition_id)",
            )
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to create index: {}", e)))?;

            Ok(())
        }
    }

    #[async_trait]
    impl RunRepository for SqliteRunStore {
        async fn save_run(&self, run: &OrchestrationRun) -> Result<()> {
            let body = serde_json::to_string(run)?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO orchestration_runs (id, definition_id, status, started_at, body)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(run.id.to_string())
            .bind(run.definition_id.map(|id| id.to_string()))
            .bind(run.status.as_str())
            .bind(run.started_at.to_rfc3339())
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to save run: {}", e)))?;

            Ok(())
        }

        async fn save_execution(&self, execution: &AgentExecution) -> Result<()> {
            let exists = sqlx::query("SELECT 1 FROM orchestration_runs WHERE id = ?")
                .bind(execution.run_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::storage(format!("Failed to look up run: {}", e)))?;
            if exists.is_none() {
                return Err(Error::storage(format!(
                    "execution {} references unknown run {}",
                    execution.id, execution.run_id
                )));
            }

            let body = serde_json::to_string(execution)?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO agent_executions (id, run_id, step_index, started_at, body)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(execution.id.to_string())
            .bind(execution.run_id.to_string())
            .bind(execution.step_index as i64)
            .bind(execution.started_at.map(|t| t.to_rfc3339()))
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to save execution: {}", e)))?;

            Ok(())
        }

        async fn get_run(&self, run_id: RunId) -> Result<Option<OrchestrationRun>> {
            let row = sqlx::query("SELECT body FROM orchestration_runs WHERE id = ?")
                .bind(run_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::storage(format!("Failed to load run: {}", e)))?;

            match row {
                Some(row) => {
                    let body: String = row.get(0);
                    Ok(Some(serde_json::from_str(&body)?))
                }
                None => Ok(None),
            }
        }

        async fn list_executions(&self, run_id: RunId) -> Result<Vec<AgentExecution>> {
            let rows = sqlx::query(
                "SELECT body FROM agent_executions WHERE run_id = ? ORDER BY step_index, started_at",
            )
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::storage(format!("Failed to load executions: {}", e)))?;

            rows.iter()
                .map(|row| {
                    let body: String = row.get(0);
                    serde_json::from_str(&body).map_err(Error::from)
                })
                .collect()
        }

        async fn list_runs(
            &self,
            definition_id: Option<DefinitionId>,
        ) -> Result<Vec<OrchestrationRun>> {
            let rows = match definition_id {
                Some(id) => {
                    sqlx::query(
                        "SELECT body FROM orchestration_runs WHERE definition_id = ? ORDER BY started_at DESC",
                    )
                    .bind(id.to_string())
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query("SELECT body FROM orchestration_runs ORDER BY started_at DESC")
                        .fetch_all(&self.pool)
                        .await
                }
            }
            .map_err(|e| Error::storage(format!("Failed to list runs: {}", e)))?;

            rows.iter()
                .map(|row| {
                    let body: String = row.get(0);
                    serde_json::from_str(&body).map_err(Error::from)
                })
                .collect()
        }

        async fn delete_run(&self, run_id: RunId) -> Result<bool> {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| Error::storage(format!("Failed to begin transaction: {}", e)))?;

            sqlx::query("DELETE FROM agent_executions WHERE run_id = ?")
                .bind(run_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::storage(format!("Failed to delete executions: {}", e)))?;

            let deleted = sqlx::query("DELETE FROM orchestration_runs WHERE id = ?")
                .bind(run_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::storage(format!("Failed to delete run: {}", e)))?;

            tx.commit()
                .await
                .map_err(|e| Error::storage(format!("Failed to commit delete: {}", e)))?;

            Ok(deleted.rows_affected() > 0)
        }
    }
}

//! SQLite-backed sandbox registry.
//!
//! The registry is the durable record of every sandbox the harness has
//! provisioned. Rows are written before the backend call that creates the
//! real resource and updated on every state change, so a crashed run can be
//! reconciled later: any row not yet terminated names a sandbox that may
//! still be running somewhere.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::lifecycle::SandboxState;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Connection to the registry database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Row not found.
    #[error("Sandbox not found in registry: {0}")]
    NotFound(Uuid),

    /// A stored value could not be parsed back.
    #[error("Corrupt registry row: {0}")]
    Corrupt(String),
}

/// One registered sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRow {
    /// Harness-side sandbox identifier.
    pub id: Uuid,
    /// Task this sandbox was provisioned for.
    pub task_id: Uuid,
    /// Which backend owns the real resource.
    pub backend: BackendKind,
    /// Backend-native identifier, empty until provisioning returns one.
    pub external_id: String,
    /// Last recorded lifecycle state.
    pub state: SandboxState,
    /// Which attempt of the task this sandbox served, first attempt = 1.
    pub attempt: u32,
    /// When the row was first written.
    pub created_at: DateTime<Utc>,
    /// When the row was last updated.
    pub updated_at: DateTime<Utc>,
}

impl SandboxRow {
    /// Creates a row for a sandbox that is about to be provisioned.
    pub fn new(id: Uuid, task_id: Uuid, backend: BackendKind, state: SandboxState) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_id,
            backend,
            external_id: String::new(),
            state,
            attempt: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the backend-native identifier.
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = external_id.into();
        self
    }

    /// Sets the attempt number this sandbox serves.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// SQLite client for the sandbox registry.
pub struct SandboxRegistry {
    pool: SqlitePool,
}

impl SandboxRegistry {
    /// Opens (or creates) the registry at the given SQLite URL or path.
    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| RegistryError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| RegistryError::ConnectionFailed(e.to_string()))?;

        let registry = Self { pool };
        registry.ensure_schema().await?;
        Ok(registry)
    }

    /// Opens an in-memory registry that lives as long as the pool.
    pub async fn in_memory() -> Result<Self, RegistryError> {
        // A second connection would see a different empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| RegistryError::ConnectionFailed(e.to_string()))?;

        let registry = Self { pool };
        registry.ensure_schema().await?;
        Ok(registry)
    }

    /// Creates a registry from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the registry schema when missing.
    pub async fn ensure_schema(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sandboxes (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                backend TEXT NOT NULL,
                external_id TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sandboxes_state ON sandboxes(state)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Inserts or replaces a sandbox row.
    pub async fn save(&self, row: &SandboxRow) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO sandboxes
                (id, task_id, backend, external_id, state, attempt, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                external_id = excluded.external_id,
                state = excluded.state,
                attempt = excluded.attempt,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.id.to_string())
        .bind(row.task_id.to_string())
        .bind(row.backend.to_string())
        .bind(&row.external_id)
        .bind(row.state.to_string())
        .bind(row.attempt)
        .bind(row.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Updates the recorded state of a sandbox.
    pub async fn update_state(&self, id: Uuid, state: SandboxState) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE sandboxes SET state = $1, updated_at = $2 WHERE id = $3")
            .bind(state.to_string())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }

        Ok(())
    }

    /// Fetches one sandbox row, if present.
    pub async fn get(&self, id: Uuid) -> Result<Option<SandboxRow>, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT id, task_id, backend, external_id, state, attempt, created_at, updated_at
            FROM sandboxes
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Self::parse_row(&r)?)),
            None => Ok(None),
        }
    }

    /// Lists every sandbox row, oldest first.
    pub async fn all(&self) -> Result<Vec<SandboxRow>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, backend, external_id, state, attempt, created_at, updated_at
            FROM sandboxes
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Self::parse_row(&row)?);
        }
        Ok(records)
    }

    /// Lists every sandbox not yet confirmed terminated, oldest first.
    pub async fn live(&self) -> Result<Vec<SandboxRow>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, task_id, backend, external_id, state, attempt, created_at, updated_at
            FROM sandboxes
            WHERE state != $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(SandboxState::Terminated.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Self::parse_row(&row)?);
        }
        Ok(records)
    }

    /// Deletes rows that reached a terminated state before `cutoff`.
    pub async fn prune_terminated(&self, cutoff: DateTime<Utc>) -> Result<u64, RegistryError> {
        let result = sqlx::query("DELETE FROM sandboxes WHERE state = $1 AND updated_at < $2")
            .bind(SandboxState::Terminated.to_string())
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    fn parse_row(row: &SqliteRow) -> Result<SandboxRow, RegistryError> {
        let id: String = row.get("id");
        let task_id: String = row.get("task_id");
        let backend: String = row.get("backend");
        let state: String = row.get("state");
        let attempt: i64 = row.get("attempt");

        Ok(SandboxRow {
            id: Uuid::parse_str(&id)
                .map_err(|e| RegistryError::Corrupt(format!("id {:?}: {}", id, e)))?,
            task_id: Uuid::parse_str(&task_id)
                .map_err(|e| RegistryError::Corrupt(format!("task_id {:?}: {}", task_id, e)))?,
            backend: backend
                .parse::<BackendKind>()
                .map_err(|e| RegistryError::Corrupt(format!("backend {:?}: {}", backend, e)))?,
            external_id: row.get("external_id"),
            state: state
                .parse::<SandboxState>()
                .map_err(|e| RegistryError::Corrupt(format!("state {:?}: {}", state, e)))?,
            attempt: u32::try_from(attempt)
                .map_err(|e| RegistryError::Corrupt(format!("attempt {}: {}", attempt, e)))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

//! Database connection pool and the store contract the pipeline consumes.
//!
//! An analysis record is written by exactly one writer: created Pending by
//! the dispatcher, finalised once by the worker in a single update that
//! commits all tool runs and the terminal status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::analysis::{Analysis, AnalysisStatus, ToolRun};
use crate::models::tool::Tool;

/// Create a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// The persistence surface used by the dispatcher, the worker and the
/// dashboard.
#[async_trait]
pub trait Store: Send + Sync {
    /// Create a Pending analysis and return it (the id goes into status
    /// URLs immediately).
    async fn start_analysis(
        &self,
        installation_id: i64,
        repo_id: i64,
    ) -> Result<Analysis, StoreError>;

    /// Commit the terminal status, durations, commit range, request number
    /// and every tool run in one update.
    async fn finalise_analysis(&self, analysis: &Analysis) -> Result<(), StoreError>;

    /// Fetch an analysis; `None` is the distinguishable not-found answer
    /// for dashboard requests.
    async fn analysis(&self, id: Uuid) -> Result<Option<Analysis>, StoreError>;

    /// Configured tools, in configuration order.
    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError>;

    async fn record_installation(
        &self,
        installation_id: i64,
        account: &str,
    ) -> Result<(), StoreError>;

    async fn remove_installation(&self, installation_id: i64) -> Result<(), StoreError>;
}

/// PostgreSQL-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Raw `analyses` row before status and tool-run decoding.
#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: Uuid,
    installation_id: i64,
    repo_id: i64,
    status: String,
    created_at: DateTime<Utc>,
    clone_duration_ms: Option<i64>,
    deps_duration_ms: Option<i64>,
    total_duration_ms: Option<i64>,
    commit_from: Option<String>,
    commit_to: Option<String>,
    request_number: Option<i64>,
    tool_runs: serde_json::Value,
}

impl TryFrom<AnalysisRow> for Analysis {
    type Error = StoreError;

    fn try_from(row: AnalysisRow) -> Result<Self, StoreError> {
        let status: AnalysisStatus = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))?;
        let tool_runs: Vec<ToolRun> = serde_json::from_value(row.tool_runs)
            .map_err(|e| StoreError::Corrupt(format!("tool_runs: {e}")))?;
        Ok(Analysis {
            id: row.id,
            installation_id: row.installation_id,
            repo_id: row.repo_id,
            status,
            created_at: row.created_at,
            clone_duration_ms: row.clone_duration_ms.map(|ms| ms as u64),
            deps_duration_ms: row.deps_duration_ms.map(|ms| ms as u64),
            total_duration_ms: row.total_duration_ms.map(|ms| ms as u64),
            commit_from: row.commit_from,
            commit_to: row.commit_to,
            request_number: row.request_number,
            tool_runs,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn start_analysis(
        &self,
        installation_id: i64,
        repo_id: i64,
    ) -> Result<Analysis, StoreError> {
        let analysis = Analysis::pending(Uuid::new_v4(), installation_id, repo_id);
        sqlx::query(
            r#"
            INSERT INTO analyses (id, installation_id, repo_id, status, created_at, tool_runs)
            VALUES ($1, $2, $3, $4, $5, '[]'::jsonb)
            "#,
        )
        .bind(analysis.id)
        .bind(analysis.installation_id)
        .bind(analysis.repo_id)
        .bind(analysis.status.as_str())
        .bind(analysis.created_at)
        .execute(&self.pool)
        .await?;
        Ok(analysis)
    }

    async fn finalise_analysis(&self, analysis: &Analysis) -> Result<(), StoreError> {
        let tool_runs = serde_json::to_value(&analysis.tool_runs)
            .map_err(|e| StoreError::Corrupt(format!("tool_runs: {e}")))?;
        sqlx::query(
            r#"
            UPDATE analyses
            SET status = $2,
                clone_duration_ms = $3,
                deps_duration_ms = $4,
                total_duration_ms = $5,
                commit_from = $6,
                commit_to = $7,
                request_number = $8,
                tool_runs = $9
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(analysis.id)
        .bind(analysis.status.as_str())
        .bind(analysis.clone_duration_ms.map(|ms| ms as i64))
        .bind(analysis.deps_duration_ms.map(|ms| ms as i64))
        .bind(analysis.total_duration_ms.map(|ms| ms as i64))
        .bind(&analysis.commit_from)
        .bind(&analysis.commit_to)
        .bind(analysis.request_number)
        .bind(&tool_runs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn analysis(&self, id: Uuid) -> Result<Option<Analysis>, StoreError> {
        let row = sqlx::query_as::<_, AnalysisRow>(
            r#"
            SELECT id, installation_id, repo_id, status, created_at,
                   clone_duration_ms, deps_duration_ms, total_duration_ms,
                   commit_from, commit_to, request_number, tool_runs
            FROM analyses
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Analysis::try_from).transpose()
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, StoreError> {
        let tools = sqlx::query_as::<_, Tool>(
            "SELECT id, name, url, path, args FROM tools ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tools)
    }

    async fn record_installation(
        &self,
        installation_id: i64,
        account: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO installations (installation_id, account_login, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (installation_id) DO UPDATE SET account_login = $2
            "#,
        )
        .bind(installation_id)
        .bind(account)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_installation(&self, installation_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM installations WHERE installation_id = $1")
            .bind(installation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

//! SQLite-backed engine store

use crate::core::{
    LoopItem, LoopItemStatus, LoopState, PipelineRun, RunStatus, StepExecution, StepStatus,
};
use crate::store::EngineStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

/// SQLite engine store
pub struct SqliteEngineStore {
    pool: SqlitePool,
}

impl SqliteEngineStore {
    /// Create a new SQLite store
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = SqlitePool::connect(&format!("sqlite:{}", db_path))
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("conductor");
        std::fs::create_dir_all(&db_dir)?;

        let db_path = db_dir.join("runs.db");
        Self::new(db_path.to_str().unwrap()).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                project_id TEXT,
                task_branch TEXT,
                user_id TEXT,
                status TEXT NOT NULL,
                task_description TEXT NOT NULL DEFAULT '',
                current_step_id TEXT,
                human_context TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS step_executions (
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                session_id TEXT,
                inputs TEXT,
                outputs TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                human_context TEXT,
                started_at TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (run_id, step_id)
            );

            CREATE TABLE IF NOT EXISTS run_outputs (
                run_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (run_id, key)
            );

            CREATE TABLE IF NOT EXISTS loop_states (
                run_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                current_index INTEGER NOT NULL DEFAULT 0,
                items TEXT NOT NULL,
                PRIMARY KEY (run_id, step_id)
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_id);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_steps_run ON step_executions(run_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn run_status_str(status: RunStatus) -> &'static str {
        match status {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
            RunStatus::Cancelled => "Cancelled",
        }
    }

    fn run_status_from_str(status: &str) -> RunStatus {
        match status {
            "Running" => RunStatus::Running,
            "Completed" => RunStatus::Completed,
            "Failed" => RunStatus::Failed,
            "Cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Pending,
        }
    }

    fn step_status_str(status: StepStatus) -> &'static str {
        match status {
            StepStatus::Queued => "Queued",
            StepStatus::Running => "Running",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Cancelled => "Cancelled",
            StepStatus::Retrying => "Retrying",
        }
    }

    fn step_status_from_str(status: &str) -> StepStatus {
        match status {
            "Running" => StepStatus::Running,
            "Completed" => StepStatus::Completed,
            "Failed" => StepStatus::Failed,
            "Cancelled" => StepStatus::Cancelled,
            "Retrying" => StepStatus::Retrying,
            _ => StepStatus::Queued,
        }
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> PipelineRun {
        PipelineRun {
            id: row.get("id"),
            pipeline_id: row.get("pipeline_id"),
            project_id: row.get("project_id"),
            task_branch: row.get("task_branch"),
            user_id: row.get("user_id"),
            status: Self::run_status_from_str(&row.get::<String, _>("status")),
            task_description: row.get("task_description"),
            current_step_id: row.get("current_step_id"),
            human_context: row.get("human_context"),
            created_at: Self::from_naive(row.get("created_at")),
            updated_at: Self::from_naive(row.get("updated_at")),
            completed_at: row
                .get::<Option<NaiveDateTime>, _>("completed_at")
                .map(Self::from_naive),
        }
    }

    fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<StepExecution> {
        let outputs: BTreeMap<String, String> =
            serde_json::from_str(&row.get::<String, _>("outputs"))
                .context("Corrupt step outputs column")?;

        Ok(StepExecution {
            run_id: row.get("run_id"),
            step_id: row.get("step_id"),
            status: Self::step_status_from_str(&row.get::<String, _>("status")),
            session_id: row.get("session_id"),
            inputs: row.get("inputs"),
            outputs,
            error: row.get("error"),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            human_context: row.get("human_context"),
            started_at: row
                .get::<Option<NaiveDateTime>, _>("started_at")
                .map(Self::from_naive),
            updated_at: Self::from_naive(row.get("updated_at")),
        })
    }
}

#[async_trait]
impl EngineStore for SqliteEngineStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs
            (id, pipeline_id, project_id, task_branch, user_id, status, task_description,
             current_step_id, human_context, created_at, updated_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&run.id)
        .bind(&run.pipeline_id)
        .bind(&run.project_id)
        .bind(&run.task_branch)
        .bind(&run.user_id)
        .bind(Self::run_status_str(run.status))
        .bind(&run.task_description)
        .bind(&run.current_step_id)
        .bind(&run.human_context)
        .bind(Self::to_naive(run.created_at))
        .bind(Self::to_naive(run.updated_at))
        .bind(run.completed_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to create run")?;

        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        Ok(row.as_ref().map(Self::row_to_run))
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
              status = ?2, task_description = ?3, current_step_id = ?4, human_context = ?5,
              project_id = ?6, task_branch = ?7, user_id = ?8,
              updated_at = ?9, completed_at = ?10
            WHERE id = ?1
            "#,
        )
        .bind(&run.id)
        .bind(Self::run_status_str(run.status))
        .bind(&run.task_description)
        .bind(&run.current_step_id)
        .bind(&run.human_context)
        .bind(&run.project_id)
        .bind(&run.task_branch)
        .bind(&run.user_id)
        .bind(Self::to_naive(run.updated_at))
        .bind(run.completed_at.map(Self::to_naive))
        .execute(&self.pool)
        .await
        .context("Failed to update run")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Run '{}' does not exist", run.id);
        }
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<PipelineRun>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list runs")?;

        Ok(rows.iter().map(Self::row_to_run).collect())
    }

    async fn create_step(&self, step: &StepExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO step_executions
            (run_id, step_id, status, session_id, inputs, outputs, error,
             retry_count, max_retries, human_context, started_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&step.run_id)
        .bind(&step.step_id)
        .bind(Self::step_status_str(step.status))
        .bind(&step.session_id)
        .bind(&step.inputs)
        .bind(serde_json::to_string(&step.outputs)?)
        .bind(&step.error)
        .bind(step.retry_count as i64)
        .bind(step.max_retries as i64)
        .bind(&step.human_context)
        .bind(step.started_at.map(Self::to_naive))
        .bind(Self::to_naive(step.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to create step execution")?;

        Ok(())
    }

    async fn get_step(&self, run_id: &str, step_id: &str) -> Result<Option<StepExecution>> {
        let row = sqlx::query("SELECT * FROM step_executions WHERE run_id = ?1 AND step_id = ?2")
            .bind(run_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load step execution")?;

        row.as_ref().map(Self::row_to_step).transpose()
    }

    async fn update_step(&self, step: &StepExecution) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions SET
              status = ?3, session_id = ?4, inputs = ?5, outputs = ?6, error = ?7,
              retry_count = ?8, max_retries = ?9, human_context = ?10,
              started_at = ?11, updated_at = ?12
            WHERE run_id = ?1 AND step_id = ?2
            "#,
        )
        .bind(&step.run_id)
        .bind(&step.step_id)
        .bind(Self::step_status_str(step.status))
        .bind(&step.session_id)
        .bind(&step.inputs)
        .bind(serde_json::to_string(&step.outputs)?)
        .bind(&step.error)
        .bind(step.retry_count as i64)
        .bind(step.max_retries as i64)
        .bind(&step.human_context)
        .bind(step.started_at.map(Self::to_naive))
        .bind(Self::to_naive(step.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to update step execution")?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Step '{}_{}' does not exist", step.run_id, step.step_id);
        }
        Ok(())
    }

    async fn get_outputs(&self, run_id: &str) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM run_outputs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to load outputs")?;

        Ok(rows
            .iter()
            .map(|row| (row.get("key"), row.get("value")))
            .collect())
    }

    async fn set_output(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO run_outputs (run_id, key, value) VALUES (?1, ?2, ?3)")
            .bind(run_id)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("Failed to set output")?;

        Ok(())
    }

    async fn create_loop_state(&self, state: &LoopState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO loop_states (run_id, step_id, current_index, items)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&state.run_id)
        .bind(&state.step_id)
        .bind(state.current_index as i64)
        .bind(serde_json::to_string(&state.items)?)
        .execute(&self.pool)
        .await
        .context("Failed to create loop state")?;

        Ok(())
    }

    async fn get_loop_state(&self, run_id: &str, step_id: &str) -> Result<Option<LoopState>> {
        let row = sqlx::query("SELECT * FROM loop_states WHERE run_id = ?1 AND step_id = ?2")
            .bind(run_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load loop state")?;

        match row {
            Some(row) => {
                let items: Vec<LoopItem> = serde_json::from_str(&row.get::<String, _>("items"))
                    .context("Corrupt loop items column")?;
                Ok(Some(LoopState {
                    run_id: row.get("run_id"),
                    step_id: row.get("step_id"),
                    items,
                    current_index: row.get::<i64, _>("current_index") as usize,
                }))
            }
            None => Ok(None),
        }
    }

    async fn update_loop_item(
        &self,
        run_id: &str,
        step_id: &str,
        index: usize,
        status: LoopItemStatus,
        output: Option<&str>,
    ) -> Result<()> {
        let mut state = self
            .get_loop_state(run_id, step_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("No loop state for '{}_{}'", run_id, step_id))?;

        let item = state
            .items
            .get_mut(index)
            .ok_or_else(|| anyhow::anyhow!("Loop item index {} out of range", index))?;
        item.status = status;
        if let Some(output) = output {
            item.output = Some(output.to_string());
        }

        sqlx::query("UPDATE loop_states SET items = ?3 WHERE run_id = ?1 AND step_id = ?2")
            .bind(run_id)
            .bind(step_id)
            .bind(serde_json::to_string(&state.items)?)
            .execute(&self.pool)
            .await
            .context("Failed to update loop item")?;

        Ok(())
    }

    async fn advance_loop(&self, run_id: &str, step_id: &str) -> Result<Option<LoopItem>> {
        let state = self
            .get_loop_state(run_id, step_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("No loop state for '{}_{}'", run_id, step_id))?;

        match state.next_pending().cloned() {
            Some(item) => {
                sqlx::query(
                    "UPDATE loop_states SET current_index = ?3 WHERE run_id = ?1 AND step_id = ?2",
                )
                .bind(run_id)
                .bind(step_id)
                .bind(item.index as i64)
                .execute(&self.pool)
                .await
                .context("Failed to advance loop")?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

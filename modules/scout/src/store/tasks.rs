//! Durable analysis task queue.
//!
//! Claiming is a single statement over `FOR UPDATE SKIP LOCKED`, so
//! concurrent workers never receive the same task and never block each
//! other on contended rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use scout_common::{
    AnalysisParameters, AnalysisTask, NewAnalysisTask, Result, ScoutError, TaskType,
};

use crate::processor::TaskQueue;
use crate::reclaim::StaleClaimStore;
use crate::scout::TaskAdder;

pub struct PgTaskStorage {
    pool: PgPool,
    error_backoff: Duration,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    id: i64,
    task_type: String,
    source: String,
    source_id: String,
    profile_id: i64,
    should_save: bool,
    errors: Vec<String>,
    created_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<AnalysisTask> {
        let task_type = TaskType::parse(&self.task_type).ok_or_else(|| {
            ScoutError::Other(anyhow::anyhow!(
                "task {} has unknown type {:?}",
                self.id,
                self.task_type
            ))
        })?;

        Ok(AnalysisTask {
            id: self.id,
            task_type,
            parameters: AnalysisParameters {
                source: self.source,
                source_id: self.source_id,
                profile_id: self.profile_id,
                should_save: self.should_save,
            },
            errors: self.errors,
            created_at: self.created_at,
        })
    }
}

impl PgTaskStorage {
    pub fn new(pool: PgPool, error_backoff: Duration) -> Self {
        Self {
            pool,
            error_backoff,
        }
    }
}

#[async_trait]
impl TaskAdder for PgTaskStorage {
    async fn add(&self, tasks: Vec<NewAnalysisTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut task_types = Vec::with_capacity(tasks.len());
        let mut sources = Vec::with_capacity(tasks.len());
        let mut source_ids = Vec::with_capacity(tasks.len());
        let mut profile_ids = Vec::with_capacity(tasks.len());
        let mut should_saves = Vec::with_capacity(tasks.len());

        for task in &tasks {
            task_types.push(task.task_type.as_str().to_string());
            sources.push(task.parameters.source.clone());
            source_ids.push(task.parameters.source_id.clone());
            profile_ids.push(task.parameters.profile_id);
            should_saves.push(task.parameters.should_save);
        }

        sqlx::query(
            r#"
            INSERT INTO scout.analysis_tasks
                (task_type, source, source_id, profile_id, should_save)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::text[], $4::bigint[], $5::boolean[])
            "#,
        )
        .bind(&task_types)
        .bind(&sources)
        .bind(&source_ids)
        .bind(&profile_ids)
        .bind(&should_saves)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgTaskStorage {
    async fn claim(
        &self,
        task_types: &[TaskType],
        profile_ids: &[i64],
    ) -> Result<Option<AnalysisTask>> {
        let type_names: Vec<String> = task_types.iter().map(|t| t.as_str().to_string()).collect();

        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE scout.analysis_tasks
            SET is_claimed = true, claimed_at = now()
            WHERE id = (
                SELECT id
                FROM scout.analysis_tasks
                WHERE NOT is_claimed
                  AND NOT is_committed
                  AND NOT is_failed
                  AND claim_available_at <= now()
                  AND task_type = ANY($1)
                  AND profile_id = ANY($2)
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_type, source, source_id, profile_id, should_save, errors, created_at
            "#,
        )
        .bind(&type_names)
        .bind(profile_ids)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRow::into_task).transpose()
    }

    async fn unclaim(&self, task_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scout.analysis_tasks
            SET is_claimed = false, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn add_error(&self, task_id: i64, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scout.analysis_tasks
            SET errors = array_append(errors, $2),
                claim_available_at = now() + $3 * interval '1 second'
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(message)
        .bind(self.error_backoff.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(&self, task_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scout.analysis_tasks
            SET is_failed = true, failed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn commit(&self, task_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scout.analysis_tasks
            SET is_committed = true, committed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl StaleClaimStore for PgTaskStorage {
    async fn unclaim_stale(&self, older_than: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scout.analysis_tasks
            SET is_claimed = false, claimed_at = NULL
            WHERE is_claimed
              AND NOT is_committed
              AND NOT is_failed
              AND claimed_at < now() - $1 * interval '1 second'
            "#,
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

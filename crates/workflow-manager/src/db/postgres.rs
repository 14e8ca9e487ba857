//! PostgreSQL implementation of the workflow store.
//!
//! Instances and task executions live in separate tables. Task rows carry
//! the status and deadline as columns next to the JSON document so the
//! supervisor's overdue scan runs on the `(status, timeout)` index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use crate::db::models::{
    ExportExecution, Payload, Status, TaskExecution, TaskExecutionStatus, WorkflowInstance,
    ACTIVE_STATUSES,
};
use crate::db::store::{WorkflowDefinitions, WorkflowStore};
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::workflow::{WorkflowRevision, WorkflowSpec};

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: DbPool, schema: &str) -> AppResult<Self> {
        if schema.is_empty() || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(AppError::Config(format!("Invalid schema name: {}", schema)));
        }
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }

    /// Create the schema, tables and indexes if they do not exist.
    pub async fn bootstrap(&self) -> AppResult<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    payload_id TEXT NOT NULL,
                    workflow_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    version BIGINT NOT NULL DEFAULT 0,
                    doc JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    UNIQUE (payload_id, workflow_id)
                )
                "#,
                self.table("workflow_instance")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    execution_id TEXT PRIMARY KEY,
                    instance_id TEXT NOT NULL REFERENCES {}(id),
                    seq INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    timeout TIMESTAMPTZ NOT NULL,
                    doc JSONB NOT NULL
                )
                "#,
                self.table("task_execution"),
                self.table("workflow_instance")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS task_execution_status_timeout_idx ON {} (status, timeout)",
                self.table("task_execution")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS task_execution_instance_seq_idx ON {} (instance_id, seq)",
                self.table("task_execution")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    workflow_id TEXT NOT NULL,
                    revision INTEGER NOT NULL,
                    ae_title TEXT,
                    doc JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    UNIQUE (workflow_id, revision)
                )
                "#,
                self.table("workflow_revision")
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    payload_id TEXT PRIMARY KEY,
                    doc JSONB NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )
                "#,
                self.table("payload")
            ),
        ];

        for statement in statements.iter() {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        tracing::info!(schema = %self.schema, "Database schema ready");
        Ok(())
    }

    async fn load_tasks(&self, instance_id: &str) -> AppResult<Vec<TaskExecution>> {
        let rows: Vec<(Json<TaskExecution>,)> = sqlx::query_as(&format!(
            "SELECT doc FROM {} WHERE instance_id = $1 ORDER BY seq ASC",
            self.table("task_execution")
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(task),)| task).collect())
    }

    async fn hydrate(
        &self,
        row: Option<(Json<WorkflowInstance>, i64)>,
    ) -> AppResult<Option<WorkflowInstance>> {
        let Some((Json(mut instance), version)) = row else {
            return Ok(None);
        };
        instance.version = version;
        instance.tasks = self.load_tasks(&instance.id).await?;
        Ok(Some(instance))
    }
}

/// Instance document stored without its tasks.
fn instance_doc(instance: &WorkflowInstance) -> WorkflowInstance {
    WorkflowInstance {
        tasks: Vec::new(),
        ..instance.clone()
    }
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, payload_id, workflow_id, status, version, doc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
            self.table("workflow_instance")
        ))
        .bind(&instance.id)
        .bind(&instance.payload_id)
        .bind(&instance.workflow_id)
        .bind(instance.status.as_str())
        .bind(instance.version)
        .bind(Json(instance_doc(instance)))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for (seq, task) in instance.tasks.iter().enumerate() {
            sqlx::query(&format!(
                r#"
                INSERT INTO {} (execution_id, instance_id, seq, status, timeout, doc)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
                self.table("task_execution")
            ))
            .bind(&task.execution_id)
            .bind(&instance.id)
            .bind(seq as i32)
            .bind(task.status.as_str())
            .bind(task.timeout)
            .bind(Json(task))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_instance(&self, instance_id: &str) -> AppResult<Option<WorkflowInstance>> {
        let row: Option<(Json<WorkflowInstance>, i64)> = sqlx::query_as(&format!(
            "SELECT doc, version FROM {} WHERE id = $1",
            self.table("workflow_instance")
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn get_instance_by_payload_and_workflow(
        &self,
        payload_id: &str,
        workflow_id: &str,
    ) -> AppResult<Option<WorkflowInstance>> {
        let row: Option<(Json<WorkflowInstance>, i64)> = sqlx::query_as(&format!(
            "SELECT doc, version FROM {} WHERE payload_id = $1 AND workflow_id = $2",
            self.table("workflow_instance")
        ))
        .bind(payload_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn update_task_status(
        &self,
        instance_id: &str,
        task: &TaskExecution,
        expected: TaskExecutionStatus,
    ) -> AppResult<bool> {
        let affected = sqlx::query(&format!(
            r#"
            WITH updated AS (
                UPDATE {tasks}
                SET status = $3, timeout = $4, doc = $5
                WHERE execution_id = $1 AND instance_id = $2 AND status = $6
                RETURNING instance_id
            )
            UPDATE {instances}
            SET version = version + 1
            WHERE id IN (SELECT instance_id FROM updated)
            "#,
            tasks = self.table("task_execution"),
            instances = self.table("workflow_instance")
        ))
        .bind(&task.execution_id)
        .bind(instance_id)
        .bind(task.status.as_str())
        .bind(task.timeout)
        .bind(Json(task))
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn update_task_exports(
        &self,
        instance_id: &str,
        execution_id: &str,
        exports: &[ExportExecution],
        expected_version: i64,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let bumped = sqlx::query(&format!(
            "UPDATE {} SET version = version + 1 WHERE id = $1 AND version = $2",
            self.table("workflow_instance")
        ))
        .bind(instance_id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if bumped == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET doc = jsonb_set(doc, '{{exports}}', $3)
            WHERE instance_id = $1 AND execution_id = $2
            "#,
            self.table("task_execution")
        ))
        .bind(instance_id)
        .bind(execution_id)
        .bind(Json(exports))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: Status,
        expected_version: i64,
    ) -> AppResult<bool> {
        let affected = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $2,
                doc = jsonb_set(doc, '{{status}}', to_jsonb($2::text)),
                version = version + 1
            WHERE id = $1 AND version = $3
            "#,
            self.table("workflow_instance")
        ))
        .bind(instance_id)
        .bind(status.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn append_tasks(&self, instance_id: &str, tasks: &[TaskExecution]) -> AppResult<usize> {
        let mut tx = self.pool.begin().await?;

        // Lock the instance row so concurrent appends get distinct seq values.
        let locked: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT version FROM {} WHERE id = $1 FOR UPDATE",
            self.table("workflow_instance")
        ))
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_none() {
            tx.rollback().await?;
            return Ok(0);
        }

        let (max_seq,): (Option<i32>,) = sqlx::query_as(&format!(
            "SELECT MAX(seq) FROM {} WHERE instance_id = $1",
            self.table("task_execution")
        ))
        .bind(instance_id)
        .fetch_one(&mut *tx)
        .await?;

        let mut seq = max_seq.map_or(0, |s| s + 1);
        let mut appended = 0;
        for task in tasks {
            let inserted = sqlx::query(&format!(
                r#"
                INSERT INTO {} (execution_id, instance_id, seq, status, timeout, doc)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (execution_id) DO NOTHING
                "#,
                self.table("task_execution")
            ))
            .bind(&task.execution_id)
            .bind(instance_id)
            .bind(seq)
            .bind(task.status.as_str())
            .bind(task.timeout)
            .bind(Json(task))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted == 1 {
                seq += 1;
                appended += 1;
            }
        }

        if appended > 0 {
            sqlx::query(&format!(
                "UPDATE {} SET version = version + 1 WHERE id = $1",
                self.table("workflow_instance")
            ))
            .bind(instance_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(appended)
    }

    async fn list_overdue_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<TaskExecution>> {
        let statuses: Vec<String> = ACTIVE_STATUSES.iter().map(|s| s.as_str().to_string()).collect();

        let rows: Vec<(Json<TaskExecution>,)> = sqlx::query_as(&format!(
            r#"
            SELECT doc FROM {}
            WHERE status = ANY($1) AND timeout < $2
            ORDER BY timeout ASC
            LIMIT $3
            "#,
            self.table("task_execution")
        ))
        .bind(statuses)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(task),)| task).collect())
    }

    async fn create_payload(&self, payload: &Payload) -> AppResult<bool> {
        let affected = sqlx::query(&format!(
            "INSERT INTO {} (payload_id, doc) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            self.table("payload")
        ))
        .bind(&payload.payload_id)
        .bind(Json(payload))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn get_payload(&self, payload_id: &str) -> AppResult<Option<Payload>> {
        let row: Option<(Json<Payload>,)> = sqlx::query_as(&format!(
            "SELECT doc FROM {} WHERE payload_id = $1",
            self.table("payload")
        ))
        .bind(payload_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(payload),)| payload))
    }
}

#[async_trait]
impl WorkflowDefinitions for PgStore {
    async fn resolve_revisions(
        &self,
        workflow_ids: &[String],
        ae_title: Option<&str>,
    ) -> AppResult<Vec<WorkflowRevision>> {
        if !workflow_ids.is_empty() {
            let rows: Vec<(Json<WorkflowRevision>,)> = sqlx::query_as(&format!(
                r#"
                SELECT DISTINCT ON (workflow_id) doc FROM {}
                WHERE workflow_id = ANY($1)
                ORDER BY workflow_id, revision DESC
                "#,
                self.table("workflow_revision")
            ))
            .bind(workflow_ids)
            .fetch_all(&self.pool)
            .await?;

            let mut revisions: Vec<WorkflowRevision> =
                rows.into_iter().map(|(Json(r),)| r).collect();
            revisions.sort_by_key(|r| {
                workflow_ids
                    .iter()
                    .position(|id| *id == r.workflow_id)
                    .unwrap_or(usize::MAX)
            });
            return Ok(revisions);
        }

        let Some(ae_title) = ae_title else {
            return Ok(Vec::new());
        };

        let rows: Vec<(Json<WorkflowRevision>,)> = sqlx::query_as(&format!(
            r#"
            SELECT doc FROM (
                SELECT DISTINCT ON (workflow_id) doc, ae_title FROM {}
                ORDER BY workflow_id, revision DESC
            ) latest
            WHERE ae_title = $1
            "#,
            self.table("workflow_revision")
        ))
        .bind(ae_title)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(Json(r),)| r).collect())
    }

    async fn get_revision(
        &self,
        workflow_id: &str,
        revision: i32,
    ) -> AppResult<Option<WorkflowRevision>> {
        let row: Option<(Json<WorkflowRevision>,)> = sqlx::query_as(&format!(
            "SELECT doc FROM {} WHERE workflow_id = $1 AND revision = $2",
            self.table("workflow_revision")
        ))
        .bind(workflow_id)
        .bind(revision)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(Json(r),)| r))
    }

    async fn save_revision(
        &self,
        workflow_id: &str,
        workflow: &WorkflowSpec,
    ) -> AppResult<WorkflowRevision> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(workflow_id)
            .execute(&mut *tx)
            .await?;

        let current: Option<(Json<WorkflowRevision>,)> = sqlx::query_as(&format!(
            "SELECT doc FROM {} WHERE workflow_id = $1 ORDER BY revision DESC LIMIT 1",
            self.table("workflow_revision")
        ))
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await?;

        let next = match current {
            Some((Json(current),)) if current.workflow == *workflow => {
                tx.rollback().await?;
                return Ok(current);
            }
            Some((Json(current),)) => current.revision + 1,
            None => 1,
        };

        let revision = WorkflowRevision {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            revision: next,
            workflow: workflow.clone(),
        };

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, workflow_id, revision, ae_title, doc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            self.table("workflow_revision")
        ))
        .bind(&revision.id)
        .bind(&revision.workflow_id)
        .bind(revision.revision)
        .bind(revision.workflow.informatics_gateway.ae_title.as_deref())
        .bind(Json(&revision))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            workflow_id = %workflow_id,
            revision = next,
            "Saved workflow revision"
        );

        Ok(revision)
    }
}

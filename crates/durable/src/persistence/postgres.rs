//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via sequence numbers, under a run row lock
//! - Events, tasks, timers and pending effects of one advance written in one transaction
//! - Efficient task and timer claiming with SKIP LOCKED
//! - A partial unique index keeping one open run per workflow id

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::activity::ActivityError;
use crate::workflow::{ActivityOptions, ParentClosePolicy, WorkflowEvent};

const SCHEMA: &str = include_str!("../../migrations/001_durable_schema.sql");

const WORKFLOW_COLUMNS: &str = "run_id, workflow_id, workflow_type, task_queue, status, input, \
     result, error, parent_run_id, parent_close_policy, created_at, updated_at";

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use maas_durable::PostgresWorkflowEventStore;
///
/// let store = PostgresWorkflowEventStore::connect("postgres://localhost/maasdb").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_error("failed to connect to database"))?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the durable execution tables if they do not exist
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to apply durable schema"))?;
        debug!("durable schema applied");
        Ok(())
    }
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!(error = %e, "{}", context);
        StoreError::Database(e.to_string())
    }
}

fn serialization_error(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn workflow_from_row(row: &PgRow) -> Result<WorkflowInfo, StoreError> {
    let status: String = row.get("status");
    let policy: String = row.get("parent_close_policy");
    let error_json: Option<serde_json::Value> = row.get("error");

    Ok(WorkflowInfo {
        run_id: row.get("run_id"),
        workflow_id: row.get("workflow_id"),
        workflow_type: row.get("workflow_type"),
        task_queue: row.get("task_queue"),
        status: status.parse()?,
        input: row.get("input"),
        result: row.get("result"),
        error: error_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(serialization_error)?,
        parent_run_id: row.get("parent_run_id"),
        parent_close_policy: ParentClosePolicy::parse(&policy).ok_or_else(|| {
            StoreError::Serialization(format!("unknown parent close policy: {policy}"))
        })?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn claimed_from_row(row: &PgRow) -> Result<ClaimedTask, StoreError> {
    let options_json: serde_json::Value = row.get("options");
    let options: ActivityOptions =
        serde_json::from_value(options_json).map_err(serialization_error)?;

    Ok(ClaimedTask {
        id: row.get("id"),
        run_id: row.get("run_id"),
        workflow_id: row.get("workflow_id"),
        workflow_type: row.get("workflow_type"),
        task_queue: row.get("task_queue"),
        activity_id: row.get("activity_id"),
        activity_type: row.get("activity_type"),
        input: row.get("input"),
        options,
        attempt: row.get::<i32, _>("attempt") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
    })
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Record an effect inside the caller's transaction
async fn insert_effect(
    conn: &mut PgConnection,
    run_id: Uuid,
    effect: &PendingEffect,
) -> Result<(), StoreError> {
    let data = serde_json::to_value(effect).map_err(serialization_error)?;

    sqlx::query(
        r#"
        INSERT INTO maas_durable_effects (run_id, effect_key, kind, effect)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (run_id, effect_key) DO NOTHING
        "#,
    )
    .bind(run_id)
    .bind(effect.key())
    .bind(effect.kind())
    .bind(&data)
    .execute(conn)
    .await
    .map_err(db_error("failed to record effect"))?;
    Ok(())
}

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, workflow), fields(run_id = %workflow.run_id, workflow_id = %workflow.workflow_id))]
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("failed to begin transaction"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO maas_durable_workflows
                (run_id, workflow_id, workflow_type, task_queue, status, input,
                 parent_run_id, parent_close_policy)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7)
            "#,
        )
        .bind(workflow.run_id)
        .bind(&workflow.workflow_id)
        .bind(&workflow.workflow_type)
        .bind(&workflow.task_queue)
        .bind(&workflow.input)
        .bind(workflow.parent_run_id)
        .bind(workflow.parent_close_policy.as_str())
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(e)
                if e
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                return Err(StoreError::WorkflowIdInUse(workflow.workflow_id));
            }
            Err(e) => return Err(db_error("failed to create workflow run")(e)),
        }

        insert_effect(&mut tx, workflow.run_id, &PendingEffect::Start).await?;

        tx.commit()
            .await
            .map_err(db_error("failed to commit workflow run"))?;

        debug!(workflow_type = %workflow.workflow_type, "created workflow run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow_info(&self, run_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM maas_durable_workflows WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to get workflow info"))?
        .ok_or(StoreError::WorkflowNotFound(run_id))?;

        workflow_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_current_run(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowInfo>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM maas_durable_workflows \
             WHERE workflow_id = $1 ORDER BY created_at DESC, run_id DESC LIMIT 1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to find current run"))?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_children(&self, parent_run_id: Uuid) -> Result<Vec<WorkflowInfo>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM maas_durable_workflows \
             WHERE parent_run_id = $1 ORDER BY created_at"
        ))
        .bind(parent_run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to list child runs"))?;

        rows.iter().map(workflow_from_row).collect()
    }

    #[instrument(skip(self, append), fields(events = append.events.len(), tasks = append.tasks.len()))]
    async fn append_events(
        &self,
        run_id: Uuid,
        expected_sequence: i32,
        append: HistoryAppend,
    ) -> Result<i32, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("failed to begin transaction"))?;

        // Serialize appends per run
        sqlx::query("SELECT run_id FROM maas_durable_workflows WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("failed to lock workflow run"))?
            .ok_or(StoreError::WorkflowNotFound(run_id))?;

        let row = sqlx::query("SELECT COUNT(*) AS n FROM maas_durable_events WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("failed to read event sequence"))?;
        let current_sequence = row.get::<i64, _>("n") as i32;

        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        let mut new_sequence = current_sequence;
        for event in &append.events {
            let event_data = serde_json::to_value(event).map_err(serialization_error)?;

            sqlx::query(
                r#"
                INSERT INTO maas_durable_events (run_id, sequence_num, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(run_id)
            .bind(new_sequence)
            .bind(event.type_name())
            .bind(&event_data)
            .execute(&mut *tx)
            .await
            .map_err(db_error("failed to insert event"))?;

            new_sequence += 1;
        }

        if let Some(change) = status_change(&append.events) {
            let error_json = change
                .error
                .map(serde_json::to_value)
                .transpose()
                .map_err(serialization_error)?;

            sqlx::query(
                r#"
                UPDATE maas_durable_workflows
                SET status = $2,
                    result = COALESCE($3, result),
                    error = COALESCE($4, error),
                    updated_at = NOW()
                WHERE run_id = $1
                "#,
            )
            .bind(run_id)
            .bind(change.status.as_str())
            .bind(&change.result)
            .bind(&error_json)
            .execute(&mut *tx)
            .await
            .map_err(db_error("failed to update workflow status"))?;
        }

        for task in &append.tasks {
            let options_json = serde_json::to_value(&task.options).map_err(serialization_error)?;

            sqlx::query(
                r#"
                INSERT INTO maas_durable_tasks (
                    id, run_id, workflow_id, workflow_type, task_queue,
                    activity_id, activity_type, input, options, priority, max_attempts
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(task.run_id)
            .bind(&task.workflow_id)
            .bind(&task.workflow_type)
            .bind(&task.task_queue)
            .bind(&task.activity_id)
            .bind(&task.activity_type)
            .bind(&task.input)
            .bind(&options_json)
            .bind(task.options.priority)
            .bind(task.options.retry_policy.max_attempts as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_error("failed to enqueue task"))?;
        }

        for timer in &append.timers {
            sqlx::query(
                r#"
                INSERT INTO maas_durable_timers (run_id, timer_id, fire_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (run_id, timer_id) DO UPDATE SET fire_at = EXCLUDED.fire_at
                "#,
            )
            .bind(timer.run_id)
            .bind(&timer.timer_id)
            .bind(timer.fire_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error("failed to create timer"))?;
        }

        for effect in &append.effects {
            insert_effect(&mut tx, run_id, effect).await?;
        }

        tx.commit()
            .await
            .map_err(db_error("failed to commit append"))?;

        debug!(%run_id, new_sequence, "appended events");
        Ok(new_sequence)
    }

    #[instrument(skip(self))]
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i32, WorkflowEvent)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_num, event_data
            FROM maas_durable_events
            WHERE run_id = $1
            ORDER BY sequence_num
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to load events"))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i32 = row.get("sequence_num");
            let data: serde_json::Value = row.get("event_data");
            let event: WorkflowEvent = serde_json::from_value(data).map_err(serialization_error)?;
            events.push((seq, event));
        }

        Ok(events)
    }

    #[instrument(skip(self, filter), fields(task_queue = %filter.task_queue))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        filter: &TaskFilter,
        max_tasks: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        if filter.activity_types.is_empty() || max_tasks == 0 {
            return Ok(vec![]);
        }

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM maas_durable_tasks
                WHERE status = 'pending'
                  AND task_queue = $1
                  AND activity_type = ANY($2)
                  AND ($3::TEXT[] IS NULL OR workflow_type = ANY($3))
                  AND visible_at <= NOW()
                ORDER BY priority DESC, visible_at
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE maas_durable_tasks t
            SET status = 'claimed',
                claimed_by = $5,
                claimed_at = NOW(),
                heartbeat_at = NOW(),
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.run_id, t.workflow_id, t.workflow_type, t.task_queue,
                      t.activity_id, t.activity_type, t.input, t.options,
                      t.attempt, t.max_attempts
            "#,
        )
        .bind(&filter.task_queue)
        .bind(&filter.activity_types)
        .bind(filter.workflow_types.clone())
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to claim tasks"))?;

        let claimed = rows
            .iter()
            .map(claimed_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, _details))]
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        _details: Option<serde_json::Value>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE maas_durable_tasks
            SET heartbeat_at = NOW()
            WHERE id = $1 AND claimed_by = $2 AND status = 'claimed'
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("failed to heartbeat task"))?;

        // Not claimed by us any more: cancelled, reclaimed or finished
        let accepted = row.is_some();
        Ok(HeartbeatResponse {
            accepted,
            should_cancel: !accepted,
        })
    }

    #[instrument(skip(self, result))]
    async fn complete_task(
        &self,
        task_id: Uuid,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("failed to begin transaction"))?;

        let row = sqlx::query(
            r#"
            UPDATE maas_durable_tasks
            SET status = 'completed', result = $2
            WHERE id = $1 AND status = 'claimed'
            RETURNING run_id, activity_id
            "#,
        )
        .bind(task_id)
        .bind(&result)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("failed to complete task"))?;

        let Some(row) = row else {
            debug!(%task_id, "task no longer claimed, result dropped");
            return Ok(false);
        };

        let effect = PendingEffect::Deliver {
            event: WorkflowEvent::ActivityCompleted {
                activity_id: row.get("activity_id"),
                result,
            },
        };
        insert_effect(&mut tx, row.get("run_id"), &effect).await?;

        tx.commit()
            .await
            .map_err(db_error("failed to commit task completion"))?;

        debug!(%task_id, "completed task");
        Ok(true)
    }

    #[instrument(skip(self, error))]
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &ActivityError,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("failed to begin transaction"))?;

        let row = sqlx::query(
            r#"
            SELECT run_id, activity_id, status, attempt, options, scheduled_at
            FROM maas_durable_tasks
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("failed to load task"))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let status: String = row.get("status");
        if status != "claimed" {
            return Ok(TaskFailureOutcome::Discarded);
        }

        let attempt = row.get::<i32, _>("attempt") as u32;
        let scheduled_at: DateTime<Utc> = row.get("scheduled_at");
        let options_json: serde_json::Value = row.get("options");
        let options: ActivityOptions =
            serde_json::from_value(options_json).map_err(serialization_error)?;
        let error_json = serde_json::to_value(error).map_err(serialization_error)?;

        let now = Utc::now();
        let outcome = TaskFailureOutcome::decide(&options, attempt, scheduled_at, now, error);

        match &outcome {
            TaskFailureOutcome::WillRetry { delay, .. } => {
                sqlx::query(
                    r#"
                    UPDATE maas_durable_tasks
                    SET status = 'pending',
                        claimed_by = NULL,
                        claimed_at = NULL,
                        heartbeat_at = NULL,
                        last_error = $2,
                        visible_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(&error_json)
                .bind(now + to_chrono(*delay))
                .execute(&mut *tx)
                .await
                .map_err(db_error("failed to requeue task"))?;
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE maas_durable_tasks
                    SET status = 'failed', last_error = $2
                    WHERE id = $1
                    "#,
                )
                .bind(task_id)
                .bind(&error_json)
                .execute(&mut *tx)
                .await
                .map_err(db_error("failed to fail task"))?;

                let effect = PendingEffect::Deliver {
                    event: WorkflowEvent::ActivityFailed {
                        activity_id: row.get("activity_id"),
                        error: outcome.final_error(error),
                    },
                };
                insert_effect(&mut tx, row.get("run_id"), &effect).await?;
            }
        }

        tx.commit()
            .await
            .map_err(db_error("failed to commit task failure"))?;

        debug!(%task_id, ?outcome, "task attempt failed");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn cancel_tasks(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE maas_durable_tasks
            SET status = 'cancelled'
            WHERE run_id = $1 AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("failed to cancel tasks"))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reclaim_stale_tasks(
        &self,
        stale_threshold: Duration,
    ) -> Result<Vec<Uuid>, StoreError> {
        let threshold = Utc::now() - to_chrono(stale_threshold);

        let rows = sqlx::query(
            r#"
            UPDATE maas_durable_tasks
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                heartbeat_at = NULL
            WHERE status = 'claimed'
              AND heartbeat_at < $1
            RETURNING id
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to reclaim stale tasks"))?;

        let reclaimed: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();

        if !reclaimed.is_empty() {
            debug!(count = reclaimed.len(), "reclaimed stale tasks");
        }

        Ok(reclaimed)
    }

    #[instrument(skip(self))]
    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT run_id, timer_id, fire_at
                FROM maas_durable_timers
                WHERE fire_at <= $1
                ORDER BY fire_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE maas_durable_timers t
            SET fire_at = $3
            FROM due d
            WHERE t.run_id = d.run_id AND t.timer_id = d.timer_id
            RETURNING t.run_id, t.timer_id, d.fire_at AS due_at
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(now + to_chrono(lease))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to claim due timers"))?;

        Ok(rows
            .iter()
            .map(|row| TimerRecord {
                run_id: row.get("run_id"),
                timer_id: row.get("timer_id"),
                fire_at: row.get("due_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete_timer(&self, run_id: Uuid, timer_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM maas_durable_timers WHERE run_id = $1 AND timer_id = $2")
            .bind(run_id)
            .bind(timer_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to delete timer"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cancel_timers(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM maas_durable_timers WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to cancel timers"))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn claim_stale_effects(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<EffectRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH stale AS (
                SELECT run_id, effect_key
                FROM maas_durable_effects
                WHERE touched_at <= $1
                ORDER BY touched_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE maas_durable_effects e
            SET touched_at = NOW(),
                attempts = attempts + 1
            FROM stale s
            WHERE e.run_id = s.run_id AND e.effect_key = s.effect_key
            RETURNING e.run_id, e.effect, e.attempts
            "#,
        )
        .bind(Utc::now() - to_chrono(stale_after))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to claim stale effects"))?;

        rows.iter()
            .map(|row| {
                let data: serde_json::Value = row.get("effect");
                Ok(EffectRecord {
                    run_id: row.get("run_id"),
                    effect: serde_json::from_value(data).map_err(serialization_error)?,
                    attempts: row.get::<i32, _>("attempts") as u32,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn complete_effect(&self, run_id: Uuid, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM maas_durable_effects WHERE run_id = $1 AND effect_key = $2")
            .bind(run_id)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_error("failed to complete effect"))?;
        Ok(())
    }
}

//! The durable queue façade (C2, §4.2).
//!
//! Every multi-statement operation opens its own transaction and is wrapped
//! in [`Store::execute`], which retries on transient lock/deadlock/connection
//! errors with jittered exponential backoff — the same formula
//! `orchestrator::calculate_retry_backoff` uses for crawl retries, applied
//! here to store retries instead.

mod schema;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{SchedulerError, SchedulerResult};
use crate::types::{Domain, Job, JobStatus, Page, SourceType, Task, TaskStatus};

const MAX_EXECUTE_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> SchedulerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        sqlx::query(schema::SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-migrated pool, e.g. the one handed out by
    /// `#[sqlx::test]`. Skips the `connect`-time schema application since
    /// the caller is responsible for migrations in that case.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `f` against a pool handle, retrying the whole operation on a
    /// transient error. `f` is expected to be idempotent-on-retry (§4.2).
    pub async fn execute<T, F, Fut>(&self, f: F) -> SchedulerResult<T>
    where
        F: Fn(PgPool) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match f(self.pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < MAX_EXECUTE_ATTEMPTS && is_transient(&err) => {
                    attempt += 1;
                    let backoff = retry_backoff(attempt);
                    log::warn!(
                        target: "scheduler::store",
                        "transient store error on attempt {attempt}: {err}; retrying in {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(SchedulerError::Database(err)),
            }
        }
    }

    pub async fn ensure_domain(&self, name: &str) -> SchedulerResult<Domain> {
        let normalised = Domain::normalise(name);
        self.execute(move |pool| {
            let normalised = normalised.clone();
            async move {
                sqlx::query_as::<_, Domain>(
                    "INSERT INTO domains (name) VALUES ($1) \
                     ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
                     RETURNING *",
                )
                .bind(normalised)
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    pub async fn get_domain_by_id(&self, domain_id: Uuid) -> SchedulerResult<Domain> {
        self.execute(move |pool| async move {
            sqlx::query_as::<_, Domain>("SELECT * FROM domains WHERE id = $1")
                .bind(domain_id)
                .fetch_one(&pool)
                .await
        })
        .await
    }

    pub async fn get_job(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.execute(move |pool| async move {
            sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_one(&pool)
                .await
        })
        .await
        .map_err(|err| match err {
            SchedulerError::Database(sqlx::Error::RowNotFound) => SchedulerError::JobNotFound(job_id),
            other => other,
        })
    }

    pub async fn active_job_for_domain_org(
        &self,
        domain_id: Uuid,
        organisation_id: Option<Uuid>,
    ) -> SchedulerResult<Option<Job>> {
        self.execute(move |pool| async move {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE domain_id = $1 \
                 AND organisation_id IS NOT DISTINCT FROM $2 \
                 AND status IN ('pending', 'initialising', 'running', 'paused') \
                 LIMIT 1",
            )
            .bind(domain_id)
            .bind(organisation_id)
            .fetch_optional(&pool)
            .await
        })
        .await
    }

    /// Atomically select the highest-priority pending task of `job_id` and
    /// flip it to `running`. `None` is not an error (§4.2).
    pub async fn get_next_task(&self, job_id: Uuid) -> SchedulerResult<Option<Task>> {
        self.execute(move |pool| async move {
            let mut tx = pool.begin().await?;
            let claimed = sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE job_id = $1 AND status = 'pending' \
                 ORDER BY priority_score DESC, created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;

            let claimed = match claimed {
                Some(t) => t,
                None => {
                    tx.commit().await?;
                    return Ok(None);
                }
            };

            let running = sqlx::query_as::<_, Task>(
                "UPDATE tasks SET status = 'running', started_at = now() WHERE id = $1 RETURNING *",
            )
            .bind(claimed.id)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Some(running))
        })
        .await
    }

    /// Persist the worker's result fields and final state; notifies on
    /// revert-to-pending (§4.2).
    pub async fn update_task_status(&self, task: &Task) -> SchedulerResult<()> {
        let task = task.clone();
        self.execute(move |pool| {
            let task = task.clone();
            async move {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "UPDATE tasks SET status = $2, retry_count = $3, started_at = $4, \
                     completed_at = $5, status_code = $6, response_time_ms = $7, \
                     cache_status = $8, content_type = $9, error = $10 WHERE id = $1",
                )
                .bind(task.id)
                .bind(task.status)
                .bind(task.retry_count)
                .bind(task.started_at)
                .bind(task.completed_at)
                .bind(task.status_code)
                .bind(task.response_time_ms)
                .bind(task.cache_status.as_deref())
                .bind(task.content_type.as_deref())
                .bind(task.error.as_deref())
                .execute(&mut *tx)
                .await?;

                bump_job_counters_for_terminal_task(&mut tx, task.job_id, task.status).await?;

                if task.status == TaskStatus::Completed {
                    sqlx::query(
                        "INSERT INTO crawl_results (task_id, status_code, response_time_ms, \
                         cache_status, content_type, error) VALUES ($1, $2, $3, $4, $5, $6)",
                    )
                    .bind(task.id)
                    .bind(task.status_code)
                    .bind(task.response_time_ms)
                    .bind(task.cache_status.as_deref())
                    .bind(task.content_type.as_deref())
                    .bind(task.error.as_deref())
                    .execute(&mut *tx)
                    .await?;
                }

                if task.status == TaskStatus::Pending {
                    notify_new_tasks(&mut tx, task.job_id).await?;
                }

                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// Ensure a `Page` exists for each `(domain_id, path)` and insert a
    /// `pending` task for it, skipping `(job_id, page_id)` duplicates
    /// (§4.2, §8 invariant 10). Returns the number of tasks actually
    /// inserted.
    pub async fn enqueue_urls(
        &self,
        job_id: Uuid,
        domain_id: Uuid,
        pages: Vec<(String, f64)>,
        source_type: SourceType,
        source_url: Option<String>,
    ) -> SchedulerResult<u64> {
        self.execute(move |pool| {
            let pages = pages.clone();
            let source_url = source_url.clone();
            async move {
                let mut tx = pool.begin().await?;
                let mut inserted = 0u64;

                for (path, priority) in &pages {
                    let page = sqlx::query_as::<_, Page>(
                        "INSERT INTO pages (domain_id, path) VALUES ($1, $2) \
                         ON CONFLICT (domain_id, path) DO UPDATE SET path = EXCLUDED.path \
                         RETURNING *",
                    )
                    .bind(domain_id)
                    .bind(path)
                    .fetch_one(&mut *tx)
                    .await?;

                    let result: PgQueryResult = sqlx::query(
                        "INSERT INTO tasks (job_id, page_id, path, status, priority_score, source_type, source_url) \
                         VALUES ($1, $2, $3, 'pending', $4, $5, $6) \
                         ON CONFLICT (job_id, page_id) DO NOTHING",
                    )
                    .bind(job_id)
                    .bind(page.id)
                    .bind(path)
                    .bind(priority)
                    .bind(source_type)
                    .bind(source_url.as_deref())
                    .execute(&mut *tx)
                    .await?;

                    inserted += result.rows_affected();
                }

                if inserted > 0 {
                    let counter_column = if matches!(source_type, SourceType::Sitemap) {
                        "sitemap_tasks"
                    } else {
                        "found_tasks"
                    };
                    let sql = format!(
                        "UPDATE jobs SET total_tasks = total_tasks + $2, {counter_column} = {counter_column} + $2 WHERE id = $1"
                    );
                    sqlx::query(&sql)
                        .bind(job_id)
                        .bind(inserted as i64)
                        .execute(&mut *tx)
                        .await?;

                    notify_new_tasks(&mut tx, job_id).await?;
                }

                tx.commit().await?;
                Ok(inserted)
            }
        })
        .await
    }

    /// Implements §4.2 `CleanupStuckJobs`: any `{pending, running}` job
    /// whose tasks are all terminal is flipped to `completed`. Idempotent
    /// (§8 invariant 7) since a second call finds nothing left to update.
    pub async fn cleanup_stuck_jobs(&self) -> SchedulerResult<u64> {
        self.execute(move |pool| async move {
            let result = sqlx::query(
                "UPDATE jobs SET status = 'completed', progress = 100, \
                 completed_at = COALESCE(completed_at, now()) \
                 WHERE status IN ('pending', 'running') AND total_tasks > 0 \
                 AND completed_tasks + failed_tasks + skipped_tasks >= total_tasks",
            )
            .execute(&pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// §4.4.6 stale-task monitor: tasks `running` past `stale_timeout` are
    /// either returned to `pending` (with `++retry_count`) or marked
    /// `failed` once `max_task_retries` is exhausted.
    pub async fn reclaim_stale_tasks(&self, stale_timeout: Duration, max_task_retries: u32) -> SchedulerResult<u64> {
        let stale_seconds = stale_timeout.as_secs() as i64;
        self.execute(move |pool| async move {
            let mut tx = pool.begin().await?;

            let requeued = sqlx::query(
                "UPDATE tasks SET status = 'pending', started_at = NULL, retry_count = retry_count + 1 \
                 WHERE status = 'running' AND started_at < now() - make_interval(secs => $1) \
                 AND retry_count < $2",
            )
            .bind(stale_seconds as f64)
            .bind(max_task_retries as i32)
            .execute(&mut *tx)
            .await?;

            let failed = sqlx::query_as::<_, Task>(
                "UPDATE tasks SET status = 'failed', completed_at = now(), error = 'Max retries exceeded' \
                 WHERE status = 'running' AND started_at < now() - make_interval(secs => $1) \
                 AND retry_count >= $2 RETURNING *",
            )
            .bind(stale_seconds as f64)
            .bind(max_task_retries as i32)
            .fetch_all(&mut *tx)
            .await?;

            for task in &failed {
                bump_job_counters_for_terminal_task(&mut tx, task.job_id, TaskStatus::Failed).await?;
            }

            let total = requeued.rows_affected() + failed.len() as u64;
            tx.commit().await?;
            Ok(total)
        })
        .await
    }

    /// §4.4.6 orphan cleanup: one `failed` job's lingering `pending`
    /// tasks are flipped to `failed`, capping transaction size at one job
    /// per invocation. Never touches `cancelled` jobs. Returns the job id
    /// processed, if any.
    pub async fn cleanup_one_failed_job_orphans(&self) -> SchedulerResult<Option<Uuid>> {
        self.execute(move |pool| async move {
            let mut tx = pool.begin().await?;
            let job = sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE status = 'failed' AND EXISTS ( \
                    SELECT 1 FROM tasks WHERE tasks.job_id = jobs.id AND tasks.status = 'pending' \
                 ) LIMIT 1 FOR UPDATE SKIP LOCKED",
            )
            .fetch_optional(&mut *tx)
            .await?;

            let job = match job {
                Some(j) => j,
                None => {
                    tx.commit().await?;
                    return Ok(None);
                }
            };

            let orphaned = sqlx::query(
                "UPDATE tasks SET status = 'failed', completed_at = now(), error = $2 \
                 WHERE job_id = $1 AND status = 'pending'",
            )
            .bind(job.id)
            .bind(job.error_message.clone().unwrap_or_else(|| "job failed".to_string()))
            .execute(&mut *tx)
            .await?;

            if orphaned.rows_affected() > 0 {
                sqlx::query("UPDATE jobs SET failed_tasks = failed_tasks + $2 WHERE id = $1")
                    .bind(job.id)
                    .bind(orphaned.rows_affected() as i64)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(Some(job.id))
        })
        .await
    }

    /// §4.4.6 startup recovery: jobs left `running` with `running` tasks
    /// (from an unclean shutdown) get their tasks reset to `pending`.
    /// Returns the affected job ids so the worker pool can re-add them.
    pub async fn recover_running_jobs(&self) -> SchedulerResult<Vec<Uuid>> {
        self.execute(move |pool| async move {
            let mut tx = pool.begin().await?;
            let job_ids: Vec<Uuid> = sqlx::query_scalar(
                "SELECT DISTINCT job_id FROM tasks t \
                 JOIN jobs j ON j.id = t.job_id \
                 WHERE j.status = 'running' AND t.status = 'running'",
            )
            .fetch_all(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE tasks SET status = 'pending', started_at = NULL, retry_count = retry_count + 1 \
                 WHERE status = 'running' AND job_id = ANY($1)",
            )
            .bind(&job_ids)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(job_ids)
        })
        .await
    }

    /// Cancel a job: mark it `cancelled` and skip its `pending` tasks,
    /// atomically (§4.1).
    pub async fn cancel_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        self.execute(move |pool| async move {
            let mut tx = pool.begin().await?;
            sqlx::query(
                "UPDATE jobs SET status = 'cancelled', completed_at = now() \
                 WHERE id = $1 AND status IN ('pending', 'initialising', 'running', 'paused')",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            let skipped = sqlx::query(
                "UPDATE tasks SET status = 'skipped', completed_at = now() \
                 WHERE job_id = $1 AND status = 'pending'",
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            if skipped.rows_affected() > 0 {
                sqlx::query("UPDATE jobs SET skipped_tasks = skipped_tasks + $2 WHERE id = $1")
                    .bind(job_id)
                    .bind(skipped.rows_affected() as i64)
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn transition_job_status(&self, job_id: Uuid, status: JobStatus) -> SchedulerResult<()> {
        self.execute(move |pool| async move {
            let started_clause = if status == JobStatus::Running {
                "started_at = COALESCE(started_at, now()),"
            } else {
                ""
            };
            let sql = format!("UPDATE jobs SET {started_clause} status = $2 WHERE id = $1");
            sqlx::query(&sql).bind(job_id).bind(status).execute(&pool).await?;
            Ok(())
        })
        .await
    }

    /// Fails a job outright: records `status=failed` with `error_message`
    /// set to `message`, and flips its remaining `pending` tasks to
    /// `skipped` with that same message (§4.4.7 steps i and ii).
    pub async fn fail_job(&self, job_id: Uuid, message: &str) -> SchedulerResult<()> {
        let message = message.to_string();
        self.execute(move |pool| {
            let message = message.clone();
            async move {
                let mut tx = pool.begin().await?;

                sqlx::query(
                    "UPDATE jobs SET status = 'failed', error_message = $2, \
                     completed_at = COALESCE(completed_at, now()) WHERE id = $1",
                )
                .bind(job_id)
                .bind(&message)
                .execute(&mut *tx)
                .await?;

                let skipped = sqlx::query(
                    "UPDATE tasks SET status = 'skipped', completed_at = now(), error = $2 \
                     WHERE job_id = $1 AND status = 'pending'",
                )
                .bind(job_id)
                .bind(&message)
                .execute(&mut *tx)
                .await?;

                if skipped.rows_affected() > 0 {
                    sqlx::query("UPDATE jobs SET skipped_tasks = skipped_tasks + $2 WHERE id = $1")
                        .bind(job_id)
                        .bind(skipped.rows_affected() as i64)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(())
            }
        })
        .await
    }

    /// Persist the domain limiter's dirty adaptive-delay state (§4.3).
    pub async fn persist_domain_delays(
        &self,
        domain_name: &str,
        adaptive_delay_seconds: f64,
        adaptive_delay_floor_seconds: f64,
    ) -> SchedulerResult<()> {
        let domain_name = domain_name.to_string();
        self.execute(move |pool| {
            let domain_name = domain_name.clone();
            async move {
                sqlx::query(
                    "UPDATE domains SET adaptive_delay_seconds = $2, adaptive_delay_floor_seconds = $3 \
                     WHERE name = $1",
                )
                .bind(domain_name)
                .bind(adaptive_delay_seconds)
                .bind(adaptive_delay_floor_seconds)
                .execute(&pool)
                .await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn insert_job(
        &self,
        domain_id: Uuid,
        opts: &crate::types::JobOptions,
        status: JobStatus,
    ) -> SchedulerResult<Job> {
        let opts = opts.clone();
        self.execute(move |pool| {
            let opts = opts.clone();
            async move {
                sqlx::query_as::<_, Job>(
                    "INSERT INTO jobs (domain_id, user_id, organisation_id, status, concurrency, \
                     find_links, max_pages, include_paths, exclude_paths, required_workers) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING *",
                )
                .bind(domain_id)
                .bind(opts.user_id)
                .bind(opts.organisation_id)
                .bind(status)
                .bind(opts.concurrency as i32)
                .bind(opts.find_links)
                .bind(opts.max_pages.map(|v| v as i32))
                .bind(&opts.include_paths)
                .bind(&opts.exclude_paths)
                .bind(opts.required_workers.map(|v| v as i32))
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }
}

async fn notify_new_tasks(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, job_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_notify('new_tasks', $1)")
        .bind(job_id.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn bump_job_counters_for_terminal_task(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: Uuid,
    status: TaskStatus,
) -> Result<(), sqlx::Error> {
    let column = match status {
        TaskStatus::Completed => Some("completed_tasks"),
        TaskStatus::Failed => Some("failed_tasks"),
        TaskStatus::Skipped => Some("skipped_tasks"),
        TaskStatus::Pending | TaskStatus::Running => None,
    };
    if let Some(column) = column {
        let sql = format!("UPDATE jobs SET {column} = {column} + 1 WHERE id = $1");
        sqlx::query(&sql).bind(job_id).execute(&mut **tx).await?;
    }
    Ok(())
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some("40001") | Some("40P01") | Some("55P03")
        ),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        _ => false,
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    let base_ms = 100u64;
    let exp = base_ms.saturating_mul(1u64 << attempt.min(10));
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis(((exp as f64) * jitter) as u64).min(Duration::from_secs(5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_grows_and_caps() {
        let short = retry_backoff(1);
        let long = retry_backoff(8);
        assert!(short < Duration::from_secs(5));
        assert!(long <= Duration::from_secs(5));
    }
}

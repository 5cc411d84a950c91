//! End-to-end scenarios (S1-S7) against an ephemeral Postgres database.
//!
//! Each test builds its own `Store`/`DomainLimiter`/`WorkerPool`/`JobManager`
//! tuple around the pool `#[sqlx::test]` hands out, following the corpus's
//! own preference for a fresh wiring per test over a shared harness struct.

use std::sync::Arc;
use std::time::Duration;

use crawl_scheduler::{
    AcquireOutcome, CrawlerError, DomainLimiter, JobManager, JobOptions, JobStatus, MockCrawler, SchedulerConfig,
    SourceType, Store, TaskStatus, WarmResult, WorkerPool,
};
use sqlx::PgPool;
use uuid::Uuid;

fn ok_result(status_code: u16) -> Result<WarmResult, CrawlerError> {
    Ok(WarmResult {
        status_code,
        response_time_ms: 12,
        cache_status: None,
        content_type: Some("text/html".to_string()),
        links: Vec::new(),
        redirect_url: None,
    })
}

struct Harness {
    store: Arc<Store>,
    worker_pool: Arc<WorkerPool>,
    job_manager: Arc<JobManager>,
    crawler: Arc<MockCrawler>,
}

async fn build(pool: PgPool, config: SchedulerConfig) -> Harness {
    let store = Arc::new(Store::from_pool(pool));
    let mock = Arc::new(MockCrawler::new());
    let crawler: Arc<dyn crawl_scheduler::Crawler> = mock.clone();
    let limiter = DomainLimiter::new(config.clone(), Some(store.clone()));
    let worker_pool = WorkerPool::new(store.clone(), limiter, crawler.clone(), config);
    let job_manager = JobManager::new(store.clone(), crawler, worker_pool.clone());
    worker_pool.set_link_sink(job_manager.clone()).await;
    Harness { store, worker_pool, job_manager, crawler: mock }
}

/// Poll `f` until it returns `Some`, or panic after `timeout`.
async fn poll_until<T, F, Fut>(timeout: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// S1 - happy path: one task, one success, job completes.
#[sqlx::test]
async fn happy_path_single_task_completes(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    h.crawler.push_response("https://example.com/", ok_result(200));

    let job = h
        .job_manager
        .create_job(JobOptions::new("example.com").with_concurrency(2))
        .await
        .expect("create_job");

    h.worker_pool.start().await.expect("worker pool start");

    let finished = poll_until(Duration::from_secs(5), || async {
        let job = h.store.get_job(job.id).await.ok()?;
        job.status.is_terminal().then_some(job)
    })
    .await;

    h.worker_pool.stop().await;

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.total_tasks, 1);
    assert_eq!(finished.completed_tasks, 1);
    assert_eq!(finished.recompute_progress(), 100.0);
}

// S2 - sitemap bootstrap discovers two URLs, homepage keeps priority 1.0.
#[sqlx::test]
async fn sitemap_bootstrap_enqueues_discovered_urls(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    h.crawler
        .set_sitemaps("example.com", vec!["https://example.com/sitemap.xml".to_string()]);
    h.crawler.set_sitemap_urls(
        "https://example.com/sitemap.xml",
        vec!["https://example.com/".to_string(), "https://example.com/a".to_string()],
    );
    h.crawler.push_response("https://example.com/", ok_result(200));
    h.crawler.push_response("https://example.com/a", ok_result(200));

    let job = h
        .job_manager
        .create_job(JobOptions::new("example.com").with_sitemap(true))
        .await
        .expect("create_job");

    let finished = poll_until(Duration::from_secs(5), || async {
        let job = h.store.get_job(job.id).await.ok()?;
        (job.total_tasks == 2).then_some(job)
    })
    .await;

    assert_eq!(finished.sitemap_tasks, 2);

    let tasks: Vec<crawl_scheduler::Task> = sqlx::query_as("SELECT * FROM tasks WHERE job_id = $1 ORDER BY path")
        .bind(job.id)
        .fetch_all(h.store.pool())
        .await
        .expect("fetch tasks");
    let homepage = tasks.iter().find(|t| t.path == "/").expect("homepage task present");
    assert_eq!(homepage.priority_score, 1.0);
    assert_eq!(homepage.source_type, SourceType::Sitemap);
    let other = tasks.iter().find(|t| t.path == "/a").expect("second task present");
    assert_eq!(other.priority_score, 0.5);

    h.worker_pool.start().await.expect("worker pool start");
    poll_until(Duration::from_secs(5), || async {
        let job = h.store.get_job(job.id).await.ok()?;
        job.status.is_terminal().then_some(())
    })
    .await;
    h.worker_pool.stop().await;
}

// S3 - a task that times out three times then succeeds ends up completed
// with retry_count=3 and no duplicate task rows.
#[sqlx::test]
async fn retry_on_timeout_eventually_completes(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    for _ in 0..3 {
        h.crawler
            .push_response("https://example.com/", Err(CrawlerError::new("connection timeout")));
    }
    h.crawler.push_response("https://example.com/", ok_result(200));

    let job = h
        .job_manager
        .create_job(JobOptions::new("example.com"))
        .await
        .expect("create_job");

    h.worker_pool.start().await.expect("worker pool start");

    let finished = poll_until(Duration::from_secs(10), || async {
        let job = h.store.get_job(job.id).await.ok()?;
        job.status.is_terminal().then_some(job)
    })
    .await;

    h.worker_pool.stop().await;

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.total_tasks, 1);

    let tasks: Vec<crawl_scheduler::Task> = sqlx::query_as("SELECT * FROM tasks WHERE job_id = $1")
        .bind(job.id)
        .fetch_all(h.store.pool())
        .await
        .expect("fetch tasks");
    assert_eq!(tasks.len(), 1, "no duplicate task rows");
    assert_eq!(tasks[0].retry_count, 3);
    assert_eq!(tasks[0].status, TaskStatus::Completed);
}

// S4 - three consecutive 429s exhaust MaxBlockingRetries and the task fails;
// the domain's adaptive delay grows by exactly 3 steps.
#[sqlx::test]
async fn blocking_error_fails_task_and_grows_adaptive_delay(pool: PgPool) {
    let mut config = SchedulerConfig::default();
    config.persist_interval_seconds = 0; // persist immediately so the test can observe it
    let h = build(pool, config).await;
    for _ in 0..3 {
        h.crawler
            .push_response("https://slow.com/", Err(CrawlerError::new("429 too many requests")));
    }

    let job = h
        .job_manager
        .create_job(JobOptions::new("slow.com"))
        .await
        .expect("create_job");

    h.worker_pool.start().await.expect("worker pool start");

    let finished = poll_until(Duration::from_secs(10), || async {
        let job = h.store.get_job(job.id).await.ok()?;
        job.status.is_terminal().then_some(job)
    })
    .await;

    h.worker_pool.stop().await;

    assert_eq!(finished.status, JobStatus::Completed, "job still finishes (failed task is terminal)");
    assert_eq!(finished.failed_tasks, 1);

    let domain = h.store.ensure_domain("slow.com").await.expect("domain exists");
    assert_eq!(domain.adaptive_delay_seconds, 0.5 + 3.0);
}

// S6 - cancelling a job mid-run completes the already-finished tasks, skips
// the rest, and leaves no further tasks claimable.
#[sqlx::test]
async fn cancel_mid_run_skips_remaining_tasks(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    let domain = h.store.ensure_domain("example.com").await.expect("ensure_domain");
    let job = h
        .store
        .insert_job(domain.id, &JobOptions::new("example.com"), JobStatus::Running)
        .await
        .expect("insert_job");

    let pages: Vec<(String, f64)> = (0..10).map(|i| (format!("/{i}"), 0.5)).collect();
    h.store
        .enqueue_urls(job.id, domain.id, pages, SourceType::Manual, None)
        .await
        .expect("enqueue_urls");

    for _ in 0..3 {
        let mut task = h
            .store
            .get_next_task(job.id)
            .await
            .expect("get_next_task")
            .expect("a pending task");
        task.status = TaskStatus::Completed;
        task.completed_at = Some(chrono::Utc::now());
        h.store.update_task_status(&task).await.expect("update_task_status");
    }

    h.job_manager.cancel_job(job.id).await.expect("cancel_job");

    let cancelled = h.store.get_job(job.id).await.expect("get_job");
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.completed_tasks, 3);
    assert_eq!(cancelled.skipped_tasks, 7);
    assert!(cancelled.completed_at.is_some());

    assert!(h.store.get_next_task(job.id).await.expect("get_next_task").is_none());
}

// S7 - a job left `running` with a stale `running` task at startup is
// recovered to `pending` and then processed to completion.
#[sqlx::test]
async fn startup_recovery_reprocesses_stale_running_task(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    let domain = h.store.ensure_domain("example.com").await.expect("ensure_domain");
    let job = h
        .store
        .insert_job(domain.id, &JobOptions::new("example.com"), JobStatus::Running)
        .await
        .expect("insert_job");
    h.store
        .enqueue_urls(job.id, domain.id, vec![("/".to_string(), 1.0)], SourceType::Manual, None)
        .await
        .expect("enqueue_urls");

    // Simulate an unclean shutdown: the only task is stuck `running`,
    // started long enough ago to also qualify as stale.
    sqlx::query(
        "UPDATE tasks SET status = 'running', started_at = now() - interval '10 minutes' WHERE job_id = $1",
    )
    .bind(job.id)
    .execute(h.store.pool())
    .await
    .expect("seed stale running task");

    h.crawler.push_response("https://example.com/", ok_result(200));

    h.worker_pool.start().await.expect("worker pool start");

    let finished = poll_until(Duration::from_secs(5), || async {
        let job = h.store.get_job(job.id).await.ok()?;
        job.status.is_terminal().then_some(job)
    })
    .await;

    h.worker_pool.stop().await;

    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.completed_tasks, 1);

    let task: crawl_scheduler::Task = sqlx::query_as("SELECT * FROM tasks WHERE job_id = $1")
        .bind(job.id)
        .fetch_one(h.store.pool())
        .await
        .expect("fetch task");
    assert_eq!(task.retry_count, 1, "recovery incremented retry_count once");
}

// Invariant 3: concurrent GetNextTask callers never claim the same task.
#[sqlx::test]
async fn concurrent_claims_never_overlap(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    let domain = h.store.ensure_domain("example.com").await.expect("ensure_domain");
    let job = h
        .store
        .insert_job(domain.id, &JobOptions::new("example.com"), JobStatus::Running)
        .await
        .expect("insert_job");

    let pages: Vec<(String, f64)> = (0..40).map(|i| (format!("/{i}"), 0.5)).collect();
    h.store
        .enqueue_urls(job.id, domain.id, pages, SourceType::Manual, None)
        .await
        .expect("enqueue_urls");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = h.store.clone();
        let job_id = job.id;
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Ok(Some(task)) = store.get_next_task(job_id).await {
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut all_claimed: Vec<Uuid> = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.expect("worker task panicked"));
    }

    assert_eq!(all_claimed.len(), 40, "every task claimed exactly once across all callers");
    let unique: std::collections::HashSet<Uuid> = all_claimed.iter().copied().collect();
    assert_eq!(unique.len(), 40, "no task claimed twice");
}

// Invariant 9: restarting a terminal job creates a new job id and leaves
// the original untouched.
#[sqlx::test]
async fn restart_creates_new_job_and_preserves_original(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    let domain = h.store.ensure_domain("example.com").await.expect("ensure_domain");
    let original = h
        .store
        .insert_job(domain.id, &JobOptions::new("example.com"), JobStatus::Failed)
        .await
        .expect("insert_job");

    let restarted = h.job_manager.restart_job(original.id).await.expect("restart_job");

    assert_ne!(restarted.id, original.id);
    assert_eq!(restarted.domain_id, original.domain_id);

    let original_after = h.store.get_job(original.id).await.expect("get_job");
    assert_eq!(original_after.status, JobStatus::Failed, "original job is left as history");
}

// Restart rejects a job that isn't in a terminal state.
#[sqlx::test]
async fn restart_rejects_non_terminal_job(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    let domain = h.store.ensure_domain("example.com").await.expect("ensure_domain");
    let job = h
        .store
        .insert_job(domain.id, &JobOptions::new("example.com"), JobStatus::Running)
        .await
        .expect("insert_job");

    let err = h.job_manager.restart_job(job.id).await.expect_err("running job cannot restart");
    assert!(matches!(err, crawl_scheduler::SchedulerError::InvalidTransition { .. }));
}

// The domain limiter's AcquireOutcome::Cancelled resets error/success
// streaks without touching the adaptive delay, matching §4.3's cancellation
// contract (a cancelled acquire never mutates rate-limit state beyond the
// streak counters).
#[sqlx::test]
async fn cancelled_outcome_does_not_grow_delay(pool: PgPool) {
    let h = build(pool, SchedulerConfig::default()).await;
    let limiter = DomainLimiter::new(SchedulerConfig::default(), Some(h.store.clone()));
    let permit = limiter
        .acquire(crawl_scheduler::AcquireRequest {
            domain: "example.com".to_string(),
            job_id: Uuid::new_v4(),
            robots_delay: None,
            job_concurrency: 1,
        })
        .await;
    let applied = permit.applied_delay();
    permit.release(AcquireOutcome::Cancelled).await;
    assert_eq!(applied, Duration::from_millis(500));
}

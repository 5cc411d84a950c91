//! The worker pool (C4, §4.4): N long-running workers plus three
//! housekeeping tasks, elastic scaling, and the job-level failure gate.
//!
//! The claim→fetch→persist→release loop and its retry/backoff outcome
//! dispatch are grounded in `orchestrator::crawl_pages`'s
//! `calculate_retry_backoff` and `PageResult` dispatch; the housekeeping
//! tasks follow `CrawlSessionManager::start_cleanup_task`'s
//! `Arc<Self>`-receiver + `tokio::spawn` + `tokio::time::interval` shape.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::crawler::{is_blocking_error, Crawler};
use crate::limiter::{AcquireOutcome, AcquireRequest, DomainLimiter};
use crate::store::Store;
use crate::types::TaskStatus;

const BASE_SLEEP: Duration = Duration::from_millis(500);
const MAX_SLEEP: Duration = Duration::from_secs(30);
const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const BASE_WORKER_COUNT: u32 = 4;

#[derive(Clone)]
struct JobInfo {
    domain_name: String,
    domain_id: Uuid,
    find_links: bool,
    concurrency: u32,
    crawl_delay: Option<Duration>,
}

/// The narrow capability the worker pool needs from the job manager (§9):
/// enqueue discovered links and check/record the processed-pages dedup set.
#[async_trait::async_trait]
pub trait LinkSink: Send + Sync {
    async fn enqueue_discovered_links(&self, job_id: Uuid, domain_id: Uuid, source_url: &str, links: Vec<String>);
}

struct JobFailureState {
    consecutive_failures: AtomicU32,
}

pub struct WorkerPool {
    store: Arc<Store>,
    limiter: DomainLimiter,
    crawler: Arc<dyn Crawler>,
    config: SchedulerConfig,
    link_sink: RwLock<Option<Arc<dyn LinkSink>>>,

    jobs: RwLock<std::collections::HashSet<Uuid>>,
    job_requirements: DashMap<Uuid, u32>,
    job_info_cache: DashMap<Uuid, JobInfo>,
    job_failures: DashMap<Uuid, JobFailureState>,

    current_workers: AtomicU32,
    stopping: std::sync::atomic::AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    wake: Arc<Notify>,

    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(store: Arc<Store>, limiter: DomainLimiter, crawler: Arc<dyn Crawler>, config: SchedulerConfig) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            store,
            limiter,
            crawler,
            config,
            link_sink: RwLock::new(None),
            jobs: RwLock::new(std::collections::HashSet::new()),
            job_requirements: DashMap::new(),
            job_info_cache: DashMap::new(),
            job_failures: DashMap::new(),
            current_workers: AtomicU32::new(0),
            stopping: std::sync::atomic::AtomicBool::new(false),
            shutdown_tx,
            wake: Arc::new(Notify::new()),
            handles: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn set_link_sink(&self, sink: Arc<dyn LinkSink>) {
        *self.link_sink.write().await = Some(sink);
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// §4.4.6 startup recovery, then spawn the base workers and the three
    /// housekeeping tasks. Non-blocking.
    pub async fn start(self: &Arc<Self>) -> crate::error::SchedulerResult<()> {
        let recovered = self.store.recover_running_jobs().await?;
        {
            let mut jobs = self.jobs.write().await;
            for job_id in recovered {
                jobs.insert(job_id);
            }
        }

        self.rescale(BASE_WORKER_COUNT).await;

        self.spawn_housekeeping(Self::run_stale_task_monitor, RECOVERY_INTERVAL);
        self.spawn_housekeeping(Self::run_stuck_job_sweep, CLEANUP_INTERVAL);
        self.spawn_housekeeping(Self::run_orphan_cleanup, CLEANUP_INTERVAL);

        Ok(())
    }

    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().expect("handles mutex poisoned"));
        for handle in handles {
            let _ = handle.await;
        }
    }

    // ---- scaling (§4.4.5) ----

    pub async fn add_job(self: &Arc<Self>, job_id: Uuid, info: JobInfoInput, required_workers: Option<u32>) {
        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job_id);
        }
        self.job_info_cache.insert(
            job_id,
            JobInfo {
                domain_name: info.domain_name,
                domain_id: info.domain_id,
                find_links: info.find_links,
                concurrency: info.concurrency,
                crawl_delay: info.crawl_delay,
            },
        );
        if let Some(n) = required_workers {
            if n > 0 {
                self.job_requirements.insert(job_id, n);
            }
        }
        let target = self.target_worker_count();
        if target > self.current_workers.load(Ordering::SeqCst) {
            self.rescale(target).await;
        }
        self.wake.notify_waiters();
    }

    pub async fn remove_job(&self, job_id: Uuid) {
        {
            let mut jobs = self.jobs.write().await;
            jobs.remove(&job_id);
        }
        self.job_requirements.remove(&job_id);
        self.job_info_cache.remove(&job_id);
        self.job_failures.remove(&job_id);
        let target = self.target_worker_count().max(BASE_WORKER_COUNT);
        self.current_workers.store(target, Ordering::SeqCst);
    }

    fn target_worker_count(&self) -> u32 {
        self.job_requirements
            .iter()
            .map(|e| *e.value())
            .fold(BASE_WORKER_COUNT, u32::max)
    }

    async fn rescale(self: &Arc<Self>, target: u32) {
        let current = self.current_workers.swap(target, Ordering::SeqCst);
        if target <= current {
            return;
        }
        let mut handles = self.handles.lock().expect("handles mutex poisoned");
        for worker_id in current..target {
            let pool = self.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown_rx).await;
            }));
        }
    }

    // ---- worker loop (§4.4) ----

    async fn worker_loop(self: Arc<Self>, worker_id: u32, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut miss_count: u32 = 0;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return;
            }
            if worker_id >= self.current_workers.load(Ordering::SeqCst) {
                return;
            }

            match self.claim_pending_task().await {
                Some(task) => {
                    self.process_task(task).await;
                    miss_count = 0;
                }
                None => {
                    let backoff = (BASE_SLEEP.as_millis() as f64 * 1.5f64.powi(miss_count.min(10) as i32)) as u64;
                    let backoff = Duration::from_millis(backoff).min(MAX_SLEEP);
                    miss_count = miss_count.saturating_add(1);

                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = self.wake.notified() => {}
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
        }
    }

    /// §4.4.1 claim: round-robin over a snapshot of active job ids.
    async fn claim_pending_task(&self) -> Option<crate::types::Task> {
        let job_ids: Vec<Uuid> = self.jobs.read().await.iter().copied().collect();
        for job_id in job_ids {
            if let Ok(Some(task)) = self.store.get_next_task(job_id).await {
                return Some(task);
            }
        }
        None
    }

    /// §4.4.2 process.
    async fn process_task(self: &Arc<Self>, mut task: crate::types::Task) {
        let info = match self.job_info_cache.get(&task.job_id) {
            Some(info) => info.clone(),
            None => {
                log::warn!(target: "scheduler::worker_pool", "no job info cached for job {}; re-queuing task", task.job_id);
                task.status = TaskStatus::Pending;
                let _ = self.store.update_task_status(&task).await;
                return;
            }
        };

        let permit = self
            .limiter
            .acquire(AcquireRequest {
                domain: info.domain_name.clone(),
                job_id: task.job_id,
                robots_delay: info.crawl_delay,
                job_concurrency: info.concurrency,
            })
            .await;

        let url = build_url(&info.domain_name, &task.path);
        let result = self.crawler.warm_url(&url, info.find_links).await;

        match result {
            Ok(warm) => {
                permit.release(AcquireOutcome::Success).await;
                task.status = TaskStatus::Completed;
                task.completed_at = Some(chrono::Utc::now());
                task.status_code = Some(warm.status_code as i32);
                task.response_time_ms = Some(warm.response_time_ms as i64);
                task.cache_status = warm.cache_status.clone();
                task.content_type = warm.content_type.clone();
                let _ = self.store.update_task_status(&task).await;
                self.record_success(task.job_id).await;

                if info.find_links && !warm.links.is_empty() {
                    if let Some(sink) = self.link_sink.read().await.clone() {
                        sink.enqueue_discovered_links(task.job_id, info.domain_id, &url, warm.links).await;
                    }
                }
            }
            Err(err) => {
                let message = err.0;
                if is_blocking_error(&message) {
                    permit.release(AcquireOutcome::RateLimited).await;
                    if task.retry_count + 1 >= self.config.rate_limit_max_retries as i32 {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(chrono::Utc::now());
                    } else {
                        task.status = TaskStatus::Pending;
                        task.retry_count += 1;
                        task.started_at = None;
                    }
                    task.error = Some(message);
                    let _ = self.store.update_task_status(&task).await;
                } else if is_retryable_error(&message) {
                    permit.release(AcquireOutcome::Failure).await;
                    if task.retry_count + 1 >= self.config.max_task_retries as i32 {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(chrono::Utc::now());
                    } else {
                        task.status = TaskStatus::Pending;
                        task.retry_count += 1;
                        task.started_at = None;
                    }
                    task.error = Some(message);
                    let _ = self.store.update_task_status(&task).await;
                } else {
                    permit.release(AcquireOutcome::Failure).await;
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(chrono::Utc::now());
                    task.error = Some(message);
                    let _ = self.store.update_task_status(&task).await;
                }

                // The job-level gate counts a task as having failed it only
                // once its own retry budget is exhausted, not on every
                // individual retryable attempt (§4.4.7).
                if task.status == TaskStatus::Failed {
                    self.record_failure(task.job_id, &task.error.clone().unwrap_or_default()).await;
                }
            }
        }

        self.maybe_finalise_job(task.job_id).await;
    }

    async fn maybe_finalise_job(&self, job_id: Uuid) {
        if let Ok(job) = self.store.get_job(job_id).await {
            if job.status.is_active() && job.is_stuck_complete() {
                let _ = self.store.cleanup_stuck_jobs().await;
                self.remove_job(job_id).await;
            }
        }
    }

    // ---- job-level failure gate (§4.4.7) ----

    async fn record_success(&self, job_id: Uuid) {
        if let Some(state) = self.job_failures.get(&job_id) {
            state.consecutive_failures.store(0, Ordering::SeqCst);
        }
    }

    async fn record_failure(self: &Arc<Self>, job_id: Uuid, last_error: &str) {
        let state = self
            .job_failures
            .entry(job_id)
            .or_insert_with(|| JobFailureState { consecutive_failures: AtomicU32::new(0) });
        let failures = state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        drop(state);

        if failures >= self.config.job_failure_threshold {
            let message = format!("job failed after {failures} consecutive task failures: {last_error}");
            log::error!(target: "scheduler::worker_pool", "{message}");
            let _ = self.store.fail_job(job_id, &message).await;
            self.remove_job(job_id).await;
        }
    }

    // ---- housekeeping (§4.4.6) ----

    fn spawn_housekeeping<F, Fut>(self: &Arc<Self>, task: F, interval: Duration)
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let pool = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task(pool.clone()).await,
                    _ = shutdown_rx.recv() => return,
                }
            }
        });
        self.handles.lock().expect("handles mutex poisoned").push(handle);
    }

    async fn run_stale_task_monitor(self: Arc<Self>) {
        let timeout = Duration::from_secs(self.config.task_stale_timeout_seconds);
        match self.store.reclaim_stale_tasks(timeout, self.config.max_task_retries).await {
            Ok(n) if n > 0 => log::debug!(target: "scheduler::worker_pool", "reclaimed {n} stale tasks"),
            Ok(_) => {}
            Err(err) => log::warn!(target: "scheduler::worker_pool", "stale task reclaim failed: {err}"),
        }
    }

    async fn run_stuck_job_sweep(self: Arc<Self>) {
        match self.store.cleanup_stuck_jobs().await {
            Ok(n) if n > 0 => log::debug!(target: "scheduler::worker_pool", "swept {n} stuck jobs to completed"),
            Ok(_) => {}
            Err(err) => log::warn!(target: "scheduler::worker_pool", "stuck job sweep failed: {err}"),
        }
    }

    async fn run_orphan_cleanup(self: Arc<Self>) {
        match self.store.cleanup_one_failed_job_orphans().await {
            Ok(Some(job_id)) => log::debug!(target: "scheduler::worker_pool", "cleaned orphan tasks for failed job {job_id}"),
            Ok(None) => {}
            Err(err) => log::warn!(target: "scheduler::worker_pool", "orphan cleanup failed: {err}"),
        }
    }

}

pub struct JobInfoInput {
    pub domain_name: String,
    pub domain_id: Uuid,
    pub find_links: bool,
    pub concurrency: u32,
    pub crawl_delay: Option<Duration>,
}

fn build_url(domain: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        let mut url = url::Url::parse(path).unwrap_or_else(|_| url::Url::parse(&format!("https://{domain}{path}")).expect("fallback URL is well-formed"));
        let _ = url.set_scheme("https");
        url.to_string()
    } else {
        format!("https://{domain}{path}")
    }
}

/// Timeouts, connection failures, and 5xx responses other than the ones
/// `is_blocking_error` already claims (429/403/503) are retried (§4.4.2).
fn is_retryable_error(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    ["timeout", "connection refused", "connection reset", "dns", "500", "502", "504"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_handles_relative_and_absolute_paths() {
        assert_eq!(build_url("example.com", "/a"), "https://example.com/a");
        assert_eq!(build_url("example.com", "http://example.com/a"), "https://example.com/a");
    }

    #[test]
    fn retryable_error_matches_timeouts_not_client_errors() {
        assert!(is_retryable_error("connection timeout"));
        assert!(is_retryable_error("dns lookup failed"));
        assert!(!is_retryable_error("404 not found"));
    }
}

//! Top-level facade bundling store, limiter, worker pool, job manager and
//! notification bridge, per the design note preferring a configured tuple
//! over process-wide statics.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::crawler::Crawler;
use crate::error::SchedulerResult;
use crate::job_manager::JobManager;
use crate::limiter::DomainLimiter;
use crate::notify_bridge::NotifyBridge;
use crate::store::Store;
use crate::types::{Job, JobOptions};
use crate::worker_pool::WorkerPool;

pub struct Scheduler {
    pub store: Arc<Store>,
    pub worker_pool: Arc<WorkerPool>,
    pub job_manager: Arc<JobManager>,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
    notify_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub async fn build(database_url: &str, config: SchedulerConfig, crawler: Arc<dyn Crawler>) -> SchedulerResult<Self> {
        let store = Arc::new(Store::connect(database_url).await?);
        let limiter = DomainLimiter::new(config.clone(), Some(store.clone()));
        let worker_pool = WorkerPool::new(store.clone(), limiter, crawler.clone(), config);
        let job_manager = JobManager::new(store.clone(), crawler, worker_pool.clone());
        worker_pool.set_link_sink(job_manager.clone()).await;

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        Ok(Self {
            store,
            worker_pool,
            job_manager,
            shutdown_tx,
            notify_handle: std::sync::Mutex::new(None),
        })
    }

    pub async fn start(&self) -> SchedulerResult<()> {
        self.worker_pool.start().await?;

        let bridge = NotifyBridge::new(self.store.pool().clone());
        let wake = self.worker_pool.wake_handle();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            bridge.run(wake, shutdown_rx).await;
        });
        *self.notify_handle.lock().expect("notify handle mutex poisoned") = Some(handle);

        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.worker_pool.stop().await;
        if let Some(handle) = self.notify_handle.lock().expect("notify handle mutex poisoned").take() {
            let _ = handle.await;
        }
    }

    pub async fn create_job(&self, opts: JobOptions) -> SchedulerResult<Job> {
        self.job_manager.create_job(opts).await
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        self.job_manager.cancel_job(job_id).await
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.job_manager.get_job_status(job_id).await
    }

    pub async fn restart_job(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.job_manager.restart_job(job_id).await
    }
}

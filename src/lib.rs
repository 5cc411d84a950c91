pub mod config;
pub mod crawler;
pub mod error;
pub mod job_manager;
pub mod limiter;
pub mod notify_bridge;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker_pool;

pub use config::SchedulerConfig;
pub use crawler::{Crawler, CrawlerError, MockCrawler, WarmResult};
pub use error::{SchedulerError, SchedulerResult};
pub use job_manager::JobManager;
pub use limiter::{AcquireOutcome, AcquireRequest, DomainLimiter, DomainPermit};
pub use notify_bridge::NotifyBridge;
pub use scheduler::Scheduler;
pub use store::Store;
pub use types::{Domain, Job, JobOptions, JobStatus, Page, SourceType, Task, TaskStatus};
pub use worker_pool::{JobInfoInput, LinkSink, WorkerPool};

//! Domain, Page, Job, Task and their state enums.
//!
//! Mirrors the persisted schema (`migrations/`) one-to-one; `sqlx::FromRow`
//! maps rows directly onto these structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Initialising,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Initialising | JobStatus::Running | JobStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum SourceType {
    Sitemap,
    Link,
    Manual,
    Fallback,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    pub name: String,
    pub adaptive_delay_seconds: f64,
    pub adaptive_delay_floor_seconds: f64,
}

impl Domain {
    /// Strip scheme, `www.` prefix and trailing slash.
    #[must_use]
    pub fn normalise(raw: &str) -> String {
        let mut s = raw.trim();
        if let Some(rest) = s.strip_prefix("https://") {
            s = rest;
        } else if let Some(rest) = s.strip_prefix("http://") {
            s = rest;
        }
        let s = s.split('/').next().unwrap_or(s);
        let s = s.strip_prefix("www.").unwrap_or(s);
        s.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Page {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub path: String,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub user_id: Option<Uuid>,
    pub organisation_id: Option<Uuid>,
    pub status: JobStatus,
    pub progress: f64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub found_tasks: i64,
    pub sitemap_tasks: i64,
    pub concurrency: i32,
    pub find_links: bool,
    pub max_pages: Option<i32>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub required_workers: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub source_type: Option<SourceType>,
    pub source_url: Option<String>,
}

impl Job {
    /// Recompute `progress` from the counters (§3 invariant).
    #[must_use]
    pub fn recompute_progress(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        let done = self.completed_tasks + self.failed_tasks + self.skipped_tasks;
        100.0 * done as f64 / self.total_tasks as f64
    }

    /// Whether the job has reached the terminal-job rule of §4.1.
    #[must_use]
    pub fn is_stuck_complete(&self) -> bool {
        self.total_tasks > 0 && self.completed_tasks + self.failed_tasks + self.skipped_tasks >= self.total_tasks
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub page_id: Uuid,
    pub path: String,
    pub status: TaskStatus,
    pub retry_count: i32,
    pub priority_score: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source_type: SourceType,
    pub source_url: Option<String>,
    pub status_code: Option<i32>,
    pub response_time_ms: Option<i64>,
    pub cache_status: Option<String>,
    pub content_type: Option<String>,
    pub error: Option<String>,
}

/// Arguments to `JobManager::create_job`.
///
/// `domain` has no sane default and is the only required field; everything
/// else gets a default via the `with_*` setters, following the teacher's
/// `CrawlConfig` builder-lite convention rather than a full typestate
/// builder (not warranted for a single required field).
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub domain: String,
    pub user_id: Option<Uuid>,
    pub organisation_id: Option<Uuid>,
    pub concurrency: u32,
    pub find_links: bool,
    pub use_sitemap: bool,
    pub max_pages: Option<u32>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub required_workers: Option<u32>,
}

impl JobOptions {
    #[must_use]
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            user_id: None,
            organisation_id: None,
            concurrency: 1,
            find_links: false,
            use_sitemap: false,
            max_pages: None,
            include_paths: Vec::new(),
            exclude_paths: Vec::new(),
            required_workers: None,
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_organisation_id(mut self, organisation_id: Uuid) -> Self {
        self.organisation_id = Some(organisation_id);
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_find_links(mut self, find_links: bool) -> Self {
        self.find_links = find_links;
        self
    }

    #[must_use]
    pub fn with_sitemap(mut self, use_sitemap: bool) -> Self {
        self.use_sitemap = use_sitemap;
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    #[must_use]
    pub fn with_include_paths(mut self, paths: Vec<String>) -> Self {
        self.include_paths = paths;
        self
    }

    #[must_use]
    pub fn with_exclude_paths(mut self, paths: Vec<String>) -> Self {
        self.exclude_paths = paths;
        self
    }

    #[must_use]
    pub fn with_required_workers(mut self, workers: u32) -> Self {
        self.required_workers = Some(workers);
        self
    }

    pub fn validate(&self) -> Result<(), crate::error::SchedulerError> {
        if self.domain.trim().is_empty() {
            return Err(crate::error::SchedulerError::InvalidJobOptions(
                "domain must not be empty".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(crate::error::SchedulerError::InvalidJobOptions(
                "concurrency must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_strips_scheme_www_and_path() {
        assert_eq!(Domain::normalise("https://www.Example.com/a/b"), "example.com");
        assert_eq!(Domain::normalise("http://example.com"), "example.com");
        assert_eq!(Domain::normalise("example.com/"), "example.com");
    }

    #[test]
    fn progress_zero_total_is_zero() {
        let job = Job {
            id: Uuid::new_v4(),
            domain_id: Uuid::new_v4(),
            user_id: None,
            organisation_id: None,
            status: JobStatus::Pending,
            progress: 0.0,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            skipped_tasks: 0,
            found_tasks: 0,
            sitemap_tasks: 0,
            concurrency: 1,
            find_links: false,
            max_pages: None,
            include_paths: vec![],
            exclude_paths: vec![],
            required_workers: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            source_type: None,
            source_url: None,
        };
        assert_eq!(job.recompute_progress(), 0.0);
    }
}

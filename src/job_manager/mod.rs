//! Job manager (C5, §4.5): create/start/cancel jobs, sitemap bootstrap,
//! and the per-job processed-pages dedup set.
//!
//! The worker-pool dependency is the narrow capability described in the
//! spec's cyclic-reference design note — only `LinkSink` is exposed back
//! to the pool, avoiding a circular `Arc` cycle between the two.

use std::sync::Arc;

use dashmap::DashSet;
use uuid::Uuid;

use crate::crawler::Crawler;
use crate::error::{SchedulerError, SchedulerResult};
use crate::store::Store;
use crate::types::{Job, JobOptions, JobStatus, SourceType};
use crate::worker_pool::{JobInfoInput, LinkSink, WorkerPool};

pub struct JobManager {
    store: Arc<Store>,
    crawler: Arc<dyn Crawler>,
    worker_pool: Arc<WorkerPool>,
    processed_pages: DashSet<String>,
}

impl JobManager {
    #[must_use]
    pub fn new(store: Arc<Store>, crawler: Arc<dyn Crawler>, worker_pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            store,
            crawler,
            worker_pool,
            processed_pages: DashSet::new(),
        })
    }

    pub async fn create_job(self: &Arc<Self>, opts: JobOptions) -> SchedulerResult<Job> {
        opts.validate()?;
        let domain = self.store.ensure_domain(&opts.domain).await?;

        if let Some(org_id) = opts.organisation_id {
            if let Some(existing) = self.store.active_job_for_domain_org(domain.id, Some(org_id)).await? {
                let _ = self.cancel_job(existing.id).await;
            }
        }

        let initial_status = if opts.use_sitemap { JobStatus::Initialising } else { JobStatus::Pending };
        let job = self.store.insert_job(domain.id, &opts, initial_status).await?;

        if opts.use_sitemap {
            let this = self.clone();
            let job_id = job.id;
            let domain_name = domain.name.clone();
            let domain_id = domain.id;
            let include = opts.include_paths.clone();
            let exclude = opts.exclude_paths.clone();
            tokio::spawn(async move {
                if let Err(err) = this.bootstrap_sitemap(job_id, domain_id, &domain_name, &include, &exclude).await {
                    let message = format!("sitemap bootstrap failed: {err}");
                    log::error!(target: "scheduler::job_manager", "job {job_id}: {message}");
                    let _ = this.store.fail_job(job_id, &message).await;
                }
            });
        } else {
            self.enqueue_job_urls(
                job.id,
                domain.id,
                vec![("/".to_string(), 1.0)],
                SourceType::Manual,
                None,
            )
            .await?;
            self.start_job(job.id).await?;
        }

        Ok(job)
    }

    async fn bootstrap_sitemap(
        self: &Arc<Self>,
        job_id: Uuid,
        domain_id: Uuid,
        domain_name: &str,
        include: &[String],
        exclude: &[String],
    ) -> anyhow::Result<()> {
        let sitemaps = self
            .crawler
            .discover_sitemaps(domain_name)
            .await
            .map_err(|e| anyhow::anyhow!(e.0))?;

        let mut all_urls = Vec::new();
        for sitemap_url in &sitemaps {
            let urls = self
                .crawler
                .parse_sitemap(sitemap_url)
                .await
                .map_err(|e| anyhow::anyhow!(e.0))?;
            all_urls.extend(urls);
        }

        let filtered = self.crawler.filter_urls(all_urls, include, exclude);
        let base_url = format!("https://{domain_name}/");

        if filtered.is_empty() {
            self.enqueue_job_urls(
                job_id,
                domain_id,
                vec![("/".to_string(), 1.0)],
                SourceType::Fallback,
                Some(base_url),
            )
            .await?;
        } else {
            let pages: Vec<(String, f64)> = filtered
                .into_iter()
                .map(|u| {
                    let path = url_path(&u);
                    let priority = if path == "/" { 1.0 } else { 0.5 };
                    (path, priority)
                })
                .collect();
            self.enqueue_job_urls(job_id, domain_id, pages, SourceType::Sitemap, Some(base_url))
                .await?;
        }

        self.start_job(job_id).await?;
        Ok(())
    }

    /// Filters inputs through the processed-pages set before delegating to
    /// `Store::enqueue_urls` (§4.5, §8 invariant 10).
    pub async fn enqueue_job_urls(
        &self,
        job_id: Uuid,
        domain_id: Uuid,
        pages: Vec<(String, f64)>,
        source_type: SourceType,
        source_url: Option<String>,
    ) -> SchedulerResult<u64> {
        // The dedup set is keyed on page_id, which only exists once the page
        // row has been created; Store::enqueue_urls itself is the source of
        // truth for the (job_id, page_id) uniqueness invariant via its
        // ON CONFLICT DO NOTHING. The in-memory set is a fast-path
        // short-circuit for repeated link-discovery of the same path string
        // within a job, keyed on the normalised path directly.
        let fresh: Vec<(String, f64)> = pages
            .into_iter()
            .filter(|(path, _)| self.processed_pages.insert(Self::path_key(job_id, path)))
            .collect();

        if fresh.is_empty() {
            return Ok(0);
        }

        self.store.enqueue_urls(job_id, domain_id, fresh, source_type, source_url).await
    }

    fn path_key(job_id: Uuid, path: &str) -> String {
        format!("{job_id}_{path}")
    }

    pub async fn start_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        self.store.transition_job_status(job_id, JobStatus::Running).await?;
        let job = self.store.get_job(job_id).await?;
        let domain = self.store.get_domain_by_id(job.domain_id).await?;

        self.worker_pool
            .add_job(
                job_id,
                JobInfoInput {
                    domain_name: domain.name,
                    domain_id: job.domain_id,
                    find_links: job.find_links,
                    concurrency: job.concurrency.max(1) as u32,
                    crawl_delay: if domain.adaptive_delay_seconds > 0.0 {
                        Some(std::time::Duration::from_secs_f64(domain.adaptive_delay_seconds))
                    } else {
                        None
                    },
                },
                job.required_workers.map(|v| v as u32),
            )
            .await;
        Ok(())
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> SchedulerResult<()> {
        self.store.cancel_job(job_id).await?;
        self.worker_pool.remove_job(job_id).await;
        self.clear_processed_pages(job_id);
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.store.get_job(job_id).await
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> SchedulerResult<Job> {
        self.store.cleanup_stuck_jobs().await?;
        self.store.get_job(job_id).await
    }

    /// Restart a terminal job: creates a *new* job id with the same
    /// configuration; the original is left untouched as history (§4.1,
    /// §8 invariant 9).
    pub async fn restart_job(self: &Arc<Self>, job_id: Uuid) -> SchedulerResult<Job> {
        let original = self.store.get_job(job_id).await?;
        if !original.status.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                from: original.status,
                to: JobStatus::Pending,
            });
        }

        let domain = self.store.get_domain_by_id(original.domain_id).await?;
        let opts = JobOptions {
            domain: domain.name,
            user_id: original.user_id,
            organisation_id: original.organisation_id,
            concurrency: original.concurrency.max(1) as u32,
            find_links: original.find_links,
            use_sitemap: false,
            max_pages: original.max_pages.map(|v| v as u32),
            include_paths: original.include_paths.clone(),
            exclude_paths: original.exclude_paths.clone(),
            required_workers: original.required_workers.map(|v| v as u32),
        };

        self.create_job(opts).await
    }

    fn clear_processed_pages(&self, job_id: Uuid) {
        let prefix = format!("{job_id}_");
        self.processed_pages.retain(|key| !key.starts_with(&prefix));
    }
}

#[async_trait::async_trait]
impl LinkSink for JobManager {
    async fn enqueue_discovered_links(&self, job_id: Uuid, domain_id: Uuid, source_url: &str, links: Vec<String>) {
        let pages: Vec<(String, f64)> = links
            .iter()
            .filter_map(|link| normalise_discovered_link(link, source_url).map(|path| (path, 0.5)))
            .collect();

        if pages.is_empty() {
            return;
        }

        if let Err(err) = self
            .enqueue_job_urls(job_id, domain_id, pages, SourceType::Link, Some(source_url.to_string()))
            .await
        {
            log::warn!(target: "scheduler::job_manager", "failed to enqueue discovered links for job {job_id}: {err}");
        }
    }
}

fn url_path(raw: &str) -> String {
    url::Url::parse(raw)
        .map(|u| {
            let path = u.path();
            if path.is_empty() { "/".to_string() } else { path.to_string() }
        })
        .unwrap_or_else(|_| "/".to_string())
}

/// §4.4.3 link normalisation: strip fragment, strip trailing `/` except
/// root, lowercase host, accept only same-domain-or-subdomain URLs (with
/// `www.` normalisation on both sides).
fn normalise_discovered_link(link: &str, source_url: &str) -> Option<String> {
    let base = url::Url::parse(source_url).ok()?;
    let absolute = base.join(link).ok()?;

    let link_host = absolute.host_str()?.to_ascii_lowercase();
    let base_host = base.host_str()?.to_ascii_lowercase();
    let link_host_bare = link_host.strip_prefix("www.").unwrap_or(&link_host);
    let base_host_bare = base_host.strip_prefix("www.").unwrap_or(&base_host);
    if link_host_bare != base_host_bare && !link_host_bare.ends_with(&format!(".{base_host_bare}")) {
        return None;
    }

    let mut path = absolute.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.is_empty() {
        path = "/".to_string();
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_rejects_other_domains() {
        assert_eq!(
            normalise_discovered_link("https://example.com/a/", "https://example.com/"),
            Some("/a".to_string())
        );
        assert_eq!(normalise_discovered_link("https://other.com/a", "https://example.com/"), None);
        assert_eq!(
            normalise_discovered_link("https://www.example.com/b", "https://example.com/"),
            Some("/b".to_string())
        );
        assert_eq!(
            normalise_discovered_link("https://blog.example.com/c", "https://example.com/"),
            Some("/c".to_string())
        );
    }
}

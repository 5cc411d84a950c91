//! Per-domain adaptive delay + concurrency gate (C3, §4.3).
//!
//! Per-domain state lives in a `DashMap` entry, lazily created on first
//! access — the same lazy-create-on-miss convention as the teacher's
//! `DomainLimiter`. The async wait for a free concurrency slot uses a
//! `tokio::sync::Notify` parked alongside the state mutex, since
//! `std::sync::Condvar` cannot be awaited.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};

use crate::config::SchedulerConfig;
use crate::store::Store;

#[derive(Debug, Clone)]
struct DomainState {
    base_delay: Duration,
    adaptive_delay: Duration,
    delay_floor: Duration,
    error_streak: u32,
    success_streak: u32,
    next_available: Instant,
    backoff_until: Instant,
    probing: bool,
    probe_previous: Duration,
    probe_target: Duration,
    active: u32,
    dirty: bool,
    last_persisted: Instant,
}

impl DomainState {
    fn new(base_delay: Duration) -> Self {
        let now = Instant::now();
        Self {
            base_delay,
            adaptive_delay: base_delay,
            delay_floor: Duration::ZERO,
            error_streak: 0,
            success_streak: 0,
            next_available: now,
            backoff_until: now,
            probing: false,
            probe_previous: base_delay,
            probe_target: base_delay,
            active: 0,
            dirty: false,
            last_persisted: now,
        }
    }
}

struct DomainEntry {
    state: Mutex<DomainState>,
    slot_freed: Notify,
}

pub struct AcquireRequest {
    pub domain: String,
    pub job_id: uuid::Uuid,
    pub robots_delay: Option<Duration>,
    pub job_concurrency: u32,
}

pub struct DomainPermit {
    domain: String,
    applied_delay: Duration,
    limiter: Arc<DomainLimiterInner>,
    released: AtomicBool,
}

impl DomainPermit {
    #[must_use]
    pub fn applied_delay(&self) -> Duration {
        self.applied_delay
    }

    pub async fn release(self, outcome: AcquireOutcome) {
        self.limiter.clone().release(&self.domain, outcome).await;
        self.released.store(true, Ordering::SeqCst);
    }
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            log::warn!(
                target: "scheduler::limiter",
                "domain permit for '{}' dropped without release()",
                self.domain
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Success,
    RateLimited,
    Failure,
    Cancelled,
}

struct DomainLimiterInner {
    domains: DashMap<String, Arc<DomainEntry>>,
    config: SchedulerConfig,
    store: Option<Arc<Store>>,
}

/// Public handle. Cloning is cheap (wraps an `Arc`).
#[derive(Clone)]
pub struct DomainLimiter {
    inner: Arc<DomainLimiterInner>,
}

impl DomainLimiter {
    #[must_use]
    pub fn new(config: SchedulerConfig, store: Option<Arc<Store>>) -> Self {
        Self {
            inner: Arc::new(DomainLimiterInner {
                domains: DashMap::new(),
                config,
                store,
            }),
        }
    }

    fn entry(&self, domain: &str) -> Arc<DomainEntry> {
        self.inner
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                Arc::new(DomainEntry {
                    state: Mutex::new(DomainState::new(Duration::from_millis(
                        self.inner.config.rate_limit_base_delay_ms,
                    ))),
                    slot_freed: Notify::new(),
                })
            })
            .clone()
    }

    pub async fn acquire(&self, req: AcquireRequest) -> DomainPermit {
        let entry = self.entry(&req.domain);

        loop {
            let wait_until;
            {
                let mut state = entry.state.lock().await;

                if let Some(robots_delay) = req.robots_delay {
                    if robots_delay > state.base_delay {
                        state.base_delay = robots_delay;
                        if state.adaptive_delay < state.base_delay {
                            state.adaptive_delay = state.base_delay;
                        }
                    }
                }

                let now = Instant::now();
                let ready_at = state.next_available.max(state.backoff_until);
                if now < ready_at {
                    wait_until = Some(ready_at);
                } else {
                    let allowed = allowed_concurrency(&state, req.job_concurrency, self.inner.config.concurrency_step_seconds);
                    if state.active < allowed {
                        state.active += 1;
                        state.next_available = Instant::now() + state.adaptive_delay;
                        let applied_delay = state.adaptive_delay;
                        drop(state);
                        return DomainPermit {
                            domain: req.domain,
                            applied_delay,
                            limiter: self.inner.clone(),
                            released: AtomicBool::new(false),
                        };
                    }
                    wait_until = None;
                }
            }

            match wait_until {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => {
                    let notified = entry.slot_freed.notified();
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }
    }
}

fn allowed_concurrency(state: &DomainState, job_concurrency: u32, concurrency_step_seconds: u64) -> u32 {
    if concurrency_step_seconds == 0 {
        return job_concurrency.max(1);
    }
    let extra_delay = state.adaptive_delay.saturating_sub(state.base_delay).as_secs_f64();
    let step = concurrency_step_seconds as f64;
    let reduction = (extra_delay / step).floor() as i64;
    (job_concurrency as i64 - reduction).clamp(1, job_concurrency.max(1) as i64) as u32
}

impl DomainLimiterInner {
    async fn release(self: Arc<Self>, domain: &str, outcome: AcquireOutcome) {
        let Some(entry) = self.domains.get(domain).map(|e| e.clone()) else {
            return;
        };

        {
            let mut state = entry.state.lock().await;
            state.active = state.active.saturating_sub(1);

            match outcome {
                AcquireOutcome::RateLimited => {
                    state.success_streak = 0;
                    state.error_streak += 1;
                    if state.probing {
                        // The revert to probe_previous (and raised floor) is
                        // itself the penalty for rate-limiting mid-probe; no
                        // extra step on top of it (§8 S5).
                        state.adaptive_delay = state.probe_previous;
                        state.delay_floor = state.probe_target;
                        state.probing = false;
                    } else {
                        let step = Duration::from_secs(self.config.rate_limit_delay_step_seconds);
                        let max_delay = Duration::from_secs(self.config.rate_limit_max_delay_seconds);
                        state.adaptive_delay = (state.adaptive_delay + step).min(max_delay);
                    }
                    state.backoff_until = Instant::now() + state.adaptive_delay;
                    state.dirty = true;
                }
                AcquireOutcome::Success => {
                    state.error_streak = 0;
                    state.success_streak += 1;
                    if state.probing {
                        state.probing = false;
                    } else if state.success_streak >= self.config.rate_limit_success_threshold {
                        let step = Duration::from_secs(self.config.rate_limit_delay_step_seconds);
                        let floor = state.delay_floor.max(state.base_delay);
                        let target = state.adaptive_delay.saturating_sub(step).max(floor);
                        if target < state.adaptive_delay {
                            state.probing = true;
                            state.probe_previous = state.adaptive_delay;
                            state.probe_target = target;
                            state.adaptive_delay = target;
                            state.success_streak = 0;
                            state.dirty = true;
                        }
                    }
                }
                AcquireOutcome::Failure | AcquireOutcome::Cancelled => {
                    state.error_streak = 0;
                    state.success_streak = 0;
                }
            }

            if state.dirty && state.last_persisted.elapsed() >= Duration::from_secs(self.config.persist_interval_seconds) {
                if let Some(store) = &self.store {
                    let _ = store
                        .persist_domain_delays(domain, state.adaptive_delay.as_secs_f64(), state.delay_floor.as_secs_f64())
                        .await;
                }
                state.dirty = false;
                state.last_persisted = Instant::now();
            }
        }

        entry.slot_freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[tokio::test]
    async fn acquire_then_release_success_is_fast() {
        let limiter = DomainLimiter::new(cfg(), None);
        let permit = limiter
            .acquire(AcquireRequest {
                domain: "example.com".into(),
                job_id: uuid::Uuid::new_v4(),
                robots_delay: None,
                job_concurrency: 2,
            })
            .await;
        assert_eq!(permit.applied_delay(), Duration::from_millis(500));
        permit.release(AcquireOutcome::Success).await;
    }

    #[tokio::test]
    async fn rate_limited_grows_adaptive_delay() {
        let limiter = DomainLimiter::new(cfg(), None);
        let permit = limiter
            .acquire(AcquireRequest {
                domain: "slow.com".into(),
                job_id: uuid::Uuid::new_v4(),
                robots_delay: None,
                job_concurrency: 1,
            })
            .await;
        permit.release(AcquireOutcome::RateLimited).await;

        let entry = limiter.entry("slow.com");
        let state = entry.state.lock().await;
        assert_eq!(state.adaptive_delay, Duration::from_millis(1500));
        assert_eq!(state.error_streak, 1);
    }

    #[tokio::test]
    async fn probe_lowers_then_reverts_on_rate_limit() {
        let limiter = DomainLimiter::new(cfg(), None);
        {
            // Seed as if the domain had previously been rate-limited up to 3s,
            // matching S5 ("after 20 successes under adaptiveDelay=3s...").
            let entry = limiter.entry("probe.com");
            let mut state = entry.state.lock().await;
            state.adaptive_delay = Duration::from_secs(3);
            state.success_streak = 19;
        }

        let permit = limiter
            .acquire(AcquireRequest {
                domain: "probe.com".into(),
                job_id: uuid::Uuid::new_v4(),
                robots_delay: None,
                job_concurrency: 1,
            })
            .await;
        permit.release(AcquireOutcome::Success).await;

        {
            let entry = limiter.entry("probe.com");
            let state = entry.state.lock().await;
            assert!(state.probing);
            assert_eq!(state.adaptive_delay, Duration::from_secs(2));
        }

        let permit = limiter
            .acquire(AcquireRequest {
                domain: "probe.com".into(),
                job_id: uuid::Uuid::new_v4(),
                robots_delay: None,
                job_concurrency: 1,
            })
            .await;
        permit.release(AcquireOutcome::RateLimited).await;

        let entry = limiter.entry("probe.com");
        let state = entry.state.lock().await;
        assert!(!state.probing);
        assert_eq!(state.delay_floor, Duration::from_secs(2));
        assert_eq!(state.adaptive_delay, Duration::from_secs(3));
    }
}

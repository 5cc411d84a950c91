//! Environment-variable driven configuration for the scheduler.
//!
//! Parse failures on a set variable are logged and the default is kept —
//! configuration should never prevent startup.

/// Tunables for the domain limiter (§4.3) and the worker pool's job-level
/// failure gate (§4.4.7).
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Initial per-domain delay. Default 500ms.
    pub rate_limit_base_delay_ms: u64,
    /// Ceiling for the adaptive delay. Default 60s.
    pub rate_limit_max_delay_seconds: u64,
    /// Consecutive successes required before a probe. Default 20.
    pub rate_limit_success_threshold: u32,
    /// Blocking-error retry cap before a task is marked failed. Default 3.
    pub rate_limit_max_retries: u32,
    /// Consecutive task failures before a job is failed outright. Default 2.
    pub job_failure_threshold: u32,
    /// Optional auto-cancel after sustained rate-limiting.
    pub rate_limit_cancel: Option<CancelPolicy>,

    /// Delay step applied on each rate-limit backoff. Not environment
    /// configurable in the upstream spec; fixed at 1s per §4.3.
    pub rate_limit_delay_step_seconds: u64,
    /// Concurrency step used to compute the allowed in-flight count. Fixed
    /// at 5s per §4.3.
    pub concurrency_step_seconds: u64,
    /// How often dirty per-domain state is flushed to the store. Fixed at
    /// 30s per §4.3.
    pub persist_interval_seconds: u64,
    /// Cap on retries for non-blocking retryable task errors. Fixed at 5
    /// per §4.4.2.
    pub max_task_retries: u32,
    /// Running tasks older than this are considered stale. Fixed at 3min
    /// per §4.4.6.
    pub task_stale_timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CancelPolicy {
    pub threshold: u32,
    pub delay_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rate_limit_base_delay_ms: 500,
            rate_limit_max_delay_seconds: 60,
            rate_limit_success_threshold: 20,
            rate_limit_max_retries: 3,
            job_failure_threshold: 2,
            rate_limit_cancel: None,
            rate_limit_delay_step_seconds: 1,
            concurrency_step_seconds: 5,
            persist_interval_seconds: 30,
            max_task_retries: 5,
            task_stale_timeout_seconds: 180,
        }
    }
}

impl SchedulerConfig {
    /// Build a config from the `BBB_*` environment variables, falling back
    /// to defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let cancel_enabled = env_bool("BBB_RATE_LIMIT_CANCEL_ENABLED").unwrap_or(false);
        let rate_limit_cancel = if cancel_enabled {
            Some(CancelPolicy {
                threshold: env_parse("BBB_RATE_LIMIT_CANCEL_THRESHOLD").unwrap_or(10),
                delay_seconds: env_parse("BBB_RATE_LIMIT_CANCEL_DELAY_SECONDS").unwrap_or(300),
            })
        } else {
            None
        };

        Self {
            rate_limit_base_delay_ms: env_parse("BBB_RATE_LIMIT_BASE_DELAY_MS")
                .unwrap_or(defaults.rate_limit_base_delay_ms),
            rate_limit_max_delay_seconds: env_parse("BBB_RATE_LIMIT_MAX_DELAY_SECONDS")
                .unwrap_or(defaults.rate_limit_max_delay_seconds),
            rate_limit_success_threshold: env_parse("BBB_RATE_LIMIT_SUCCESS_THRESHOLD")
                .unwrap_or(defaults.rate_limit_success_threshold),
            rate_limit_max_retries: env_parse("BBB_RATE_LIMIT_MAX_RETRIES")
                .unwrap_or(defaults.rate_limit_max_retries),
            job_failure_threshold: env_parse("BBB_JOB_FAILURE_THRESHOLD")
                .unwrap_or(defaults.job_failure_threshold),
            rate_limit_cancel,
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!(target: "scheduler::config", "ignoring unparsable {key}={raw}");
                None
            }
        },
        Err(_) => None,
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.rate_limit_base_delay_ms, 500);
        assert_eq!(cfg.rate_limit_max_delay_seconds, 60);
        assert_eq!(cfg.rate_limit_success_threshold, 20);
        assert_eq!(cfg.job_failure_threshold, 2);
        assert!(cfg.rate_limit_cancel.is_none());
    }
}

//! Backoff policy applied when a job attempt fails or its lease expires.
//!
//! Delays grow exponentially from `backoff_base_ms` and are capped at
//! `backoff_max_ms`. Jitter is derived deterministically from the
//! (job id, attempt) pair so retries spread out across jobs while staying
//! reproducible for a given job.

use std::hash::{DefaultHasher, Hash, Hasher};

use super::{config::RetryConfig, job::JobId};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u16 {
        self.config.max_attempts
    }

    /// True once `attempts` completed attempts leave no retry budget.
    pub fn is_exhausted(&self, attempts: u16) -> bool {
        attempts >= self.config.max_attempts
    }

    /// Jittered delay before attempt number `attempt` becomes leasable.
    pub fn delay_ms(&self, job_id: JobId, attempt: u16) -> u64 {
        let anchor = self.base_delay_ms(attempt);
        if anchor == 0 {
            return 0;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let jitter_span = ((anchor as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(self.config.backoff_max_ms as f64);

        let lower = 0f64.max(anchor as f64 - jitter_span);
        let upper = (anchor as f64 + jitter_span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = self.deterministic_unit(job_id, attempt);
        let jittered = lower + (upper - lower) * unit;
        jittered.round() as u64
    }

    fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = (attempt.saturating_sub(1)) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    fn deterministic_unit(&self, job_id: JobId, attempt: u16) -> f64 {
        let mut hasher = DefaultHasher::default();
        job_id.hash(&mut hasher);
        attempt.hash(&mut hasher);
        let bits = hasher.finish();
        (bits as f64) / (u64::MAX as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 100,
        })
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(policy().delay_ms(JobId::new(), 0), 0);
    }

    #[test]
    fn base_delay_doubles_until_the_cap() {
        let policy = policy();
        assert_eq!(policy.base_delay_ms(1), 1_000);
        assert_eq!(policy.base_delay_ms(2), 2_000);
        assert_eq!(policy.base_delay_ms(3), 4_000);
        assert_eq!(policy.base_delay_ms(12), 60_000);
    }

    #[test]
    fn jittered_delay_stays_within_the_window() {
        let policy = policy();
        for attempt in 1..=8u16 {
            let anchor = policy.base_delay_ms(attempt);
            let jitter = ((anchor as f64) * 0.25).max(100.0).min(60_000.0);
            let delay = policy.delay_ms(JobId::new(), attempt);
            assert!(delay as f64 >= (anchor as f64 - jitter).max(0.0) - 1.0);
            assert!(delay as f64 <= (anchor as f64 + jitter).min(60_000.0) + 1.0);
        }
    }

    #[test]
    fn jitter_is_deterministic_per_job_and_attempt() {
        let policy = policy();
        let job = JobId::new();
        assert_eq!(policy.delay_ms(job, 3), policy.delay_ms(job, 3));
    }

    #[test]
    fn exhaustion_tracks_max_attempts() {
        let policy = policy();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
        assert!(policy.is_exhausted(6));
    }
}

use crate::error::DispatchError;
use crate::error_code::FailureKind;
use std::time::Duration;

/// How to proceed after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Same provider and model again.
    Retry { delay: Duration },
    /// A different model from the role's pool.
    Rotate { delay: Duration },
    Fail,
}

/// Retry limits per failure kind.
///
/// Keep this deterministic and explainable: rate limits rotate with exponential backoff,
/// transient failures retry in place, everything else fails on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_rate_limit_retries: u32,
    pub max_transient_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            max_rate_limit_retries: 1,
            max_transient_retries: 1,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^attempt`, or the vendor's retry-after, capped at `max_backoff`.
    pub(crate) fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exponential = self.base_backoff.saturating_mul(factor);
        retry_after.unwrap_or(exponential).min(self.max_backoff)
    }

    /// `rate_limited` and `transient` count retries already spent on each kind.
    pub(crate) fn decide(&self, err: &DispatchError, rate_limited: u32, transient: u32) -> Decision {
        match err.kind {
            FailureKind::RateLimited if rate_limited < self.max_rate_limit_retries => Decision::Rotate {
                delay: self.backoff(rate_limited, err.retry_after),
            },
            FailureKind::Transient if transient < self.max_transient_retries => Decision::Retry {
                delay: self.backoff(transient, err.retry_after),
            },
            _ => Decision::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FailureKind) -> DispatchError {
        DispatchError::new(kind, "p", "m", "x")
    }

    #[test]
    fn test_rate_limit_rotates_once() {
        let policy = RetryPolicy::default();
        let err = failure(FailureKind::RateLimited);
        assert_eq!(
            policy.decide(&err, 0, 0),
            Decision::Rotate { delay: Duration::from_millis(250) }
        );
        assert_eq!(policy.decide(&err, 1, 0), Decision::Fail);
    }

    #[test]
    fn test_backoff_doubles_per_rotation() {
        let policy = RetryPolicy {
            max_rate_limit_retries: 3,
            ..RetryPolicy::default()
        };
        let err = failure(FailureKind::RateLimited);
        assert_eq!(
            policy.decide(&err, 1, 0),
            Decision::Rotate { delay: Duration::from_millis(500) }
        );
        assert_eq!(policy.decide(&err, 3, 0), Decision::Fail);
    }

    #[test]
    fn test_transient_retries_once() {
        let policy = RetryPolicy::default();
        let err = failure(FailureKind::Transient);
        assert!(matches!(policy.decide(&err, 0, 0), Decision::Retry { .. }));
        assert_eq!(policy.decide(&err, 0, 1), Decision::Fail);
    }

    #[test]
    fn test_terminal_kinds_never_retry() {
        let policy = RetryPolicy::default();
        for kind in [FailureKind::Permanent, FailureKind::ContentPolicy, FailureKind::Configuration, FailureKind::Capability] {
            assert_eq!(policy.decide(&failure(kind), 0, 0), Decision::Fail);
        }
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = RetryPolicy::default();
        let err = failure(FailureKind::RateLimited).with_retry_after(Some(Duration::from_secs(60)));
        assert_eq!(policy.decide(&err, 0, 0), Decision::Rotate { delay: Duration::from_secs(8) });
        assert_eq!(policy.backoff(40, None), Duration::from_secs(8));
    }
}

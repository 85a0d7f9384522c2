use crate::{Context, Error, Result};
use std::time::Duration;
use tracing::debug;

/// Caller-side retry with exponential backoff.
///
/// Repositories never retry on their own. Callers that want retries wrap an
/// operation with [`retry_with_policy`]; only kinds for which
/// [`ErrorKind::is_retryable`](crate::ErrorKind::is_retryable) holds are
/// attempted again.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Short backoffs for lock contention on embedded engines
    pub fn fast() -> Self {
        Self::new(3, Duration::from_millis(10), Duration::from_millis(100), 2.0)
    }

    pub fn standard() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }

    /// Backoff before retry number `attempt` (0-indexed)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable kind, the
/// policy is exhausted, or `ctx` expires. Backoff sleeps never outlast the
/// context deadline.
pub fn retry_with_policy<F, T>(ctx: &Context, policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut last_error: Error = match operation() {
        Ok(value) => return Ok(value),
        Err(e) if !e.is_retryable() => return Err(e),
        Err(e) => e,
    };

    for attempt in 0..policy.max_attempts {
        let mut backoff = policy.backoff_duration(attempt);
        if let Some(remaining) = ctx.remaining() {
            backoff = backoff.min(remaining);
        }
        debug!(attempt = attempt + 1, kind = last_error.code(), ?backoff, "retrying operation");
        std::thread::sleep(backoff);
        if ctx.check().is_err() {
            return Err(last_error);
        }

        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => last_error = e,
        }
    }

    Err(last_error)
}

/// [`retry_with_policy`] with the default policy
pub fn retry<F, T>(ctx: &Context, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    retry_with_policy(ctx, &RetryPolicy::default(), operation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::cell::Cell;

    fn tiny() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0)
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(500), 2.0);
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_duration(5), Duration::from_millis(500));
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0);
        let result = retry_with_policy(&Context::background(), &tiny(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(Error::timeout("database is locked"))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_with_policy(&Context::background(), &tiny(), || {
            calls.set(calls.get() + 1);
            Err(Error::connection("refused"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Connection);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_kinds_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_with_policy(&Context::background(), &RetryPolicy::fast(), || {
            calls.set(calls.get() + 1);
            Err(Error::duplicate("email taken"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Duplicate);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_stops_when_context_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(5));
        let policy = RetryPolicy::new(1000, Duration::from_millis(2), Duration::from_millis(2), 1.0);
        let calls = Cell::new(0);
        let result: Result<()> = retry_with_policy(&ctx, &policy, || {
            calls.set(calls.get() + 1);
            Err(Error::transaction("serialization failure"))
        });
        assert!(result.is_err());
        assert!(calls.get() < 1000);
    }
}

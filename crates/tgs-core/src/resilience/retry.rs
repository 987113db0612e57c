use std::{
    collections::HashMap,
    future::Future,
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::{
    errors::{Error, ErrorClass},
    Result,
};

/// Longest single sleep the handler will take, whatever the server asks for.
pub const MAX_SLEEP: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (so up to `max_retries + 1` calls).
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Ceiling for a single backoff sleep. Flood waits are never capped.
    pub max_delay: Option<Duration>,
    pub exponential: bool,
    pub flood_wait_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Some(Duration::from_secs(60)),
            exponential: true,
            flood_wait_multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let raw = if self.exponential {
            let factor = 2u32.saturating_pow(attempt.min(16));
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay
        };
        match self.max_delay {
            Some(cap) if raw > cap => cap,
            _ => raw,
        }
    }

    pub fn flood_wait(&self, seconds: u64) -> Duration {
        let scaled = seconds as f64 * self.flood_wait_multiplier.max(0.0);
        Duration::try_from_secs_f64(scaled)
            .map(|d| d.min(MAX_SLEEP))
            .unwrap_or(MAX_SLEEP)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Retry,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct OperationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub status: OperationStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Runs fallible async operations with classified retries and keeps a
/// per-operation log of every attempt.
#[derive(Debug, Default)]
pub struct ErrorHandler {
    policy: RetryPolicy,
    logs: Mutex<HashMap<String, Vec<OperationLogEntry>>>,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_retry_policy(operation, self.policy, op).await
    }

    pub async fn with_retry_policy<T, F, Fut>(
        &self,
        operation: &str,
        policy: RetryPolicy,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let total = policy.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            let err = match op().await {
                Ok(v) => {
                    self.log(OperationLogEntry {
                        execution_time_secs: Some(started.elapsed().as_secs_f64()),
                        ..entry(operation, OperationStatus::Success, attempt + 1)
                    });
                    return Ok(v);
                }
                Err(e) => e,
            };

            let remaining = attempt < policy.max_retries;
            match err.class() {
                ErrorClass::RateLimit(seconds) if remaining => {
                    let delay = policy.flood_wait(seconds);
                    warn!(
                        operation,
                        seconds,
                        wait_secs = delay.as_secs_f64(),
                        attempt = attempt + 1,
                        "flood wait, backing off"
                    );
                    self.log_retry(operation, attempt + 1, &err, delay);
                    sleep(delay).await;
                }
                ErrorClass::SessionExpired | ErrorClass::Fatal => {
                    error!(operation, error = %err, "non-retryable error");
                    self.log_failed(operation, attempt + 1, &err);
                    return Err(err);
                }
                ErrorClass::Network | ErrorClass::Transient if remaining => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        operation,
                        error = %err,
                        delay_secs = delay.as_secs_f64(),
                        attempt = attempt + 1,
                        "operation failed, retrying"
                    );
                    self.log_retry(operation, attempt + 1, &err, delay);
                    sleep(delay).await;
                }
                class => {
                    error!(operation, attempts = total, error = %err, "retries exhausted");
                    self.log_failed(operation, attempt + 1, &err);
                    let last = Box::new(err);
                    let operation = operation.to_string();
                    return Err(match class {
                        ErrorClass::Network => Error::NetworkConnectivity {
                            operation,
                            attempts: total,
                            last,
                        },
                        _ => Error::MaxRetriesExceeded {
                            operation,
                            attempts: total,
                            last,
                        },
                    });
                }
            }

            attempt += 1;
        }
    }

    pub fn operation_logs(&self, operation: &str) -> Vec<OperationLogEntry> {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_operation_logs(&self) -> HashMap<String, Vec<OperationLogEntry>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear_logs(&self, operation: Option<&str>) {
        let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
        match operation {
            Some(op) => {
                logs.remove(op);
            }
            None => logs.clear(),
        }
    }

    fn log_retry(&self, operation: &str, attempt: u32, err: &Error, delay: Duration) {
        self.log(OperationLogEntry {
            error_type: Some(err.kind().to_string()),
            delay_secs: Some(delay.as_secs_f64()),
            last_error: Some(err.to_string()),
            ..entry(operation, OperationStatus::Retry, attempt)
        });
    }

    fn log_failed(&self, operation: &str, attempt: u32, err: &Error) {
        self.log(OperationLogEntry {
            error_type: Some(err.kind().to_string()),
            last_error: Some(err.to_string()),
            ..entry(operation, OperationStatus::Failed, attempt)
        });
    }

    fn log(&self, rec: OperationLogEntry) {
        debug!(operation = %rec.operation, status = ?rec.status, attempt = rec.attempt, "operation log");
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(rec.operation.clone())
            .or_default()
            .push(rec);
    }
}

fn entry(operation: &str, status: OperationStatus, attempt: u32) -> OperationLogEntry {
    OperationLogEntry {
        timestamp: Utc::now(),
        operation: operation.to_string(),
        status,
        attempt,
        error_type: None,
        delay_secs: None,
        execution_time_secs: None,
        last_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn handler() -> ErrorHandler {
        ErrorHandler::new(RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let h = handler();
        let calls = &AtomicU32::new(0);
        let t0 = tokio::time::Instant::now();

        let out = h
            .with_retry("fetch", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::Network("reset".into()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 2);
        // 1s + 2s of backoff.
        assert_eq!(t0.elapsed(), Duration::from_secs(3));
        let logs = h.operation_logs("fetch");
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].status, OperationStatus::Retry);
        assert_eq!(logs[2].status, OperationStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_sleeps_with_multiplier() {
        let h = handler();
        let calls = &AtomicU32::new(0);
        let t0 = tokio::time::Instant::now();

        h.with_retry("send", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::RateLimited { seconds: 10 })
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(t0.elapsed(), Duration::from_secs(15));
        assert_eq!(h.operation_logs("send")[0].delay_secs, Some(15.0));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_network_errors_become_connectivity_error() {
        let h = handler();
        let calls = &AtomicU32::new(0);

        let err = h
            .with_retry("connect", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Network("down".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(
            err,
            Error::NetworkConnectivity { attempts: 4, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_generic_errors_become_max_retries() {
        let h = handler();
        let err = h
            .with_retry("parse", || async move {
                Err::<(), _>(Error::External("bad payload".into()))
            })
            .await
            .unwrap_err();

        match err {
            Error::MaxRetriesExceeded { operation, last, .. } => {
                assert_eq!(operation, "parse");
                assert!(matches!(*last, Error::External(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let h = handler();
        let calls = &AtomicU32::new(0);

        let err = h
            .with_retry("auth", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::SessionExpired("revoked".into()))
            })
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.operation_logs("auth")[0].status, OperationStatus::Failed);
    }

    #[test]
    fn backoff_is_capped() {
        let p = RetryPolicy {
            max_delay: Some(Duration::from_secs(5)),
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(0), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(6), Duration::from_secs(5));

        let linear = RetryPolicy {
            exponential: false,
            max_delay: None,
            ..RetryPolicy::default()
        };
        for attempt in 0..4 {
            assert_eq!(linear.backoff(attempt), Duration::from_secs(1));
        }
    }

    #[test]
    fn flood_wait_is_clamped() {
        let p = RetryPolicy::default();
        assert_eq!(p.flood_wait(4), Duration::from_secs(6));
        assert_eq!(p.flood_wait(u64::MAX), MAX_SLEEP);

        let odd = RetryPolicy {
            flood_wait_multiplier: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert_eq!(odd.flood_wait(1), MAX_SLEEP);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_flood_wait_does_not_kill_the_task() {
        let h = std::sync::Arc::new(handler());
        let t0 = tokio::time::Instant::now();

        let task = tokio::spawn({
            let h = h.clone();
            async move {
                let calls = &AtomicU32::new(0);
                h.with_retry("reply", || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::RateLimited { seconds: u64::MAX })
                    } else {
                        Ok(())
                    }
                })
                .await
            }
        });

        let joined = task.await;
        assert!(joined.is_ok(), "retry task panicked");
        assert!(joined.unwrap().is_ok());
        assert_eq!(t0.elapsed(), MAX_SLEEP);
        assert_eq!(
            h.operation_logs("reply")[0].delay_secs,
            Some(MAX_SLEEP.as_secs_f64())
        );
    }

    #[test]
    fn clear_logs_by_operation() {
        let h = handler();
        h.log(entry("a", OperationStatus::Success, 1));
        h.log(entry("b", OperationStatus::Success, 1));
        h.clear_logs(Some("a"));
        assert!(h.operation_logs("a").is_empty());
        assert_eq!(h.all_operation_logs().len(), 1);
        h.clear_logs(None);
        assert!(h.all_operation_logs().is_empty());
    }
}

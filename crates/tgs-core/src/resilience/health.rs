use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

const DEGRADED_AFTER: u32 = 5;
const UNHEALTHY_AFTER: u32 = 10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn for_failures(n: u32) -> Self {
        if n >= UNHEALTHY_AFTER {
            HealthStatus::Unhealthy
        } else if n >= DEGRADED_AFTER {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success_time: DateTime<Utc>,
    pub time_since_last_success_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    consecutive_failures: u32,
    last_success_time: DateTime<Utc>,
    last_failure: Option<String>,
}

/// Tracks consecutive failures across operations.
#[derive(Debug)]
pub struct HealthMonitor {
    state: Mutex<HealthState>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HealthState {
                consecutive_failures: 0,
                last_success_time: Utc::now(),
                last_failure: None,
            }),
        }
    }

    pub fn record_success(&self, operation: &str) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.consecutive_failures > 0 {
            info!(operation, recovered_after = s.consecutive_failures, "health recovered");
        }
        s.consecutive_failures = 0;
        s.last_success_time = Utc::now();
        s.last_failure = None;
    }

    pub fn record_failure(&self, operation: &str, err: &crate::Error) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = HealthStatus::for_failures(s.consecutive_failures);
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure = Some(format!("{operation}: {err}"));
        let after = HealthStatus::for_failures(s.consecutive_failures);
        if after != before {
            warn!(
                operation,
                failures = s.consecutive_failures,
                status = ?after,
                "health status changed"
            );
        }
    }

    pub fn status(&self) -> HealthStatus {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        HealthStatus::for_failures(s.consecutive_failures)
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    pub fn get_health_status(&self) -> HealthSnapshot {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let since = Utc::now() - s.last_success_time;
        HealthSnapshot {
            status: HealthStatus::for_failures(s.consecutive_failures),
            consecutive_failures: s.consecutive_failures,
            last_success_time: s.last_success_time,
            time_since_last_success_secs: since.num_milliseconds().max(0) as f64 / 1000.0,
            last_failure: s.last_failure.clone(),
        }
    }
}

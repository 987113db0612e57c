//! Retry, rate limiting and health tracking shared by every component.

pub mod health;
pub mod rate_limit;
pub mod retry;

pub use health::{HealthMonitor, HealthSnapshot, HealthStatus};
pub use rate_limit::RateLimiter;
pub use retry::{ErrorHandler, OperationLogEntry, OperationStatus, RetryPolicy};

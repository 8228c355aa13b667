//! throttled: bounded-concurrency task runner and interval rate limiter for tokio.

mod config;
mod error;
mod limiter;

pub mod queue;
pub mod runner;

pub use config::{MAX_CONCURRENT_ENV, RateLimitConfig, RunnerConfig};
pub use error::{ConfigError, LimiterClosed, TaskError};
pub use limiter::RateLimiter;
pub use queue::ThrottledQueue;
pub use runner::ThrottledRunner;

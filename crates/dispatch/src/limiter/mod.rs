//! Rate limiting for task execution
//!
//! This module provides:
//! - [`RateLimiter`] - token bucket shared by every worker
//! - [`RateLimitConfig`] - capacity, refill interval and refill amount
//!
//! Workers call [`RateLimiter::acquire`] after dequeuing a task and before
//! running its body, so the limit applies to task *starts*.

mod token_bucket;

pub(crate) use token_bucket::duration_millis;
pub use token_bucket::{RateLimitConfig, RateLimitError, RateLimiter};

//! Bucketguard - in-process leaky-bucket rate limiting.
//!
//! A [`Limiter`](ratelimit::Limiter) is built from a compact policy string
//! such as `3r/m,spam:5,block:12d`, counts hits per key, drains every counter
//! by its allowance once per interval, and escalates keys that keep
//! overflowing into a blocked state.
//!
//! ```no_run
//! use bucketguard::ratelimit::{Limiter, TokioScheduler};
//!
//! # async fn run() -> bucketguard::error::Result<()> {
//! let scheduler = TokioScheduler::current()?;
//! let limiter = Limiter::new("3r/m,spam:5,block:12d", &scheduler)?;
//!
//! if limiter.hit("203.0.113.7").is_rejected() {
//!     // refuse the request
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;

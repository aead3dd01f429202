//! Shared plumbing for the bridge engine crates.

mod rate_limit;

pub use rate_limit::RateLimiter;

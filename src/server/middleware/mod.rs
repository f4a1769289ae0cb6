// src/server/middleware/mod.rs
pub mod rate_limit;

pub use rate_limit::ConnectionRateLimiter;

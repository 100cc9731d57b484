//! # Utility Modules
//!
//! Supporting utilities shared by the server, sessions and consoles.
//!
//! ## Components
//! - **Rate Limiter**: per-address sliding-window blocker for the accept path
//! - **Metrics**: thread-safe observability counters
//! - **Logging**: `tracing` subscriber configuration
//! - **Time**: unix timestamp helper for handshake packets

pub mod logging;
pub mod metrics;
pub mod rate_limiter;
pub mod time;

pub use rate_limiter::RateLimiter;

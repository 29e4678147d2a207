//! # Utility Modules
//!
//! Supporting utilities for logging, metrics and timing.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Time**: Timestamp source for keep-alive ids
//! - **Timeout**: Timeout constants and async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod time;
pub mod timeout;

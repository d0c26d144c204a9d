//! SafeWatch - environmental safety alerts.
//!
//! This library evaluates environmental measurements against regulatory
//! thresholds, decides which subscribers should hear about a change, and
//! delivers notifications over email and push while keeping an audit trail
//! of every attempt.

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod deduplication;
pub mod internal_metrics;
pub mod matching;
pub mod notification;
pub mod pipeline;
pub mod rate_limit;
pub mod reference;
pub mod status;
pub mod subscribers;
pub mod task_manager;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export core types for convenience
pub use self::core::*;

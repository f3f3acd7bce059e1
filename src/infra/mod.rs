//! Infrastructure - configuration and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, SessionHostKind};
pub use metrics::Metrics;

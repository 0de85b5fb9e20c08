//! # txc-core
//!
//! Shared building blocks for the TRANSAQ XML Connector workspace:
//!
//! - **Types** (`types`): connector log level
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): `TxcError` via thiserror
//! - **Logging** (`logging`): tracing-based structured logging
//! - **Latency** (`latency`): histogram-based round-trip statistics
//! - **CPU affinity** (`cpu_affinity`): thread-to-core pinning

pub mod config;
pub mod cpu_affinity;
pub mod error;
pub mod latency;
pub mod logging;
pub mod types;

pub use error::{Result, TxcError};
pub use types::LogLevel;

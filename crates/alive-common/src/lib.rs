//! alive-hook common types
//!
//! Shared types, error taxonomy, logging and configuration used by every
//! alive-hook crate.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::HookerConfig;
pub use error::{Error, Result, TransactionStage};
pub use logging::{init_agent_logging, init_debug_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};

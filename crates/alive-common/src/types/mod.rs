//! Common types used across alive-hook components
//!
//! - `export` - module exports, legacy addresses and per-export records
//! - `hooks` - redirections, installer state and install summaries

pub mod export;
pub mod hooks;

pub use export::*;
pub use hooks::*;

//! Error types for alive-hook
//!
//! Every variant here is fatal once it escapes the installer. Name anomalies and
//! stub cross-validation mismatches are reported as values, not errors.

use crate::types::LegacyAddress;
use thiserror::Error;

/// Step of the patch transaction that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    Begin,
    UpdateThreads,
    Attach,
    Commit,
}

impl std::fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStage::Begin => write!(f, "begin"),
            TransactionStage::UpdateThreads => write!(f, "thread update"),
            TransactionStage::Attach => write!(f, "attach"),
            TransactionStage::Commit => write!(f, "commit"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Export enumeration failed: {0}")]
    Enumeration(String),

    #[error("Duplicated function for address {address} already used by {existing} when checking {name}")]
    DuplicateAddress {
        address: LegacyAddress,
        existing: String,
        name: String,
    },

    #[error("Patch transaction {stage} failed: {message}")]
    Transaction {
        stage: TransactionStage,
        message: String,
    },

    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: usize, message: String },

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a transaction failure at `stage`
    pub fn transaction(stage: TransactionStage, message: impl Into<String>) -> Self {
        Error::Transaction {
            stage,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

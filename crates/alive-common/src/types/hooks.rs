//! Redirection and installer types

use super::export::LegacyAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way control is transferred for one export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectDirection {
    /// Original code forwards to the reimplementation
    ToReimplementation,
    /// Reimplementation entry forwards to the original code
    ToOriginal,
}

impl fmt::Display for RedirectDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectDirection::ToReimplementation => write!(f, "original -> reimplementation"),
            RedirectDirection::ToOriginal => write!(f, "reimplementation -> original"),
        }
    }
}

/// A single entry-point rewrite: the code at `from` jumps to `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redirection {
    pub name: String,
    pub legacy_address: LegacyAddress,
    pub from: usize,
    pub to: usize,
    pub direction: RedirectDirection,
    /// Implemented, but forced back to the original by the override list
    pub disabled_by_config: bool,
}

/// Hook installer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerState {
    Idle,
    Enumerating,
    Validating,
    TransactionOpen,
    /// Terminal: every redirection is live
    Committed,
    /// Terminal: nothing was patched, startup must not continue
    Faulted,
}

impl InstallerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallerState::Committed | InstallerState::Faulted)
    }
}

impl fmt::Display for InstallerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallerState::Idle => write!(f, "idle"),
            InstallerState::Enumerating => write!(f, "enumerating"),
            InstallerState::Validating => write!(f, "validating"),
            InstallerState::TransactionOpen => write!(f, "transaction_open"),
            InstallerState::Committed => write!(f, "committed"),
            InstallerState::Faulted => write!(f, "faulted"),
        }
    }
}

/// Counts gathered during one installation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSummary {
    /// Named exports seen in the export directory
    pub exports_seen: usize,
    /// Exports skipped for name anomalies
    pub skipped: usize,
    /// Exports registered under a legacy address
    pub hooked: usize,
    pub implemented: usize,
    pub stubbed: usize,
    /// Implemented exports forced back to the original code
    pub disabled_by_config: usize,
}

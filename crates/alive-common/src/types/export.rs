//! Export-related types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Code offset in the legacy binary, embedded in an export's name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LegacyAddress(pub u32);

impl LegacyAddress {
    /// Address as a pointer-sized value
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LegacyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl fmt::UpperHex for LegacyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.0, f)
    }
}

impl FromStr for LegacyAddress {
    type Err = std::num::ParseIntError;

    /// Parses hex digits with an optional `0x`/`0X` prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u32::from_str_radix(digits, 16).map(LegacyAddress)
    }
}

/// Named export read from a module's export directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleExport {
    pub name: String,
    pub address: usize,
    pub ordinal: u16,
}

/// Export whose name carried a legacy address, after jump resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookCandidate {
    pub name: String,
    pub legacy_address: LegacyAddress,
    pub code_address: usize,
}

/// Why an export was not considered for hooking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameAnomaly {
    /// No underscore-delimited run of 6-8 hex digits
    NoLegacyAddress,
    /// Compiler-generated local static (`?__done__@`, `?__kAddr__@`)
    FalsePositiveQualifier,
}

impl fmt::Display for NameAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameAnomaly::NoLegacyAddress => write!(f, "no legacy address"),
            NameAnomaly::FalsePositiveQualifier => write!(f, "exported local static"),
        }
    }
}

/// Export skipped during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedExport {
    pub name: String,
    pub reason: NameAnomaly,
}

/// Result of stub detection for one export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub is_implemented: bool,
    pub decorated_name: String,
    pub undecorated_name: String,
}

impl ExportInfo {
    /// Undecorated name when known, otherwise the decorated export name
    pub fn name(&self) -> &str {
        if self.undecorated_name.is_empty() {
            &self.decorated_name
        } else {
            &self.undecorated_name
        }
    }
}

/// One hookable export, fixed once enumeration and validation are done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub name: String,
    pub code_address: usize,
    pub legacy_address: LegacyAddress,
    pub is_implemented: bool,
}

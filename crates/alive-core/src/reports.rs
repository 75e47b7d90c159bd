//! Progress reports
//!
//! Two plain-text lists of legacy addresses, implemented and still stubbed.
//! Lines use the override file format so a report can be fed back as one.

use crate::registry::AddressRegistry;
use alive_common::{LegacyAddress, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

/// Addresses split by implementation status, ascending
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProgressReport {
    pub implemented: Vec<LegacyAddress>,
    pub stubbed: Vec<LegacyAddress>,
}

impl ProgressReport {
    pub fn from_registry(registry: &AddressRegistry) -> Self {
        let (implemented, stubbed): (Vec<_>, Vec<_>) =
            registry.iter().partition(|(_, info)| info.is_implemented);
        Self {
            implemented: implemented.into_iter().map(|(a, _)| *a).collect(),
            stubbed: stubbed.into_iter().map(|(a, _)| *a).collect(),
        }
    }

    /// Write both lists; failures are logged and never propagated
    pub fn save(&self, implemented_path: &Path, stubbed_path: &Path) {
        for (path, addresses) in [
            (implemented_path, &self.implemented),
            (stubbed_path, &self.stubbed),
        ] {
            match write_list(path, addresses) {
                Ok(()) => info!("Wrote {} addresses to {}", addresses.len(), path.display()),
                Err(e) => warn!("Failed to write report {}: {}", path.display(), e),
            }
        }
    }
}

/// One uppercase hex address per line, no prefix
pub fn render(addresses: &[LegacyAddress]) -> String {
    let mut out = String::with_capacity(addresses.len() * 9);
    for address in addresses {
        let _ = writeln!(out, "{:X}", address);
    }
    out
}

fn write_list(path: &Path, addresses: &[LegacyAddress]) -> Result<()> {
    std::fs::write(path, render(addresses))?;
    Ok(())
}

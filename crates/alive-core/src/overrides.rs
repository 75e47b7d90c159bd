//! Force-disabled redirections
//!
//! The override file lists legacy addresses, one hex value per line, whose
//! reimplementation must not be used even when it exists.

use alive_common::{LegacyAddress, Result};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

/// Addresses that always redirect to the original code
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DisabledSet {
    addresses: BTreeSet<LegacyAddress>,
}

impl DisabledSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the list at `path`; a missing file is an empty set
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let set = Self::parse(&content);
                info!(
                    "Loaded {} disabled addresses from {}",
                    set.len(),
                    path.display()
                );
                Ok(set)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No override file at {}", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse newline-delimited hex addresses, skipping anything else
    pub fn parse(content: &str) -> Self {
        let mut addresses = BTreeSet::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.parse::<LegacyAddress>() {
                Ok(address) => {
                    addresses.insert(address);
                }
                Err(e) => debug!("Ignoring override line {}: {:?} ({})", number + 1, line, e),
            }
        }
        Self { addresses }
    }

    pub fn contains(&self, address: LegacyAddress) -> bool {
        self.addresses.contains(&address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl FromIterator<LegacyAddress> for DisabledSet {
    fn from_iter<I: IntoIterator<Item = LegacyAddress>>(iter: I) -> Self {
        Self {
            addresses: iter.into_iter().collect(),
        }
    }
}

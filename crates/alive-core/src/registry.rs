//! Legacy address registry

use alive_common::{Error, ExportInfo, LegacyAddress, Result};
use std::collections::btree_map::{self, BTreeMap, Entry};

/// One export per legacy address, insert-only
#[derive(Debug, Default)]
pub struct AddressRegistry {
    entries: BTreeMap<LegacyAddress, ExportInfo>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if `address` is already claimed
    ///
    /// Lets callers reject a duplicate before doing any work for `name`.
    pub fn ensure_vacant(&self, address: LegacyAddress, name: &str) -> Result<()> {
        match self.entries.get(&address) {
            Some(info) => Err(duplicate(address, info, name)),
            None => Ok(()),
        }
    }

    /// Record `info` under `address`; duplicates are never merged
    pub fn insert(&mut self, address: LegacyAddress, name: &str, info: ExportInfo) -> Result<()> {
        match self.entries.entry(address) {
            Entry::Occupied(existing) => Err(duplicate(address, existing.get(), name)),
            Entry::Vacant(slot) => {
                slot.insert(info);
                Ok(())
            }
        }
    }

    pub fn get(&self, address: LegacyAddress) -> Option<&ExportInfo> {
        self.entries.get(&address)
    }

    pub fn contains(&self, address: LegacyAddress) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending address order
    pub fn iter(&self) -> btree_map::Iter<'_, LegacyAddress, ExportInfo> {
        self.entries.iter()
    }
}

fn duplicate(address: LegacyAddress, existing: &ExportInfo, name: &str) -> Error {
    Error::DuplicateAddress {
        address,
        existing: existing.name().to_string(),
        name: name.to_string(),
    }
}

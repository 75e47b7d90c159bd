//! Code memory implementations
//!
//! `ImageMemory` keeps mapped images in owned buffers (snapshots, tests).
//! `ProcessMemory` reads and patches the live process on Windows.

use crate::traits::CodeMemory;
use alive_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;

struct Region {
    base: usize,
    bytes: Vec<u8>,
}

impl Region {
    fn range(&self, addr: usize, size: usize) -> Option<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base)?;
        let end = start.checked_add(size)?;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

/// Byte buffers mapped at fixed addresses
#[derive(Default)]
pub struct ImageMemory {
    regions: Mutex<Vec<Region>>,
    rejected_writes: Mutex<BTreeSet<usize>>,
}

impl ImageMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory holding a single region
    pub fn with_region(base: usize, bytes: Vec<u8>) -> Self {
        let memory = Self::new();
        memory.map(base, bytes);
        memory
    }

    /// Map `bytes` at `base`
    ///
    /// Regions must not overlap; a region overlapping an existing one is rejected.
    pub fn map(&self, base: usize, bytes: Vec<u8>) -> bool {
        let end = base.saturating_add(bytes.len());
        let mut regions = self.regions.lock();
        if regions
            .iter()
            .any(|r| base < r.base + r.bytes.len() && r.base < end)
        {
            return false;
        }
        regions.push(Region { base, bytes });
        true
    }

    /// Make every write touching `addr` fail
    pub fn reject_writes_at(&self, addr: usize) {
        self.rejected_writes.lock().insert(addr);
    }

    /// Copy of the region mapped at `base`
    pub fn region(&self, base: usize) -> Option<Vec<u8>> {
        self.regions
            .lock()
            .iter()
            .find(|r| r.base == base)
            .map(|r| r.bytes.clone())
    }
}

impl CodeMemory for ImageMemory {
    fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let regions = self.regions.lock();
        regions
            .iter()
            .find_map(|r| r.range(addr, size).map(|range| r.bytes[range].to_vec()))
            .ok_or_else(|| Error::MemoryAccess {
                address: addr,
                message: format!("{} bytes not mapped", size),
            })
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let end = addr.saturating_add(data.len());
        if self.rejected_writes.lock().range(addr..end).next().is_some() {
            return Err(Error::MemoryAccess {
                address: addr,
                message: "write rejected".into(),
            });
        }

        let mut regions = self.regions.lock();
        let region = regions
            .iter_mut()
            .find(|r| r.range(addr, data.len()).is_some())
            .ok_or_else(|| Error::MemoryAccess {
                address: addr,
                message: format!("{} bytes not mapped", data.len()),
            })?;
        let start = addr - region.base;
        region.bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(target_os = "windows")]
pub use process::ProcessMemory;

#[cfg(target_os = "windows")]
mod process {
    use super::*;
    use std::ffi::c_void;
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READWRITE,
        PAGE_GUARD, PAGE_NOACCESS, PAGE_PROTECTION_FLAGS,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    /// Protection change that is undone when dropped
    struct ProtectionGuard {
        addr: usize,
        size: usize,
        old: PAGE_PROTECTION_FLAGS,
    }

    impl ProtectionGuard {
        fn writable(addr: usize, size: usize) -> Result<Self> {
            let mut old = PAGE_PROTECTION_FLAGS::default();
            unsafe {
                VirtualProtect(
                    addr as *const c_void,
                    size,
                    PAGE_EXECUTE_READWRITE,
                    &mut old,
                )
            }
            .map_err(|e| Error::MemoryAccess {
                address: addr,
                message: format!("Failed to make memory writable: {}", e),
            })?;
            Ok(Self { addr, size, old })
        }
    }

    impl ProtectionGuard {
        /// Put the old protection back, reporting failure to the caller
        fn restore(self) -> Result<()> {
            let result = self.reprotect();
            std::mem::forget(self);
            result
        }

        fn reprotect(&self) -> Result<()> {
            let mut tmp = PAGE_PROTECTION_FLAGS::default();
            unsafe { VirtualProtect(self.addr as *const c_void, self.size, self.old, &mut tmp) }
                .map_err(|e| Error::MemoryAccess {
                    address: self.addr,
                    message: format!("Failed to restore protection: {}", e),
                })
        }
    }

    // Writes run while other threads are suspended, so a failed restore is
    // returned rather than logged.
    impl Drop for ProtectionGuard {
        fn drop(&mut self) {
            let _ = self.reprotect();
        }
    }

    /// The current process's address space
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ProcessMemory;

    impl ProcessMemory {
        pub fn new() -> Self {
            Self
        }

        /// Fail unless `[addr, addr + size)` lies in one committed, readable region
        fn check_readable(&self, addr: usize, size: usize) -> Result<()> {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            let written = unsafe {
                VirtualQuery(
                    Some(addr as *const c_void),
                    &mut mbi,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                return Err(Error::MemoryAccess {
                    address: addr,
                    message: "VirtualQuery failed".into(),
                });
            }
            if mbi.State != MEM_COMMIT {
                return Err(Error::MemoryAccess {
                    address: addr,
                    message: "Memory not committed".into(),
                });
            }
            if mbi.Protect.0 & (PAGE_NOACCESS.0 | PAGE_GUARD.0) != 0 {
                return Err(Error::MemoryAccess {
                    address: addr,
                    message: "Memory not readable".into(),
                });
            }
            let region_end = mbi.BaseAddress as usize + mbi.RegionSize;
            if addr.saturating_add(size) > region_end {
                return Err(Error::MemoryAccess {
                    address: addr,
                    message: "Read crosses region boundary".into(),
                });
            }
            Ok(())
        }
    }

    impl CodeMemory for ProcessMemory {
        fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
            self.check_readable(addr, size)?;
            let slice = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
            Ok(slice.to_vec())
        }

        fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
            let guard = ProtectionGuard::writable(addr, data.len())?;
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
            }
            guard.restore()?;
            unsafe {
                FlushInstructionCache(
                    GetCurrentProcess(),
                    Some(addr as *const c_void),
                    data.len(),
                )
            }
            .map_err(|e| Error::MemoryAccess {
                address: addr,
                message: format!("FlushInstructionCache failed: {}", e),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let memory = ImageMemory::with_region(0x1000, vec![0u8; 0x100]);
        memory.write(0x1010, &[1, 2, 3]).unwrap();
        assert_eq!(memory.read(0x100F, 5).unwrap(), vec![0, 1, 2, 3, 0]);
    }

    #[test]
    fn test_read_outside_region_fails() {
        let memory = ImageMemory::with_region(0x1000, vec![0u8; 0x100]);
        assert!(memory.read(0x10FE, 4).is_err());
        assert!(memory.read(0x0FFF, 1).is_err());
        assert!(memory.read(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_multiple_regions() {
        let memory = ImageMemory::new();
        assert!(memory.map(0x400000, vec![0xAA; 0x10]));
        assert!(memory.map(0x10000000, vec![0xBB; 0x10]));
        assert!(!memory.map(0x400008, vec![0; 0x10]));
        assert_eq!(memory.read(0x400000, 1).unwrap(), vec![0xAA]);
        assert_eq!(memory.read(0x10000000, 1).unwrap(), vec![0xBB]);
    }

    #[test]
    fn test_rejected_write_leaves_bytes() {
        let memory = ImageMemory::with_region(0x1000, vec![0u8; 0x100]);
        memory.reject_writes_at(0x1012);
        assert!(memory.write(0x1010, &[1, 2, 3, 4]).is_err());
        assert!(memory.write(0x1013, &[9]).is_ok());
        assert_eq!(memory.read(0x1010, 4).unwrap(), vec![0, 0, 0, 9]);
    }

    #[test]
    fn test_read_u32_and_c_string() {
        let mut bytes = vec![0u8; 0x40];
        bytes[0..4].copy_from_slice(&0x12345678u32.to_le_bytes());
        bytes[0x10..0x14].copy_from_slice(b"Foo\0");
        let memory = ImageMemory::with_region(0x2000, bytes);
        assert_eq!(memory.read_u32(0x2000).unwrap(), 0x12345678);
        assert_eq!(memory.read_c_string(0x2010, 64).unwrap(), "Foo");
    }

    /// Counts `read` calls made through the trait helpers
    struct CountingReads<'a> {
        inner: &'a ImageMemory,
        reads: std::cell::Cell<usize>,
    }

    impl CodeMemory for CountingReads<'_> {
        fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read(addr, size)
        }

        fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
            self.inner.write(addr, data)
        }
    }

    #[test]
    fn test_c_string_read_in_chunks() {
        let mut bytes = vec![0u8; 0x2000];
        bytes[0x10..0x10 + 300].fill(b'A');
        let memory = ImageMemory::with_region(0x10000, bytes);
        let counting = CountingReads {
            inner: &memory,
            reads: Default::default(),
        };

        let name = counting
            .read_c_string(0x10010, crate::traits::MAX_NAME_LEN)
            .unwrap();
        assert_eq!(name.len(), 300);
        assert_eq!(counting.reads.get(), 2);
    }

    #[test]
    fn test_c_string_chunks_stop_at_page_boundary() {
        let mut bytes = vec![0u8; 0x2000];
        bytes[0xFF0..0x1010].fill(b'B');
        let memory = ImageMemory::with_region(0x10000, bytes);
        let counting = CountingReads {
            inner: &memory,
            reads: Default::default(),
        };

        assert_eq!(counting.read_c_string(0x10FF0, 64).unwrap(), "B".repeat(32));
        assert_eq!(counting.reads.get(), 2);
    }

    #[test]
    fn test_c_string_length_cap() {
        let memory = ImageMemory::with_region(0x2000, vec![b'A'; 0x40]);
        assert!(memory.read_c_string(0x2000, 16).is_err());
        // Unterminated up to the end of the region
        assert!(memory.read_c_string(0x2000, 0x100).is_err());
    }
}

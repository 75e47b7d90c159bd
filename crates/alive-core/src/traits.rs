//! Core trait definitions for alive-hook
//!
//! The installer only talks to these capabilities; the Windows implementations
//! live in `memory`, `threads` and `patcher`, and tests use in-memory images.

use alive_common::{Error, ModuleExport, Result};

/// Longest debug name read through `read_c_string`
pub const MAX_NAME_LEN: usize = 4096;

/// Readable memory is granted per page
pub const PAGE_SIZE: usize = 0x1000;

/// Bytes fetched per `read` by `read_c_string`
const STRING_CHUNK: usize = 256;

/// Something with an export directory
pub trait ExportSource {
    /// Named exports; forwarded or null entries carry address 0
    fn exports(&self) -> Result<Vec<ModuleExport>>;
}

impl ExportSource for [ModuleExport] {
    fn exports(&self) -> Result<Vec<ModuleExport>> {
        Ok(self.to_vec())
    }
}

impl ExportSource for Vec<ModuleExport> {
    fn exports(&self) -> Result<Vec<ModuleExport>> {
        Ok(self.clone())
    }
}

/// Access to the process's code and data
pub trait CodeMemory {
    /// Read `size` bytes starting at `addr`
    fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>>;

    /// Write `data` at `addr`, temporarily lifting page protection
    ///
    /// The previous protection is restored and the instruction cache flushed
    /// before returning.
    fn write(&self, addr: usize, data: &[u8]) -> Result<()>;

    /// Read a little-endian 32-bit value
    fn read_u32(&self, addr: usize) -> Result<u32> {
        let bytes = self.read(addr, 4)?;
        let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| Error::MemoryAccess {
            address: addr,
            message: format!("short read of {} bytes", bytes.len()),
        })?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a NUL-terminated string of at most `max_len` bytes
    ///
    /// Reads whole chunks that never cross a page boundary, shrinking a chunk
    /// only where readable memory ends before the page does.
    fn read_c_string(&self, addr: usize, max_len: usize) -> Result<String> {
        let mut bytes = Vec::new();
        let mut cursor = addr;
        while bytes.len() < max_len {
            let to_page_end = PAGE_SIZE - cursor % PAGE_SIZE;
            let mut len = STRING_CHUNK.min(to_page_end).min(max_len - bytes.len());
            let chunk = loop {
                match self.read(cursor, len) {
                    Ok(chunk) => break chunk,
                    Err(e) if len == 1 => return Err(e),
                    Err(_) => len /= 2,
                }
            };
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&chunk);
            cursor = cursor
                .checked_add(chunk.len())
                .ok_or(Error::InvalidAddress(addr))?;
        }
        Err(Error::MemoryAccess {
            address: addr,
            message: format!("string exceeds {} bytes", max_len),
        })
    }
}

/// Stop-the-world control over the process's other threads
pub trait ThreadControl {
    /// Suspend every thread except the caller
    fn suspend_others(&mut self) -> Result<()>;

    /// Resume everything suspended by `suspend_others`
    fn resume_all(&mut self) -> Result<()>;
}

/// Atomic code patch transaction
///
/// Attaches are staged and only become visible on `commit`. A failed commit
/// leaves the code exactly as it was before `begin`.
pub trait CodePatcher {
    fn begin(&mut self) -> Result<()>;

    /// Stage a rewrite of the entry at `from` into a jump to `to`
    fn attach(&mut self, from: usize, to: usize) -> Result<()>;

    /// Apply every staged rewrite with other threads suspended, or none of them
    fn commit(&mut self) -> Result<()>;

    /// Drop staged rewrites
    fn abort(&mut self);
}

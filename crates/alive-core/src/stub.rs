//! Placeholder detection
//!
//! Unimplemented functions in the reimplementation share one body shape:
//!
//! ```text
//! push eax
//! mov  eax, [names_cell]      ; A1 <imm32>
//! pop  eax
//! nop; nop; nop; nop; int3; nop; nop; nop; nop
//! ```
//!
//! `names_cell` holds a pointer to the adjacent NUL-terminated decorated and
//! undecorated names of the function. A marker only counts when the decorated
//! name matches the export, so stray byte sequences are not mistaken for stubs.

use crate::hooks::NOP;
use crate::traits::{CodeMemory, MAX_NAME_LEN};
use alive_common::{Error, ExportInfo, Result};
use tracing::{debug, trace};

/// Bytes scanned from the start of each candidate
pub const STUB_WINDOW_SIZE: usize = 256;

/// 4 NOPs, INT3, 4 NOPs
pub const STUB_MARKER: [u8; 9] = [0x90, 0x90, 0x90, 0x90, 0xCC, 0x90, 0x90, 0x90, 0x90];

/// Position of the INT3 inside the marker
const TRAP_OFFSET: usize = 4;

/// `imm32` of `mov eax, [imm32]` ends one byte (`pop eax`) before the marker
const CELL_OFFSET: usize = 5;

/// Decides whether an export is still a placeholder
pub struct StubDetector<'m, M: CodeMemory + ?Sized> {
    memory: &'m M,
    bytewise_verification: bool,
}

impl<'m, M: CodeMemory + ?Sized> StubDetector<'m, M> {
    /// With `bytewise_verification` set the trap byte is left in place
    pub fn new(memory: &'m M, bytewise_verification: bool) -> Self {
        Self {
            memory,
            bytewise_verification,
        }
    }

    /// Classify the function at `address` exported as `export_name`
    pub fn inspect(&self, address: usize, export_name: &str) -> Result<ExportInfo> {
        let window = self.read_window(address)?;

        let mut start = 0;
        while let Some(found) = find_marker(&window[start..]) {
            let offset = start + found;
            start = offset + 1;

            if offset < CELL_OFFSET {
                debug!(
                    "{}: marker at +{:#x} has no name cell in front of it",
                    export_name, offset
                );
                continue;
            }

            let cell = u32::from_le_bytes([
                window[offset - 5],
                window[offset - 4],
                window[offset - 3],
                window[offset - 2],
            ]);

            let (decorated, undecorated) = match self.read_name_pair(cell as usize) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(
                        "{}: marker at +{:#x} with unreadable names: {}",
                        export_name, offset, e
                    );
                    continue;
                }
            };

            if decorated != export_name {
                debug!(
                    "{}: marker at +{:#x} belongs to {}",
                    export_name, offset, decorated
                );
                continue;
            }

            if !self.bytewise_verification {
                self.memory.write(address + offset + TRAP_OFFSET, &[NOP])?;
            }

            trace!("{} is a stub", export_name);
            return Ok(ExportInfo {
                is_implemented: false,
                decorated_name: decorated,
                undecorated_name: undecorated,
            });
        }

        Ok(ExportInfo {
            is_implemented: true,
            decorated_name: export_name.to_string(),
            undecorated_name: String::new(),
        })
    }

    /// Up to `STUB_WINDOW_SIZE` bytes, truncated where readable memory ends
    ///
    /// Fails only when not even the first byte is readable. A window shorter
    /// than the marker simply holds no marker.
    fn read_window(&self, address: usize) -> Result<Vec<u8>> {
        let unreadable = match self.memory.read(address, STUB_WINDOW_SIZE) {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        // Longest readable prefix; `good` is readable, `bad` is not
        let (mut good, mut bad) = (0, STUB_WINDOW_SIZE);
        let mut window = Vec::new();
        while bad - good > 1 {
            let mid = good + (bad - good) / 2;
            match self.memory.read(address, mid) {
                Ok(bytes) => {
                    good = mid;
                    window = bytes;
                }
                Err(_) => bad = mid,
            }
        }

        if good == 0 {
            return Err(unreadable);
        }
        trace!("Window at {:#x} truncated to {} bytes", address, good);
        Ok(window)
    }

    fn read_name_pair(&self, cell: usize) -> Result<(String, String)> {
        let names = self.memory.read_u32(cell)? as usize;
        let decorated = self.memory.read_c_string(names, MAX_NAME_LEN)?;
        let next = names
            .checked_add(decorated.len() + 1)
            .ok_or(Error::InvalidAddress(names))?;
        let undecorated = self.memory.read_c_string(next, MAX_NAME_LEN)?;
        Ok((decorated, undecorated))
    }
}

fn find_marker(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(STUB_MARKER.len())
        .position(|w| w == STUB_MARKER)
}

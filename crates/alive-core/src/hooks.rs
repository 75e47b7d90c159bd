//! Jump encodings used for entry-point redirection

/// NOP instruction
pub const NOP: u8 = 0x90;

/// `jmp rel32` opcode
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// `jmp rel32`: opcode plus 32-bit displacement
pub const X86_REL_JMP_SIZE: usize = 5;

/// `jmp [rip+0]` followed by the 8-byte target
pub const X64_ABS_JMP_SIZE: usize = 14;

const X64_ABS_JMP_PREFIX: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

/// Displacement of a `jmp rel32` at `from` that lands on `to`
///
/// `None` when the distance does not fit in 32 bits.
#[cfg(target_pointer_width = "64")]
pub fn rel32_displacement(from: usize, to: usize) -> Option<i32> {
    let next = from as i128 + X86_REL_JMP_SIZE as i128;
    i32::try_from(to as i128 - next).ok()
}

/// Displacement of a `jmp rel32` at `from` that lands on `to`
///
/// The address space is 32 bits wide, so the displacement wraps and every
/// target is reachable.
#[cfg(not(target_pointer_width = "64"))]
pub fn rel32_displacement(from: usize, to: usize) -> Option<i32> {
    Some(to.wrapping_sub(from.wrapping_add(X86_REL_JMP_SIZE)) as i32)
}

/// Bytes that make the code at `from` continue at `to`
///
/// The 5-byte relative form when reachable, else the 14-byte absolute form.
pub fn redirect_patch(from: usize, to: usize) -> Vec<u8> {
    match rel32_displacement(from, to) {
        Some(rel) => {
            let mut patch = Vec::with_capacity(X86_REL_JMP_SIZE);
            patch.push(JMP_REL32_OPCODE);
            patch.extend_from_slice(&rel.to_le_bytes());
            patch
        }
        None => {
            let mut patch = Vec::with_capacity(X64_ABS_JMP_SIZE);
            patch.extend_from_slice(&X64_ABS_JMP_PREFIX);
            patch.extend_from_slice(&(to as u64).to_le_bytes());
            patch
        }
    }
}

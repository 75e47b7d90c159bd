//! Export enumeration
//!
//! Turns a module's export directory into hook candidates: every named export
//! whose name embeds a legacy address, with one level of `jmp rel32` thunking
//! resolved to the real function body.

use crate::hooks::{JMP_REL32_OPCODE, X86_REL_JMP_SIZE};
use crate::traits::{CodeMemory, ExportSource};
use alive_common::{HookCandidate, LegacyAddress, NameAnomaly, Result, SkippedExport};
use iced_x86::{Code, Decoder, DecoderOptions};
use tracing::{debug, info, warn};

/// Hex digits accepted after an underscore
pub const MIN_ADDRESS_DIGITS: usize = 6;
pub const MAX_ADDRESS_DIGITS: usize = 8;

/// Local statics the compiler sometimes exports, e.g.
/// `?__done__@?1??vUpdate_4E0030@Movie@@QAEXXZ@4_NA`
const FALSE_POSITIVE_PREFIXES: [&str; 2] = ["?__done__@", "?__kAddr__@"];

#[cfg(target_pointer_width = "64")]
const CODE_BITNESS: u32 = 64;
#[cfg(not(target_pointer_width = "64"))]
const CODE_BITNESS: u32 = 32;

/// Extract the legacy address embedded in an export name
///
/// The first underscore followed by a run of 6-8 hex digits wins; longer or
/// shorter runs are passed over.
pub fn parse_legacy_address(name: &str) -> std::result::Result<LegacyAddress, NameAnomaly> {
    if FALSE_POSITIVE_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        return Err(NameAnomaly::FalsePositiveQualifier);
    }

    for (pos, _) in name.match_indices('_') {
        let digits = &name[pos + 1..];
        let len = digits.bytes().take_while(u8::is_ascii_hexdigit).count();
        if (MIN_ADDRESS_DIGITS..=MAX_ADDRESS_DIGITS).contains(&len) {
            if let Ok(value) = u32::from_str_radix(&digits[..len], 16) {
                return Ok(LegacyAddress(value));
            }
        }
    }

    Err(NameAnomaly::NoLegacyAddress)
}

/// Follow a single `jmp rel32` at `address`
///
/// Any other entry instruction, including short and indirect jumps, leaves
/// the address unchanged. The jump target is not inspected further. Only the
/// opcode byte has to be readable; an `E9` cut off by the end of readable
/// memory is not a jump.
pub fn resolve_jump<M: CodeMemory + ?Sized>(memory: &M, address: usize) -> Result<usize> {
    if memory.read(address, 1)?.first() != Some(&JMP_REL32_OPCODE) {
        return Ok(address);
    }
    let bytes = match memory.read(address, X86_REL_JMP_SIZE) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Truncated jmp rel32 at {:#x}: {}", address, e);
            return Ok(address);
        }
    };

    let mut decoder = Decoder::with_ip(CODE_BITNESS, &bytes, address as u64, DecoderOptions::NONE);
    let instr = decoder.decode();
    match instr.code() {
        Code::Jmp_rel32_32 | Code::Jmp_rel32_64 => Ok(instr.near_branch_target() as usize),
        _ => Ok(address),
    }
}

/// Output of one enumeration pass
#[derive(Debug, Default)]
pub struct EnumeratedExports {
    /// Named exports with a non-null address
    pub exports_seen: usize,
    pub candidates: Vec<HookCandidate>,
    pub skipped: Vec<SkippedExport>,
}

/// Walk the export directory of `source`
pub fn enumerate<S, M>(source: &S, memory: &M) -> Result<EnumeratedExports>
where
    S: ExportSource + ?Sized,
    M: CodeMemory + ?Sized,
{
    let exports = source.exports()?;
    let mut result = EnumeratedExports {
        candidates: Vec::with_capacity(exports.len()),
        ..Default::default()
    };

    for export in exports {
        if export.name.is_empty() || export.address == 0 {
            continue;
        }
        result.exports_seen += 1;

        match parse_legacy_address(&export.name) {
            Ok(legacy_address) => {
                let code_address = resolve_jump(memory, export.address)?;
                if code_address != export.address {
                    debug!(
                        "{} thunk {:#x} -> {:#x}",
                        export.name, export.address, code_address
                    );
                }
                result.candidates.push(HookCandidate {
                    name: export.name,
                    legacy_address,
                    code_address,
                });
            }
            Err(reason) => {
                match reason {
                    NameAnomaly::FalsePositiveQualifier => warn!(
                        "Ignoring exported local static {}",
                        export.name
                    ),
                    NameAnomaly::NoLegacyAddress => warn!("{} was not hooked", export.name),
                }
                result.skipped.push(SkippedExport {
                    name: export.name,
                    reason,
                });
            }
        }
    }

    info!(
        "Enumerated {} exports: {} candidates, {} skipped",
        result.exports_seen,
        result.candidates.len(),
        result.skipped.len()
    );
    Ok(result)
}

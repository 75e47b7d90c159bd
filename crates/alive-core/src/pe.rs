//! PE parsing for export enumeration
//!
//! Works on a mapped image (RVA == offset) and checks every read against the
//! slice bounds, so a corrupt header yields an error instead of a fault.

use alive_common::{Error, ModuleExport, Result};

const DOS_MAGIC: u16 = 0x5A4D;
const NT_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

const E_LFANEW_OFFSET: usize = 0x3C;
const FILE_HEADER_SIZE: usize = 20;
const SIZE_OF_IMAGE_OFFSET: usize = 56;
const EXPORT_DIRECTORY_SIZE: usize = 40;

/// Bounds-checked little-endian reads over an image
struct ImageReader<'a> {
    data: &'a [u8],
}

impl<'a> ImageReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                Error::Enumeration(format!(
                    "read of {} bytes at offset {:#x} is outside the image ({:#x} bytes)",
                    len,
                    offset,
                    self.data.len()
                ))
            })
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn c_str(&self, offset: usize) -> Result<String> {
        let tail = self.data.get(offset..).ok_or_else(|| {
            Error::Enumeration(format!("string offset {:#x} is outside the image", offset))
        })?;
        let len = tail.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::Enumeration(format!("unterminated string at offset {:#x}", offset))
        })?;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}

#[derive(Debug, Clone, Copy)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

/// Header fields the enumerator needs
#[derive(Debug, Clone, Copy)]
pub struct PeHeaders {
    pub is_pe32_plus: bool,
    pub size_of_image: u32,
    export_directory: DataDirectory,
}

/// Parse the DOS/NT headers at the start of `image`
pub fn parse_headers(image: &[u8]) -> Result<PeHeaders> {
    let reader = ImageReader::new(image);

    if reader.u16(0)? != DOS_MAGIC {
        return Err(Error::Enumeration("missing MZ signature".into()));
    }

    let nt_offset = reader.u32(E_LFANEW_OFFSET)? as usize;
    if reader.u32(nt_offset)? != NT_SIGNATURE {
        return Err(Error::Enumeration("missing PE signature".into()));
    }

    let optional = nt_offset + 4 + FILE_HEADER_SIZE;
    let (is_pe32_plus, rva_count_offset) = match reader.u16(optional)? {
        PE32_MAGIC => (false, 92),
        PE32_PLUS_MAGIC => (true, 108),
        other => {
            return Err(Error::Enumeration(format!(
                "unknown optional header magic {:#x}",
                other
            )))
        }
    };

    let size_of_image = reader.u32(optional + SIZE_OF_IMAGE_OFFSET)?;
    let rva_count = reader.u32(optional + rva_count_offset)?;

    // Directories follow NumberOfRvaAndSizes; entry 0 is the export table
    let export_directory = if rva_count == 0 {
        DataDirectory {
            virtual_address: 0,
            size: 0,
        }
    } else {
        let dir = optional + rva_count_offset + 4;
        DataDirectory {
            virtual_address: reader.u32(dir)?,
            size: reader.u32(dir + 4)?,
        }
    };

    Ok(PeHeaders {
        is_pe32_plus,
        size_of_image,
        export_directory,
    })
}

/// Parse named exports of the image mapped at `base`
///
/// Forwarded exports are reported with address 0.
pub fn parse_exports(base: usize, image: &[u8]) -> Result<Vec<ModuleExport>> {
    let headers = parse_headers(image)?;
    let reader = ImageReader::new(image);
    let mut exports = Vec::new();

    let export_dir_rva = headers.export_directory.virtual_address as usize;
    if export_dir_rva == 0 {
        return Ok(exports);
    }

    let dir = reader.bytes(export_dir_rva, EXPORT_DIRECTORY_SIZE)?;
    let field = |offset: usize| {
        u32::from_le_bytes([dir[offset], dir[offset + 1], dir[offset + 2], dir[offset + 3]])
    };

    let ordinal_base = field(16);
    let num_functions = field(20) as usize;
    let num_names = field(24) as usize;
    let functions = field(28) as usize;
    let names = field(32) as usize;
    let ordinals = field(36) as usize;

    let export_dir_end = export_dir_rva + headers.export_directory.size as usize;

    for i in 0..num_names {
        let name_rva = reader.u32(names + i * 4)? as usize;
        let ordinal_index = reader.u16(ordinals + i * 2)? as usize;

        if ordinal_index >= num_functions {
            continue;
        }

        let func_rva = reader.u32(functions + ordinal_index * 4)? as usize;
        let name = reader.c_str(name_rva)?;

        let address = if func_rva == 0 || (func_rva >= export_dir_rva && func_rva < export_dir_end)
        {
            0
        } else {
            base.checked_add(func_rva)
                .ok_or(Error::InvalidAddress(func_rva))?
        };

        exports.push(ModuleExport {
            name,
            address,
            ordinal: (ordinal_base as usize + ordinal_index) as u16,
        });
    }

    Ok(exports)
}

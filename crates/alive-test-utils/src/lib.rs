//! Testing utilities for alive-hook
//!
//! Builds mapped PE32 images (RVA == file offset) with named exports, stub
//! bodies following the placeholder convention, and jump thunks. `Timeline`
//! captures `tracing` output for assertions on what was logged.

mod timeline;

pub use timeline::{Timeline, TimelineEntry};

/// 4 NOPs, INT3, 4 NOPs
pub const STUB_MARKER: [u8; 9] = [0x90, 0x90, 0x90, 0x90, 0xCC, 0x90, 0x90, 0x90, 0x90];

/// Offset of the marker inside bodies produced by `stub_body`
pub const STUB_MARKER_OFFSET: usize = 7;

const CODE_RVA: usize = 0x1000;
const DATA_RVA: usize = 0x20000;
const HEADER_NT_OFFSET: usize = 0x80;
const PAGE: usize = 0x1000;

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

/// Placeholder body: `push eax; mov eax, [cell]; pop eax; <marker>; ret`
///
/// `cell` holds a pointer to "decorated\0undecorated\0".
pub fn stub_body(cell: u32) -> Vec<u8> {
    let mut body = vec![0x50, 0xA1];
    body.extend_from_slice(&cell.to_le_bytes());
    body.push(0x58);
    body.extend_from_slice(&STUB_MARKER);
    body.push(0xC3);
    body
}

/// `jmp rel32` from `from` to `to`
pub fn jmp_rel32(from: usize, to: usize) -> Vec<u8> {
    let rel = (to as i64 - (from as i64 + 5)) as i32;
    let mut bytes = vec![0xE9];
    bytes.extend_from_slice(&rel.to_le_bytes());
    bytes
}

enum ExportEntry {
    Code { name: String, rva: usize },
    Forwarded { name: String, target: String },
}

/// Image produced by `ModuleImageBuilder::build`
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub base: usize,
    pub bytes: Vec<u8>,
    /// (export name, address) for every code export
    pub exports: Vec<(String, usize)>,
}

impl BuiltImage {
    pub fn address_of(&self, name: &str) -> Option<usize> {
        self.exports
            .iter()
            .find(|(export, _)| export == name)
            .map(|(_, address)| *address)
    }

    pub fn byte_at(&self, address: usize) -> u8 {
        self.bytes[address - self.base]
    }
}

/// Incremental builder for a PE32 DLL image
pub struct ModuleImageBuilder {
    base: usize,
    code: Vec<u8>,
    data: Vec<u8>,
    exports: Vec<ExportEntry>,
}

impl ModuleImageBuilder {
    /// `base` must fit in 32 bits, stub name pointers are 32-bit
    pub fn new(base: usize) -> Self {
        assert!(base <= u32::MAX as usize, "image base must be 32-bit");
        Self {
            base,
            code: Vec::new(),
            data: Vec::new(),
            exports: Vec::new(),
        }
    }

    /// Append code without exporting it
    pub fn add_code(&mut self, bytes: &[u8]) -> usize {
        let offset = align(self.code.len(), 16);
        self.code.resize(offset, 0xCC);
        self.code.extend_from_slice(bytes);
        assert!(CODE_RVA + self.code.len() <= DATA_RVA, "code section full");
        self.base + CODE_RVA + offset
    }

    /// Append data, 4-byte aligned
    pub fn add_data(&mut self, bytes: &[u8]) -> usize {
        let offset = align(self.data.len(), 4);
        self.data.resize(offset, 0);
        self.data.extend_from_slice(bytes);
        self.base + DATA_RVA + offset
    }

    /// Append code and export it under `name`
    pub fn add_function(&mut self, name: &str, bytes: &[u8]) -> usize {
        let address = self.add_code(bytes);
        self.exports.push(ExportEntry::Code {
            name: name.to_string(),
            rva: address - self.base,
        });
        address
    }

    /// Export an existing address under `name`
    pub fn add_export(&mut self, name: &str, address: usize) {
        self.exports.push(ExportEntry::Code {
            name: name.to_string(),
            rva: address - self.base,
        });
    }

    /// Export forwarded to another module
    pub fn add_forwarded_export(&mut self, name: &str, target: &str) {
        self.exports.push(ExportEntry::Forwarded {
            name: name.to_string(),
            target: target.to_string(),
        });
    }

    /// Store "decorated\0undecorated\0" plus a pointer cell to it; returns the cell
    pub fn add_name_pair(&mut self, decorated: &str, undecorated: &str) -> u32 {
        let mut blob = decorated.as_bytes().to_vec();
        blob.push(0);
        blob.extend_from_slice(undecorated.as_bytes());
        blob.push(0);
        let names = self.add_data(&blob) as u32;
        self.add_data(&names.to_le_bytes()) as u32
    }

    /// Placeholder exported as `decorated`, carrying the matching name pair
    pub fn add_stub(&mut self, decorated: &str, undecorated: &str) -> usize {
        self.add_stub_with_names(decorated, decorated, undecorated)
    }

    /// Placeholder exported as `export_name` whose name pair may disagree
    pub fn add_stub_with_names(
        &mut self,
        export_name: &str,
        decorated: &str,
        undecorated: &str,
    ) -> usize {
        let cell = self.add_name_pair(decorated, undecorated);
        self.add_function(export_name, &stub_body(cell))
    }

    /// Export `name` as a `jmp rel32` thunk to `target`
    pub fn add_jump_thunk(&mut self, name: &str, target: usize) -> usize {
        let offset = align(self.code.len(), 16);
        let thunk = self.base + CODE_RVA + offset;
        self.add_function(name, &jmp_rel32(thunk, target))
    }

    pub fn build(self) -> BuiltImage {
        let export_rva = align(DATA_RVA + self.data.len(), 16);

        // Export directory block: header, tables, then strings
        let mut names: Vec<(String, usize, Option<String>)> = self
            .exports
            .iter()
            .enumerate()
            .map(|(i, entry)| match entry {
                ExportEntry::Code { name, .. } => (name.clone(), i, None),
                ExportEntry::Forwarded { name, target } => (name.clone(), i, Some(target.clone())),
            })
            .collect();
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let count = self.exports.len();
        let functions_rva = export_rva + 40;
        let names_rva = functions_rva + count * 4;
        let ordinals_rva = names_rva + count * 4;
        let mut strings_rva = ordinals_rva + count * 2;

        let mut block = vec![0u8; strings_rva - export_rva];
        let mut strings = Vec::new();
        let mut function_rvas = vec![0u32; count];
        let mut exports = Vec::new();

        let module_name_rva = strings_rva;
        strings.extend_from_slice(b"reimpl.dll\0");
        strings_rva += 11;

        for (slot, (name, index, forward)) in names.iter().enumerate() {
            let name_rva = strings_rva;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            strings_rva += name.len() + 1;

            match (&self.exports[*index], forward) {
                (ExportEntry::Code { rva, .. }, _) => {
                    function_rvas[*index] = *rva as u32;
                    exports.push((name.clone(), self.base + rva));
                }
                (ExportEntry::Forwarded { .. }, Some(target)) => {
                    function_rvas[*index] = strings_rva as u32;
                    strings.extend_from_slice(target.as_bytes());
                    strings.push(0);
                    strings_rva += target.len() + 1;
                }
                (ExportEntry::Forwarded { .. }, None) => unreachable!(),
            }

            let names_at = names_rva - export_rva + slot * 4;
            block[names_at..names_at + 4].copy_from_slice(&(name_rva as u32).to_le_bytes());
            let ordinals_at = ordinals_rva - export_rva + slot * 2;
            block[ordinals_at..ordinals_at + 2].copy_from_slice(&(*index as u16).to_le_bytes());
        }

        for (i, rva) in function_rvas.iter().enumerate() {
            let at = 40 + i * 4;
            block[at..at + 4].copy_from_slice(&rva.to_le_bytes());
        }

        let put = |block: &mut Vec<u8>, at: usize, value: u32| {
            block[at..at + 4].copy_from_slice(&value.to_le_bytes());
        };
        put(&mut block, 12, module_name_rva as u32);
        put(&mut block, 16, 1); // ordinal base
        put(&mut block, 20, count as u32);
        put(&mut block, 24, count as u32);
        put(&mut block, 28, functions_rva as u32);
        put(&mut block, 32, names_rva as u32);
        put(&mut block, 36, ordinals_rva as u32);
        block.extend_from_slice(&strings);

        let export_size = if count == 0 { 0 } else { block.len() };
        let size_of_image = align(export_rva + block.len(), PAGE);
        let mut bytes = vec![0u8; size_of_image];

        write_headers(
            &mut bytes,
            self.base as u32,
            size_of_image as u32,
            if count == 0 { 0 } else { export_rva as u32 },
            export_size as u32,
        );
        bytes[CODE_RVA..CODE_RVA + self.code.len()].copy_from_slice(&self.code);
        bytes[DATA_RVA..DATA_RVA + self.data.len()].copy_from_slice(&self.data);
        if count > 0 {
            bytes[export_rva..export_rva + block.len()].copy_from_slice(&block);
        }

        BuiltImage {
            base: self.base,
            bytes,
            exports,
        }
    }
}

fn write_headers(
    bytes: &mut [u8],
    image_base: u32,
    size_of_image: u32,
    export_rva: u32,
    export_size: u32,
) {
    bytes[0..2].copy_from_slice(b"MZ");
    bytes[0x3C..0x40].copy_from_slice(&(HEADER_NT_OFFSET as u32).to_le_bytes());
    bytes[HEADER_NT_OFFSET..HEADER_NT_OFFSET + 4].copy_from_slice(b"PE\0\0");

    let file_header = HEADER_NT_OFFSET + 4;
    bytes[file_header..file_header + 2].copy_from_slice(&0x014Cu16.to_le_bytes()); // i386
    bytes[file_header + 16..file_header + 18].copy_from_slice(&0x00E0u16.to_le_bytes());
    bytes[file_header + 18..file_header + 20].copy_from_slice(&0x2102u16.to_le_bytes()); // DLL

    let optional = file_header + 20;
    let fields: [(usize, u32); 7] = [
        (28, image_base),
        (32, PAGE as u32),
        (36, 0x200),
        (56, size_of_image),
        (60, 0x400),
        (92, 16),
        (96, export_rva),
    ];
    bytes[optional..optional + 2].copy_from_slice(&0x010Bu16.to_le_bytes());
    for (offset, value) in fields {
        bytes[optional + offset..optional + offset + 4].copy_from_slice(&value.to_le_bytes());
    }
    bytes[optional + 100..optional + 104].copy_from_slice(&export_size.to_le_bytes());
}

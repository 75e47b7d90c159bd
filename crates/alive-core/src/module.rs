//! Loaded module view

use crate::pe;
use crate::traits::ExportSource;
use alive_common::{Error, ModuleExport, Result};

/// Headers are always within the first page of a mapped image
const HEADER_PAGE: usize = 0x1000;

/// A PE image mapped in the current process
#[derive(Debug, Clone, Copy)]
pub struct LoadedModule {
    base: usize,
    size: usize,
}

impl LoadedModule {
    /// View the image mapped at `base`
    ///
    /// # Safety
    /// `base` must point at a mapped image whose first page and whole
    /// `SizeOfImage` range stay readable for the lifetime of the view.
    pub unsafe fn from_base(base: usize) -> Result<Self> {
        if base == 0 {
            return Err(Error::Enumeration("null module handle".into()));
        }
        let headers = std::slice::from_raw_parts(base as *const u8, HEADER_PAGE);
        let parsed = pe::parse_headers(headers)?;
        Ok(Self {
            base,
            size: parsed.size_of_image as usize,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn image(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) }
    }
}

impl ExportSource for LoadedModule {
    fn exports(&self) -> Result<Vec<ModuleExport>> {
        pe::parse_exports(self.base, self.image())
    }
}

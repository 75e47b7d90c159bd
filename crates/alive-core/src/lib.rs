//! alive-hook core library
//!
//! Export enumeration, stub detection, address bookkeeping and the atomic
//! patch transaction that wires a reimplementation module into the legacy
//! program it replaces, one function at a time.

pub mod exports;
pub mod hooks;
pub mod installer;
pub mod memory;
pub mod module;
pub mod overrides;
pub mod patcher;
pub mod pe;
pub mod registry;
pub mod reports;
pub mod stub;
pub mod threads;
pub mod traits;

pub use alive_common::{Error, Result};
pub use installer::{abort_startup, ExportHooker};
pub use memory::ImageMemory;
pub use module::LoadedModule;
pub use overrides::DisabledSet;
pub use patcher::TransactionPatcher;
pub use registry::AddressRegistry;
pub use stub::StubDetector;
pub use threads::SingleThreaded;
pub use traits::*;

#[cfg(target_os = "windows")]
pub use memory::ProcessMemory;
#[cfg(target_os = "windows")]
pub use threads::ProcessThreads;

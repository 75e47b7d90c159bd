//! alive-hook agent
//!
//! Linked into the reimplementation DLL. On process attach it reads
//! `alive.toml`, sets up logging and installs every redirection before the
//! loader lets any other code run. Any failure aborts the process: running
//! with a partial set of hooks would mix original and reimplemented state.

use alive_common::{HookerConfig, InstallSummary, Result};
use alive_core::{CodeMemory, ExportHooker, ExportSource, ThreadControl, TransactionPatcher};
use std::any::Any;
use std::panic::Location;

/// Install hooks for the exports of `source`
pub fn install<S, M, T>(
    source: &S,
    memory: &M,
    threads: T,
    config: HookerConfig,
) -> Result<InstallSummary>
where
    S: ExportSource + ?Sized,
    M: CodeMemory + ?Sized,
    T: ThreadControl,
{
    let patcher = TransactionPatcher::new(memory, threads);
    let mut hooker = ExportHooker::new(source, memory, patcher, config);
    hooker.apply()?;
    Ok(hooker.summary().clone())
}

/// One-line description of a panic for the fatal startup channel
pub fn panic_message(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> String {
    let what = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    match location {
        Some(at) => format!("panic at {}:{}: {}", at.file(), at.line(), what),
        None => format!("panic: {}", what),
    }
}

#[cfg(target_os = "windows")]
pub use entry::DllMain;

#[cfg(target_os = "windows")]
mod entry {
    use super::*;
    use alive_common::{config::DEFAULT_CONFIG_FILE, info, init_agent_logging, Error, LogConfig};
    use alive_core::{abort_startup, LoadedModule, ProcessMemory, ProcessThreads};
    use std::ffi::c_void;
    use std::panic;
    use windows::Win32::Foundation::{BOOL, HINSTANCE, TRUE};
    use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

    /// Run `f` with panics routed to `abort_startup`
    ///
    /// The previous hook is put back afterwards; later panics are not startup
    /// failures.
    fn abort_on_panic<R>(f: impl FnOnce() -> R) -> R {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(|info| {
            abort_startup(&Error::Internal(panic_message(info.payload(), info.location())));
        }));
        let result = f();
        panic::set_hook(previous);
        result
    }

    fn attach(hinst: HINSTANCE) -> Result<()> {
        let config = match HookerConfig::load_or_default(DEFAULT_CONFIG_FILE) {
            Ok(config) => config,
            Err(e) => {
                init_agent_logging(&LogConfig::default());
                return Err(e);
            }
        };
        init_agent_logging(&config.logging);

        info!(target: "alive_agent", "Installing hooks");

        let module = unsafe { LoadedModule::from_base(hinst.0 as usize) }?;
        let memory = ProcessMemory::new();
        let summary = install(&module, &memory, ProcessThreads::new(), config)?;

        info!(
            target: "alive_agent",
            exports = summary.exports_seen,
            hooked = summary.hooked,
            skipped = summary.skipped,
            "Hooks installed"
        );
        Ok(())
    }

    /// DLL entry point
    ///
    /// # Safety
    /// Called by the Windows loader. Hooks are installed synchronously so
    /// they are in place before the host calls into either side.
    #[no_mangle]
    #[allow(non_snake_case)]
    pub unsafe extern "system" fn DllMain(
        hinst: HINSTANCE,
        reason: u32,
        _reserved: *mut c_void,
    ) -> BOOL {
        if reason == DLL_PROCESS_ATTACH {
            if let Err(e) = abort_on_panic(|| attach(hinst)) {
                abort_startup(&e);
            }
        }
        TRUE
    }
}

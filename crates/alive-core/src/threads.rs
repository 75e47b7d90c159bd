//! Thread suspension around code patches

use crate::traits::ThreadControl;
use alive_common::Result;

/// Suspends nothing; for hosts where the caller is the only thread
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleThreaded;

impl ThreadControl for SingleThreaded {
    fn suspend_others(&mut self) -> Result<()> {
        Ok(())
    }

    fn resume_all(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
pub use process::ProcessThreads;

#[cfg(target_os = "windows")]
mod process {
    use super::*;
    use alive_common::{Error, TransactionStage};
    use tracing::warn;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
    };
    use windows::Win32::System::Threading::{
        GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread, SuspendThread,
        THREAD_SUSPEND_RESUME,
    };

    /// Every thread of the current process except the caller
    #[derive(Debug, Default)]
    pub struct ProcessThreads {
        suspended: Vec<(u32, HANDLE)>,
    }

    impl ProcessThreads {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of threads currently held suspended
        pub fn suspended_count(&self) -> usize {
            self.suspended.len()
        }

        fn other_threads() -> Result<Vec<u32>> {
            let pid = unsafe { GetCurrentProcessId() };
            let current = unsafe { GetCurrentThreadId() };
            let mut threads = Vec::new();

            unsafe {
                let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0).map_err(|e| {
                    Error::transaction(
                        TransactionStage::UpdateThreads,
                        format!("CreateToolhelp32Snapshot failed: {}", e),
                    )
                })?;

                let mut entry = THREADENTRY32 {
                    dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
                    ..Default::default()
                };

                if Thread32First(snapshot, &mut entry).is_ok() {
                    loop {
                        if entry.th32OwnerProcessID == pid && entry.th32ThreadID != current {
                            threads.push(entry.th32ThreadID);
                        }
                        entry.dwSize = std::mem::size_of::<THREADENTRY32>() as u32;
                        if Thread32Next(snapshot, &mut entry).is_err() {
                            break;
                        }
                    }
                }

                let _ = CloseHandle(snapshot);
            }

            Ok(threads)
        }
    }

    // Between the first SuspendThread and the end of resume_all no logging or
    // allocation happens: a suspended thread may own the heap or a log writer.
    impl ThreadControl for ProcessThreads {
        fn suspend_others(&mut self) -> Result<()> {
            let threads = Self::other_threads()?;
            self.suspended.reserve(threads.len());

            let mut failed = None;
            for &tid in &threads {
                // Threads may exit between the snapshot and OpenThread
                let Ok(handle) = (unsafe { OpenThread(THREAD_SUSPEND_RESUME, false, tid) }) else {
                    continue;
                };
                if unsafe { SuspendThread(handle) } == u32::MAX {
                    let _ = unsafe { CloseHandle(handle) };
                    failed = Some(tid);
                    break;
                }
                self.suspended.push((tid, handle));
            }

            if let Some(tid) = failed {
                let resumed = self.resume_all();
                let mut message = format!("SuspendThread failed for thread {}", tid);
                if let Err(e) = resumed {
                    message.push_str(&format!("; {}", e));
                }
                return Err(Error::transaction(TransactionStage::UpdateThreads, message));
            }
            Ok(())
        }

        fn resume_all(&mut self) -> Result<()> {
            let mut failures = 0usize;
            let mut first_failure = 0u32;
            for (tid, handle) in self.suspended.drain(..) {
                if unsafe { ResumeThread(handle) } == u32::MAX {
                    if failures == 0 {
                        first_failure = tid;
                    }
                    failures += 1;
                }
                let _ = unsafe { CloseHandle(handle) };
            }
            if failures == 0 {
                Ok(())
            } else {
                Err(Error::transaction(
                    TransactionStage::UpdateThreads,
                    format!(
                        "ResumeThread failed for {} threads, first {}",
                        failures, first_failure
                    ),
                ))
            }
        }
    }

    impl Drop for ProcessThreads {
        fn drop(&mut self) {
            if !self.suspended.is_empty() {
                if let Err(e) = self.resume_all() {
                    warn!("{}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_threaded_is_noop() {
        let mut threads = SingleThreaded;
        assert!(threads.suspend_others().is_ok());
        assert!(threads.resume_all().is_ok());
        assert!(threads.resume_all().is_ok());
    }
}

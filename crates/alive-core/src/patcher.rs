//! Staged, all-or-nothing entry point patching

use crate::hooks::redirect_patch;
use crate::traits::{CodeMemory, CodePatcher, ThreadControl};
use alive_common::{Error, Result, TransactionStage};
use tracing::{debug, error, info};

/// A jump waiting to be written, with the bytes it replaces
#[derive(Debug, Clone)]
struct StagedPatch {
    from: usize,
    to: usize,
    patch: Vec<u8>,
    original: Vec<u8>,
}

impl StagedPatch {
    fn end(&self) -> usize {
        self.from + self.patch.len()
    }

    fn overlaps(&self, from: usize, len: usize) -> bool {
        from < self.end() && self.from < from + len
    }
}

/// Thread control failures surface as `UpdateThreads` transaction errors
fn thread_update_error(e: Error) -> Error {
    match e {
        Error::Transaction { .. } => e,
        other => Error::transaction(TransactionStage::UpdateThreads, other.to_string()),
    }
}

/// `CodePatcher` over any memory and thread control
///
/// Nothing touches memory before `commit`. Other threads are frozen only for
/// the writes inside `commit`; everything that reads, allocates or logs runs
/// while they are live, since a frozen thread may hold the heap or the log
/// writer. A failed commit puts back every patch already written, so callers
/// observe either all jumps or none.
pub struct TransactionPatcher<'m, M: CodeMemory + ?Sized, T: ThreadControl> {
    memory: &'m M,
    threads: T,
    staged: Vec<StagedPatch>,
    open: bool,
}

impl<'m, M: CodeMemory + ?Sized, T: ThreadControl> TransactionPatcher<'m, M, T> {
    pub fn new(memory: &'m M, threads: T) -> Self {
        Self {
            memory,
            threads,
            staged: Vec::new(),
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of attaches waiting for `commit`
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    fn ensure_open(&self, stage: TransactionStage) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::transaction(stage, "no transaction open"))
        }
    }

    /// Write every staged patch; on failure undo the written ones in reverse
    ///
    /// Runs with other threads frozen: no logging, and `unrestored` is
    /// preallocated by the caller.
    fn write_all(
        &self,
        staged: &[StagedPatch],
        unrestored: &mut Vec<usize>,
    ) -> std::result::Result<(), (usize, Error)> {
        for (index, patch) in staged.iter().enumerate() {
            if let Err(e) = self.memory.write(patch.from, &patch.patch) {
                for written in staged[..index].iter().rev() {
                    if self.memory.write(written.from, &written.original).is_err() {
                        unrestored.push(written.from);
                    }
                }
                return Err((index, e));
            }
        }
        Ok(())
    }
}

impl<'m, M: CodeMemory + ?Sized, T: ThreadControl> CodePatcher for TransactionPatcher<'m, M, T> {
    fn begin(&mut self) -> Result<()> {
        if self.open {
            return Err(Error::transaction(
                TransactionStage::Begin,
                "transaction already open",
            ));
        }
        self.open = true;
        debug!("Patch transaction opened");
        Ok(())
    }

    fn attach(&mut self, from: usize, to: usize) -> Result<()> {
        self.ensure_open(TransactionStage::Attach)?;

        let patch = redirect_patch(from, to);
        if let Some(existing) = self.staged.iter().find(|p| p.overlaps(from, patch.len())) {
            return Err(Error::transaction(
                TransactionStage::Attach,
                format!(
                    "{:#x} overlaps the patch already staged at {:#x}",
                    from, existing.from
                ),
            ));
        }

        let original = self.memory.read(from, patch.len()).map_err(|e| {
            Error::transaction(TransactionStage::Attach, format!("{:#x}: {}", from, e))
        })?;

        self.staged.push(StagedPatch {
            from,
            to,
            patch,
            original,
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.ensure_open(TransactionStage::Commit)?;

        let staged = std::mem::take(&mut self.staged);
        self.open = false;
        let mut unrestored = Vec::with_capacity(staged.len());

        if let Err(e) = self.threads.suspend_others() {
            let e = thread_update_error(e);
            return Err(match self.threads.resume_all() {
                Ok(()) => e,
                Err(resume) => Error::transaction(
                    TransactionStage::UpdateThreads,
                    format!("{}; {}", e, resume),
                ),
            });
        }
        let written = self.write_all(&staged, &mut unrestored);
        let resumed = self.threads.resume_all();

        match written {
            Ok(()) => {
                resumed.map_err(thread_update_error)?;
                info!("Committed {} patches", staged.len());
                Ok(())
            }
            Err((index, e)) => {
                let failed = &staged[index];
                let mut message = format!(
                    "writing jump {:#x} -> {:#x} failed: {}",
                    failed.from, failed.to, e
                );
                for from in &unrestored {
                    error!("Failed to restore original bytes at {:#x}", from);
                }
                if !unrestored.is_empty() {
                    message.push_str(&format!(
                        "; {} patches could not be restored",
                        unrestored.len()
                    ));
                }
                if let Err(resume) = resumed {
                    error!("Failed to resume threads after a failed commit: {}", resume);
                    message.push_str(&format!("; {}", resume));
                }
                Err(Error::transaction(TransactionStage::Commit, message))
            }
        }
    }

    fn abort(&mut self) {
        if !self.open {
            return;
        }
        debug!("Aborting patch transaction with {} staged", self.staged.len());
        self.staged.clear();
        self.open = false;
    }
}

impl<'m, M: CodeMemory + ?Sized, T: ThreadControl> Drop for TransactionPatcher<'m, M, T> {
    fn drop(&mut self) {
        self.abort();
    }
}

//! Export hook installer
//!
//! Drives one startup pass over the reimplementation module:
//!
//! 1. enumerate exports and parse their legacy addresses
//! 2. classify each export as implemented or stub, rejecting duplicates
//! 3. merge the override list
//! 4. patch every entry point inside a single transaction
//!
//! Implemented functions take over the legacy entry point. Stubs (and anything
//! disabled by the override list) have their own entry point sent back to the
//! legacy code, so callers on either side always reach working code.

use crate::exports;
use crate::overrides::DisabledSet;
use crate::registry::AddressRegistry;
use crate::reports::ProgressReport;
use crate::stub::StubDetector;
use crate::traits::{CodeMemory, CodePatcher, ExportSource};
use alive_common::{
    Error, ExportRecord, HookerConfig, InstallSummary, InstallerState, RedirectDirection,
    Redirection, Result,
};
use tracing::{debug, error, info};

/// One-shot installer over an export source, its memory and a patcher
pub struct ExportHooker<'a, S, M, P>
where
    S: ExportSource + ?Sized,
    M: CodeMemory + ?Sized,
    P: CodePatcher,
{
    source: &'a S,
    memory: &'a M,
    patcher: P,
    config: HookerConfig,
    state: InstallerState,
    registry: AddressRegistry,
    records: Vec<ExportRecord>,
    disabled: Option<DisabledSet>,
    summary: InstallSummary,
}

impl<'a, S, M, P> ExportHooker<'a, S, M, P>
where
    S: ExportSource + ?Sized,
    M: CodeMemory + ?Sized,
    P: CodePatcher,
{
    pub fn new(source: &'a S, memory: &'a M, patcher: P, config: HookerConfig) -> Self {
        Self {
            source,
            memory,
            patcher,
            config,
            state: InstallerState::Idle,
            registry: AddressRegistry::new(),
            records: Vec::new(),
            disabled: None,
            summary: InstallSummary::default(),
        }
    }

    /// Use `disabled` instead of reading the override file
    pub fn with_disabled(mut self, disabled: DisabledSet) -> Self {
        self.disabled = Some(disabled);
        self
    }

    pub fn state(&self) -> InstallerState {
        self.state
    }

    pub fn summary(&self) -> &InstallSummary {
        &self.summary
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    /// Validated exports in enumeration order
    pub fn records(&self) -> &[ExportRecord] {
        &self.records
    }

    pub fn patcher(&self) -> &P {
        &self.patcher
    }

    /// Run the whole pass; may be called once
    pub fn apply(&mut self) -> Result<()> {
        if self.state != InstallerState::Idle {
            return Err(Error::Internal(format!(
                "apply() called in state {}",
                self.state
            )));
        }

        match self.run() {
            Ok(()) => {
                self.state = InstallerState::Committed;
                info!(
                    "Hooked {} exports ({} implemented, {} stubbed, {} disabled by config)",
                    self.summary.hooked,
                    self.summary.implemented,
                    self.summary.stubbed,
                    self.summary.disabled_by_config
                );
                Ok(())
            }
            Err(e) => {
                if self.state == InstallerState::TransactionOpen {
                    self.patcher.abort();
                }
                error!("Hook installation failed in state {}: {}", self.state, e);
                self.state = InstallerState::Faulted;
                Err(e)
            }
        }
    }

    /// Redirections for every validated export
    ///
    /// Empty until validation has run.
    pub fn plan(&self) -> Vec<Redirection> {
        let empty = DisabledSet::new();
        let disabled = self.disabled.as_ref().unwrap_or(&empty);

        self.records
            .iter()
            .map(|record| {
                let legacy = record.legacy_address.as_usize();
                let overridden = disabled.contains(record.legacy_address);
                if record.is_implemented && !overridden {
                    Redirection {
                        name: record.name.clone(),
                        legacy_address: record.legacy_address,
                        from: legacy,
                        to: record.code_address,
                        direction: RedirectDirection::ToReimplementation,
                        disabled_by_config: false,
                    }
                } else {
                    Redirection {
                        name: record.name.clone(),
                        legacy_address: record.legacy_address,
                        from: record.code_address,
                        to: legacy,
                        direction: RedirectDirection::ToOriginal,
                        disabled_by_config: record.is_implemented && overridden,
                    }
                }
            })
            .collect()
    }

    fn run(&mut self) -> Result<()> {
        self.state = InstallerState::Enumerating;
        let enumerated = exports::enumerate(self.source, self.memory)?;
        self.summary.exports_seen = enumerated.exports_seen;
        self.summary.skipped = enumerated.skipped.len();

        self.state = InstallerState::Validating;
        let detector = StubDetector::new(self.memory, self.config.bytewise_verification);
        for candidate in enumerated.candidates {
            self.registry
                .ensure_vacant(candidate.legacy_address, &candidate.name)?;
            let info = detector.inspect(candidate.code_address, &candidate.name)?;
            debug!(
                "{} {} at {:#x} ({})",
                candidate.legacy_address,
                info.name(),
                candidate.code_address,
                if info.is_implemented {
                    "implemented"
                } else {
                    "stub"
                }
            );
            let is_implemented = info.is_implemented;
            self.registry
                .insert(candidate.legacy_address, &candidate.name, info)?;
            self.records.push(ExportRecord {
                name: candidate.name,
                code_address: candidate.code_address,
                legacy_address: candidate.legacy_address,
                is_implemented,
            });
        }
        self.summary.implemented = self.records.iter().filter(|r| r.is_implemented).count();
        self.summary.stubbed = self.records.len() - self.summary.implemented;

        if self.config.save_reports {
            ProgressReport::from_registry(&self.registry)
                .save(&self.config.implemented_report, &self.config.stubbed_report);
        }

        if self.disabled.is_none() {
            self.disabled = Some(DisabledSet::load(&self.config.override_file)?);
        }

        let plan = self.plan();
        self.summary.hooked = plan.len();
        self.summary.disabled_by_config = plan.iter().filter(|r| r.disabled_by_config).count();

        self.install(&plan)
    }

    fn install(&mut self, plan: &[Redirection]) -> Result<()> {
        self.patcher.begin()?;
        self.state = InstallerState::TransactionOpen;

        for redirection in plan {
            self.patcher.attach(redirection.from, redirection.to)?;
        }

        self.patcher.commit()
    }
}

/// Log a fatal startup error and abort the process
pub fn abort_startup(error: &Error) -> ! {
    error!("Fatal: {}", error);
    eprintln!("alive-hook: fatal startup error: {}", error);
    std::process::abort()
}

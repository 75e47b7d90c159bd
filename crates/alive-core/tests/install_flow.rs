//! End-to-end installer tests over synthetic module images
//!
//! Each test builds a reimplementation DLL image with `ModuleImageBuilder`,
//! maps it next to a fake legacy code region and runs the whole pass.

use alive_common::{
    Error, HookerConfig, InstallerState, LegacyAddress, ModuleExport, RedirectDirection, Result,
    TransactionStage,
};
use alive_core::exports::resolve_jump;
use alive_core::{
    CodeMemory, CodePatcher, DisabledSet, ExportHooker, ImageMemory, SingleThreaded,
    TransactionPatcher,
};
use alive_test_utils::{ModuleImageBuilder, Timeline, STUB_MARKER_OFFSET};
use std::io::Write;

const BASE: usize = 0x1000_0000;
const LEGACY: usize = 0x400000;
const LEGACY_SIZE: usize = 0x100000;

struct Fixture {
    memory: ImageMemory,
    exports: Vec<ModuleExport>,
}

impl Fixture {
    fn new(builder: ModuleImageBuilder) -> Self {
        let image = builder.build();
        let exports = alive_core::pe::parse_exports(BASE, &image.bytes).unwrap();
        let memory = ImageMemory::new();
        assert!(memory.map(BASE, image.bytes));
        assert!(memory.map(LEGACY, vec![0xCC; LEGACY_SIZE]));
        Self { memory, exports }
    }

    fn snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        (
            self.memory.region(BASE).unwrap(),
            self.memory.region(LEGACY).unwrap(),
        )
    }
}

fn verifying_config() -> HookerConfig {
    HookerConfig {
        bytewise_verification: true,
        ..Default::default()
    }
}

/// Records calls instead of patching
#[derive(Debug, Default)]
struct RecordingPatcher {
    calls: Vec<String>,
    fail_attach_at: Option<usize>,
}

impl CodePatcher for RecordingPatcher {
    fn begin(&mut self) -> Result<()> {
        self.calls.push("begin".into());
        Ok(())
    }

    fn attach(&mut self, from: usize, to: usize) -> Result<()> {
        if self.fail_attach_at == Some(from) {
            return Err(Error::transaction(TransactionStage::Attach, "refused"));
        }
        self.calls.push(format!("attach {:#x} {:#x}", from, to));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.calls.push("commit".into());
        Ok(())
    }

    fn abort(&mut self) {
        self.calls.push("abort".into());
    }
}

#[test]
fn test_full_install_redirects_both_ways() {
    let mut builder = ModuleImageBuilder::new(BASE);
    let update = builder.add_function("?Update_4A1F20@@YAXXZ", &[0x55, 0x8B, 0xEC, 0x5D, 0xC3]);
    let draw = builder.add_stub("?Draw_401000@@YAXXZ", "Draw");
    let fixture = Fixture::new(builder);

    let patcher = TransactionPatcher::new(&fixture.memory, SingleThreaded);
    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        patcher,
        HookerConfig::default(),
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();

    assert_eq!(hooker.state(), InstallerState::Committed);
    assert_eq!(resolve_jump(&fixture.memory, 0x4A1F20).unwrap(), update);
    assert_eq!(resolve_jump(&fixture.memory, draw).unwrap(), 0x401000);
    assert_eq!(
        hooker.registry().get(LegacyAddress(0x401000)).unwrap().name(),
        "Draw"
    );
}

#[test]
fn test_stub_name_pair_resolves_display_name() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_stub("Foo@@YAXXZ_4A1F20", "Foo");
    let fixture = Fixture::new(builder);

    let patcher = TransactionPatcher::new(&fixture.memory, SingleThreaded);
    let mut hooker =
        ExportHooker::new(&fixture.exports, &fixture.memory, patcher, verifying_config())
            .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();

    let info = hooker.registry().get(LegacyAddress(0x4A1F20)).unwrap();
    assert!(!info.is_implemented);
    assert_eq!(info.name(), "Foo");
}

#[test]
fn test_duplicate_address_faults_before_transaction() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("?First_4A1F20@@YAXXZ", &[0xC3]);
    builder.add_function("?Second_4A1F20@@YAXXZ", &[0xC3]);
    let fixture = Fixture::new(builder);

    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        verifying_config(),
    )
    .with_disabled(DisabledSet::new());

    let err = hooker.apply().unwrap_err();
    match err {
        Error::DuplicateAddress {
            address,
            existing,
            name,
        } => {
            assert_eq!(address, LegacyAddress(0x4A1F20));
            assert_eq!(existing, "?First_4A1F20@@YAXXZ");
            assert_eq!(name, "?Second_4A1F20@@YAXXZ");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(hooker.state(), InstallerState::Faulted);
    assert!(hooker.patcher().calls.is_empty());
}

#[test]
fn test_duplicate_is_rejected_before_stub_detection() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("A_4A1F20", &[0xC3]);
    let stub = builder.add_stub("B_4A1F20", "B");
    let fixture = Fixture::new(builder);

    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        HookerConfig::default(),
    )
    .with_disabled(DisabledSet::new());
    assert!(hooker.apply().is_err());

    // The second export was never inspected, so its trap is intact
    assert_eq!(
        fixture
            .memory
            .read(stub + STUB_MARKER_OFFSET + 4, 1)
            .unwrap(),
        vec![0xCC]
    );
}

#[test]
fn test_name_anomalies_are_skipped_not_fatal() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("DllMain", &[0xC3]);
    builder.add_function("?__done__@?1??Foo@@QAEXXZ@4_NA", &[0x00]);
    builder.add_function("?__kAddr__@?1??vUpdate_4E0030@Movie@@QAEXXZ@4IB", &[0x00]);
    builder.add_function("Short_40100", &[0xC3]);
    builder.add_function("Real_4A1F20", &[0xC3]);
    let fixture = Fixture::new(builder);

    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        verifying_config(),
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();

    assert_eq!(hooker.summary().skipped, 4);
    assert_eq!(hooker.registry().len(), 1);
    assert!(hooker.registry().contains(LegacyAddress(0x4A1F20)));
    assert!(!hooker.registry().contains(LegacyAddress(0x4E0030)));
}

#[test]
fn test_one_warning_per_skipped_name() {
    let skipped = [
        "DllMain",
        "?__done__@?1??Foo@@QAEXXZ@4_NA",
        "?__kAddr__@?1??vUpdate_4E0030@Movie@@QAEXXZ@4IB",
        "Short_40100",
    ];
    let mut builder = ModuleImageBuilder::new(BASE);
    for name in skipped {
        builder.add_function(name, &[0xC3]);
    }
    builder.add_function("Real_4A1F20", &[0xC3]);
    builder.add_stub("Todo_401000", "Todo");
    let fixture = Fixture::new(builder);

    let timeline = Timeline::new();
    tracing::subscriber::with_default(timeline.subscriber(), || {
        let mut hooker = ExportHooker::new(
            &fixture.exports,
            &fixture.memory,
            RecordingPatcher::default(),
            verifying_config(),
        )
        .with_disabled(DisabledSet::new());
        hooker.apply().unwrap();
        assert_eq!(hooker.summary().skipped, skipped.len());
    });

    let warnings = timeline.messages_at(tracing::Level::WARN);
    assert_eq!(warnings.len(), skipped.len(), "{warnings:?}");
    for name in skipped {
        assert_eq!(warnings.iter().filter(|w| w.contains(name)).count(), 1);
    }
    assert!(!warnings
        .iter()
        .any(|w| w.contains("Real_4A1F20") || w.contains("Todo_401000")));
}

#[test]
fn test_disabled_address_forces_original() {
    let mut builder = ModuleImageBuilder::new(BASE);
    let update = builder.add_function("Update_4A1F20", &[0x55, 0xC3]);
    let fixture = Fixture::new(builder);

    let dir = tempfile::tempdir().unwrap();
    let override_file = dir.path().join("hook_map.txt");
    let mut file = std::fs::File::create(&override_file).unwrap();
    writeln!(file, "0x4A1F20").unwrap();
    writeln!(file, "garbage").unwrap();
    drop(file);

    let config = HookerConfig {
        override_file,
        ..verifying_config()
    };
    let patcher = TransactionPatcher::new(&fixture.memory, SingleThreaded);
    let mut hooker = ExportHooker::new(&fixture.exports, &fixture.memory, patcher, config);
    hooker.apply().unwrap();

    let plan = hooker.plan();
    assert_eq!(plan.len(), 1);
    assert_eq!(plan[0].direction, RedirectDirection::ToOriginal);
    assert!(plan[0].disabled_by_config);
    // Reimplementation entry now jumps to legacy code, legacy code untouched
    assert_eq!(resolve_jump(&fixture.memory, update).unwrap(), 0x4A1F20);
    assert_eq!(fixture.memory.read(0x4A1F20, 1).unwrap(), vec![0xCC]);
}

#[test]
fn test_missing_override_file_is_empty() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("Update_4A1F20", &[0xC3]);
    let fixture = Fixture::new(builder);

    let dir = tempfile::tempdir().unwrap();
    let config = HookerConfig {
        override_file: dir.path().join("absent.txt"),
        ..verifying_config()
    };
    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        config,
    );
    hooker.apply().unwrap();
    assert_eq!(hooker.plan()[0].direction, RedirectDirection::ToReimplementation);
}

#[test]
fn test_commit_failure_leaves_memory_untouched() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("A_401000", &[0xC3]);
    builder.add_function("B_402000", &[0xC3]);
    let stub = builder.add_stub("C_403000", "C");
    builder.add_function("D_404000", &[0xC3]);
    let fixture = Fixture::new(builder);
    let before = fixture.snapshot();

    // Two legacy entries are already written when the stub's entry fails
    fixture.memory.reject_writes_at(stub);

    let patcher = TransactionPatcher::new(&fixture.memory, SingleThreaded);
    let mut hooker =
        ExportHooker::new(&fixture.exports, &fixture.memory, patcher, verifying_config())
            .with_disabled(DisabledSet::new());

    let err = hooker.apply().unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction {
            stage: TransactionStage::Commit,
            ..
        }
    ));
    assert_eq!(hooker.state(), InstallerState::Faulted);
    assert_eq!(fixture.snapshot(), before);
}

#[test]
fn test_attach_failure_aborts_transaction() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("A_401000", &[0xC3]);
    builder.add_function("B_402000", &[0xC3]);
    let fixture = Fixture::new(builder);

    let patcher = RecordingPatcher {
        fail_attach_at: Some(0x402000),
        ..Default::default()
    };
    let mut hooker =
        ExportHooker::new(&fixture.exports, &fixture.memory, patcher, verifying_config())
            .with_disabled(DisabledSet::new());

    assert!(hooker.apply().is_err());
    assert_eq!(hooker.state(), InstallerState::Faulted);
    let calls = &hooker.patcher().calls;
    assert_eq!(calls.first().map(String::as_str), Some("begin"));
    assert_eq!(calls.last().map(String::as_str), Some("abort"));
    assert!(!calls.iter().any(|c| c == "commit"));
}

#[test]
fn test_only_rel32_thunks_are_followed() {
    let mut builder = ModuleImageBuilder::new(BASE);
    let body = builder.add_code(&[0x55, 0x8B, 0xEC, 0x5D, 0xC3]);
    builder.add_jump_thunk("Near_401000", body);
    let short = builder.add_function("Short_402000", &[0xEB, 0x00, 0xC3]);
    let fixture = Fixture::new(builder);

    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        verifying_config(),
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();

    let near = hooker
        .records()
        .iter()
        .find(|r| r.legacy_address == LegacyAddress(0x401000))
        .unwrap();
    assert_eq!(near.code_address, body);
    let not_followed = hooker
        .records()
        .iter()
        .find(|r| r.legacy_address == LegacyAddress(0x402000))
        .unwrap();
    assert_eq!(not_followed.code_address, short);
}

#[test]
fn test_trap_neutralized_outside_verification_mode() {
    let mut builder = ModuleImageBuilder::new(BASE);
    let stub = builder.add_stub("Todo_401000", "Todo");
    let trap = stub + STUB_MARKER_OFFSET + 4;

    let verifying = Fixture::new(builder);
    let mut hooker = ExportHooker::new(
        &verifying.exports,
        &verifying.memory,
        RecordingPatcher::default(),
        verifying_config(),
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();
    assert_eq!(verifying.memory.read(trap, 1).unwrap(), vec![0xCC]);

    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_stub("Todo_401000", "Todo");
    let live = Fixture::new(builder);
    let mut hooker = ExportHooker::new(
        &live.exports,
        &live.memory,
        RecordingPatcher::default(),
        HookerConfig::default(),
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();
    assert_eq!(live.memory.read(trap, 1).unwrap(), vec![0x90]);
}

#[test]
fn test_reports_written_when_enabled() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("Done_4A1F20", &[0xC3]);
    builder.add_stub("Todo_401000", "Todo");
    builder.add_stub("Later_402000", "Later");
    let fixture = Fixture::new(builder);

    let dir = tempfile::tempdir().unwrap();
    let config = HookerConfig {
        save_reports: true,
        implemented_report: dir.path().join("decompiled_functions.txt"),
        stubbed_report: dir.path().join("stubbed_functions.txt"),
        ..verifying_config()
    };
    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        config,
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();

    let implemented = std::fs::read_to_string(dir.path().join("decompiled_functions.txt")).unwrap();
    let stubbed = std::fs::read_to_string(dir.path().join("stubbed_functions.txt")).unwrap();
    assert_eq!(implemented, "4A1F20\n");
    assert_eq!(stubbed, "401000\n402000\n");
}

#[test]
fn test_summary_serializes() {
    let mut builder = ModuleImageBuilder::new(BASE);
    builder.add_function("Done_4A1F20", &[0xC3]);
    let fixture = Fixture::new(builder);

    let mut hooker = ExportHooker::new(
        &fixture.exports,
        &fixture.memory,
        RecordingPatcher::default(),
        verifying_config(),
    )
    .with_disabled(DisabledSet::new());
    hooker.apply().unwrap();

    let json = serde_json::to_value(hooker.summary()).unwrap();
    assert_eq!(json["hooked"], 1);
    assert_eq!(json["implemented"], 1);
    let plan = serde_json::to_value(hooker.plan()).unwrap();
    assert_eq!(plan[0]["direction"], "to_reimplementation");
}

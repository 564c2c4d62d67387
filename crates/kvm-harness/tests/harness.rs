//! Execution engine and runner integration against the scripted backend.

mod common;

use common::{MockBackend, Step};
use kvm_harness::{
    Harness, HarnessError, Outcome, Reporter, ResultRecord, TracingReporter, VcpuExit, Verdict,
    VmConfig, VmInstance,
    harness::UNKNOWN_FILE,
    result::{KVM_TEXIT, TBROK, TCONF, TFAIL, TINFO, TPASS, TWARN},
    run_instance,
};

/// Reporter that keeps everything it is given.
#[derive(Debug, Default)]
struct Collect {
    seen: Vec<(Outcome, i32, String, String)>,
}

impl Reporter for Collect {
    fn report(&mut self, verdict: &Verdict, file: &str, message: &str) {
        self.seen.push((
            verdict.outcome,
            verdict.aux,
            file.to_string(),
            message.to_string(),
        ));
    }
}

fn harness(backend: &MockBackend) -> Harness<MockBackend> {
    Harness::new(backend.clone(), VmConfig::default(), vec![0xf4])
}

#[test]
fn test_result_round_trip() {
    common::init_tracing();
    let cases = [
        (TPASS, Outcome::Pass),
        (TFAIL, Outcome::Fail),
        (TBROK, Outcome::Broken),
        (TWARN, Outcome::Warn),
        (TINFO, Outcome::Info),
        (TCONF, Outcome::Conf),
    ];

    for (aux, (code, outcome)) in cases.into_iter().enumerate() {
        let aux = aux as i32 * 100 - 7;
        let backend = MockBackend::new();
        backend.report(code, aux, "kvm_test.c", "round trip");
        backend.exit();

        let mut harness = harness(&backend);
        harness.setup().unwrap();
        let mut reporter = Collect::default();
        assert_eq!(harness.run(&mut reporter).unwrap(), 1);
        assert_eq!(
            reporter.seen,
            vec![(
                outcome,
                aux,
                "kvm_test.c".to_string(),
                "round trip".to_string()
            )]
        );

        harness.cleanup();
        assert_eq!(backend.state().open_resources(), 0);
    }
}

#[test]
fn test_multiple_results() {
    common::init_tracing();
    let backend = MockBackend::new();
    backend.report(TINFO, 10, "kvm_pagefault01.c", "mapping guest page");
    backend.report(TPASS, 42, "kvm_pagefault01.c", "page fault handled");
    backend.report(TFAIL, 57, "kvm_pagefault01.c", "CR2 mismatch");
    backend.exit();

    let mut harness = harness(&backend);
    harness.setup().unwrap();
    let mut reporter = Collect::default();
    assert_eq!(harness.run(&mut reporter).unwrap(), 3);

    let outcomes: Vec<_> = reporter.seen.iter().map(|r| (r.0, r.1)).collect();
    assert_eq!(
        outcomes,
        vec![(Outcome::Info, 10), (Outcome::Pass, 42), (Outcome::Fail, 57)]
    );
    assert_eq!(reporter.seen[2].3, "CR2 mismatch");
    assert_eq!(backend.state().runs, 4);
}

#[test]
fn test_halt_without_result_is_broken() {
    let backend = MockBackend::new();
    backend.report(TPASS, 1, "a.c", "first");
    // Second halt writes nothing; the stale TPASS must not be read again.
    backend.script([Step::Exit(VcpuExit::Halt)]);

    let mut harness = harness(&backend);
    harness.setup().unwrap();
    let mut reporter = Collect::default();
    let err = harness.run(&mut reporter).unwrap_err();

    assert!(matches!(err, HarnessError::ResultCorruption(_)), "{err}");
    assert_eq!(err.outcome(), Outcome::Broken);
    assert_eq!(reporter.seen.len(), 1);
}

#[test]
fn test_unrecognized_code_is_broken() {
    let backend = MockBackend::new();
    backend.report(0x1234, 1, "a.c", "garbage");

    let mut harness = harness(&backend);
    harness.setup().unwrap();
    let err = harness.run(&mut TracingReporter).unwrap_err();
    assert!(matches!(err, HarnessError::ResultCorruption(_)), "{err}");
}

#[test]
fn test_interrupted_runs_are_retried() {
    common::init_tracing();
    let backend = MockBackend::new();
    backend.script([
        Step::Write(ResultRecord {
            result: TPASS,
            lineno: 5,
            ..ResultRecord::none()
        }),
        Step::Exit(VcpuExit::Interrupted),
        Step::Exit(VcpuExit::Interrupted),
        Step::Exit(VcpuExit::Halt),
    ]);

    let mut instance = VmInstance::create(&backend, &VmConfig::default(), &[0xf4]).unwrap();
    let record = run_instance(&mut instance).unwrap();

    // The record written before the interruption survives the re-entries.
    assert_eq!(record.result, TPASS);
    assert_eq!(record.lineno, 5);
    assert_eq!(backend.state().runs, 3);
}

#[test]
fn test_unexpected_exit_is_a_fault() {
    let backend = MockBackend::new();
    backend.script([Step::Exit(VcpuExit::Shutdown)]);

    let mut instance = VmInstance::create(&backend, &VmConfig::default(), &[0xf4]).unwrap();
    let err = run_instance(&mut instance).unwrap_err();

    match &err {
        HarnessError::ExecutionFault { reason, rip } => {
            assert!(reason.contains("shutdown"), "{reason}");
            assert_eq!(rip.0, Some(0xfff1));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.outcome(), Outcome::Broken);

    // Run errors leave the resources to the caller.
    assert!(backend.state().open_resources() > 0);
    drop(instance);
    assert_eq!(backend.state().open_resources(), 0);
}

#[test]
fn test_run_failure_is_a_fault() {
    let backend = MockBackend::new();
    backend.script([Step::Fail(libc::EFAULT)]);

    let mut instance = VmInstance::create(&backend, &VmConfig::default(), &[0xf4]).unwrap();
    let err = run_instance(&mut instance).unwrap_err();
    assert!(matches!(err, HarnessError::ExecutionFault { .. }), "{err}");
}

#[test]
fn test_completion_port() {
    let signal = VcpuExit::IoOut {
        port: 0xf4,
        size: 1,
        data: 0,
    };
    let record = ResultRecord {
        result: TFAIL,
        lineno: 9,
        ..ResultRecord::none()
    };

    let backend = MockBackend::new();
    backend.script([Step::Write(record.clone()), Step::Exit(signal.clone())]);
    let mut instance = VmInstance::create(&backend, &VmConfig::default(), &[0xf4]).unwrap();
    assert_eq!(run_instance(&mut instance).unwrap().lineno, 9);

    let backend = MockBackend::new();
    backend.script([Step::Write(record), Step::Exit(signal)]);
    let config = VmConfig::builder().completion_port(None).build();
    let mut instance = VmInstance::create(&backend, &config, &[0xf4]).unwrap();
    assert!(matches!(
        run_instance(&mut instance),
        Err(HarnessError::ExecutionFault { .. })
    ));
}

#[test]
fn test_unreadable_file_name() {
    let backend = MockBackend::new();
    backend.script(Step::report(ResultRecord {
        result: TPASS,
        lineno: 3,
        file_addr: 1 << 40,
        message: "ok".to_string(),
    }));
    backend.exit();

    let mut harness = harness(&backend);
    harness.setup().unwrap();
    let mut reporter = Collect::default();
    harness.run(&mut reporter).unwrap();
    assert_eq!(reporter.seen[0].2, UNKNOWN_FILE);
}

#[test]
fn test_setup_and_cleanup_are_idempotent() {
    common::init_tracing();
    let backend = MockBackend::new();
    let mut harness = harness(&backend);

    // Cleanup without setup is fine.
    harness.cleanup();

    let err = harness.run(&mut TracingReporter).unwrap_err();
    assert!(matches!(err, HarnessError::InvalidConfig(_)));

    harness.setup().unwrap();
    harness.setup().unwrap();
    assert_eq!(backend.state().opens, 1);
    assert!(harness.instance().is_some());

    harness.cleanup();
    harness.cleanup();
    assert!(harness.instance().is_none());
    assert_eq!(backend.state().open_resources(), 0);

    // A new cycle reuses the cached CPU features.
    harness.setup().unwrap();
    assert_eq!(backend.state().opens, 2);
    assert_eq!(backend.state().cpuid_queries, 3);
    drop(harness);
    assert_eq!(backend.state().open_resources(), 0);
}

#[test]
fn test_failed_setup_leaves_nothing_open() {
    let backend = MockBackend::new();
    backend.state().fail_at = Some(common::FailPoint::SetRegion(1));

    let mut harness = harness(&backend);
    assert!(harness.setup().is_err());
    assert!(harness.instance().is_none());
    harness.cleanup();
    assert_eq!(backend.state().open_resources(), 0);
}

#[test]
fn test_exit_marker_alone() {
    let backend = MockBackend::new();
    backend.exit();

    let mut harness = harness(&backend);
    harness.setup().unwrap();
    assert_eq!(harness.run(&mut TracingReporter).unwrap(), 0);
    assert_eq!(
        backend
            .state()
            .read_guest(kvm_harness::config::KVM_RESULT_BASEADDR, 4),
        KVM_TEXIT.to_le_bytes()
    );
}

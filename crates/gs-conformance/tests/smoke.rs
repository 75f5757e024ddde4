use std::path::Path;

use gs_api::{AttributeValue, Attributes, GridSampleSession};
use gs_conformance::{
    HarnessConfig, run_gridsample_conformance, run_gridsample_error_conformance, run_smoke,
};
use gs_core::{DType, DenseTensor, Device, TensorMeta};
use gs_kernel_cpu::{GridSampleOptions, KernelError, Parallelism, grid_sample_contiguous};
use gs_runtime::{EvidenceKind, RuntimeContext};

#[test]
fn smoke_report_is_stable() {
    let cfg = HarnessConfig::default_paths();
    let report = run_smoke(&cfg);
    assert_eq!(report.suite, "smoke");
    assert!(report.fixture_count >= 2);
    assert!(report.cases_total > 0);
    assert_eq!(report.cases_total, report.cases_passed);

    let fixture_path = cfg.fixture_root.join("gridsample_cases.json");
    assert!(Path::new(&fixture_path).exists());
}

#[test]
fn value_fixture_executes_with_both_schedulers() {
    let serial = HarnessConfig::default_paths().with_parallelism(Parallelism::Serial);
    let rayon = HarnessConfig::default_paths().with_parallelism(Parallelism::Rayon);
    let (serial_report, _) = run_gridsample_conformance(&serial).expect("serial suite should run");
    let (rayon_report, _) = run_gridsample_conformance(&rayon).expect("rayon suite should run");

    assert_eq!(serial_report.cases_total, serial_report.cases_passed);
    assert_eq!(rayon_report.cases_total, rayon_report.cases_passed);
}

#[test]
fn error_fixture_executes_with_both_schedulers() {
    for parallelism in [Parallelism::Serial, Parallelism::Rayon] {
        let cfg = HarnessConfig::default_paths().with_parallelism(parallelism);
        let (report, _) = run_gridsample_error_conformance(&cfg).expect("error suite should run");
        assert_eq!(report.cases_total, report.cases_passed);
    }
}

#[test]
fn missing_fixture_root_fails_closed() {
    let cfg = HarnessConfig {
        fixture_root: std::env::temp_dir().join("gs-conformance-no-such-root"),
        parallelism: Parallelism::Serial,
    };
    let err = run_gridsample_conformance(&cfg).expect_err("missing fixtures must fail");
    assert!(err.contains("gridsample_cases.json"));
    assert_eq!(run_smoke(&cfg).cases_total, 0);
}

#[test]
fn session_evidence_tracks_dispatch_and_rejection() {
    let input = DenseTensor::from_contiguous(vec![0.0f32, 1.0, 2.0, 3.0], vec![1, 1, 2, 2], Device::Cpu)
        .expect("input");
    let grid = DenseTensor::from_contiguous(vec![0.0f32, 0.0], vec![1, 1, 1, 2], Device::Cpu)
        .expect("grid");
    let mut session = GridSampleSession::new(Parallelism::Serial);

    let mut attributes = Attributes::new();
    attributes.insert("align_corners".to_string(), AttributeValue::Int(1));
    let out = session
        .grid_sample(&input, &grid, &attributes)
        .expect("centre sample should succeed");
    assert_eq!(out.storage(), &[1.5]);

    attributes.insert("mode".to_string(), AttributeValue::Str("cubic".to_string()));
    let err = session
        .grid_sample(&input, &grid, &attributes)
        .expect_err("unknown mode must be rejected");
    assert!(matches!(err, KernelError::InvalidConfiguration(_)));

    let kinds = session
        .evidence()
        .iter()
        .map(|entry| entry.kind)
        .collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            EvidenceKind::Config,
            EvidenceKind::Dispatch,
            EvidenceKind::Rejection
        ]
    );
}

#[test]
fn kernel_rejection_is_recordable_by_runtime_context() {
    let input_meta = TensorMeta::from_shape(vec![1, 1, 2, 2], DType::F32, Device::Cpu);
    let grid_meta = TensorMeta::from_shape(vec![1, 1, 1, 2], DType::F32, Device::Cuda);
    let err = grid_sample_contiguous(
        &[0.0f32; 4],
        &[0.0f32; 2],
        &input_meta,
        &grid_meta,
        &GridSampleOptions::default(),
    )
    .expect_err("cuda grid must be rejected");

    let mut ctx = RuntimeContext::new(Parallelism::Serial);
    ctx.record_rejection("grid_sample", &err);
    let last = ctx.ledger().entries().last().expect("rejection entry");
    assert_eq!(last.kind, EvidenceKind::Rejection);
    assert!(last.summary.contains("unsupported device"));
}

#![forbid(unsafe_code)]

mod logging;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use gs_api::{Attributes, GridSampleSession, GridSampler, resolve_options};
use gs_core::{DenseTensor, Device};
use gs_kernel_cpu::{Parallelism, SampleFloat};
use gs_runtime::{EvidenceEntry, EvidenceKind};
use serde::Deserialize;
use serde_json::{Value, json};

pub use logging::{CASE_LOG_SCHEMA_VERSION, StructuredCaseLog, det64};

const GRIDSAMPLE_FIXTURE: &str = "gridsample_cases.json";
const GRIDSAMPLE_ERROR_FIXTURE: &str = "gridsample_error_cases.json";
const MAX_FIXTURE_BYTES: u64 = 1_048_576;
const DEFAULT_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub parallelism: Parallelism,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            parallelism: Parallelism::default(),
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridSampleCaseReport {
    pub name: String,
    pub parallelism: Parallelism,
    pub shape_ok: bool,
    pub f32_output_ok: bool,
    pub f64_output_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl GridSampleCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.shape_ok && self.f32_output_ok && self.f64_output_ok
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridSampleErrorCaseReport {
    pub name: String,
    pub parallelism: Parallelism,
    pub expected_error: String,
    pub observed_error: Option<String>,
    pub forensic_log: StructuredCaseLog,
}

impl GridSampleErrorCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.observed_error.as_deref() == Some(self.expected_error.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub parallelism: Parallelism,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchReport {
    pub iterations: usize,
    pub p50_ns: u128,
    pub p95_ns: u128,
    pub p99_ns: u128,
    pub mean_ns: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub failed_entries: usize,
    pub parallelism: Parallelism,
}

#[derive(Debug, Clone, Deserialize)]
struct GridSampleFixtureFile {
    cases: Vec<GridSampleCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct GridSampleCase {
    name: String,
    input_shape: Vec<usize>,
    input: Vec<f64>,
    grid_shape: Vec<usize>,
    grid: Vec<f64>,
    #[serde(default)]
    attributes: Attributes,
    expected_shape: Vec<usize>,
    expected: Vec<f64>,
    tolerance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct GridSampleErrorFixtureFile {
    cases: Vec<GridSampleErrorCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct GridSampleErrorCase {
    name: String,
    input_shape: Vec<usize>,
    grid_shape: Vec<usize>,
    #[serde(default)]
    attributes: Attributes,
    expected_error: String,
}

/// Output of one typed evaluation, widened to `f64` for comparison.
struct Observation {
    shape: Vec<usize>,
    values: Vec<f64>,
    evidence: Value,
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixture_count = fs::read_dir(&config.fixture_root)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .count();

    let (value_total, value_passed) = run_gridsample_conformance(config)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(GridSampleCaseReport::passed))
        });
    let (error_total, error_passed) = run_gridsample_error_conformance(config)
        .map_or((0, 0), |(_, cases)| {
            summarize_passes(cases.iter().map(GridSampleErrorCaseReport::passed))
        });

    HarnessReport {
        suite: "smoke",
        fixture_count,
        parallelism: config.parallelism,
        cases_total: value_total + error_total,
        cases_passed: value_passed + error_passed,
    }
}

pub fn run_gridsample_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<GridSampleCaseReport>), String> {
    let fixture_path = config.fixture_root.join(GRIDSAMPLE_FIXTURE);
    let fixture: GridSampleFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_gridsample_case(case, config.parallelism)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(GridSampleCaseReport::passed));

    let report = HarnessReport {
        suite: "gridsample",
        fixture_count: 1,
        parallelism: config.parallelism,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

pub fn run_gridsample_error_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<GridSampleErrorCaseReport>), String> {
    let fixture_path = config.fixture_root.join(GRIDSAMPLE_ERROR_FIXTURE);
    let fixture: GridSampleErrorFixtureFile = load_fixture(&fixture_path)?;

    let mut case_reports = Vec::with_capacity(fixture.cases.len());
    for case in &fixture.cases {
        case_reports.push(run_gridsample_error_case(case, config.parallelism)?);
    }

    let (cases_total, cases_passed) =
        summarize_passes(case_reports.iter().map(GridSampleErrorCaseReport::passed));

    let report = HarnessReport {
        suite: "gridsample_errors",
        fixture_count: 1,
        parallelism: config.parallelism,
        cases_total,
        cases_passed,
    };

    Ok((report, case_reports))
}

/// Runs both suites and writes every case log as one JSONL line to `output_path`.
pub fn emit_forensics_log(
    config: &HarnessConfig,
    output_path: &Path,
) -> Result<ForensicsSummary, String> {
    let (_, value_cases) = run_gridsample_conformance(config)?;
    let (_, error_cases) = run_gridsample_error_conformance(config)?;

    let logs = value_cases
        .into_iter()
        .map(|case| case.forensic_log)
        .chain(error_cases.into_iter().map(|case| case.forensic_log))
        .collect::<Vec<_>>();

    let mut lines = String::new();
    for entry in &logs {
        let line = serde_json::to_string(entry)
            .map_err(|error| format!("failed to serialize structured log entry: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!(
                "failed to create forensics output dir {}: {error}",
                parent.display()
            )
        })?;
    }

    fs::write(output_path, lines).map_err(|error| {
        format!(
            "failed to write forensics log {}: {error}",
            output_path.display()
        )
    })?;

    let failed_entries = logs.iter().filter(|entry| !entry.passed()).count();

    Ok(ForensicsSummary {
        output_path: output_path.to_path_buf(),
        log_entries: logs.len(),
        failed_entries,
        parallelism: config.parallelism,
    })
}

/// Times a fixed 1x3x64x64 bilinear workload sampled by a 48x48 grid.
pub fn run_gridsample_microbench(
    iterations: usize,
    parallelism: Parallelism,
) -> Result<BenchReport, String> {
    let (channels, in_size, out_size) = (3usize, 64usize, 48usize);
    let input_values = (0..channels * in_size * in_size)
        .map(|idx| (idx % 97) as f32 / 97.0)
        .collect::<Vec<_>>();
    let grid_values = (0..out_size * out_size)
        .flat_map(|idx| {
            let row = (idx / out_size) as f32;
            let col = (idx % out_size) as f32;
            let span = (out_size - 1) as f32;
            [col / span * 2.2 - 1.1, row / span * 2.2 - 1.1]
        })
        .collect::<Vec<_>>();
    let input = DenseTensor::from_contiguous(
        input_values,
        vec![1, channels, in_size, in_size],
        Device::Cpu,
    )
    .map_err(|error| format!("microbench input build failed: {error}"))?;
    let grid = DenseTensor::from_contiguous(grid_values, vec![1, out_size, out_size, 2], Device::Cpu)
        .map_err(|error| format!("microbench grid build failed: {error}"))?;
    let sampler = GridSampler::new(Default::default());

    let mut samples = Vec::with_capacity(iterations.max(1));
    for _ in 0..iterations.max(1) {
        let started = Instant::now();
        let out = sampler
            .run(&input, &grid, parallelism)
            .map_err(|error| format!("microbench grid sample failed: {error}"))?;
        samples.push(started.elapsed().as_nanos());
        std::hint::black_box(out);
    }

    samples.sort_unstable();
    let sum = samples.iter().copied().sum::<u128>();
    let mean = sum / (samples.len() as u128);

    Ok(BenchReport {
        iterations: samples.len(),
        p50_ns: percentile(&samples, 50),
        p95_ns: percentile(&samples, 95),
        p99_ns: percentile(&samples, 99),
        mean_ns: mean,
    })
}

fn run_gridsample_case(
    case: &GridSampleCase,
    parallelism: Parallelism,
) -> Result<GridSampleCaseReport, String> {
    let single = evaluate_case::<f32>(case, parallelism, |value| value as f32, f64::from)?;
    let double = evaluate_case::<f64>(case, parallelism, |value| value, |value| value)?;

    let tolerance = case.tolerance.unwrap_or(DEFAULT_TOLERANCE);
    let shape_ok = single.shape == case.expected_shape && double.shape == case.expected_shape;
    let f32_output_ok = vec_within(&single.values, &case.expected, tolerance);
    let f64_output_ok = vec_within(&double.values, &case.expected, tolerance);
    let outcome = if shape_ok && f32_output_ok && f64_output_ok {
        "pass"
    } else {
        "fail"
    };
    let reason_code = if outcome == "pass" {
        "gridsample_parity_ok"
    } else if !shape_ok {
        "gridsample_shape_mismatch"
    } else {
        "gridsample_value_mismatch"
    };

    let options = resolve_options(&case.attributes)
        .map_err(|error| format!("case '{}' has invalid attributes: {error}", case.name))?;
    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("case_name".to_string(), json!(case.name));
    extra_fields.insert("options".to_string(), json!(options));
    extra_fields.insert("input_shape".to_string(), json!(case.input_shape));
    extra_fields.insert("grid_shape".to_string(), json!(case.grid_shape));
    extra_fields.insert("expected_shape".to_string(), json!(case.expected_shape));
    extra_fields.insert("observed_shape".to_string(), json!(single.shape));
    extra_fields.insert("tolerance".to_string(), json!(tolerance));
    extra_fields.insert(
        "max_abs_error_f32".to_string(),
        json!(max_abs_error(&single.values, &case.expected)),
    );
    extra_fields.insert(
        "max_abs_error_f64".to_string(),
        json!(max_abs_error(&double.values, &case.expected)),
    );
    if outcome != "pass" {
        extra_fields.insert("observed_f32".to_string(), json!(single.values));
        extra_fields.insert("expected".to_string(), json!(case.expected));
    }
    extra_fields.insert("runtime_evidence".to_string(), single.evidence);

    Ok(GridSampleCaseReport {
        name: case.name.clone(),
        parallelism,
        shape_ok,
        f32_output_ok,
        f64_output_ok,
        forensic_log: StructuredCaseLog::new(
            "gridsample",
            GRIDSAMPLE_FIXTURE,
            case.name.as_str(),
            parallelism,
            vec![format!("crates/gs-conformance/fixtures/{GRIDSAMPLE_FIXTURE}")],
            replay_command("gridsample_fixture_is_green", parallelism),
            outcome,
            reason_code,
        )
        .with_extra_fields(extra_fields),
    })
}

fn evaluate_case<T: SampleFloat>(
    case: &GridSampleCase,
    parallelism: Parallelism,
    narrow: impl Fn(f64) -> T,
    widen: impl Fn(T) -> f64,
) -> Result<Observation, String> {
    let input = DenseTensor::from_contiguous(
        case.input.iter().copied().map(&narrow).collect(),
        case.input_shape.clone(),
        Device::Cpu,
    )
    .map_err(|error| format!("input tensor build failed for '{}': {error}", case.name))?;
    let grid = DenseTensor::from_contiguous(
        case.grid.iter().copied().map(&narrow).collect(),
        case.grid_shape.clone(),
        Device::Cpu,
    )
    .map_err(|error| format!("grid tensor build failed for '{}': {error}", case.name))?;

    let mut session = GridSampleSession::new(parallelism);
    let output = session
        .grid_sample(&input, &grid, &case.attributes)
        .map_err(|error| format!("grid sample failed for '{}': {error}", case.name))?;

    Ok(Observation {
        shape: output.shape().to_vec(),
        values: output.storage().iter().copied().map(widen).collect(),
        evidence: runtime_evidence_field(session.evidence()),
    })
}

fn run_gridsample_error_case(
    case: &GridSampleErrorCase,
    parallelism: Parallelism,
) -> Result<GridSampleErrorCaseReport, String> {
    let input = zero_tensor(&case.input_shape)
        .map_err(|error| format!("input tensor build failed for '{}': {error}", case.name))?;
    let grid = zero_tensor(&case.grid_shape)
        .map_err(|error| format!("grid tensor build failed for '{}': {error}", case.name))?;

    let mut session = GridSampleSession::new(parallelism);
    let result = session.grid_sample(&input, &grid, &case.attributes);
    let (observed_error, diagnostic) = match &result {
        Ok(_) => (None, "call succeeded".to_string()),
        Err(error) => (Some(error.class_label().to_string()), error.to_string()),
    };

    let passed = observed_error.as_deref() == Some(case.expected_error.as_str());
    let outcome = if passed { "pass" } else { "fail" };
    let reason_code = if passed {
        "gridsample_error_parity_ok"
    } else if observed_error.is_none() {
        "gridsample_error_not_raised"
    } else {
        "gridsample_error_class_mismatch"
    };

    let mut extra_fields = BTreeMap::new();
    extra_fields.insert("case_name".to_string(), json!(case.name));
    extra_fields.insert("attributes".to_string(), json!(case.attributes));
    extra_fields.insert("input_shape".to_string(), json!(case.input_shape));
    extra_fields.insert("grid_shape".to_string(), json!(case.grid_shape));
    extra_fields.insert("expected_error".to_string(), json!(case.expected_error));
    extra_fields.insert("observed_error".to_string(), json!(observed_error));
    extra_fields.insert("diagnostic".to_string(), json!(diagnostic));
    extra_fields.insert(
        "runtime_evidence".to_string(),
        runtime_evidence_field(session.evidence()),
    );

    Ok(GridSampleErrorCaseReport {
        name: case.name.clone(),
        parallelism,
        expected_error: case.expected_error.clone(),
        observed_error,
        forensic_log: StructuredCaseLog::new(
            "gridsample_errors",
            GRIDSAMPLE_ERROR_FIXTURE,
            case.name.as_str(),
            parallelism,
            vec![format!(
                "crates/gs-conformance/fixtures/{GRIDSAMPLE_ERROR_FIXTURE}"
            )],
            replay_command("gridsample_error_fixture_is_green", parallelism),
            outcome,
            reason_code,
        )
        .with_extra_fields(extra_fields),
    })
}

fn zero_tensor(shape: &[usize]) -> Result<DenseTensor<f32>, String> {
    let numel = checked_shape_numel(shape)?;
    DenseTensor::from_contiguous(vec![0.0; numel], shape.to_vec(), Device::Cpu)
        .map_err(|error| error.to_string())
}

fn replay_command(test_name: &str, parallelism: Parallelism) -> String {
    format!(
        "cargo test -p gs-conformance {test_name} -- --nocapture # parallelism={}",
        parallelism.as_str()
    )
}

fn runtime_evidence_kind_label(kind: EvidenceKind) -> &'static str {
    match kind {
        EvidenceKind::Config => "config",
        EvidenceKind::Dispatch => "dispatch",
        EvidenceKind::Rejection => "rejection",
    }
}

fn runtime_evidence_field(entries: &[EvidenceEntry]) -> Value {
    let mut kind_counts: BTreeMap<String, usize> = BTreeMap::new();
    for entry in entries {
        let kind_label = runtime_evidence_kind_label(entry.kind).to_string();
        kind_counts
            .entry(kind_label)
            .and_modify(|count| *count += 1)
            .or_insert(1);
    }

    json!({
        "total_entries": entries.len(),
        "kind_counts": kind_counts,
        "entries": entries
            .iter()
            .map(|entry| {
                json!({
                    "ts_unix_ms": entry.ts_unix_ms,
                    "kind": runtime_evidence_kind_label(entry.kind),
                    "summary": entry.summary,
                })
            })
            .collect::<Vec<_>>(),
    })
}

fn checked_shape_numel(shape: &[usize]) -> Result<usize, String> {
    shape.iter().try_fold(1usize, |acc, dim| {
        acc.checked_mul(*dim)
            .ok_or_else(|| format!("shape {shape:?} element count overflows usize"))
    })
}

fn load_fixture<T>(path: &Path) -> Result<T, String>
where
    T: for<'de> Deserialize<'de>,
{
    let metadata = fs::metadata(path).map_err(|error| {
        format!(
            "failed reading fixture metadata {}: {error}",
            path.display()
        )
    })?;
    let size = metadata.len();
    if size > MAX_FIXTURE_BYTES {
        return Err(format!(
            "fixture {} exceeds max bytes: actual={size} max={MAX_FIXTURE_BYTES}",
            path.display()
        ));
    }

    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed reading fixture {}: {error}", path.display()))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| format!("failed parsing fixture {}: {error}", path.display()))
}

fn summarize_passes<I>(iter: I) -> (usize, usize)
where
    I: Iterator<Item = bool>,
{
    let mut total = 0usize;
    let mut passed = 0usize;
    for is_passed in iter {
        total += 1;
        if is_passed {
            passed += 1;
        }
    }
    (total, passed)
}

fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}

fn vec_within(actual: &[f64], expected: &[f64], tolerance: f64) -> bool {
    actual.len() == expected.len()
        && actual
            .iter()
            .zip(expected.iter())
            .all(|(actual, expected)| within(*actual, *expected, tolerance))
}

fn max_abs_error(actual: &[f64], expected: &[f64]) -> f64 {
    actual
        .iter()
        .zip(expected.iter())
        .map(|(actual, expected)| (actual - expected).abs())
        .fold(0.0, f64::max)
}

fn percentile(samples: &[u128], p: usize) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let clamped = p.min(100);
    let idx = ((samples.len() - 1) * clamped) / 100;
    samples[idx]
}

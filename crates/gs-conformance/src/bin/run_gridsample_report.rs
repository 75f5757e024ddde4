#![forbid(unsafe_code)]

use std::path::PathBuf;

use gs_conformance::{HarnessConfig, emit_forensics_log, run_gridsample_microbench, run_smoke};
use gs_kernel_cpu::Parallelism;
use serde_json::json;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: run_gridsample_report [--parallelism serial|rayon] [--output path] [--bench-iterations N] [--print-full-log]";

fn main() -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut parallelism = Parallelism::default();
    let mut output: Option<PathBuf> = None;
    let mut bench_iterations = 0usize;
    let mut print_full_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--parallelism" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--parallelism requires one of: serial|rayon".to_string())?;
                parallelism = value.parse::<Parallelism>().map_err(|error| error.to_string())?;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--bench-iterations" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--bench-iterations requires a count".to_string())?;
                bench_iterations = value
                    .parse::<usize>()
                    .map_err(|error| format!("invalid --bench-iterations '{value}': {error}"))?;
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!("unknown arg '{other}'. {USAGE}"));
            }
        }
    }

    let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
    let output_path = output
        .unwrap_or_else(|| repo_root.join("artifacts/conformance/gridsample_forensics.jsonl"));

    let config = HarnessConfig::default_paths().with_parallelism(parallelism);
    let summary = emit_forensics_log(&config, output_path.as_path())?;

    if print_full_log {
        let raw = std::fs::read_to_string(summary.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated forensics log {}: {error}",
                summary.output_path.display()
            )
        })?;
        print!("{raw}");
        return Ok(());
    }

    let smoke = run_smoke(&config);
    let bench = if bench_iterations > 0 {
        let report = run_gridsample_microbench(bench_iterations, parallelism)?;
        Some(json!({
            "iterations": report.iterations,
            "p50_ns": report.p50_ns,
            "p95_ns": report.p95_ns,
            "p99_ns": report.p99_ns,
            "mean_ns": report.mean_ns,
        }))
    } else {
        None
    };

    let status = if summary.failed_entries == 0 { "ok" } else { "failed" };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": status,
            "parallelism": parallelism.as_str(),
            "output_path": summary.output_path.display().to_string(),
            "log_entries": summary.log_entries,
            "failed_entries": summary.failed_entries,
            "smoke": {
                "fixture_count": smoke.fixture_count,
                "cases_total": smoke.cases_total,
                "cases_passed": smoke.cases_passed,
            },
            "bench": bench,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    if summary.failed_entries > 0 {
        return Err(format!(
            "{} conformance case(s) failed; rerun with --print-full-log",
            summary.failed_entries
        ));
    }

    Ok(())
}

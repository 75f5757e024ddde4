use std::collections::BTreeMap;

use gs_kernel_cpu::Parallelism;
use serde::Serialize;
use serde_json::Value;

pub const CASE_LOG_SCHEMA_VERSION: &str = "gs-conformance-log-v1";

/// Envelope keys that flattened extra fields must never shadow.
const ENVELOPE_KEYS: [&str; 12] = [
    "schema_version",
    "ts_unix_ms",
    "suite_id",
    "scenario_id",
    "fixture_id",
    "parallelism",
    "seed",
    "env_fingerprint",
    "artifact_refs",
    "replay_command",
    "outcome",
    "reason_code",
];

/// One JSONL line of the conformance forensics log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: &'static str,
    pub scenario_id: String,
    pub fixture_id: &'static str,
    pub parallelism: &'static str,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub outcome: &'static str,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &'static str,
        fixture_id: &'static str,
        case_name: &str,
        parallelism: Parallelism,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &'static str,
        reason_code: impl Into<String>,
    ) -> Self {
        let scenario_id = format!("{suite_id}/{case_name}");
        Self {
            schema_version: CASE_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            seed: det64(scenario_id.as_bytes()).max(1),
            scenario_id,
            suite_id,
            fixture_id,
            parallelism: parallelism.as_str(),
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            outcome,
            reason_code: reason_code.into(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(
            extra_fields
                .into_iter()
                .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str())),
        );
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

/// FNV-1a over `bytes`.
#[must_use]
pub fn det64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

fn env_fingerprint() -> String {
    let raw = format!(
        "{}|{}|{}|{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        rayon::current_num_threads()
    );
    format!("det64:{:016x}", det64(raw.as_bytes()))
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gs_kernel_cpu::Parallelism;
    use serde_json::json;

    use super::{CASE_LOG_SCHEMA_VERSION, StructuredCaseLog, det64};

    fn sample_log() -> StructuredCaseLog {
        StructuredCaseLog::new(
            "gridsample",
            "gridsample_cases.json",
            "ramp_uniform_grid",
            Parallelism::Serial,
            vec!["crates/gs-conformance/fixtures/gridsample_cases.json".to_string()],
            "cargo test -p gs-conformance".to_string(),
            "pass",
            "gridsample_parity_ok",
        )
    }

    #[test]
    fn det64_is_stable() {
        assert_eq!(det64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(det64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn envelope_carries_replay_contract() {
        let log = sample_log();
        assert_eq!(log.schema_version, CASE_LOG_SCHEMA_VERSION);
        assert_eq!(log.scenario_id, "gridsample/ramp_uniform_grid");
        assert_eq!(log.parallelism, "serial");
        assert!(log.seed > 0);
        assert!(log.env_fingerprint.starts_with("det64:"));
        assert!(log.passed());
    }

    #[test]
    fn extra_fields_cannot_shadow_envelope() {
        let log = sample_log().with_extra_fields(BTreeMap::from([
            ("outcome".to_string(), json!("fail")),
            ("max_abs_error".to_string(), json!(0.0)),
        ]));
        let value = serde_json::to_value(&log).expect("log should serialize");
        assert_eq!(value["outcome"], json!("pass"));
        assert_eq!(value["max_abs_error"], json!(0.0));
        assert!(!log.extra_fields.contains_key("outcome"));
    }
}

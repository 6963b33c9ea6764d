use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use cp_core::{det_hash64_bytes, det64_label};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scenario_id;

pub const STRUCTURED_LOG_SCHEMA_VERSION: &str = "cp-conformance-log-v1";

/// Envelope keys that a flattened extra field must never shadow.
const ENVELOPE_KEYS: [&str; 15] = [
    "schema_version",
    "ts_unix_ms",
    "suite_id",
    "scenario_id",
    "case_name",
    "family",
    "backend",
    "seed",
    "env_fingerprint",
    "artifact_refs",
    "replay_command",
    "duration_ms",
    "outcome",
    "reason_code",
    "extra_fields",
];

/// One JSONL record per scenario run. The envelope fields are a fixed
/// contract; per-scenario detail goes into `extra_fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCaseLog {
    pub schema_version: String,
    pub ts_unix_ms: u64,
    pub suite_id: String,
    pub scenario_id: String,
    pub case_name: String,
    pub family: String,
    pub backend: String,
    pub seed: u64,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
    pub duration_ms: u64,
    pub outcome: String,
    pub reason_code: String,
    #[serde(flatten)]
    pub extra_fields: BTreeMap<String, Value>,
}

impl StructuredCaseLog {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        suite_id: &str,
        case_name: &str,
        family: &str,
        backend: &str,
        seed: u64,
        artifact_refs: Vec<String>,
        replay_command: String,
        passed: bool,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: STRUCTURED_LOG_SCHEMA_VERSION.to_string(),
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            scenario_id: scenario_id(suite_id, backend, case_name),
            case_name: case_name.to_string(),
            family: family.to_string(),
            backend: backend.to_string(),
            seed,
            env_fingerprint: env_fingerprint(),
            artifact_refs,
            replay_command,
            duration_ms: 0,
            outcome: outcome_label(passed).to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Merges `extra_fields`, dropping any key that collides with the envelope.
    #[must_use]
    pub fn with_extra_fields(mut self, extra_fields: BTreeMap<String, Value>) -> Self {
        for (key, value) in extra_fields {
            if ENVELOPE_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.extra_fields.insert(key, value);
        }
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == outcome_label(true)
    }
}

#[must_use]
pub fn outcome_label(passed: bool) -> &'static str {
    if passed { "pass" } else { "fail" }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

/// Stable digest of the build environment a log line was produced in.
fn env_fingerprint() -> String {
    let descriptor = format!(
        "{}|{}|{}|{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    det64_label(det_hash64_bytes(descriptor.as_bytes()))
}

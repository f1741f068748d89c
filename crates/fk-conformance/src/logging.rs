use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use fk_core::ExecutionMode;
use serde::Serialize;
use serde_json::Value;

pub const CASE_LOG_SCHEMA_VERSION: &str = "fk-conformance-case-log-v1";

/// One forensic record per executed conformance case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub ts_unix_ms: u128,
    pub suite_id: String,
    pub fixture_id: String,
    pub case_id: String,
    pub mode: &'static str,
    pub artifact_refs: Vec<String>,
    pub replay_command: String,
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
        fixture_id: &str,
        case_id: &str,
        mode: ExecutionMode,
        artifact_refs: Vec<String>,
        replay_command: String,
        outcome: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            schema_version: CASE_LOG_SCHEMA_VERSION,
            ts_unix_ms: now_unix_ms(),
            suite_id: suite_id.to_string(),
            fixture_id: fixture_id.to_string(),
            case_id: case_id.to_string(),
            mode: mode_label(mode),
            artifact_refs,
            replay_command,
            outcome: outcome.to_string(),
            reason_code: reason_code.to_string(),
            extra_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_extra_fields(mut self, fields: BTreeMap<String, Value>) -> Self {
        self.extra_fields.extend(fields);
        self
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == "pass"
    }
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

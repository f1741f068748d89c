#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fk_core::{EngineKind, ExecutionMode};
use fk_kernels::OptionalParams;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceKind {
    Registration,
    Selection,
    Build,
    Policy,
}

/// One ledger record. Per-layer entries carry the layer id and ordered
/// `key=value` fields; `summary` is rendered from them at record time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub layer_id: Option<String>,
    pub fields: Vec<(&'static str, String)>,
    pub summary: String,
}

impl EvidenceEntry {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            layer_id: None,
            fields: Vec::new(),
            summary: summary.into(),
        });
    }

    pub fn record_layer(
        &mut self,
        kind: EvidenceKind,
        layer_id: &str,
        fields: Vec<(&'static str, String)>,
    ) {
        let mut summary = format!("layer={layer_id}");
        for (key, value) in &fields {
            summary.push_str(&format!(" {key}={value}"));
        }
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            layer_id: Some(layer_id.to_string()),
            fields,
            summary,
        });
    }

    pub fn for_layer<'a>(&'a self, layer_id: &'a str) -> impl Iterator<Item = &'a EvidenceEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.layer_id.as_deref() == Some(layer_id))
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }

    pub fn record_build_failure<E>(&mut self, layer_id: &str, error: &E)
    where
        E: fmt::Display + ?Sized,
    {
        self.ledger.record_layer(
            EvidenceKind::Build,
            layer_id,
            vec![("outcome", "failure".to_string()), ("error", error.to_string())],
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigMode {
    #[default]
    Strict,
    Hardened,
}

impl From<ConfigMode> for ExecutionMode {
    fn from(value: ConfigMode) -> Self {
        match value {
            ConfigMode::Strict => ExecutionMode::Strict,
            ConfigMode::Hardened => ExecutionMode::Hardened,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidJson { diagnostic: String },
    UnknownEngine { name: String },
    EmptyForcedKernel { layer_id: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid config json: {diagnostic}"),
            Self::UnknownEngine { name } => write!(f, "unknown engine '{name}'"),
            Self::EmptyForcedKernel { layer_id } => {
                write!(f, "forced kernel for layer '{layer_id}' is empty")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_engine() -> String {
    EngineKind::Ocl.label().to_string()
}

/// Program-level options that shape how nodes are compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    #[serde(default)]
    pub mode: ConfigMode,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub meaningful_kernel_names: bool,
    /// Layer id to kernel name.
    #[serde(default)]
    pub force_implementations: BTreeMap<String, String>,
    #[serde(default)]
    pub parallel_compile: bool,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            mode: ConfigMode::Strict,
            engine: default_engine(),
            meaningful_kernel_names: false,
            force_implementations: BTreeMap::new(),
            parallel_compile: false,
        }
    }
}

impl ProgramConfig {
    pub fn from_json(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(input).map_err(|error| ConfigError::InvalidJson {
                diagnostic: error.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|error| ConfigError::InvalidJson {
            diagnostic: error.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine_kind()?;
        if let Some((layer_id, _)) = self
            .force_implementations
            .iter()
            .find(|(_, kernel)| kernel.trim().is_empty())
        {
            return Err(ConfigError::EmptyForcedKernel {
                layer_id: layer_id.clone(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode.into()
    }

    pub fn engine_kind(&self) -> Result<EngineKind, ConfigError> {
        self.engine
            .parse()
            .map_err(|_| ConfigError::UnknownEngine {
                name: self.engine.clone(),
            })
    }

    #[must_use]
    pub fn optional_params_for(&self, layer_id: &str) -> OptionalParams {
        OptionalParams {
            forced_kernel: self.force_implementations.get(layer_id).cloned(),
            meaningful_kernel_names: self.meaningful_kernel_names,
        }
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use fk_core::{EngineKind, ExecutionMode};

    use super::{
        ConfigError, ConfigMode, EvidenceKind, EvidenceLedger, ProgramConfig, RuntimeContext,
    };

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.ledger_mut()
            .record(EvidenceKind::Selection, "layer=gather:0 kernel=gather_ref");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Selection);
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Policy).count(), 1);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.set_mode(ExecutionMode::Hardened);

        assert_eq!(ctx.mode(), ExecutionMode::Hardened);
        assert_eq!(ctx.ledger().len(), 2);
    }

    #[test]
    fn build_failure_records_diagnostic() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Strict);
        ctx.record_build_failure("gather:7", "unsupported gather axis: 9 (rank=4)");
        let entry = ctx
            .ledger()
            .entries_of(EvidenceKind::Build)
            .next()
            .expect("build evidence present");
        assert_eq!(entry.layer_id.as_deref(), Some("gather:7"));
        assert_eq!(entry.field("outcome"), Some("failure"));
        assert!(
            entry
                .field("error")
                .is_some_and(|error| error.contains("unsupported gather axis"))
        );
        assert!(entry.summary.starts_with("layer=gather:7 outcome=failure"));
    }

    #[test]
    fn layer_entries_keep_fields_in_order_and_filter_by_layer() {
        let mut ledger = EvidenceLedger::new();
        ledger.record_layer(
            EvidenceKind::Selection,
            "gather:0",
            vec![
                ("kernel", "gather_planar".to_string()),
                ("key", "f32:bfyx".to_string()),
            ],
        );
        ledger.record(EvidenceKind::Registration, "op=gather engine=ocl entries=95");
        ledger.record_layer(
            EvidenceKind::Build,
            "gather:1",
            vec![("axis", "Y".to_string())],
        );

        let first = &ledger.entries()[0];
        assert_eq!(first.summary, "layer=gather:0 kernel=gather_planar key=f32:bfyx");
        assert_eq!(first.field("key"), Some("f32:bfyx"));
        assert_eq!(first.field("axis"), None);
        assert_eq!(ledger.entries()[1].layer_id, None);
        assert!(ledger.entries()[1].fields.is_empty());

        let layer_one: Vec<EvidenceKind> =
            ledger.for_layer("gather:1").map(|entry| entry.kind).collect();
        assert_eq!(layer_one, vec![EvidenceKind::Build]);
        assert_eq!(ledger.for_layer("gather:9").count(), 0);
    }

    #[test]
    fn config_defaults_are_strict_ocl() {
        let config = ProgramConfig::from_json("{}").expect("empty object uses defaults");
        assert_eq!(config, ProgramConfig::default());
        assert_eq!(config.execution_mode(), ExecutionMode::Strict);
        assert_eq!(config.engine_kind(), Ok(EngineKind::Ocl));
    }

    #[test]
    fn config_parses_forced_implementations() {
        let config = ProgramConfig::from_json(
            r#"{
                "mode": "hardened",
                "meaningful_kernel_names": true,
                "force_implementations": { "gather:0": "gather_ref" },
                "parallel_compile": true
            }"#,
        )
        .expect("config should parse");
        assert_eq!(config.mode, ConfigMode::Hardened);
        assert!(config.parallel_compile);

        let forced = config.optional_params_for("gather:0");
        assert_eq!(forced.forced_kernel.as_deref(), Some("gather_ref"));
        assert!(forced.meaningful_kernel_names);
        assert_eq!(config.optional_params_for("gather:1").forced_kernel, None);
    }

    #[test]
    fn config_rejects_unknown_fields_and_engines() {
        let err = ProgramConfig::from_json(r#"{ "tuning": "aggressive" }"#)
            .expect_err("unknown field must fail");
        assert!(err.to_string().contains("unknown field"));

        let err = ProgramConfig::from_json(r#"{ "engine": "vulkan" }"#)
            .expect_err("unknown engine must fail");
        assert_eq!(
            err,
            ConfigError::UnknownEngine {
                name: "vulkan".to_string()
            }
        );

        let err = ProgramConfig::from_json(r#"{ "force_implementations": { "g": " " } }"#)
            .expect_err("blank kernel must fail");
        assert!(matches!(err, ConfigError::EmptyForcedKernel { .. }));
    }

    #[test]
    fn config_json_roundtrip_preserves_fields() {
        let mut config = ProgramConfig::default();
        config
            .force_implementations
            .insert("gather:2".to_string(), "gather_planar".to_string());
        let raw = config.to_json().expect("serialize");
        assert_eq!(ProgramConfig::from_json(&raw), Ok(config));
    }
}

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use fk_catalog::CatalogError;
use fk_core::{EngineKind, ExecutionMode, GraphNode};
use fk_dispatch::{
    BuildContext, DispatchError, ImplCatalog, PrimitiveImpl, default_catalog, dispatch_node,
    effective_options,
};
use fk_kernels::{GatherKernelSelector, KernelRanker};
use fk_runtime::{ConfigError, EvidenceEntry, EvidenceKind, ProgramConfig, RuntimeContext};
use rayon::prelude::*;
use tracing::{debug, info, info_span};

pub use fk_axis::PhysicalAxis;
pub use fk_dispatch::{KernelStream, RecordedLaunch, RecordingStream};

pub type CompileResult = Result<Box<dyn PrimitiveImpl>, DispatchError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Config(ConfigError),
    Catalog(CatalogError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(error) => write!(f, "session config failure: {error}"),
            Self::Catalog(error) => write!(f, "session catalog failure: {error}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<CatalogError> for SessionError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

/// Result of compiling one node, before its evidence is recorded.
struct CompileOutcome {
    layer_id: String,
    dropped_hint: Option<String>,
    result: CompileResult,
}

/// Compiles graph nodes against a frozen catalog and a kernel ranker.
pub struct CompileSession {
    catalog: Arc<ImplCatalog>,
    ranker: Arc<dyn KernelRanker>,
    engine: EngineKind,
    config: ProgramConfig,
    runtime: RuntimeContext,
}

impl fmt::Debug for CompileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileSession")
            .field("engine", &self.engine)
            .field("catalog_entries", &self.catalog.len())
            .field("config", &self.config)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl CompileSession {
    pub fn new(config: ProgramConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let catalog = default_catalog(config.execution_mode())?;
        Self::with_parts(
            config,
            Arc::new(catalog),
            Arc::new(GatherKernelSelector::with_defaults()),
        )
    }

    pub fn from_json(config: &str) -> Result<Self, SessionError> {
        Self::new(ProgramConfig::from_json(config)?)
    }

    pub fn with_parts(
        config: ProgramConfig,
        catalog: Arc<ImplCatalog>,
        ranker: Arc<dyn KernelRanker>,
    ) -> Result<Self, SessionError> {
        let engine = config.engine_kind()?;
        let mut runtime = RuntimeContext::new(config.execution_mode());
        for family in catalog.families() {
            let entries = catalog.lookup(family.op, family.engine).len();
            runtime.ledger_mut().record(
                EvidenceKind::Registration,
                format!(
                    "op={} engine={} entries={entries} overwrites={}",
                    family.op,
                    family.engine,
                    catalog.overwrites()
                ),
            );
        }
        info!(
            engine = %engine,
            entries = catalog.len(),
            mode = ?runtime.mode(),
            "compile session ready"
        );
        Ok(Self {
            catalog,
            ranker,
            engine,
            config,
            runtime,
        })
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.runtime.mode()
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    #[must_use]
    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    #[must_use]
    pub fn config(&self) -> &ProgramConfig {
        &self.config
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<ImplCatalog> {
        &self.catalog
    }

    pub fn compile(&mut self, node: &GraphNode) -> CompileResult {
        let outcome = self.compile_one(node);
        self.record_outcome(outcome)
    }

    /// Compiles every node; results and evidence follow `nodes` order.
    pub fn compile_all(&mut self, nodes: &[GraphNode]) -> Vec<CompileResult> {
        let span = info_span!(
            "compile_all",
            nodes = nodes.len(),
            parallel = self.config.parallel_compile
        );
        let _guard = span.enter();

        let outcomes: Vec<CompileOutcome> = if self.config.parallel_compile {
            nodes.par_iter().map(|node| self.compile_one(node)).collect()
        } else {
            nodes.iter().map(|node| self.compile_one(node)).collect()
        };
        outcomes
            .into_iter()
            .map(|outcome| self.record_outcome(outcome))
            .collect()
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn evidence_len(&self) -> usize {
        self.runtime.ledger().len()
    }

    fn compile_one(&self, node: &GraphNode) -> CompileOutcome {
        let layer_id = node.id().to_string();
        let mode = self.runtime.mode();
        let ranker = self.ranker.as_ref();
        let requested = self.config.optional_params_for(node.id());

        let options = match effective_options(ranker, &requested, mode, node.id()) {
            Ok(options) => options,
            Err(error) => {
                return CompileOutcome {
                    layer_id,
                    dropped_hint: None,
                    result: Err(error),
                };
            }
        };
        let dropped_hint = if options.forced_kernel == requested.forced_kernel {
            None
        } else {
            requested.forced_kernel.clone()
        };

        let ctx = BuildContext {
            ranker,
            options: &options,
            mode,
        };
        let result = dispatch_node(&self.catalog, self.engine, node, &ctx);
        debug!(layer = %layer_id, ok = result.is_ok(), "compiled node");
        CompileOutcome {
            layer_id,
            dropped_hint,
            result,
        }
    }

    fn record_outcome(&mut self, outcome: CompileOutcome) -> CompileResult {
        let CompileOutcome {
            layer_id,
            dropped_hint,
            result,
        } = outcome;
        if let Some(kernel) = dropped_hint {
            self.runtime.ledger_mut().record_layer(
                EvidenceKind::Policy,
                &layer_id,
                vec![
                    ("policy", "ignored unknown forced kernel".to_string()),
                    ("kernel", kernel),
                ],
            );
        }
        match &result {
            Ok(built) => {
                let candidate = built.candidate();
                let params = built.params();
                let ledger = self.runtime.ledger_mut();
                ledger.record_layer(
                    EvidenceKind::Selection,
                    &layer_id,
                    vec![
                        ("kernel", candidate.kernel_name.to_string()),
                        ("entry_point", candidate.entry_point.to_string()),
                        ("priority", candidate.priority.to_string()),
                        ("key", built.dispatch_key().to_string()),
                    ],
                );
                ledger.record_layer(
                    EvidenceKind::Build,
                    &layer_id,
                    vec![
                        ("axis", params.axis.to_string()),
                        ("batch_dim", params.batch_dim.to_string()),
                        ("neg_indices", params.support_neg_ind.to_string()),
                        ("inputs", params.inputs.len().to_string()),
                    ],
                );
            }
            Err(error) => self.runtime.record_build_failure(&layer_id, error),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fk_catalog::{CatalogError, DispatchKey};
    use fk_core::{
        ElementType, EngineKind, ExecutionMode, GatherAttrs, GraphNode, LayoutDesc, MemoryLayout,
    };
    use fk_dispatch::{DispatchError, default_catalog};
    use fk_kernels::GatherKernelSelector;
    use fk_runtime::{ConfigError, ConfigMode, EvidenceKind, ProgramConfig};

    use super::{CompileSession, PhysicalAxis, RecordingStream, SessionError};

    fn node(id: &str, axis: i64, dtype: ElementType, format: MemoryLayout) -> GraphNode {
        let data = LayoutDesc::new(dtype, format, vec![2, 3, 4, 8]).expect("valid data layout");
        let indices = LayoutDesc::new(ElementType::I32, MemoryLayout::bfyx, vec![2, 2])
            .expect("valid index layout");
        GraphNode::gather(id, GatherAttrs::new(axis), data.clone(), indices, data)
    }

    fn kinds(session: &CompileSession) -> Vec<EvidenceKind> {
        session.evidence().iter().map(|entry| entry.kind).collect()
    }

    #[test]
    fn new_session_records_registration_evidence() {
        let session = CompileSession::new(ProgramConfig::default()).expect("default session");
        assert_eq!(session.engine(), EngineKind::Ocl);
        assert_eq!(session.catalog().len(), 95);
        let registration = session
            .evidence()
            .iter()
            .find(|entry| entry.kind == EvidenceKind::Registration)
            .expect("registration evidence");
        assert!(registration.summary.contains("op=gather engine=ocl entries=95"));
    }

    #[test]
    fn compile_records_selection_then_build() {
        let mut session = CompileSession::new(ProgramConfig::default()).expect("session");
        let before = session.evidence_len();
        let built = session
            .compile(&node("gather:0", -1, ElementType::F32, MemoryLayout::bfyx))
            .expect("gather compiles");

        assert_eq!(built.params().axis, PhysicalAxis::Y);
        assert_eq!(
            built.dispatch_key(),
            DispatchKey::new(ElementType::F32, MemoryLayout::bfyx)
        );
        assert_eq!(session.evidence_len(), before + 2);
        let tail = &session.evidence()[before..];
        assert_eq!(tail[0].kind, EvidenceKind::Selection);
        assert!(tail[0].summary.contains("kernel=gather_planar"));
        assert_eq!(tail[0].field("key"), Some("f32:bfyx"));
        assert_eq!(tail[1].field("axis"), Some("Y"));
        assert!(tail.iter().all(|entry| entry.layer_id.as_deref() == Some("gather:0")));
        assert_eq!(tail[1].kind, EvidenceKind::Build);
        assert!(tail[1].summary.contains("axis=Y"));

        let mut stream = RecordingStream::new();
        assert_eq!(built.execute(&mut stream), Ok(1));
    }

    #[test]
    fn failures_are_recorded_and_do_not_poison_session() {
        let mut session = CompileSession::new(ProgramConfig::default()).expect("session");
        let err = session
            .compile(&node("gather:bad", 7, ElementType::F32, MemoryLayout::bfyx))
            .expect_err("axis 7 unsupported");
        assert!(matches!(err, DispatchError::Axis(_)));
        let failure = session.evidence().last().expect("failure evidence");
        assert_eq!(failure.kind, EvidenceKind::Build);
        assert_eq!(failure.layer_id.as_deref(), Some("gather:bad"));
        assert_eq!(failure.field("outcome"), Some("failure"));

        session
            .compile(&node("gather:ok", 0, ElementType::U8, MemoryLayout::byxf))
            .expect("next node still compiles");
    }

    #[test]
    fn forced_kernel_hint_is_honored() {
        let mut config = ProgramConfig::default();
        config
            .force_implementations
            .insert("gather:0".to_string(), "gather_ref".to_string());
        let mut session = CompileSession::new(config).expect("session");
        let built = session
            .compile(&node("gather:0", 2, ElementType::F32, MemoryLayout::bfyx))
            .expect("forced kernel compiles");
        assert_eq!(built.kernel_name(), "gather_ref");
    }

    #[test]
    fn unknown_forced_kernel_strict_fails_hardened_records_policy() {
        let mut config = ProgramConfig::default();
        config
            .force_implementations
            .insert("gather:0".to_string(), "gather_tiled".to_string());
        let gather = node("gather:0", 2, ElementType::F32, MemoryLayout::bfyx);

        let mut strict = CompileSession::new(config.clone()).expect("strict session");
        let err = strict.compile(&gather).expect_err("strict rejects unknown kernel");
        assert!(matches!(err, DispatchError::UnknownForcedKernel { .. }));

        config.mode = ConfigMode::Hardened;
        let mut hardened = CompileSession::new(config).expect("hardened session");
        let built = hardened.compile(&gather).expect("hardened ignores the hint");
        assert_eq!(built.kernel_name(), "gather_planar");
        let policy = hardened
            .evidence()
            .iter()
            .find(|entry| entry.kind == EvidenceKind::Policy && entry.field("kernel").is_some())
            .expect("policy evidence");
        assert_eq!(policy.layer_id.as_deref(), Some("gather:0"));
        assert_eq!(policy.field("kernel"), Some("gather_tiled"));
        assert_eq!(policy.field("policy"), Some("ignored unknown forced kernel"));
    }

    #[test]
    fn parallel_and_sequential_compile_agree_in_order() {
        let nodes: Vec<GraphNode> = (0..24)
            .map(|index| {
                let axis = [0i64, 1, 2, 3, -1, -2, -3, 9][index % 8];
                let dtype = [ElementType::F32, ElementType::F16, ElementType::I8][index % 3];
                node(&format!("gather:{index}"), axis, dtype, MemoryLayout::bfyx)
            })
            .collect();

        let mut sequential = CompileSession::new(ProgramConfig::default()).expect("session");
        let config = ProgramConfig {
            parallel_compile: true,
            ..ProgramConfig::default()
        };
        let mut parallel = CompileSession::new(config).expect("parallel session");

        let seq = sequential.compile_all(&nodes);
        let par = parallel.compile_all(&nodes);
        assert_eq!(seq.len(), nodes.len());
        for (lhs, rhs) in seq.iter().zip(&par) {
            match (lhs, rhs) {
                (Ok(lhs), Ok(rhs)) => {
                    assert_eq!(lhs.layer_id(), rhs.layer_id());
                    assert_eq!(lhs.params(), rhs.params());
                    assert_eq!(lhs.candidate(), rhs.candidate());
                }
                (Err(lhs), Err(rhs)) => assert_eq!(lhs, rhs),
                _ => panic!("parallel and sequential outcomes diverged"),
            }
        }
        assert_eq!(kinds(&sequential), kinds(&parallel));

        let summaries: Vec<&str> = parallel
            .evidence()
            .iter()
            .filter(|entry| entry.kind == EvidenceKind::Selection)
            .map(|entry| entry.summary.as_str())
            .collect();
        assert!(summaries[0].starts_with("layer=gather:0 "));
        assert!(summaries[1].starts_with("layer=gather:1 "));
    }

    #[test]
    fn cpu_engine_has_no_gather_family() {
        let config = ProgramConfig {
            engine: "cpu".to_string(),
            ..ProgramConfig::default()
        };
        let mut session = CompileSession::new(config).expect("session");
        let err = session
            .compile(&node("gather:0", 0, ElementType::F32, MemoryLayout::bfyx))
            .expect_err("no cpu implementations");
        assert!(matches!(
            err,
            DispatchError::Catalog(CatalogError::NotRegistered { .. })
        ));
    }

    #[test]
    fn invalid_config_is_a_session_error() {
        let err = CompileSession::from_json(r#"{ "engine": "metal" }"#)
            .expect_err("unknown engine");
        assert_eq!(
            err,
            SessionError::Config(ConfigError::UnknownEngine {
                name: "metal".to_string()
            })
        );
    }

    #[test]
    fn with_parts_shares_catalog_between_sessions() {
        let catalog =
            Arc::new(default_catalog(ExecutionMode::Strict).expect("default catalog"));
        let ranker = Arc::new(GatherKernelSelector::with_defaults());
        let mut first =
            CompileSession::with_parts(ProgramConfig::default(), Arc::clone(&catalog), ranker.clone())
                .expect("first session");
        let mut second = CompileSession::with_parts(ProgramConfig::default(), catalog, ranker)
            .expect("second session");
        let gather = node("gather:shared", 3, ElementType::I32, MemoryLayout::yxfb);
        let lhs = first.compile(&gather).expect("first compiles");
        let rhs = second.compile(&gather).expect("second compiles");
        assert_eq!(lhs.params(), rhs.params());
        assert_eq!(Arc::strong_count(first.catalog()), 2);
    }

    #[test]
    fn mode_switch_changes_policy() {
        let mut session = CompileSession::new(ProgramConfig::default()).expect("session");
        session.set_mode(ExecutionMode::Hardened);
        assert_eq!(session.mode(), ExecutionMode::Hardened);
    }
}

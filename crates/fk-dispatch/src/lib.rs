#![forbid(unsafe_code)]

use std::fmt;
use std::sync::OnceLock;

use fk_axis::{AxisError, resolve_gather_axis};
use fk_catalog::{CatalogBuilder, CatalogError, DispatchKey, ImplementationCatalog};
use fk_core::{ElementType, EngineKind, ExecutionMode, GraphNode, MemoryLayout, OperatorKind};
use fk_kernels::{
    DispatchData, GatherParams, KernelArgument, KernelCandidate, KernelRanker, OptionalParams,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Axis(AxisError),
    Catalog(CatalogError),
    NoCompatibleKernel {
        op: OperatorKind,
        layer_id: String,
        dtype: ElementType,
        layout: MemoryLayout,
        rank: usize,
    },
    MissingDependency {
        layer_id: String,
        index: usize,
    },
    UnknownForcedKernel {
        layer_id: String,
        kernel: String,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Axis(error) => write!(f, "axis resolution failure: {error}"),
            Self::Catalog(error) => write!(f, "implementation lookup failure: {error}"),
            Self::NoCompatibleKernel {
                op,
                layer_id,
                dtype,
                layout,
                rank,
            } => write!(
                f,
                "cannot find a proper kernel for {op} layer '{layer_id}' (dtype={dtype}, layout={layout}, rank={rank})"
            ),
            Self::MissingDependency { layer_id, index } => {
                write!(f, "layer '{layer_id}' is missing dependency #{index}")
            }
            Self::UnknownForcedKernel { layer_id, kernel } => {
                write!(f, "layer '{layer_id}' forces unknown kernel '{kernel}'")
            }
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<AxisError> for DispatchError {
    fn from(value: AxisError) -> Self {
        Self::Axis(value)
    }
}

impl From<CatalogError> for DispatchError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    Rejected { entry_point: String, reason: String },
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected {
                entry_point,
                reason,
            } => write!(f, "stream rejected kernel '{entry_point}': {reason}"),
        }
    }
}

impl std::error::Error for StreamError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelLaunch<'a> {
    pub layer_id: &'a str,
    pub entry_point: &'a str,
    pub dispatch: DispatchData,
    pub arguments: &'a [KernelArgument],
}

/// Command-queue seam of the executor.
pub trait KernelStream {
    /// Returns the event id of the enqueued launch.
    fn enqueue(&mut self, launch: KernelLaunch<'_>) -> Result<u64, StreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLaunch {
    pub event: u64,
    pub layer_id: String,
    pub entry_point: String,
    pub dispatch: DispatchData,
    pub arguments: Vec<KernelArgument>,
}

/// Stream that only records launches; used for dry runs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStream {
    launches: Vec<RecordedLaunch>,
}

impl RecordingStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn launches(&self) -> &[RecordedLaunch] {
        &self.launches
    }
}

impl KernelStream for RecordingStream {
    fn enqueue(&mut self, launch: KernelLaunch<'_>) -> Result<u64, StreamError> {
        let event = self.launches.len() as u64 + 1;
        self.launches.push(RecordedLaunch {
            event,
            layer_id: launch.layer_id.to_string(),
            entry_point: launch.entry_point.to_string(),
            dispatch: launch.dispatch,
            arguments: launch.arguments.to_vec(),
        });
        Ok(event)
    }
}

/// Executable unit bound to one graph node.
pub trait PrimitiveImpl: fmt::Debug + Send + Sync {
    fn layer_id(&self) -> &str;

    fn dispatch_key(&self) -> DispatchKey;

    fn params(&self) -> &GatherParams;

    fn candidate(&self) -> &KernelCandidate;

    fn kernel_name(&self) -> &'static str {
        self.candidate().kernel_name
    }

    fn execute(&self, stream: &mut dyn KernelStream) -> Result<u64, StreamError>;

    fn clone_boxed(&self) -> Box<dyn PrimitiveImpl>;
}

impl Clone for Box<dyn PrimitiveImpl> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherImpl {
    layer_id: String,
    key: DispatchKey,
    params: GatherParams,
    candidate: KernelCandidate,
}

impl PrimitiveImpl for GatherImpl {
    fn layer_id(&self) -> &str {
        &self.layer_id
    }

    fn dispatch_key(&self) -> DispatchKey {
        self.key
    }

    fn params(&self) -> &GatherParams {
        &self.params
    }

    fn candidate(&self) -> &KernelCandidate {
        &self.candidate
    }

    fn execute(&self, stream: &mut dyn KernelStream) -> Result<u64, StreamError> {
        stream.enqueue(KernelLaunch {
            layer_id: &self.layer_id,
            entry_point: &self.candidate.entry_point,
            dispatch: self.candidate.dispatch,
            arguments: &self.candidate.arguments,
        })
    }

    fn clone_boxed(&self) -> Box<dyn PrimitiveImpl> {
        Box::new(self.clone())
    }
}

/// What a factory gets besides the node.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub ranker: &'a dyn KernelRanker,
    pub options: &'a OptionalParams,
    pub mode: ExecutionMode,
}

impl fmt::Debug for BuildContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("options", self.options)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

pub type ImplFactory =
    fn(&GraphNode, &BuildContext<'_>) -> Result<Box<dyn PrimitiveImpl>, DispatchError>;

pub type ImplCatalog = ImplementationCatalog<ImplFactory>;

/// Drops a forced kernel the ranker does not know, unless the mode is strict.
pub fn effective_options(
    ranker: &dyn KernelRanker,
    options: &OptionalParams,
    mode: ExecutionMode,
    layer_id: &str,
) -> Result<OptionalParams, DispatchError> {
    let Some(forced) = options.forced_kernel.as_deref() else {
        return Ok(options.clone());
    };
    if ranker.has_kernel(forced) {
        return Ok(options.clone());
    }
    match mode {
        ExecutionMode::Strict => Err(DispatchError::UnknownForcedKernel {
            layer_id: layer_id.to_string(),
            kernel: forced.to_string(),
        }),
        ExecutionMode::Hardened => {
            warn!(layer = layer_id, kernel = forced, "ignoring unknown forced kernel");
            Ok(OptionalParams {
                forced_kernel: None,
                ..options.clone()
            })
        }
    }
}

fn no_compatible_kernel(params: &GatherParams) -> DispatchError {
    let described = params.data().unwrap_or(&params.output);
    DispatchError::NoCompatibleKernel {
        op: OperatorKind::Gather,
        layer_id: params.layer_id.clone(),
        dtype: described.dtype(),
        layout: described.layout(),
        rank: described.rank(),
    }
}

/// Ranks kernels for `params`; an empty ranking is an error.
pub fn select_best(
    ranker: &dyn KernelRanker,
    params: &GatherParams,
    options: &OptionalParams,
) -> Result<Vec<KernelCandidate>, DispatchError> {
    let candidates = ranker.best_kernels(params, options);
    if candidates.is_empty() {
        return Err(no_compatible_kernel(params));
    }
    Ok(candidates)
}

/// The top-ranked kernel for `params`.
pub fn select_top(
    ranker: &dyn KernelRanker,
    params: &GatherParams,
    options: &OptionalParams,
) -> Result<KernelCandidate, DispatchError> {
    ranker
        .best_kernels(params, options)
        .into_iter()
        .next()
        .ok_or_else(|| no_compatible_kernel(params))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GatherImplBuilder;

impl GatherImplBuilder {
    pub fn build(node: &GraphNode, ctx: &BuildContext<'_>) -> Result<GatherImpl, DispatchError> {
        let layer_id = node.id();
        let data = node
            .dependency(0)
            .ok_or_else(|| DispatchError::MissingDependency {
                layer_id: layer_id.to_string(),
                index: 0,
            })?;
        let indices = node
            .dependency(1)
            .ok_or_else(|| DispatchError::MissingDependency {
                layer_id: layer_id.to_string(),
                index: 1,
            })?;

        let attrs = node.attrs();
        let axis = resolve_gather_axis(attrs.axis, data.rank())?;

        let mut params = GatherParams::new(layer_id, axis, data.clone(), node.output().clone());
        params.batch_dim = attrs.batch_dim;
        params.support_neg_ind = attrs.support_neg_ind;
        params.inputs.push(indices.clone());

        let options = effective_options(ctx.ranker, ctx.options, ctx.mode, layer_id)?;
        let candidate = select_top(ctx.ranker, &params, &options)?;

        debug!(
            layer = layer_id,
            axis = %axis,
            kernel = candidate.kernel_name,
            entry_point = %candidate.entry_point,
            "built gather implementation"
        );

        Ok(GatherImpl {
            layer_id: layer_id.to_string(),
            key: DispatchKey::for_layout(node.output()),
            params,
            candidate,
        })
    }

    pub fn create(
        node: &GraphNode,
        ctx: &BuildContext<'_>,
    ) -> Result<Box<dyn PrimitiveImpl>, DispatchError> {
        Ok(Box::new(Self::build(node, ctx)?))
    }
}

pub const GATHER_IMPL_TYPES: [ElementType; 5] = [
    ElementType::F32,
    ElementType::F16,
    ElementType::I32,
    ElementType::I8,
    ElementType::U8,
];

pub const GATHER_IMPL_LAYOUTS: [MemoryLayout; 19] = [
    MemoryLayout::fyxb,
    MemoryLayout::yxfb,
    MemoryLayout::byxf,
    MemoryLayout::bfyx,
    MemoryLayout::bfzyx,
    MemoryLayout::bfwzyx,
    MemoryLayout::b_fs_yx_fsv4,
    MemoryLayout::b_fs_yx_fsv16,
    MemoryLayout::b_fs_yx_fsv32,
    MemoryLayout::b_fs_zyx_fsv16,
    MemoryLayout::b_fs_zyx_fsv32,
    MemoryLayout::bs_fs_yx_bsv4_fsv2,
    MemoryLayout::bs_fs_yx_bsv4_fsv4,
    MemoryLayout::bs_fs_yx_bsv8_fsv2,
    MemoryLayout::bs_fs_yx_bsv8_fsv4,
    MemoryLayout::bs_fs_yx_bsv16_fsv16,
    MemoryLayout::bs_fs_yx_bsv32_fsv16,
    MemoryLayout::bs_fs_yx_bsv32_fsv32,
    MemoryLayout::fs_b_yx_fsv32,
];

pub fn attach_gather_impl(builder: &mut CatalogBuilder<ImplFactory>) -> Result<usize, CatalogError> {
    let keys = GATHER_IMPL_LAYOUTS.iter().flat_map(|layout| {
        GATHER_IMPL_TYPES
            .iter()
            .map(move |dtype| DispatchKey::new(*dtype, *layout))
    });
    builder.register_all(
        OperatorKind::Gather,
        EngineKind::Ocl,
        keys,
        GatherImplBuilder::create,
    )
}

pub fn default_catalog(mode: ExecutionMode) -> Result<ImplCatalog, CatalogError> {
    let mut builder = CatalogBuilder::new(mode);
    attach_gather_impl(&mut builder)?;
    Ok(builder.freeze())
}

static GLOBAL_CATALOG: OnceLock<Result<ImplCatalog, CatalogError>> = OnceLock::new();

/// Process-wide strict catalog, populated on first use.
pub fn global_catalog() -> Result<&'static ImplCatalog, CatalogError> {
    GLOBAL_CATALOG
        .get_or_init(|| default_catalog(ExecutionMode::Strict))
        .as_ref()
        .map_err(|error| *error)
}

/// Looks the node's output key up in `catalog` and runs the factory.
pub fn dispatch_node(
    catalog: &ImplCatalog,
    engine: EngineKind,
    node: &GraphNode,
    ctx: &BuildContext<'_>,
) -> Result<Box<dyn PrimitiveImpl>, DispatchError> {
    let key = DispatchKey::for_layout(node.output());
    let factory = catalog.find(node.kind(), engine, key)?;
    factory(node, ctx)
}

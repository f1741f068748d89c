#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fk_axis::PhysicalAxis;
use fk_core::{ElementType, LayoutDesc, MAX_TENSOR_RANK, MemoryLayout};
use tracing::debug;

/// Everything a gather kernel needs to know about one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatherParams {
    pub layer_id: String,
    pub axis: PhysicalAxis,
    pub batch_dim: i64,
    pub support_neg_ind: bool,
    /// Data tensor first, index tensor appended after it.
    pub inputs: Vec<LayoutDesc>,
    pub output: LayoutDesc,
}

impl GatherParams {
    #[must_use]
    pub fn new(
        layer_id: impl Into<String>,
        axis: PhysicalAxis,
        data: LayoutDesc,
        output: LayoutDesc,
    ) -> Self {
        Self {
            layer_id: layer_id.into(),
            axis,
            batch_dim: 0,
            support_neg_ind: false,
            inputs: vec![data],
            output,
        }
    }

    #[must_use]
    pub fn data(&self) -> Option<&LayoutDesc> {
        self.inputs.first()
    }

    #[must_use]
    pub fn indices(&self) -> Option<&LayoutDesc> {
        self.inputs.get(1)
    }

    /// Structural digest; the layer id is not part of it.
    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.axis.hash(&mut hasher);
        self.batch_dim.hash(&mut hasher);
        self.support_neg_ind.hash(&mut hasher);
        self.inputs.hash(&mut hasher);
        self.output.hash(&mut hasher);
        hasher.finish()
    }
}

/// Engine-level knobs passed next to the operator parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionalParams {
    pub forced_kernel: Option<String>,
    pub meaningful_kernel_names: bool,
}

/// Lower values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelPriority(pub u32);

impl KernelPriority {
    pub const FORCE_PRIORITY_1: Self = Self(1);
    pub const FORCE_PRIORITY_2: Self = Self(2);
    pub const FORCE_PRIORITY_3: Self = Self(3);
    pub const FORCE_PRIORITY_4: Self = Self(4);
    pub const FORCE_PRIORITY_5: Self = Self(5);
    pub const FORCE_PRIORITY_6: Self = Self(6);
    pub const FORCE_PRIORITY_7: Self = Self(7);
    pub const FORCE_PRIORITY_8: Self = Self(8);
    pub const FORCE_PRIORITY_9: Self = Self(9);
    pub const DONT_USE_IF_HAVE_SOMETHING_ELSE: Self = Self(1_000_000);
}

impl fmt::Display for KernelPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMismatch {
    MissingIndexTensor,
    InputType(ElementType),
    IndexType(ElementType),
    OutputType(ElementType),
    InputLayout(MemoryLayout),
    OutputLayout(MemoryLayout),
    Rank(usize),
    BatchDim(i64),
    DifferentTypes {
        input: ElementType,
        output: ElementType,
    },
}

impl fmt::Display for KeyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIndexTensor => write!(f, "index tensor missing"),
            Self::InputType(dtype) => write!(f, "input type {dtype} unsupported"),
            Self::IndexType(dtype) => write!(f, "index type {dtype} unsupported"),
            Self::OutputType(dtype) => write!(f, "output type {dtype} unsupported"),
            Self::InputLayout(layout) => write!(f, "input layout {layout} unsupported"),
            Self::OutputLayout(layout) => write!(f, "output layout {layout} unsupported"),
            Self::Rank(rank) => write!(f, "rank {rank} unsupported"),
            Self::BatchDim(batch_dim) => write!(f, "batch_dim={batch_dim} unsupported"),
            Self::DifferentTypes { input, output } => {
                write!(f, "input {input} / output {output} type change unsupported")
            }
        }
    }
}

/// Capabilities a kernel declares up front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamsKey {
    input_types: BTreeSet<ElementType>,
    index_types: BTreeSet<ElementType>,
    output_types: BTreeSet<ElementType>,
    input_layouts: BTreeSet<MemoryLayout>,
    output_layouts: BTreeSet<MemoryLayout>,
    ranks: BTreeSet<usize>,
    batch_dim: bool,
    different_types: bool,
}

impl ParamsKey {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enable_input_types(mut self, types: &[ElementType]) -> Self {
        self.input_types.extend(types.iter().copied());
        self
    }

    #[must_use]
    pub fn enable_index_types(mut self, types: &[ElementType]) -> Self {
        self.index_types.extend(types.iter().copied());
        self
    }

    #[must_use]
    pub fn enable_output_types(mut self, types: &[ElementType]) -> Self {
        self.output_types.extend(types.iter().copied());
        self
    }

    #[must_use]
    pub fn enable_layouts(mut self, layouts: &[MemoryLayout]) -> Self {
        self.input_layouts.extend(layouts.iter().copied());
        self.output_layouts.extend(layouts.iter().copied());
        self
    }

    #[must_use]
    pub fn enable_all_layouts(self) -> Self {
        self.enable_layouts(MemoryLayout::all())
    }

    #[must_use]
    pub fn enable_ranks(mut self, ranks: std::ops::RangeInclusive<usize>) -> Self {
        self.ranks.extend(ranks);
        self
    }

    #[must_use]
    pub fn enable_batch_dim(mut self) -> Self {
        self.batch_dim = true;
        self
    }

    #[must_use]
    pub fn enable_different_types(mut self) -> Self {
        self.different_types = true;
        self
    }

    pub fn check(&self, params: &GatherParams) -> Result<(), KeyMismatch> {
        let data = params.data().ok_or(KeyMismatch::MissingIndexTensor)?;
        let indices = params.indices().ok_or(KeyMismatch::MissingIndexTensor)?;
        let output = &params.output;

        if !self.input_types.contains(&data.dtype()) {
            return Err(KeyMismatch::InputType(data.dtype()));
        }
        if !self.index_types.contains(&indices.dtype()) {
            return Err(KeyMismatch::IndexType(indices.dtype()));
        }
        if !self.output_types.contains(&output.dtype()) {
            return Err(KeyMismatch::OutputType(output.dtype()));
        }
        if !self.input_layouts.contains(&data.layout()) {
            return Err(KeyMismatch::InputLayout(data.layout()));
        }
        if !self.output_layouts.contains(&output.layout()) {
            return Err(KeyMismatch::OutputLayout(output.layout()));
        }
        for rank in [data.rank(), indices.rank(), output.rank()] {
            if !self.ranks.contains(&rank) {
                return Err(KeyMismatch::Rank(rank));
            }
        }
        if params.batch_dim != 0 && !self.batch_dim {
            return Err(KeyMismatch::BatchDim(params.batch_dim));
        }
        if data.dtype() != output.dtype() && !self.different_types {
            return Err(KeyMismatch::DifferentTypes {
                input: data.dtype(),
                output: output.dtype(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn supports(&self, params: &GatherParams) -> bool {
        self.check(params).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchData {
    pub gws: [usize; 3],
    pub lws: [usize; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelArgument {
    Input(usize),
    Output(usize),
}

/// A compiled-or-compilable kernel bound to one parameter set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelData {
    pub kernel_name: &'static str,
    pub entry_point: String,
    pub priority: KernelPriority,
    pub dispatch: DispatchData,
    pub jit: Vec<(String, String)>,
    pub arguments: Vec<KernelArgument>,
}

impl KernelData {
    #[must_use]
    pub fn jit_value(&self, name: &str) -> Option<&str> {
        self.jit
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Ranked kernel handed out by a [`KernelRanker`]; clones share the data.
pub type KernelCandidate = Arc<KernelData>;

pub trait KernelDescriptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_key(&self) -> ParamsKey;

    fn validate(&self, _params: &GatherParams, _options: &OptionalParams) -> bool {
        true
    }

    fn priority(&self, params: &GatherParams, options: &OptionalParams) -> KernelPriority;

    fn kernels_data(&self, params: &GatherParams, options: &OptionalParams) -> Vec<KernelData>;
}

/// The kernel-ranking service seam.
pub trait KernelRanker: Send + Sync {
    /// Best kernel first; may be empty.
    fn best_kernels(
        &self,
        params: &GatherParams,
        options: &OptionalParams,
    ) -> Vec<KernelCandidate>;

    fn has_kernel(&self, name: &str) -> bool;
}

const DATA_TYPES: [ElementType; 5] = [
    ElementType::F32,
    ElementType::F16,
    ElementType::I32,
    ElementType::I8,
    ElementType::U8,
];

const INDEX_TYPES: [ElementType; 4] = [
    ElementType::I32,
    ElementType::I64,
    ElementType::F32,
    ElementType::F16,
];

fn entry_point(kernel_name: &str, params: &GatherParams, options: &OptionalParams) -> String {
    let digest = params.fingerprint64();
    if options.meaningful_kernel_names {
        let layer: String = params
            .layer_id
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
            .collect();
        format!("{kernel_name}_{layer}_{:08x}", digest as u32)
    } else {
        format!("{kernel_name}_{digest:016x}")
    }
}

fn gather_jit_constants(params: &GatherParams) -> Vec<(String, String)> {
    let mut jit = vec![
        ("AXIS".to_string(), params.axis.label().to_string()),
        ("BATCH_DIM".to_string(), params.batch_dim.to_string()),
    ];
    if let Some(data) = params.data() {
        jit.push(("INPUT0_TYPE".to_string(), data.dtype().label().to_string()));
        jit.push(("INPUT0_LAYOUT".to_string(), data.layout().name().to_string()));
        jit.push(("INPUT0_RANK".to_string(), data.rank().to_string()));
    }
    if let Some(indices) = params.indices() {
        jit.push(("INPUT1_TYPE".to_string(), indices.dtype().label().to_string()));
        jit.push(("INDICES_RANK".to_string(), indices.rank().to_string()));
    }
    jit.push((
        "OUTPUT_TYPE".to_string(),
        params.output.dtype().label().to_string(),
    ));
    jit.push((
        "OUTPUT_LAYOUT".to_string(),
        params.output.layout().name().to_string(),
    ));
    if params.support_neg_ind {
        jit.push(("INDEX_DIM_NEGATIVE".to_string(), "1".to_string()));
    }
    jit
}

/// `[x*y, z*w, f*b]` over the output, one work item per element.
fn default_dispatch_data(params: &GatherParams) -> DispatchData {
    let shape = params.output.padded_shape();
    let (b, f) = (shape[0], shape[1]);
    let spatial = &shape[2..];
    let mut wzyx = [1usize; 4];
    wzyx[4 - spatial.len()..].copy_from_slice(spatial);
    let [w, z, y, x] = wzyx;
    DispatchData {
        gws: [x * y, z * w, f * b],
        lws: [1, 1, 1],
    }
}

fn bound_arguments(params: &GatherParams) -> Vec<KernelArgument> {
    let mut args: Vec<KernelArgument> = (0..params.inputs.len()).map(KernelArgument::Input).collect();
    args.push(KernelArgument::Output(0));
    args
}

/// Reference kernel: every registered type, layout and rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatherKernelRef;

impl KernelDescriptor for GatherKernelRef {
    fn name(&self) -> &'static str {
        "gather_ref"
    }

    fn supported_key(&self) -> ParamsKey {
        ParamsKey::new()
            .enable_input_types(&DATA_TYPES)
            .enable_output_types(&DATA_TYPES)
            .enable_index_types(&INDEX_TYPES)
            .enable_all_layouts()
            .enable_ranks(1..=MAX_TENSOR_RANK)
            .enable_batch_dim()
            .enable_different_types()
    }

    fn priority(&self, _params: &GatherParams, _options: &OptionalParams) -> KernelPriority {
        KernelPriority::DONT_USE_IF_HAVE_SOMETHING_ELSE
    }

    fn kernels_data(&self, params: &GatherParams, options: &OptionalParams) -> Vec<KernelData> {
        vec![KernelData {
            kernel_name: self.name(),
            entry_point: entry_point(self.name(), params, options),
            priority: self.priority(params, options),
            dispatch: default_dispatch_data(params),
            jit: gather_jit_constants(params),
            arguments: bound_arguments(params),
        }]
    }
}

/// Planar-only kernel with vectorized innermost access.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatherKernelPlanar;

impl GatherKernelPlanar {
    fn local_work_size(gws: [usize; 3]) -> [usize; 3] {
        let lws0 = [16usize, 8, 4, 2]
            .into_iter()
            .find(|candidate| gws[0] % candidate == 0)
            .unwrap_or(1);
        [lws0, 1, 1]
    }
}

impl KernelDescriptor for GatherKernelPlanar {
    fn name(&self) -> &'static str {
        "gather_planar"
    }

    fn supported_key(&self) -> ParamsKey {
        ParamsKey::new()
            .enable_input_types(&DATA_TYPES)
            .enable_output_types(&DATA_TYPES)
            .enable_index_types(&INDEX_TYPES)
            .enable_layouts(&[MemoryLayout::bfyx, MemoryLayout::bfzyx, MemoryLayout::bfwzyx])
            .enable_ranks(1..=MAX_TENSOR_RANK)
    }

    fn validate(&self, params: &GatherParams, _options: &OptionalParams) -> bool {
        params
            .data()
            .is_some_and(|data| data.layout() == params.output.layout())
    }

    fn priority(&self, _params: &GatherParams, _options: &OptionalParams) -> KernelPriority {
        KernelPriority::FORCE_PRIORITY_3
    }

    fn kernels_data(&self, params: &GatherParams, options: &OptionalParams) -> Vec<KernelData> {
        let mut dispatch = default_dispatch_data(params);
        dispatch.lws = Self::local_work_size(dispatch.gws);
        let mut jit = gather_jit_constants(params);
        jit.push(("GATHER_PLANAR".to_string(), "1".to_string()));
        vec![KernelData {
            kernel_name: self.name(),
            entry_point: entry_point(self.name(), params, options),
            priority: self.priority(params, options),
            dispatch,
            jit,
            arguments: bound_arguments(params),
        }]
    }
}

/// Ranks every attached [`KernelDescriptor`] for a parameter set.
#[derive(Default)]
pub struct GatherKernelSelector {
    kernels: Vec<Box<dyn KernelDescriptor>>,
}

impl fmt::Debug for GatherKernelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatherKernelSelector")
            .field("kernels", &self.kernel_names())
            .finish()
    }
}

impl GatherKernelSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        let mut selector = Self::new();
        selector.attach(Box::new(GatherKernelRef));
        selector.attach(Box::new(GatherKernelPlanar));
        selector
    }

    pub fn attach(&mut self, kernel: Box<dyn KernelDescriptor>) {
        self.kernels.push(kernel);
    }

    #[must_use]
    pub fn kernel_names(&self) -> Vec<&'static str> {
        self.kernels.iter().map(|kernel| kernel.name()).collect()
    }

    /// Why each attached kernel accepts or rejects `params`.
    #[must_use]
    pub fn explain(&self, params: &GatherParams) -> Vec<(&'static str, Result<(), KeyMismatch>)> {
        self.kernels
            .iter()
            .map(|kernel| (kernel.name(), kernel.supported_key().check(params)))
            .collect()
    }
}

impl KernelRanker for GatherKernelSelector {
    fn best_kernels(
        &self,
        params: &GatherParams,
        options: &OptionalParams,
    ) -> Vec<KernelCandidate> {
        let mut ranked: Vec<(KernelPriority, usize, KernelData)> = Vec::new();
        for (order, kernel) in self.kernels.iter().enumerate() {
            if let Some(forced) = options.forced_kernel.as_deref()
                && forced != kernel.name()
            {
                continue;
            }
            if !kernel.supported_key().supports(params) || !kernel.validate(params, options) {
                continue;
            }
            let priority = kernel.priority(params, options);
            ranked.extend(
                kernel
                    .kernels_data(params, options)
                    .into_iter()
                    .map(|data| (priority, order, data)),
            );
        }
        ranked.sort_by_key(|(priority, order, _)| (*priority, *order));
        debug!(
            layer = %params.layer_id,
            candidates = ranked.len(),
            forced = ?options.forced_kernel,
            "ranked gather kernels"
        );
        ranked
            .into_iter()
            .map(|(_, _, data)| Arc::new(data))
            .collect()
    }

    fn has_kernel(&self, name: &str) -> bool {
        self.kernels.iter().any(|kernel| kernel.name() == name)
    }
}

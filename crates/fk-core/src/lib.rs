#![forbid(unsafe_code)]

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

pub const MAX_TENSOR_RANK: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementType {
    F32,
    F16,
    I32,
    I8,
    U8,
    I64,
}

impl ElementType {
    #[must_use]
    pub const fn all() -> &'static [ElementType] {
        &[
            ElementType::F32,
            ElementType::F16,
            ElementType::I32,
            ElementType::I8,
            ElementType::U8,
            ElementType::I64,
        ]
    }

    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F16 => 2,
            Self::I8 | Self::U8 => 1,
            Self::I64 => 8,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::I32 => "i32",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::I64 => "i64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ElementType {
    type Err = LayoutError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|dtype| dtype.label() == raw)
            .ok_or_else(|| LayoutError::UnknownElementType {
                name: raw.to_string(),
            })
    }
}

/// Physical element ordering of a tensor buffer.
///
/// Names follow the executor's format vocabulary: letters list dimensions from
/// outermost to innermost, `fsvN`/`bsvN` mark feature/batch slices tiled by `N`.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryLayout {
    fyxb,
    yxfb,
    byxf,
    bfyx,
    bfzyx,
    bfwzyx,
    b_fs_yx_fsv4,
    b_fs_yx_fsv16,
    b_fs_yx_fsv32,
    b_fs_zyx_fsv16,
    b_fs_zyx_fsv32,
    bs_fs_yx_bsv4_fsv2,
    bs_fs_yx_bsv4_fsv4,
    bs_fs_yx_bsv8_fsv2,
    bs_fs_yx_bsv8_fsv4,
    bs_fs_yx_bsv16_fsv16,
    bs_fs_yx_bsv32_fsv16,
    bs_fs_yx_bsv32_fsv32,
    fs_b_yx_fsv32,
}

impl MemoryLayout {
    #[must_use]
    pub const fn all() -> &'static [MemoryLayout] {
        &[
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
        ]
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::fyxb => "fyxb",
            Self::yxfb => "yxfb",
            Self::byxf => "byxf",
            Self::bfyx => "bfyx",
            Self::bfzyx => "bfzyx",
            Self::bfwzyx => "bfwzyx",
            Self::b_fs_yx_fsv4 => "b_fs_yx_fsv4",
            Self::b_fs_yx_fsv16 => "b_fs_yx_fsv16",
            Self::b_fs_yx_fsv32 => "b_fs_yx_fsv32",
            Self::b_fs_zyx_fsv16 => "b_fs_zyx_fsv16",
            Self::b_fs_zyx_fsv32 => "b_fs_zyx_fsv32",
            Self::bs_fs_yx_bsv4_fsv2 => "bs_fs_yx_bsv4_fsv2",
            Self::bs_fs_yx_bsv4_fsv4 => "bs_fs_yx_bsv4_fsv4",
            Self::bs_fs_yx_bsv8_fsv2 => "bs_fs_yx_bsv8_fsv2",
            Self::bs_fs_yx_bsv8_fsv4 => "bs_fs_yx_bsv8_fsv4",
            Self::bs_fs_yx_bsv16_fsv16 => "bs_fs_yx_bsv16_fsv16",
            Self::bs_fs_yx_bsv32_fsv16 => "bs_fs_yx_bsv32_fsv16",
            Self::bs_fs_yx_bsv32_fsv32 => "bs_fs_yx_bsv32_fsv32",
            Self::fs_b_yx_fsv32 => "fs_b_yx_fsv32",
        }
    }

    /// Number of logical dimensions the layout stores.
    #[must_use]
    pub const fn native_rank(self) -> usize {
        match self {
            Self::bfzyx | Self::b_fs_zyx_fsv16 | Self::b_fs_zyx_fsv32 => 5,
            Self::bfwzyx => 6,
            _ => 4,
        }
    }

    #[must_use]
    pub const fn is_planar(self) -> bool {
        matches!(self, Self::bfyx | Self::bfzyx | Self::bfwzyx)
    }

    #[must_use]
    pub const fn feature_block(self) -> Option<usize> {
        match self {
            Self::b_fs_yx_fsv4 | Self::bs_fs_yx_bsv4_fsv4 | Self::bs_fs_yx_bsv8_fsv4 => Some(4),
            Self::bs_fs_yx_bsv4_fsv2 | Self::bs_fs_yx_bsv8_fsv2 => Some(2),
            Self::b_fs_yx_fsv16
            | Self::b_fs_zyx_fsv16
            | Self::bs_fs_yx_bsv16_fsv16
            | Self::bs_fs_yx_bsv32_fsv16 => Some(16),
            Self::b_fs_yx_fsv32
            | Self::b_fs_zyx_fsv32
            | Self::bs_fs_yx_bsv32_fsv32
            | Self::fs_b_yx_fsv32 => Some(32),
            _ => None,
        }
    }

    #[must_use]
    pub const fn batch_block(self) -> Option<usize> {
        match self {
            Self::bs_fs_yx_bsv4_fsv2 | Self::bs_fs_yx_bsv4_fsv4 => Some(4),
            Self::bs_fs_yx_bsv8_fsv2 | Self::bs_fs_yx_bsv8_fsv4 => Some(8),
            Self::bs_fs_yx_bsv16_fsv16 => Some(16),
            Self::bs_fs_yx_bsv32_fsv16 | Self::bs_fs_yx_bsv32_fsv32 => Some(32),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_blocked(self) -> bool {
        self.feature_block().is_some() || self.batch_block().is_some()
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MemoryLayout {
    type Err = LayoutError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|layout| layout.name() == raw)
            .ok_or_else(|| LayoutError::UnknownLayout {
                name: raw.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperatorKind {
    Gather,
}

impl OperatorKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Gather => "gather",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineKind {
    Ocl,
    Cpu,
    Common,
}

impl EngineKind {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ocl => "ocl",
            Self::Cpu => "cpu",
            Self::Common => "common",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EngineKind {
    type Err = LayoutError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "ocl" => Ok(Self::Ocl),
            "cpu" => Ok(Self::Cpu),
            "common" => Ok(Self::Common),
            other => Err(LayoutError::UnknownEngine {
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    RankOutOfRange { rank: usize },
    RankExceedsLayout { rank: usize, layout: MemoryLayout },
    UnknownElementType { name: String },
    UnknownLayout { name: String },
    UnknownEngine { name: String },
    ElementCountOverflow { shape: Vec<usize> },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankOutOfRange { rank } => {
                write!(f, "tensor rank {rank} outside 1..={MAX_TENSOR_RANK}")
            }
            Self::RankExceedsLayout { rank, layout } => write!(
                f,
                "tensor rank {rank} exceeds native rank {} of layout {layout}",
                layout.native_rank()
            ),
            Self::UnknownElementType { name } => write!(f, "unknown element type '{name}'"),
            Self::UnknownLayout { name } => write!(f, "unknown memory layout '{name}'"),
            Self::UnknownEngine { name } => write!(f, "unknown engine kind '{name}'"),
            Self::ElementCountOverflow { shape } => {
                write!(f, "element count of shape {shape:?} overflows usize")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

/// Output layout of a tensor as seen by a consumer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutDesc {
    dtype: ElementType,
    layout: MemoryLayout,
    shape: Vec<usize>,
}

impl LayoutDesc {
    /// `shape` is in logical order: batch, feature, then spatial axes from
    /// outermost to innermost.
    pub fn new(
        dtype: ElementType,
        layout: MemoryLayout,
        shape: Vec<usize>,
    ) -> Result<Self, LayoutError> {
        let rank = shape.len();
        if rank == 0 || rank > MAX_TENSOR_RANK {
            return Err(LayoutError::RankOutOfRange { rank });
        }
        if rank > layout.native_rank() {
            return Err(LayoutError::RankExceedsLayout { rank, layout });
        }
        // Zero extents count as one so every partial product stays in range.
        if shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul((*dim).max(1)))
            .is_none()
        {
            return Err(LayoutError::ElementCountOverflow { shape });
        }
        Ok(Self {
            dtype,
            layout,
            shape,
        })
    }

    #[must_use]
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    #[must_use]
    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().copied().product()
    }

    /// Shape widened to the layout's native rank.
    ///
    /// Shapes shorter than 4 gain trailing ones (`[b, f, y]` is `[b, f, y, 1]`).
    /// Further ones go right after the feature axis, so `[b, f, y, x]` in a 5D
    /// layout is `[b, f, 1, y, x]` and the innermost axes keep their names.
    #[must_use]
    pub fn padded_shape(&self) -> Vec<usize> {
        let mut padded = self.shape.clone();
        if padded.len() < 4 {
            padded.resize(4, 1);
        }
        while padded.len() < self.layout.native_rank() {
            padded.insert(2, 1);
        }
        padded
    }

    #[must_use]
    pub fn fingerprint64(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GatherAttrs {
    pub axis: i64,
    pub batch_dim: i64,
    pub support_neg_ind: bool,
}

impl GatherAttrs {
    #[must_use]
    pub fn new(axis: i64) -> Self {
        Self {
            axis,
            batch_dim: 0,
            support_neg_ind: false,
        }
    }

    #[must_use]
    pub fn with_batch_dim(mut self, batch_dim: i64) -> Self {
        self.batch_dim = batch_dim;
        self
    }

    #[must_use]
    pub fn with_negative_indices(mut self, support_neg_ind: bool) -> Self {
        self.support_neg_ind = support_neg_ind;
        self
    }
}

/// A graph node as handed over by the graph compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    id: String,
    kind: OperatorKind,
    attrs: GatherAttrs,
    dependencies: Vec<LayoutDesc>,
    output: LayoutDesc,
}

impl GraphNode {
    #[must_use]
    pub fn gather(
        id: impl Into<String>,
        attrs: GatherAttrs,
        data: LayoutDesc,
        indices: LayoutDesc,
        output: LayoutDesc,
    ) -> Self {
        Self {
            id: id.into(),
            kind: OperatorKind::Gather,
            attrs,
            dependencies: vec![data, indices],
            output,
        }
    }

    #[must_use]
    pub fn with_dependencies(
        id: impl Into<String>,
        kind: OperatorKind,
        attrs: GatherAttrs,
        dependencies: Vec<LayoutDesc>,
        output: LayoutDesc,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            attrs,
            dependencies,
            output,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    #[must_use]
    pub fn attrs(&self) -> &GatherAttrs {
        &self.attrs
    }

    #[must_use]
    pub fn dependencies(&self) -> &[LayoutDesc] {
        &self.dependencies
    }

    #[must_use]
    pub fn dependency(&self, index: usize) -> Option<&LayoutDesc> {
        self.dependencies.get(index)
    }

    #[must_use]
    pub fn output(&self) -> &LayoutDesc {
        &self.output
    }
}

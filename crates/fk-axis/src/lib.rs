#![forbid(unsafe_code)]

use std::fmt;

use fk_core::{LayoutDesc, MAX_TENSOR_RANK};

/// Layout-stable name of a tensor dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysicalAxis {
    Batch,
    Feature,
    W,
    Z,
    Y,
    X,
}

impl PhysicalAxis {
    #[must_use]
    pub const fn all() -> &'static [PhysicalAxis] {
        &[
            PhysicalAxis::Batch,
            PhysicalAxis::Feature,
            PhysicalAxis::W,
            PhysicalAxis::Z,
            PhysicalAxis::Y,
            PhysicalAxis::X,
        ]
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Batch => "BATCH",
            Self::Feature => "FEATURE",
            Self::W => "W",
            Self::Z => "Z",
            Self::Y => "Y",
            Self::X => "X",
        }
    }

    #[must_use]
    pub fn from_label(raw: &str) -> Option<Self> {
        Self::all().iter().copied().find(|axis| axis.label() == raw)
    }

    #[must_use]
    pub const fn is_spatial(self) -> bool {
        !matches!(self, Self::Batch | Self::Feature)
    }

    /// Index of this axis in a shape padded to `native_rank` (see
    /// `LayoutDesc::padded_shape`), or `None` when the layout has no such axis.
    #[must_use]
    pub const fn padded_slot(self, native_rank: usize) -> Option<usize> {
        if native_rank < 4 || native_rank > MAX_TENSOR_RANK {
            return None;
        }
        match self {
            Self::Batch => Some(0),
            Self::Feature => Some(1),
            Self::X => Some(native_rank - 1),
            Self::Y => Some(native_rank - 2),
            Self::Z if native_rank >= 5 => Some(native_rank - 3),
            Self::W if native_rank == 6 => Some(2),
            Self::Z | Self::W => None,
        }
    }
}

impl fmt::Display for PhysicalAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisError {
    Unsupported { axis: i64, rank: usize },
}

impl fmt::Display for AxisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { axis, rank } => {
                write!(f, "unsupported gather axis: {axis} (rank={rank})")
            }
        }
    }
}

impl std::error::Error for AxisError {}

// Negative entries are not a mirror of the positive ones: at ranks 5 and 6,
// -1 resolves to Y, not X. Keep the tables literal.
static RANK4_AXES: [(i64, PhysicalAxis); 5] = [
    (2, PhysicalAxis::Y),
    (3, PhysicalAxis::X),
    (-1, PhysicalAxis::Y),
    (-2, PhysicalAxis::Feature),
    (-3, PhysicalAxis::Batch),
];

static RANK5_AXES: [(i64, PhysicalAxis); 7] = [
    (2, PhysicalAxis::Z),
    (3, PhysicalAxis::Y),
    (4, PhysicalAxis::X),
    (-1, PhysicalAxis::Y),
    (-2, PhysicalAxis::Z),
    (-3, PhysicalAxis::Feature),
    (-4, PhysicalAxis::Batch),
];

static RANK6_AXES: [(i64, PhysicalAxis); 9] = [
    (2, PhysicalAxis::W),
    (3, PhysicalAxis::Z),
    (4, PhysicalAxis::Y),
    (5, PhysicalAxis::X),
    (-1, PhysicalAxis::Y),
    (-2, PhysicalAxis::Z),
    (-3, PhysicalAxis::W),
    (-4, PhysicalAxis::Feature),
    (-5, PhysicalAxis::Batch),
];

fn rank_table(rank: usize) -> Option<&'static [(i64, PhysicalAxis)]> {
    match rank {
        1..=4 => Some(&RANK4_AXES[..]),
        5 => Some(&RANK5_AXES[..]),
        6 => Some(&RANK6_AXES[..]),
        _ => None,
    }
}

/// Maps a logical gather axis onto the physical axis tag for a tensor of
/// `rank` dimensions.
pub fn resolve_gather_axis(axis: i64, rank: usize) -> Result<PhysicalAxis, AxisError> {
    let table = rank_table(rank).ok_or(AxisError::Unsupported { axis, rank })?;
    match axis {
        0 => Ok(PhysicalAxis::Batch),
        1 => Ok(PhysicalAxis::Feature),
        _ => table
            .iter()
            .find(|(logical, _)| *logical == axis)
            .map(|(_, physical)| *physical)
            .ok_or(AxisError::Unsupported { axis, rank }),
    }
}

pub fn resolve_for_layout(axis: i64, layout: &LayoutDesc) -> Result<PhysicalAxis, AxisError> {
    resolve_gather_axis(axis, layout.rank())
}

/// Every logical axis accepted at `rank`, in table order.
#[must_use]
pub fn supported_axes(rank: usize) -> Vec<i64> {
    if rank == 0 || rank > MAX_TENSOR_RANK {
        return Vec::new();
    }
    let mut axes = vec![0, 1];
    if let Some(table) = rank_table(rank) {
        axes.extend(table.iter().map(|(logical, _)| *logical));
    }
    axes
}

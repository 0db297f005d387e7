//! Shared types used across the graph IR, the expander, and the interpreter.
//!
//! Everything in the emitted graphs is statically shaped: a [`Shape`] carries
//! concrete dimension sizes plus an element type, and its `Display` rendering
//! (`f32[2,5,3]`) doubles as the cache key for memoized sub-programs.

use std::fmt;

/// Element type of a tensor value in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Boolean predicate (masks, comparison results).
    Pred,
    /// 32-bit signed integer (iota, loop counters).
    S32,
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Size in bytes per element.
    pub const fn size_bytes(self) -> usize {
        match self {
            Self::Pred => 1,
            Self::F16 | Self::BF16 => 2,
            Self::S32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    pub const fn is_floating(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Round an f64 working value to what this element type can represent.
    ///
    /// The interpreter stores all buffers as f64 and re-rounds after every
    /// operation so that f32/f16 graphs see f32/f16 arithmetic.
    pub fn round(self, value: f64) -> f64 {
        match self {
            Self::Pred => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::S32 => value.trunc(),
            Self::F16 => f64::from(half::f16::from_f64(value)),
            Self::BF16 => f64::from(half::bf16::from_f64(value)),
            Self::F32 => f64::from(value as f32),
            Self::F64 => value,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pred => "pred",
            Self::S32 => "s32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        write!(f, "{name}")
    }
}

/// Statically known shape of a graph value: dimension sizes + element type.
///
/// Zero-sized dimensions are legal; the trailing-column update of the last
/// QR block can be zero-width.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    pub dims: Vec<usize>,
    pub dtype: DType,
}

impl Shape {
    pub fn new(dims: Vec<usize>, dtype: DType) -> Self {
        Shape { dims, dtype }
    }

    pub fn scalar(dtype: DType) -> Self {
        Shape { dims: Vec::new(), dtype }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// All dimensions except the trailing `minor` ones.
    pub fn leading_dims(&self, minor: usize) -> &[usize] {
        &self.dims[..self.rank() - minor]
    }

    /// Batch dimensions of a matrix-shaped value (all but the last two).
    pub fn batch_dims(&self) -> &[usize] {
        self.leading_dims(2)
    }

    pub fn dim(&self, axis: isize) -> usize {
        if axis < 0 {
            self.dims[self.rank() - axis.unsigned_abs()]
        } else {
            self.dims[axis as usize]
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Precision of matrix-multiplication emission.
///
/// `Highest` is a contract for the expander's internal products: the
/// orthogonality of `Q` degrades measurably under `Default` accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Precision {
    #[default]
    Default,
    Highest,
}

/// Errors from graph construction, expansion, and interpretation.
#[derive(Debug)]
pub enum ExpandError {
    /// The caller handed the expander something malformed: an operand of
    /// rank < 2, a block size < 1, or mismatched shapes/types to a builder.
    InvalidArgument(String),
    /// A bug in the compiler itself; propagated unchanged, never recovered.
    Internal(String),
}

impl fmt::Display for ExpandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(s) => write!(f, "invalid argument: {s}"),
            Self::Internal(s) => write!(f, "internal error: {s}"),
        }
    }
}

impl std::error::Error for ExpandError {}

pub type ExpandResult<T> = Result<T, ExpandError>;

//! qr-expander: blocked Householder QR expansion for a static-shape tensor
//! graph compiler.
//!
//! The compiler receives a program graph in which matrix factorizations
//! appear as opaque custom operations; this crate's pass replaces each
//! `"QrDecomposition"` node with an equivalent sub-graph of primitive
//! tensor operations computing `A = Q · R` (Q orthogonal, R upper-
//! triangular) for `A` of shape `[..., m, n]`, batched and with static
//! shapes at every node.
//!
//! # Pipeline
//!
//! ```text
//! Module (entry graph with QR custom ops)
//!   → QrExpander::run
//!       → pattern match "QrDecomposition"
//!       → emit blocked Householder QR (Compact-WY) per operand shape
//!       → memoize sub-program by shape signature, rewrite node to a call
//! Module (entry graph with calls into installed sub-programs)
//! ```
//!
//! The emitted sub-graph uses fixed-trip-count loops and index-tensor
//! masking in place of loop-variant slicing, so every node keeps a static
//! shape. Execution of the result belongs to the downstream compiler; the
//! [`interp`] module provides a reference evaluator so tests can run the
//! emitted graphs on concrete inputs.

pub mod build;
pub mod expander;
pub mod graph;
pub mod interp;
pub mod module;
pub mod types;

pub use expander::{build_qr_subprogram, ExpanderOptions, QrExpander, QR_CUSTOM_OP_TARGET};
pub use graph::{Graph, Node, NodeId, OpKind, ValueId};
pub use interp::{Interpreter, Tensor};
pub use module::{Module, Subprogram};
pub use types::{DType, ExpandError, ExpandResult, Precision, Shape};

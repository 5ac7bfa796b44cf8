//! Host IR for the kiln fusion compiler.
//!
//! Provides the operation-graph substrate the lowering pass consumes:
//! arena-indexed operations and values with O(1) use-list iteration,
//! in-place erase and use-rewiring, plus tensor types and the symbolic
//! shape-analysis oracle.

pub mod graph;
pub mod shape;
pub mod types;

pub use graph::{FusionGraph, OpBuilder, OpCategory, OpId, OpKind, OpNode, Use, Value};
pub use shape::{const_shape, DimExpr, ShapeAnalysis, ShapeOrData};
pub use types::{DType, KernelHandle, TensorType};

//! Symbolic shape/data expressions and the shape-analysis oracle.
//!
//! Every value in a program may carry a [`ShapeOrData`] expression: a
//! sequence of dimension expressions describing its extent, and optionally a
//! concrete data expression when the value's *contents* are symbolically
//! known (the common case is the shape operand of a broadcast, whose payload
//! is itself a shape).
//!
//! Shape information is supplied by an upstream inference stage and queried
//! through [`ShapeAnalysis`]. Absence of an entry means "unknown" and is
//! never an error.

use crate::graph::Value;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One symbolic dimension: a constant extent or a named symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimExpr {
    Const(i64),
    Sym(String),
}

impl DimExpr {
    pub fn sym(name: impl Into<String>) -> Self {
        DimExpr::Sym(name.into())
    }
}

impl fmt::Display for DimExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimExpr::Const(c) => write!(f, "{}", c),
            DimExpr::Sym(s) => f.write_str(s),
        }
    }
}

/// Build a shape vector from constant extents.
pub fn const_shape(dims: &[i64]) -> Vec<DimExpr> {
    dims.iter().map(|&d| DimExpr::Const(d)).collect()
}

/// Symbolic shape of a value, with an optional concrete data expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeOrData {
    shape: Vec<DimExpr>,
    data: Option<Vec<DimExpr>>,
}

impl ShapeOrData {
    /// A value whose shape is known but whose contents are not.
    pub fn shape_only(shape: Vec<DimExpr>) -> Self {
        Self { shape, data: None }
    }

    /// A value whose contents are symbolically known (e.g. a shape tensor).
    pub fn with_data(shape: Vec<DimExpr>, data: Vec<DimExpr>) -> Self {
        Self {
            shape,
            data: Some(data),
        }
    }

    pub fn shape(&self) -> &[DimExpr] {
        &self.shape
    }

    pub fn data(&self) -> Option<&[DimExpr]> {
        self.data.as_deref()
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }
}

/// Shape-inference oracle: a table from values to their symbolic shapes.
///
/// Populated by whatever inference ran before lowering; the lowering pass
/// only reads it. Lookups return `Option` — a missing entry is "unknown".
#[derive(Debug, Default)]
pub struct ShapeAnalysis {
    values: AHashMap<Value, ShapeOrData>,
}

impl ShapeAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, value: Value, expr: ShapeOrData) {
        self.values.insert(value, expr);
    }

    pub fn contains(&self, value: Value) -> bool {
        self.values.contains_key(&value)
    }

    pub fn get(&self, value: Value) -> Option<&ShapeOrData> {
        self.values.get(&value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

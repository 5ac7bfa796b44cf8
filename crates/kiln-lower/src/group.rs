//! Fusion groups: the unit of kernel compilation.

use ahash::AHashMap;
use kiln_ir::{FusionGraph, OpCategory, OpId, ShapeAnalysis, ShapeOrData, Value};

/// A fusable cluster of region operations.
///
/// Non-owning: `ops` references operations that stay in the region until the
/// rewrite that consumes this group erases them. `output_values` is the
/// ordered set of results that must stay externally visible — consumed by the
/// region's yield or by region operations outside the group — and fixes the
/// result signature of the compiled kernel.
#[derive(Debug, Clone)]
pub struct Group {
    id: usize,
    pub ops: Vec<OpId>,
    pub output_values: Vec<Value>,
    /// Dominant fusion pattern of the member operations.
    pub kind: OpCategory,
    /// Symbolic shape expressions for every value the group touches, valid
    /// for the lifetime of the group.
    pub value_shapes: AHashMap<Value, ShapeOrData>,
}

impl Group {
    pub fn new(id: usize, ops: Vec<OpId>, output_values: Vec<Value>, kind: OpCategory) -> Self {
        Self {
            id,
            ops,
            output_values,
            kind,
            value_shapes: AHashMap::new(),
        }
    }

    /// Diagnostic name, also used as the kernel symbol stem.
    pub fn name(&self) -> String {
        format!("fusion_group_{}", self.id)
    }

    pub fn contains(&self, op: OpId) -> bool {
        self.ops.contains(&op)
    }

    /// Record shape expressions for every operand and result the group
    /// touches. Operands first, then results; results already recorded are
    /// not overwritten. Values the oracle does not know stay unmapped.
    pub fn record_shapes(&mut self, graph: &FusionGraph, analysis: &ShapeAnalysis) {
        for &op in &self.ops {
            for &operand in graph.operands(op) {
                if let Some(expr) = analysis.get(operand) {
                    self.value_shapes
                        .entry(operand)
                        .or_insert_with(|| expr.clone());
                }
            }
            for slot in 0..graph.op(op).num_results() {
                let result = graph.result(op, slot as u8);
                if !self.value_shapes.contains_key(&result) {
                    if let Some(expr) = analysis.get(result) {
                        self.value_shapes.insert(result, expr.clone());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::{const_shape, OpKind, TensorType};

    #[test]
    fn test_record_shapes_skips_unknown_and_keeps_existing() {
        let mut g = FusionGraph::new();
        let a = g
            .build("a", OpKind::Compute(OpCategory::Opaque))
            .result(TensorType::f32(&[4]))
            .finish_top();
        let av = g.result(a, 0);
        let relu = g
            .build("relu", OpKind::Compute(OpCategory::Elementwise))
            .operand(av)
            .result(TensorType::f32(&[4]))
            .finish_top();
        let reluv = g.result(relu, 0);

        let mut analysis = ShapeAnalysis::new();
        analysis.set(av, ShapeOrData::shape_only(const_shape(&[4])));
        // No entry for relu's result: it must stay unmapped.

        let mut group = Group::new(0, vec![relu], vec![reluv], OpCategory::Elementwise);
        group.record_shapes(&g, &analysis);

        assert!(group.value_shapes.contains_key(&av));
        assert!(!group.value_shapes.contains_key(&reluv));

        // A second pass must not change anything.
        let before = group.value_shapes.len();
        group.record_shapes(&g, &analysis);
        assert_eq!(group.value_shapes.len(), before);
    }
}

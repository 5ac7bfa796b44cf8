//! Redundant-broadcast elimination.
//!
//! An expand op is a no-op when it broadcasts a value to the shape it
//! already has: the input carries no concrete data, the shape operand's
//! contents are statically known, and the input's symbolic shape equals the
//! declared output shape. Such expands are rewired away together with the
//! shape-generator ops that fed them, repeating until none is left.

use kiln_ir::{FusionGraph, OpId, ShapeAnalysis};
use tracing::debug;

use crate::{LoweringError, Result};

/// Remove every provably-redundant expand from `region`, to fixpoint.
/// Returns the number of expands removed; zero is not an error.
pub fn erase_redundant_expands(
    graph: &mut FusionGraph,
    region: OpId,
    analysis: &ShapeAnalysis,
) -> Result<usize> {
    let mut removed = 0;
    while erase_one_expand(graph, region, analysis)? {
        removed += 1;
    }
    if removed > 0 {
        debug!(removed, "erased redundant expand operations");
    }
    Ok(removed)
}

/// Erase the first removable expand found, if any. Returns whether the
/// region changed.
fn erase_one_expand(
    graph: &mut FusionGraph,
    region: OpId,
    analysis: &ShapeAnalysis,
) -> Result<bool> {
    let Some(expand) = find_removable_expand(graph, region, analysis)? else {
        return Ok(false);
    };

    let input = graph.operands(expand)[0];
    let shape_operand = graph.operands(expand)[1];
    let shape_source = shape_operand.op;
    if !graph.op(shape_source).kind.is_shape_source() {
        return Err(LoweringError::InvariantViolation(format!(
            "shape operand of expand `{}` is not produced by a shape-source operation",
            graph.op(expand).label
        )));
    }

    let output = graph.result(expand, 0);
    graph.replace_all_uses_with(output, input);
    graph.erase_op(expand)?;

    // The shape source may feed other expands; only a now-unused one goes.
    if !graph.is_used(graph.result(shape_source, 0))
        && graph.region_body(region)?.contains(&shape_source)
    {
        graph.erase_op(shape_source)?;
    }
    Ok(true)
}

/// Scan the region body for the first expand whose removal conditions all
/// hold. `None` means the simplifier has nothing left to do.
fn find_removable_expand(
    graph: &FusionGraph,
    region: OpId,
    analysis: &ShapeAnalysis,
) -> Result<Option<OpId>> {
    for &op in graph.region_body(region)? {
        if !graph.op(op).kind.is_expand() {
            continue;
        }
        if is_identity_expand(graph, op, analysis)? {
            return Ok(Some(op));
        }
    }
    Ok(None)
}

fn is_identity_expand(graph: &FusionGraph, expand: OpId, analysis: &ShapeAnalysis) -> Result<bool> {
    let operands = graph.operands(expand);
    if operands.len() != 2 {
        return Err(LoweringError::InvariantViolation(format!(
            "expand `{}` must have exactly an input and a shape operand",
            graph.op(expand).label
        )));
    }

    let (Some(input), Some(shape), Some(output)) = (
        analysis.get(operands[0]),
        analysis.get(operands[1]),
        analysis.get(graph.result(expand, 0)),
    ) else {
        // Unknown shape info never makes a candidate; it is not an error.
        return Ok(false);
    };

    if input.has_data() || output.has_data() {
        return Ok(false);
    }
    let Some(target) = shape.data() else {
        return Ok(false);
    };
    if target != output.shape() {
        return Err(LoweringError::InvariantViolation(format!(
            "expand `{}` declares a target shape that disagrees with its result shape",
            graph.op(expand).label
        )));
    }
    Ok(input.shape() == output.shape())
}

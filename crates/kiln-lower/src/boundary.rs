//! Boundary analysis: which values cross a group's edge.
//!
//! Pure functions over the graph; nothing here mutates.

use kiln_ir::{FusionGraph, OpId, Value};
use rustc_hash::FxHashSet;

use crate::{LoweringError, Result};

/// Ordered, deduplicated operand values of `ops` whose defining operation is
/// not itself in `ops`. Order is first encounter, scanning `ops` in sequence
/// and each operation's operands in sequence.
pub fn external_inputs(graph: &FusionGraph, ops: &[OpId]) -> Vec<Value> {
    let mut inner_results: FxHashSet<Value> = FxHashSet::default();
    for &op in ops {
        for slot in 0..graph.op(op).num_results() {
            inner_results.insert(graph.result(op, slot as u8));
        }
    }

    let mut seen: FxHashSet<Value> = FxHashSet::default();
    let mut inputs = Vec::new();
    for &op in ops {
        for &operand in graph.operands(op) {
            if !inner_results.contains(&operand) && seen.insert(operand) {
                inputs.push(operand);
            }
        }
    }
    inputs
}

/// Ordered result values produced within `ops` that stay externally visible:
/// consumed by the region's terminal yield, or consumed by a region
/// operation outside `ops`.
///
/// `region_ops` is the full body of the enclosing region and must contain at
/// least one operation besides its terminator, with the yield last.
pub fn external_outputs(
    graph: &FusionGraph,
    ops: &[OpId],
    region_ops: &[OpId],
) -> Result<Vec<Value>> {
    if region_ops.len() < 2 {
        return Err(LoweringError::InvariantViolation(
            "region must contain at least one operation besides its terminator".into(),
        ));
    }
    let terminator = region_ops[region_ops.len() - 1];
    if !graph.op(terminator).kind.is_yield() {
        return Err(LoweringError::InvariantViolation(
            "region is not terminated by a yield operation".into(),
        ));
    }

    let yielded: FxHashSet<Value> = graph.operands(terminator).iter().copied().collect();
    let inner: FxHashSet<OpId> = ops.iter().copied().collect();
    let outside: FxHashSet<OpId> = region_ops
        .iter()
        .copied()
        .filter(|op| !inner.contains(op))
        .collect();

    let mut outputs = Vec::new();
    for &op in ops {
        for slot in 0..graph.op(op).num_results() {
            let result = graph.result(op, slot as u8);
            if yielded.contains(&result) {
                outputs.push(result);
                continue;
            }
            if graph
                .uses(result)
                .iter()
                .any(|u| outside.contains(&u.consumer))
            {
                outputs.push(result);
            }
        }
    }
    Ok(outputs)
}

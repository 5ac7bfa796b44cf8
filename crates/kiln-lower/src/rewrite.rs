// Group rewriting
//
// Replaces each compiled group with a single kernel-call operation. The
// rewriter is created once per region and threads two pieces of state across
// the groups of that region: the value substitution map (an earlier group's
// output value → its kernel-call result) and the yield-position table that
// connects group outputs to the region container's results. Both die with
// the pass invocation.

use kiln_ir::{FusionGraph, KernelHandle, OpId, OpKind, TensorType, Value};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::boundary;
use crate::group::Group;
use crate::{LoweringError, Result};

pub struct GroupRewriter {
    region: OpId,
    /// Earlier-group output value → kernel-call result.
    value_map: FxHashMap<Value, Value>,
    /// Yield operand value → its position in the region's result list.
    yield_pos: FxHashMap<Value, usize>,
}

impl GroupRewriter {
    /// Capture the yield-position table before any rewriting happens.
    pub fn new(graph: &FusionGraph, region: OpId) -> Result<Self> {
        let body = graph.region_body(region)?;
        let Some(&terminator) = body.last() else {
            return Err(LoweringError::InvariantViolation(
                "region body is empty".into(),
            ));
        };
        if !graph.op(terminator).kind.is_yield() {
            return Err(LoweringError::InvariantViolation(
                "region is not terminated by a yield operation".into(),
            ));
        }
        let yield_pos = graph
            .operands(terminator)
            .iter()
            .enumerate()
            .map(|(pos, &value)| (value, pos))
            .collect();
        Ok(Self {
            region,
            value_map: FxHashMap::default(),
            yield_pos,
        })
    }

    /// Replace one compiled group with a kernel-call operation.
    ///
    /// Boundary inputs are remapped through the substitution map, the call
    /// is inserted just before the region container, and every container
    /// result whose yield position matches one of the group's outputs is
    /// redirected to the corresponding kernel result.
    pub fn rewrite_group(
        &mut self,
        graph: &mut FusionGraph,
        group: &Group,
        kernel: KernelHandle,
    ) -> Result<OpId> {
        let mut inputs = boundary::external_inputs(graph, &group.ops);
        for value in &mut inputs {
            if let Some(&mapped) = self.value_map.get(value) {
                *value = mapped;
            }
        }

        let result_types: Vec<TensorType> = group
            .output_values
            .iter()
            .map(|&v| graph.value_type(v).clone())
            .collect();
        if kernel.result_types != result_types {
            return Err(LoweringError::InvariantViolation(format!(
                "kernel `{}` signature does not match the outputs of `{}`",
                kernel.symbol,
                group.name()
            )));
        }

        trace!(
            group = %group.name(),
            inputs = inputs.len(),
            outputs = group.output_values.len(),
            "rewriting group to kernel call"
        );

        let mut builder = graph.build(group.name(), OpKind::KernelCall { kernel });
        builder = builder.operands(inputs);
        for ty in result_types {
            builder = builder.result(ty);
        }
        let call = builder.finish();
        graph.insert_top_before(self.region, call)?;

        for (slot, &output) in group.output_values.iter().enumerate() {
            let new_value = graph.result(call, slot as u8);
            if let Some(&pos) = self.yield_pos.get(&output) {
                graph.replace_all_uses_with(graph.result(self.region, pos as u8), new_value);
            }
            self.value_map.insert(output, new_value);
        }
        Ok(call)
    }

    /// Erase the region container once every group has been rewritten. Any
    /// container result that still has uses was never rewired, which means
    /// a group failed to cover it.
    pub fn finish(self, graph: &mut FusionGraph) -> Result<()> {
        for slot in 0..graph.op(self.region).num_results() {
            if graph.is_used(graph.result(self.region, slot as u8)) {
                return Err(LoweringError::InvariantViolation(format!(
                    "region result {} was not rewired to a kernel call",
                    slot
                )));
            }
        }
        graph.erase_region(self.region)?;
        Ok(())
    }
}

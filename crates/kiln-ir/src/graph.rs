// Operation graph for fusion lowering
//
// Arena-indexed IR: operations live in a petgraph StableGraph owned by the
// FusionGraph, values are (operation, result slot) pairs, and use-lists are
// the graph's slot-carrying edges. Back-references are indices throughout;
// nothing owns anything across the graph boundary.
//
// Blocks are ordered operation sequences: the module-level top block belongs
// to the FusionGraph, inner blocks to FusionRegion operations. Every inner
// block is terminated by exactly one Yield operation whose operands are the
// region's declared outputs; the region container's results mirror those
// operands one-to-one.

use anyhow::{anyhow, bail, Result};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use std::fmt::Write as _;

use crate::types::{KernelHandle, TensorType};

/// Arena index of one operation.
pub type OpId = NodeIndex;

/// One output of an operation: its defining op plus the result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value {
    pub op: OpId,
    pub slot: u8,
}

impl Value {
    pub fn new(op: OpId, slot: u8) -> Self {
        Self { op, slot }
    }
}

/// Fusion category of a compute operation.
///
/// Ordered by fusion precedence: when two clusters merge, the merged cluster
/// takes the higher category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpCategory {
    Elementwise,
    Broadcast,
    Injective,
    Reduction,
    Opaque,
}

/// Discriminated operation kind.
#[derive(Debug, Clone)]
pub enum OpKind {
    /// Ordinary compute op with a fusion category.
    Compute(OpCategory),
    /// Shape-broadcast op: operand 0 is the input, operand 1 the target
    /// shape value, one result.
    Expand,
    /// Shape-generator op: produces a data-carrying shape value.
    ShapeSource,
    /// Terminal op of a block; operands are the block's declared outputs.
    Yield,
    /// Group container owning an ordered inner block. Its results mirror
    /// the inner yield's operands.
    FusionRegion { body: Vec<OpId> },
    /// Invocation of a compiled kernel.
    KernelCall { kernel: KernelHandle },
}

impl OpKind {
    pub fn is_yield(&self) -> bool {
        matches!(self, OpKind::Yield)
    }

    pub fn is_expand(&self) -> bool {
        matches!(self, OpKind::Expand)
    }

    pub fn is_shape_source(&self) -> bool {
        matches!(self, OpKind::ShapeSource)
    }

    pub fn is_fusion_region(&self) -> bool {
        matches!(self, OpKind::FusionRegion { .. })
    }

    pub fn is_kernel_call(&self) -> bool {
        matches!(self, OpKind::KernelCall { .. })
    }

    /// Short kind name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Compute(_) => "compute",
            OpKind::Expand => "expand",
            OpKind::ShapeSource => "shape_source",
            OpKind::Yield => "yield",
            OpKind::FusionRegion { .. } => "fusion_region",
            OpKind::KernelCall { .. } => "kernel_call",
        }
    }

    /// Category used by the clusterer. Shape sources count as injective
    /// (pure index arithmetic); everything non-fusable is opaque.
    pub fn category(&self) -> OpCategory {
        match self {
            OpKind::Compute(c) => *c,
            OpKind::Expand => OpCategory::Broadcast,
            OpKind::ShapeSource => OpCategory::Injective,
            _ => OpCategory::Opaque,
        }
    }
}

/// A node in the operation arena.
#[derive(Debug, Clone)]
pub struct OpNode {
    /// Diagnostic label, e.g. `"add"`, `"expand"`.
    pub label: String,
    pub kind: OpKind,
    operands: Vec<Value>,
    result_types: Vec<TensorType>,
}

impl OpNode {
    pub fn operands(&self) -> &[Value] {
        &self.operands
    }

    pub fn result_types(&self) -> &[TensorType] {
        &self.result_types
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    pub fn num_results(&self) -> usize {
        self.result_types.len()
    }
}

/// Use edge: producer result slot → consumer operand slot.
#[derive(Debug, Clone, Copy)]
struct UseEdge {
    result_slot: u8,
    operand_slot: u8,
}

/// One recorded use of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Use {
    pub consumer: OpId,
    pub operand_slot: u8,
}

/// The program graph: an operation arena plus the module-level block.
pub struct FusionGraph {
    graph: StableGraph<OpNode, UseEdge>,
    top: Vec<OpId>,
}

impl FusionGraph {
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            top: Vec::new(),
        }
    }

    /// Start building a new operation.
    pub fn build(&mut self, label: impl Into<String>, kind: OpKind) -> OpBuilder<'_> {
        OpBuilder {
            graph: self,
            node: OpNode {
                label: label.into(),
                kind,
                operands: Vec::new(),
                result_types: Vec::new(),
            },
        }
    }

    fn insert(&mut self, node: OpNode) -> OpId {
        let operands = node.operands.clone();
        let id = self.graph.add_node(node);
        for (slot, value) in operands.iter().enumerate() {
            self.graph.add_edge(
                value.op,
                id,
                UseEdge {
                    result_slot: value.slot,
                    operand_slot: slot as u8,
                },
            );
        }
        id
    }

    pub fn op(&self, id: OpId) -> &OpNode {
        &self.graph[id]
    }

    pub fn contains_op(&self, id: OpId) -> bool {
        self.graph.node_weight(id).is_some()
    }

    pub fn op_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn result(&self, op: OpId, slot: u8) -> Value {
        Value::new(op, slot)
    }

    pub fn operands(&self, op: OpId) -> &[Value] {
        self.graph[op].operands()
    }

    pub fn value_type(&self, value: Value) -> &TensorType {
        &self.graph[value.op].result_types[value.slot as usize]
    }

    pub fn top_block(&self) -> &[OpId] {
        &self.top
    }

    pub fn push_top(&mut self, op: OpId) {
        self.top.push(op);
    }

    /// Insert `op` into the top block immediately before `anchor`.
    pub fn insert_top_before(&mut self, anchor: OpId, op: OpId) -> Result<()> {
        let pos = self
            .top
            .iter()
            .position(|&o| o == anchor)
            .ok_or_else(|| anyhow!("anchor operation is not in the top block"))?;
        self.top.insert(pos, op);
        Ok(())
    }

    /// Wrap `body` into a FusionRegion container and append it to the top
    /// block. The body must be terminated by exactly one yield, last; the
    /// container's result types are taken from the yield's operands.
    pub fn make_region(&mut self, label: impl Into<String>, body: Vec<OpId>) -> Result<OpId> {
        let Some(&terminator) = body.last() else {
            bail!("fusion region body is empty");
        };
        if !self.op(terminator).kind.is_yield() {
            bail!("fusion region body is not terminated by a yield");
        }
        if body[..body.len() - 1].iter().any(|&op| self.op(op).kind.is_yield()) {
            bail!("fusion region body contains more than one yield");
        }
        let result_types: Vec<TensorType> = self
            .operands(terminator)
            .iter()
            .map(|&v| self.value_type(v).clone())
            .collect();
        let id = self.insert(OpNode {
            label: label.into(),
            kind: OpKind::FusionRegion { body },
            operands: Vec::new(),
            result_types,
        });
        self.top.push(id);
        Ok(id)
    }

    pub fn region_body(&self, region: OpId) -> Result<&[OpId]> {
        match &self.op(region).kind {
            OpKind::FusionRegion { body } => Ok(body),
            _ => Err(anyhow!(
                "operation `{}` is not a fusion region",
                self.op(region).label
            )),
        }
    }

    /// All uses of `value` across the graph.
    pub fn uses(&self, value: Value) -> Vec<Use> {
        self.graph
            .edges_directed(value.op, Direction::Outgoing)
            .filter(|e| e.weight().result_slot == value.slot)
            .map(|e| Use {
                consumer: e.target(),
                operand_slot: e.weight().operand_slot,
            })
            .collect()
    }

    pub fn use_count(&self, value: Value) -> usize {
        self.graph
            .edges_directed(value.op, Direction::Outgoing)
            .filter(|e| e.weight().result_slot == value.slot)
            .count()
    }

    pub fn is_used(&self, value: Value) -> bool {
        self.use_count(value) > 0
    }

    /// Rewire every use of `from` to read `to` instead.
    pub fn replace_all_uses_with(&mut self, from: Value, to: Value) {
        if from == to {
            return;
        }
        // Collect edge ids first; retargeting mutates the edge set.
        let edges: Vec<(EdgeIndex, OpId, u8)> = self
            .graph
            .edges_directed(from.op, Direction::Outgoing)
            .filter(|e| e.weight().result_slot == from.slot)
            .map(|e| (e.id(), e.target(), e.weight().operand_slot))
            .collect();
        for (edge, consumer, slot) in edges {
            self.graph.remove_edge(edge);
            self.graph[consumer].operands[slot as usize] = to;
            self.graph.add_edge(
                to.op,
                consumer,
                UseEdge {
                    result_slot: to.slot,
                    operand_slot: slot,
                },
            );
        }
    }

    /// Erase one operation. Fails while any of its results is still used.
    pub fn erase_op(&mut self, op: OpId) -> Result<()> {
        let node = self.op(op);
        for slot in 0..node.num_results() {
            if self.is_used(Value::new(op, slot as u8)) {
                bail!(
                    "cannot erase `{}`: result {} still has uses",
                    self.op(op).label,
                    slot
                );
            }
        }
        self.detach_from_blocks(op);
        self.graph.remove_node(op);
        Ok(())
    }

    /// Erase a FusionRegion container together with its entire body.
    ///
    /// Every container result must already be rewired away; body-internal
    /// uses disappear with the body.
    pub fn erase_region(&mut self, region: OpId) -> Result<()> {
        let body = self.region_body(region)?.to_vec();
        for slot in 0..self.op(region).num_results() {
            if self.is_used(Value::new(region, slot as u8)) {
                bail!(
                    "cannot erase region `{}`: result {} still has uses",
                    self.op(region).label,
                    slot
                );
            }
        }
        for &op in body.iter().rev() {
            self.graph.remove_node(op);
        }
        self.top.retain(|&o| o != region);
        self.graph.remove_node(region);
        Ok(())
    }

    fn detach_from_blocks(&mut self, op: OpId) {
        if let Some(pos) = self.top.iter().position(|&o| o == op) {
            self.top.remove(pos);
            return;
        }
        let regions: Vec<OpId> = self
            .top
            .iter()
            .copied()
            .filter(|&r| self.op(r).kind.is_fusion_region())
            .collect();
        for region in regions {
            if let OpKind::FusionRegion { body } = &mut self.graph[region].kind {
                if let Some(pos) = body.iter().position(|&o| o == op) {
                    body.remove(pos);
                    return;
                }
            }
        }
    }

    /// Export to Graphviz DOT format.
    pub fn to_dot(&self) -> String {
        let mut dot = String::new();
        writeln!(&mut dot, "digraph FusionGraph {{").unwrap();
        writeln!(&mut dot, "  rankdir=TB;").unwrap();
        writeln!(&mut dot, "  node [shape=box, style=rounded];").unwrap();
        for id in self.graph.node_indices() {
            let node = &self.graph[id];
            writeln!(
                &mut dot,
                "  op{} [label=\"{}\\n{}\"];",
                id.index(),
                node.label,
                node.kind.name()
            )
            .unwrap();
        }
        for edge in self.graph.edge_references() {
            writeln!(
                &mut dot,
                "  op{} -> op{} [label=\"r{}→a{}\"];",
                edge.source().index(),
                edge.target().index(),
                edge.weight().result_slot,
                edge.weight().operand_slot
            )
            .unwrap();
        }
        writeln!(&mut dot, "}}").unwrap();
        dot
    }
}

impl Default for FusionGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for adding operations to the graph.
pub struct OpBuilder<'a> {
    graph: &'a mut FusionGraph,
    node: OpNode,
}

impl<'a> OpBuilder<'a> {
    /// Append one operand.
    pub fn operand(mut self, value: Value) -> Self {
        self.node.operands.push(value);
        self
    }

    /// Append several operands in order.
    pub fn operands(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        self.node.operands.extend(values);
        self
    }

    /// Append one result type.
    pub fn result(mut self, ty: TensorType) -> Self {
        self.node.result_types.push(ty);
        self
    }

    /// Finish building; the op belongs to no block yet.
    pub fn finish(self) -> OpId {
        self.graph.insert(self.node)
    }

    /// Finish building and append to the top block.
    pub fn finish_top(self) -> OpId {
        let OpBuilder { graph, node } = self;
        let id = graph.insert(node);
        graph.top.push(id);
        id
    }
}

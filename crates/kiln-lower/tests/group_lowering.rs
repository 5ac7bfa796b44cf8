//! End-to-end tests for the group-lowering pass.
//!
//! Each test builds a small module with a fusion region, runs the pass with
//! a recording stub backend, and checks the rewritten graph: kernel-call
//! wiring, result ordering, boundary correctness and failure behavior.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use kiln_ir::{
    const_shape, DimExpr, FusionGraph, KernelHandle, OpCategory, OpId, OpKind, ShapeAnalysis,
    ShapeOrData, TensorType, Value,
};
use kiln_lower::{
    cluster, ArtifactStore, Group, GroupLoweringPass, KernelCompiler, LoweringError, Result,
    TargetDescriptor,
};

/// Backend stub: records compiled groups in order, interns one shared
/// constant blob per kernel, and can be told to fail on the n-th call.
struct StubCompiler {
    log: Rc<RefCell<Vec<String>>>,
    calls: usize,
    fail_on_call: Option<usize>,
}

impl StubCompiler {
    fn new() -> Self {
        Self {
            log: Rc::new(RefCell::new(Vec::new())),
            calls: 0,
            fail_on_call: None,
        }
    }

    fn with_log(log: Rc<RefCell<Vec<String>>>) -> Self {
        Self {
            log,
            calls: 0,
            fail_on_call: None,
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            log: Rc::new(RefCell::new(Vec::new())),
            calls: 0,
            fail_on_call: Some(call),
        }
    }
}

impl KernelCompiler for StubCompiler {
    fn compile(
        &mut self,
        graph: &FusionGraph,
        group: &Group,
        _target: &TargetDescriptor,
        store: &mut ArtifactStore,
    ) -> Result<KernelHandle> {
        self.calls += 1;
        if self.fail_on_call == Some(self.calls) {
            return Err(LoweringError::CompilationFailure {
                group: group.name(),
                reason: "unsupported operator combination".into(),
            });
        }
        let artifact = store.intern(b"shared-weights");
        self.log.borrow_mut().push(group.name());
        let result_types = group
            .output_values
            .iter()
            .map(|&v| graph.value_type(v).clone())
            .collect();
        Ok(KernelHandle::new(group.name(), artifact, result_types))
    }
}

fn param(g: &mut FusionGraph, name: &str, dims: &[i64]) -> Value {
    let op = g
        .build(name, OpKind::Compute(OpCategory::Opaque))
        .result(TensorType::f32(dims))
        .finish_top();
    g.result(op, 0)
}

fn kernel_calls(g: &FusionGraph) -> Vec<OpId> {
    g.top_block()
        .iter()
        .copied()
        .filter(|&op| g.op(op).kind.is_kernel_call())
        .collect()
}

#[test]
fn test_single_group_lowered_to_one_kernel_call() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[4]);
    let b = param(&mut g, "b", &[4]);
    let d = param(&mut g, "d", &[4]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(b)
        .result(TensorType::f32(&[4]))
        .finish();
    let c = g.result(add, 0);
    let mul = g
        .build("mul", OpKind::Compute(OpCategory::Elementwise))
        .operand(c)
        .operand(d)
        .result(TensorType::f32(&[4]))
        .finish();
    let e = g.result(mul, 0);
    let yld = g.build("yield", OpKind::Yield).operand(e).finish();
    let region = g.make_region("fused_0", vec![add, mul, yld]).unwrap();
    let region_out = g.result(region, 0);
    let sink = g
        .build("sink", OpKind::Compute(OpCategory::Opaque))
        .operand(region_out)
        .result(TensorType::f32(&[4]))
        .finish_top();

    let analysis = ShapeAnalysis::new();
    let mut pass = GroupLoweringPass::new(&analysis, StubCompiler::new(), TargetDescriptor::default_gpu());
    assert!(pass.can_apply_on(&g));
    let stats = pass.run(&mut g).unwrap();

    assert_eq!(stats.regions_lowered, 1);
    assert_eq!(stats.groups_formed, 1);
    assert_eq!(stats.kernels_compiled, 1);
    assert_eq!(stats.expands_removed, 0);

    let calls = kernel_calls(&g);
    assert_eq!(calls.len(), 1);
    let call = calls[0];
    assert_eq!(g.operands(call), &[a, b, d]);
    assert_eq!(g.op(call).num_results(), 1);
    // The outer consumer reads the kernel result and the region is gone.
    assert_eq!(g.operands(sink)[0], g.result(call, 0));
    assert!(!g.contains_op(region));
}

#[test]
fn test_identity_expand_simplified_before_clustering() {
    let mut g = FusionGraph::new();
    let x = param(&mut g, "x", &[-1, 4]);
    let shape_src = g
        .build("gen_shape", OpKind::ShapeSource)
        .operand(x)
        .result(TensorType::i64(&[2]))
        .finish();
    let s = g.result(shape_src, 0);
    let expand = g
        .build("expand", OpKind::Expand)
        .operand(x)
        .operand(s)
        .result(TensorType::f32(&[-1, 4]))
        .finish();
    let y = g.result(expand, 0);
    let relu = g
        .build("relu", OpKind::Compute(OpCategory::Elementwise))
        .operand(y)
        .result(TensorType::f32(&[-1, 4]))
        .finish();
    let z = g.result(relu, 0);
    let yld = g.build("yield", OpKind::Yield).operand(z).finish();
    let region = g
        .make_region("fused_0", vec![shape_src, expand, relu, yld])
        .unwrap();
    let region_out = g.result(region, 0);
    let _sink = g
        .build("sink", OpKind::Compute(OpCategory::Opaque))
        .operand(region_out)
        .result(TensorType::f32(&[-1, 4]))
        .finish_top();

    let dims = vec![DimExpr::sym("S0"), DimExpr::Const(4)];
    let mut analysis = ShapeAnalysis::new();
    analysis.set(x, ShapeOrData::shape_only(dims.clone()));
    analysis.set(s, ShapeOrData::with_data(const_shape(&[2]), dims.clone()));
    analysis.set(y, ShapeOrData::shape_only(dims));

    let mut pass = GroupLoweringPass::new(&analysis, StubCompiler::new(), TargetDescriptor::default_gpu());
    let stats = pass.run(&mut g).unwrap();

    assert_eq!(stats.expands_removed, 1);
    assert_eq!(stats.groups_formed, 1);

    // Only relu survived into the kernel; its boundary input is x itself.
    let calls = kernel_calls(&g);
    assert_eq!(calls.len(), 1);
    assert_eq!(g.operands(calls[0]), &[x]);
}

#[test]
fn test_later_group_reads_earlier_kernel_result() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[4]);
    let b = param(&mut g, "b", &[4]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(b)
        .result(TensorType::f32(&[4]))
        .finish();
    let v1 = g.result(add, 0);
    let blackbox = g
        .build("blackbox", OpKind::Compute(OpCategory::Opaque))
        .operand(v1)
        .result(TensorType::f32(&[4]))
        .finish();
    let v2 = g.result(blackbox, 0);
    let yld = g.build("yield", OpKind::Yield).operand(v2).finish();
    let region = g.make_region("fused_0", vec![add, blackbox, yld]).unwrap();
    let region_out = g.result(region, 0);
    let sink = g
        .build("sink", OpKind::Compute(OpCategory::Opaque))
        .operand(region_out)
        .result(TensorType::f32(&[4]))
        .finish_top();

    let analysis = ShapeAnalysis::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut pass = GroupLoweringPass::new(
        &analysis,
        StubCompiler::with_log(log.clone()),
        TargetDescriptor::default_gpu(),
    );
    let stats = pass.run(&mut g).unwrap();

    assert_eq!(stats.groups_formed, 2);
    assert_eq!(&*log.borrow(), &["fusion_group_0", "fusion_group_1"]);

    // The opaque group's boundary input was remapped to the first kernel's
    // result before it was compiled and rewritten.
    let calls = kernel_calls(&g);
    assert_eq!(calls.len(), 2);
    let (k1, k2) = (calls[0], calls[1]);
    assert_eq!(g.operands(k1), &[a, b]);
    assert_eq!(g.operands(k2), &[g.result(k1, 0)]);
    assert_eq!(g.operands(sink)[0], g.result(k2, 0));
    assert!(!g.contains_op(region));
}

#[test]
fn test_result_ordering_follows_yield_positions() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[4]);
    let b = param(&mut g, "b", &[4]);
    let d = param(&mut g, "d", &[8]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(b)
        .result(TensorType::f32(&[4]))
        .finish();
    let c = g.result(add, 0);
    let mul = g
        .build("mul", OpKind::Compute(OpCategory::Elementwise))
        .operand(c)
        .operand(d)
        .result(TensorType::f32(&[8]))
        .finish();
    let e = g.result(mul, 0);
    // Yield order (e, c) differs from discovery order (c, e).
    let yld = g
        .build("yield", OpKind::Yield)
        .operand(e)
        .operand(c)
        .finish();
    let region = g.make_region("fused_0", vec![add, mul, yld]).unwrap();
    let r0 = g.result(region, 0);
    let r1 = g.result(region, 1);
    let sink0 = g
        .build("sink0", OpKind::Compute(OpCategory::Opaque))
        .operand(r0)
        .result(TensorType::f32(&[8]))
        .finish_top();
    let sink1 = g
        .build("sink1", OpKind::Compute(OpCategory::Opaque))
        .operand(r1)
        .result(TensorType::f32(&[4]))
        .finish_top();

    let analysis = ShapeAnalysis::new();
    let mut pass = GroupLoweringPass::new(&analysis, StubCompiler::new(), TargetDescriptor::default_gpu());
    pass.run(&mut g).unwrap();

    let calls = kernel_calls(&g);
    assert_eq!(calls.len(), 1);
    let call = calls[0];
    // Kernel results follow discovery order: slot 0 is c, slot 1 is e.
    assert_eq!(g.value_type(g.result(call, 0)), &TensorType::f32(&[4]));
    assert_eq!(g.value_type(g.result(call, 1)), &TensorType::f32(&[8]));
    // Region result 0 (e) maps to kernel result 1 and vice versa.
    assert_eq!(g.operands(sink0)[0], g.result(call, 1));
    assert_eq!(g.operands(sink1)[0], g.result(call, 0));
}

#[test]
fn test_partition_covers_ops_exactly_once_and_is_deterministic() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[8]);
    let b = param(&mut g, "b", &[8]);
    let c = param(&mut g, "c", &[8]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(b)
        .result(TensorType::f32(&[8]))
        .finish();
    let t1 = g.result(add, 0);
    let sub = g
        .build("sub", OpKind::Compute(OpCategory::Elementwise))
        .operand(t1)
        .operand(c)
        .result(TensorType::f32(&[8]))
        .finish();
    let t2 = g.result(sub, 0);
    let reduce = g
        .build("reduce_sum", OpKind::Compute(OpCategory::Reduction))
        .operand(t2)
        .result(TensorType::f32(&[1]))
        .finish();
    let t3 = g.result(reduce, 0);
    let relu = g
        .build("relu", OpKind::Compute(OpCategory::Elementwise))
        .operand(t3)
        .result(TensorType::f32(&[1]))
        .finish();
    let t4 = g.result(relu, 0);
    let blackbox = g
        .build("blackbox", OpKind::Compute(OpCategory::Opaque))
        .operand(t4)
        .result(TensorType::f32(&[1]))
        .finish();
    let t5 = g.result(blackbox, 0);
    let yld = g.build("yield", OpKind::Yield).operand(t5).finish();
    let body = vec![add, sub, reduce, relu, blackbox, yld];
    let compute_ops = vec![add, sub, reduce, relu, blackbox];
    let _region = g.make_region("fused_0", body.clone()).unwrap();

    let analysis = ShapeAnalysis::new();
    let groups = cluster::partition(&g, &compute_ops, &body, &analysis).unwrap();

    // Pairwise disjoint, union equals the full non-yield op set.
    let all: Vec<OpId> = groups.iter().flat_map(|gr| gr.ops.clone()).collect();
    assert_eq!(all.len(), compute_ops.len());
    let unique: HashSet<OpId> = all.iter().copied().collect();
    assert_eq!(unique.len(), all.len());
    for op in &compute_ops {
        assert!(unique.contains(op));
    }
    // The elementwise/reduction chain fuses; the opaque op stands alone.
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].ops, vec![add, sub, reduce, relu]);
    assert_eq!(groups[0].kind, OpCategory::Reduction);
    assert_eq!(groups[1].ops, vec![blackbox]);

    // Same inputs, same partition.
    let again = cluster::partition(&g, &compute_ops, &body, &analysis).unwrap();
    assert_eq!(groups.len(), again.len());
    for (x, y) in groups.iter().zip(&again) {
        assert_eq!(x.ops, y.ops);
        assert_eq!(x.output_values, y.output_values);
    }
}

/// Builds `[reduce, mul, add, yield]` where the reduction's consumer joined
/// a sibling elementwise cluster in phase 1, so only the global merge can
/// fuse the two clusters.
fn reduction_consumer_region(
    g: &mut FusionGraph,
) -> (Vec<OpId>, Vec<OpId>, Value, Value) {
    let x = param(g, "x", &[8]);
    let a = param(g, "a", &[1]);
    let b = param(g, "b", &[1]);
    let reduce = g
        .build("reduce_sum", OpKind::Compute(OpCategory::Reduction))
        .operand(x)
        .result(TensorType::f32(&[1]))
        .finish();
    let r = g.result(reduce, 0);
    let mul = g
        .build("mul", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(b)
        .result(TensorType::f32(&[1]))
        .finish();
    let m = g.result(mul, 0);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(m)
        .operand(r)
        .result(TensorType::f32(&[1]))
        .finish();
    let o = g.result(add, 0);
    let yld = g.build("yield", OpKind::Yield).operand(o).finish();
    let body = vec![reduce, mul, add, yld];
    let compute_ops = vec![reduce, mul, add];
    g.make_region("fused_0", body.clone()).unwrap();
    (body, compute_ops, r, o)
}

#[test]
fn test_global_merge_fuses_reduction_with_consumers() {
    let mut g = FusionGraph::new();
    let (body, compute_ops, r, o) = reduction_consumer_region(&mut g);

    let mut analysis = ShapeAnalysis::new();
    analysis.set(r, ShapeOrData::shape_only(const_shape(&[1])));
    analysis.set(o, ShapeOrData::shape_only(const_shape(&[1])));

    let groups = cluster::partition(&g, &compute_ops, &body, &analysis).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].ops, compute_ops);
    assert_eq!(groups[0].kind, OpCategory::Reduction);
}

#[test]
fn test_global_merge_requires_shape_agreement() {
    let mut g = FusionGraph::new();
    let (body, compute_ops, r, o) = reduction_consumer_region(&mut g);

    // Unknown shapes: the merge must not happen.
    let analysis = ShapeAnalysis::new();
    let groups = cluster::partition(&g, &compute_ops, &body, &analysis).unwrap();
    assert_eq!(groups.len(), 2);

    // Disagreeing shapes: same outcome.
    let mut analysis = ShapeAnalysis::new();
    analysis.set(r, ShapeOrData::shape_only(const_shape(&[1])));
    analysis.set(o, ShapeOrData::shape_only(const_shape(&[4])));
    let groups = cluster::partition(&g, &compute_ops, &body, &analysis).unwrap();
    assert_eq!(groups.len(), 2);
}

#[test]
fn test_compilation_failure_leaves_region_untouched() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[4]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(a)
        .result(TensorType::f32(&[4]))
        .finish();
    let c = g.result(add, 0);
    let yld = g.build("yield", OpKind::Yield).operand(c).finish();
    let region = g.make_region("fused_0", vec![add, yld]).unwrap();
    let region_out = g.result(region, 0);
    let sink = g
        .build("sink", OpKind::Compute(OpCategory::Opaque))
        .operand(region_out)
        .result(TensorType::f32(&[4]))
        .finish_top();

    let analysis = ShapeAnalysis::new();
    let mut pass = GroupLoweringPass::new(
        &analysis,
        StubCompiler::failing_on(1),
        TargetDescriptor::default_gpu(),
    );
    let err = pass.run(&mut g).unwrap_err();
    assert!(matches!(err, LoweringError::CompilationFailure { .. }));

    // No partial rewrite: region intact, no kernel calls, sink untouched.
    assert!(g.contains_op(region));
    assert!(kernel_calls(&g).is_empty());
    assert_eq!(g.operands(sink)[0], region_out);
}

#[test]
fn test_failure_in_later_region_keeps_earlier_rewrites() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[4]);
    let add1 = g
        .build("add1", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(a)
        .result(TensorType::f32(&[4]))
        .finish();
    let c1 = g.result(add1, 0);
    let yld1 = g.build("yield", OpKind::Yield).operand(c1).finish();
    let region1 = g.make_region("fused_0", vec![add1, yld1]).unwrap();
    let r1 = g.result(region1, 0);

    let b = param(&mut g, "b", &[4]);
    let add2 = g
        .build("add2", OpKind::Compute(OpCategory::Elementwise))
        .operand(b)
        .operand(b)
        .result(TensorType::f32(&[4]))
        .finish();
    let c2 = g.result(add2, 0);
    let yld2 = g.build("yield", OpKind::Yield).operand(c2).finish();
    let region2 = g.make_region("fused_1", vec![add2, yld2]).unwrap();
    let r2 = g.result(region2, 0);

    let sink1 = g
        .build("sink1", OpKind::Compute(OpCategory::Opaque))
        .operand(r1)
        .result(TensorType::f32(&[4]))
        .finish_top();
    let sink2 = g
        .build("sink2", OpKind::Compute(OpCategory::Opaque))
        .operand(r2)
        .result(TensorType::f32(&[4]))
        .finish_top();

    let analysis = ShapeAnalysis::new();
    let mut pass = GroupLoweringPass::new(
        &analysis,
        StubCompiler::failing_on(2),
        TargetDescriptor::default_gpu(),
    );
    let err = pass.run(&mut g).unwrap_err();
    assert!(matches!(err, LoweringError::CompilationFailure { .. }));

    // Region 1 is fully rewritten, region 2 untouched.
    let calls = kernel_calls(&g);
    assert_eq!(calls.len(), 1);
    assert!(!g.contains_op(region1));
    assert!(g.contains_op(region2));
    assert_eq!(g.operands(sink1)[0], g.result(calls[0], 0));
    assert_eq!(g.operands(sink2)[0], r2);
}

#[test]
fn test_artifact_store_shared_across_groups() {
    let mut g = FusionGraph::new();
    let a = param(&mut g, "a", &[4]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(a)
        .operand(a)
        .result(TensorType::f32(&[4]))
        .finish();
    let v1 = g.result(add, 0);
    let blackbox = g
        .build("blackbox", OpKind::Compute(OpCategory::Opaque))
        .operand(v1)
        .result(TensorType::f32(&[4]))
        .finish();
    let v2 = g.result(blackbox, 0);
    let yld = g.build("yield", OpKind::Yield).operand(v2).finish();
    g.make_region("fused_0", vec![add, blackbox, yld]).unwrap();

    let analysis = ShapeAnalysis::new();
    let mut pass = GroupLoweringPass::new(&analysis, StubCompiler::new(), TargetDescriptor::default_gpu());
    pass.run(&mut g).unwrap();

    // Both kernels interned the same constant blob and share one artifact.
    let calls = kernel_calls(&g);
    assert_eq!(calls.len(), 2);
    let artifacts: Vec<u64> = calls
        .iter()
        .map(|&call| match &g.op(call).kind {
            OpKind::KernelCall { kernel } => kernel.artifact,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(artifacts[0], artifacts[1]);
}

#[test]
fn test_can_apply_on_requires_a_fusion_region() {
    let mut g = FusionGraph::new();
    param(&mut g, "a", &[4]);

    let analysis = ShapeAnalysis::new();
    let pass = GroupLoweringPass::new(&analysis, StubCompiler::new(), TargetDescriptor::default_gpu());
    assert!(!pass.can_apply_on(&g));

    let b = param(&mut g, "b", &[4]);
    let add = g
        .build("add", OpKind::Compute(OpCategory::Elementwise))
        .operand(b)
        .operand(b)
        .result(TensorType::f32(&[4]))
        .finish();
    let c = g.result(add, 0);
    let yld = g.build("yield", OpKind::Yield).operand(c).finish();
    g.make_region("fused_0", vec![add, yld]).unwrap();
    assert!(pass.can_apply_on(&g));
}

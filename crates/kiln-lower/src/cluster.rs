//! Two-phase fusion clustering.
//!
//! ## Algorithm
//!
//! 1. **Local fusion** scans the yield-free operation list in block order
//!    and greedily joins each operation to the cluster of its first
//!    compatible producer: elementwise/broadcast/injective chains merge
//!    freely, fusable producers flow into a reduction consumer, and a
//!    reduction cluster accepts its first elementwise consumer. A join is
//!    rejected when the operation reaches back into the candidate cluster
//!    through a transitive producer outside it, which would make the merged
//!    cluster cyclic.
//! 2. **Global merge** looks at the clusters in aggregate. A reduction
//!    cluster absorbs *all* of its direct consumer clusters at once when
//!    every one is fusable, every crossing value carries a shape expression
//!    matching the consumer's output shape, and the merged set is convex. A
//!    fusable cluster also folds into its sole consumer. Repeats to
//!    fixpoint.
//!
//! Both phases scan vectors in block order and use hash containers for
//! membership only, so the resulting partition is reproducible for a given
//! operation list and shape oracle.

use kiln_ir::{FusionGraph, OpCategory, OpId, ShapeAnalysis};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::boundary;
use crate::group::Group;
use crate::{LoweringError, Result};

#[derive(Debug)]
struct Cluster {
    ops: Vec<OpId>,
    set: FxHashSet<OpId>,
    kind: OpCategory,
    alive: bool,
}

impl Cluster {
    fn seed(op: OpId, kind: OpCategory) -> Self {
        let mut set = FxHashSet::default();
        set.insert(op);
        Self {
            ops: vec![op],
            set,
            kind,
            alive: true,
        }
    }
}

/// Partition the yield-free operations of a region into fusion groups.
///
/// Every operation ends up in exactly one group; groups come back in block
/// order of their first operation, each with its boundary outputs computed
/// against `region_ops` (the full region body, yield last).
pub fn partition(
    graph: &FusionGraph,
    ops: &[OpId],
    region_ops: &[OpId],
    analysis: &ShapeAnalysis,
) -> Result<Vec<Group>> {
    if ops.is_empty() {
        return Err(LoweringError::InvariantViolation(
            "region contains no compute operations".into(),
        ));
    }

    let op_pos: FxHashMap<OpId, usize> = ops.iter().enumerate().map(|(i, &op)| (op, i)).collect();

    let mut clusters = local_fusion(graph, ops);
    debug!(clusters = clusters.len(), "local fusion complete");

    global_merge(graph, ops, &mut clusters, analysis, &op_pos);
    let live = clusters.iter().filter(|c| c.alive).count();
    debug!(clusters = live, "global merge complete");

    let mut final_clusters: Vec<Cluster> = clusters.into_iter().filter(|c| c.alive).collect();
    for cluster in &final_clusters {
        if cluster.ops.is_empty() {
            return Err(LoweringError::InvariantViolation(
                "fusion produced an empty group".into(),
            ));
        }
    }
    for cluster in &mut final_clusters {
        cluster.ops.sort_by_key(|op| op_pos[op]);
    }
    final_clusters.sort_by_key(|c| op_pos[&c.ops[0]]);

    let mut groups = Vec::with_capacity(final_clusters.len());
    for (id, cluster) in final_clusters.into_iter().enumerate() {
        let outputs = boundary::external_outputs(graph, &cluster.ops, region_ops)?;
        groups.push(Group::new(id, cluster.ops, outputs, cluster.kind));
    }
    Ok(groups)
}

/// Phase 1: greedy producer-chasing over the operation list.
fn local_fusion(graph: &FusionGraph, ops: &[OpId]) -> Vec<Cluster> {
    let region: FxHashSet<OpId> = ops.iter().copied().collect();
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut cluster_of: FxHashMap<OpId, usize> = FxHashMap::default();

    for &op in ops {
        let category = graph.op(op).kind.category();
        let mut target = None;
        if category != OpCategory::Opaque {
            for operand in graph.operands(op) {
                let Some(&candidate) = cluster_of.get(&operand.op) else {
                    continue;
                };
                if !can_fuse(clusters[candidate].kind, category) {
                    continue;
                }
                if reenters_cluster(graph, &clusters[candidate].set, op, &region) {
                    continue;
                }
                target = Some(candidate);
                break;
            }
        }
        match target {
            Some(index) => {
                let cluster = &mut clusters[index];
                cluster.ops.push(op);
                cluster.set.insert(op);
                cluster.kind = cluster.kind.max(category);
                cluster_of.insert(op, index);
            }
            None => {
                cluster_of.insert(op, clusters.len());
                clusters.push(Cluster::seed(op, category));
            }
        }
    }
    clusters
}

/// Whether an operation of category `consumer` may join a cluster whose
/// dominant category is `producer`.
fn can_fuse(producer: OpCategory, consumer: OpCategory) -> bool {
    use OpCategory::*;
    match (producer, consumer) {
        (Opaque, _) | (_, Opaque) => false,
        (Reduction, Elementwise) => true,
        (Reduction, _) => false,
        (_, Reduction) => true,
        _ => true,
    }
}

/// True when a transitive producer of `op` outside `cluster` itself depends
/// on a cluster result. Joining would then require `op` to both follow and
/// precede the cluster.
fn reenters_cluster(
    graph: &FusionGraph,
    cluster: &FxHashSet<OpId>,
    op: OpId,
    region: &FxHashSet<OpId>,
) -> bool {
    let mut stack: Vec<OpId> = graph
        .operands(op)
        .iter()
        .map(|v| v.op)
        .filter(|producer| region.contains(producer) && !cluster.contains(producer))
        .collect();
    let mut seen: FxHashSet<OpId> = FxHashSet::default();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        for value in graph.operands(current) {
            if !region.contains(&value.op) {
                continue;
            }
            if cluster.contains(&value.op) {
                return true;
            }
            stack.push(value.op);
        }
    }
    false
}

/// Phase 2: merge clusters with whole-region context, to fixpoint.
fn global_merge(
    graph: &FusionGraph,
    ops: &[OpId],
    clusters: &mut Vec<Cluster>,
    analysis: &ShapeAnalysis,
    op_pos: &FxHashMap<OpId, usize>,
) {
    loop {
        let Some((seed, absorbed)) = find_merge(graph, ops, clusters, analysis) else {
            break;
        };
        apply_merge(clusters, seed, &absorbed, op_pos);
    }
}

fn find_merge(
    graph: &FusionGraph,
    ops: &[OpId],
    clusters: &[Cluster],
    analysis: &ShapeAnalysis,
) -> Option<(usize, Vec<usize>)> {
    let consumers = cluster_consumers(graph, ops, clusters);
    let reach = downstream_reachability(&consumers);

    for index in 0..clusters.len() {
        if !clusters[index].alive {
            continue;
        }
        let direct = &consumers[index];
        if direct.is_empty() {
            continue;
        }
        match clusters[index].kind {
            OpCategory::Reduction => {
                // A reduction fuses with all of its consumers at once, not
                // just the first one phase 1 happened to see.
                let eligible = direct.iter().all(|&c| {
                    is_fusable_consumer(clusters[c].kind)
                        && shapes_agree(graph, analysis, &clusters[index], &clusters[c])
                });
                if eligible && convex(index, direct, &reach, clusters) {
                    return Some((index, direct.clone()));
                }
            }
            OpCategory::Elementwise | OpCategory::Broadcast | OpCategory::Injective => {
                if direct.len() == 1 {
                    let consumer = direct[0];
                    if can_fuse(clusters[index].kind, clusters[consumer].kind)
                        && convex(index, direct, &reach, clusters)
                    {
                        return Some((index, direct.clone()));
                    }
                }
            }
            OpCategory::Opaque => {}
        }
    }
    None
}

fn is_fusable_consumer(kind: OpCategory) -> bool {
    matches!(
        kind,
        OpCategory::Elementwise | OpCategory::Broadcast | OpCategory::Injective
    )
}

/// Direct consumer clusters of each cluster, in block order of discovery.
fn cluster_consumers(graph: &FusionGraph, ops: &[OpId], clusters: &[Cluster]) -> Vec<Vec<usize>> {
    let mut cluster_of: FxHashMap<OpId, usize> = FxHashMap::default();
    for (index, cluster) in clusters.iter().enumerate() {
        if cluster.alive {
            for &op in &cluster.ops {
                cluster_of.insert(op, index);
            }
        }
    }

    let mut consumers = vec![Vec::new(); clusters.len()];
    for &op in ops {
        let Some(&consumer) = cluster_of.get(&op) else {
            continue;
        };
        for value in graph.operands(op) {
            if let Some(&producer) = cluster_of.get(&value.op) {
                if producer != consumer && !consumers[producer].contains(&consumer) {
                    consumers[producer].push(consumer);
                }
            }
        }
    }
    consumers
}

fn downstream_reachability(consumers: &[Vec<usize>]) -> Vec<FxHashSet<usize>> {
    let mut reach = vec![FxHashSet::default(); consumers.len()];
    for index in 0..consumers.len() {
        let mut stack = consumers[index].clone();
        while let Some(next) = stack.pop() {
            if reach[index].insert(next) {
                stack.extend(consumers[next].iter().copied());
            }
        }
    }
    reach
}

/// The merged set may not be re-entered: no outside cluster both depends on
/// a member and feeds a member.
fn convex(
    seed: usize,
    absorbed: &[usize],
    reach: &[FxHashSet<usize>],
    clusters: &[Cluster],
) -> bool {
    let members: FxHashSet<usize> =
        std::iter::once(seed).chain(absorbed.iter().copied()).collect();
    for outside in 0..clusters.len() {
        if !clusters[outside].alive || members.contains(&outside) {
            continue;
        }
        let feeds_member = members.iter().any(|&m| reach[outside].contains(&m));
        let fed_by_member = members.iter().any(|&m| reach[m].contains(&outside));
        if feeds_member && fed_by_member {
            return false;
        }
    }
    true
}

/// Every value crossing from `producer` into `consumer` must carry a shape
/// expression equal to the consumer cluster's output shape. Unknown shapes
/// make the merge ineligible.
fn shapes_agree(
    graph: &FusionGraph,
    analysis: &ShapeAnalysis,
    producer: &Cluster,
    consumer: &Cluster,
) -> bool {
    let Some(&last) = consumer.ops.last() else {
        return false;
    };
    let Some(out) = analysis.get(graph.result(last, 0)) else {
        return false;
    };
    for &op in &consumer.ops {
        for &value in graph.operands(op) {
            if producer.set.contains(&value.op) {
                match analysis.get(value) {
                    Some(expr) if expr.shape() == out.shape() => {}
                    _ => return false,
                }
            }
        }
    }
    true
}

fn apply_merge(
    clusters: &mut [Cluster],
    seed: usize,
    absorbed: &[usize],
    op_pos: &FxHashMap<OpId, usize>,
) {
    let mut kind = clusters[seed].kind;
    let mut ops = std::mem::take(&mut clusters[seed].ops);
    for &index in absorbed {
        kind = kind.max(clusters[index].kind);
        ops.append(&mut clusters[index].ops);
        clusters[index].set.clear();
        clusters[index].alive = false;
    }
    ops.sort_by_key(|op| op_pos[op]);
    clusters[seed].set = ops.iter().copied().collect();
    clusters[seed].ops = ops;
    clusters[seed].kind = kind;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ir::OpCategory::*;

    #[test]
    fn test_can_fuse_table() {
        assert!(can_fuse(Elementwise, Elementwise));
        assert!(can_fuse(Broadcast, Elementwise));
        assert!(can_fuse(Injective, Elementwise));
        assert!(can_fuse(Elementwise, Reduction));
        assert!(can_fuse(Reduction, Elementwise));
        assert!(!can_fuse(Reduction, Reduction));
        assert!(!can_fuse(Reduction, Injective));
        assert!(!can_fuse(Opaque, Elementwise));
        assert!(!can_fuse(Elementwise, Opaque));
    }
}

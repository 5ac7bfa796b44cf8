//! The group-lowering pass.
//!
//! # Pipeline
//!
//! ```text
//! FusionRegion op
//!     ↓
//! 1. Simplify → erase redundant expand ops
//!     ↓
//! 2. Cluster  → two-phase fusion (local fusion + global merge)
//!     ↓
//! 3. Shapes   → record symbolic shape exprs into each group
//!     ↓
//! 4. Compile  → one kernel per group (external backend)
//!     ↓
//! 5. Rewrite  → kernel-call ops replace the region
//! ```
//!
//! Groups are compiled and rewritten strictly in clustering order: the
//! substitution map built by earlier groups resolves the inputs of later
//! ones. A compilation failure aborts the invocation; regions already
//! rewritten stay rewritten, the failing region is left untouched.

use kiln_ir::{FusionGraph, OpId, ShapeAnalysis};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::backend::{ArtifactStore, KernelCompiler, TargetDescriptor};
use crate::rewrite::GroupRewriter;
use crate::{cluster, simplify, Result};

/// Statistics for one pass invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoweringStats {
    pub regions_lowered: usize,
    pub expands_removed: usize,
    pub groups_formed: usize,
    pub kernels_compiled: usize,
    pub lowering_time: Duration,
}

/// Lowers every fusion region of a module into kernel-call operations.
///
/// All context is threaded explicitly: the shape oracle, the kernel backend
/// and the target descriptor come in through the constructor; nothing global
/// is consulted.
pub struct GroupLoweringPass<'a, C: KernelCompiler> {
    analysis: &'a ShapeAnalysis,
    compiler: C,
    target: TargetDescriptor,
}

impl<'a, C: KernelCompiler> GroupLoweringPass<'a, C> {
    pub fn new(analysis: &'a ShapeAnalysis, compiler: C, target: TargetDescriptor) -> Self {
        Self {
            analysis,
            compiler,
            target,
        }
    }

    /// The pass applies only to a module whose top block carries at least
    /// one fusion region.
    pub fn can_apply_on(&self, graph: &FusionGraph) -> bool {
        graph
            .top_block()
            .iter()
            .any(|&op| graph.op(op).kind.is_fusion_region())
    }

    /// Run the transform over every fusion region of the module.
    pub fn run(&mut self, graph: &mut FusionGraph) -> Result<LoweringStats> {
        let start = Instant::now();
        let mut stats = LoweringStats::default();
        // Artifact store shared across all groups of this invocation.
        let mut store = ArtifactStore::new();

        let regions: Vec<OpId> = graph
            .top_block()
            .iter()
            .copied()
            .filter(|&op| graph.op(op).kind.is_fusion_region())
            .collect();

        for region in regions {
            debug!(region = %graph.op(region).label, "lowering fusion region");
            stats.expands_removed +=
                simplify::erase_redundant_expands(graph, region, self.analysis)?;

            let body = graph.region_body(region)?.to_vec();
            let compute_ops: Vec<OpId> = body
                .iter()
                .copied()
                .filter(|&op| !graph.op(op).kind.is_yield())
                .collect();
            let groups = cluster::partition(graph, &compute_ops, &body, self.analysis)?;
            debug!(groups = groups.len(), "clustering complete");
            stats.groups_formed += groups.len();

            let mut rewriter = GroupRewriter::new(graph, region)?;
            for mut group in groups {
                group.record_shapes(graph, self.analysis);
                let kernel = self
                    .compiler
                    .compile(graph, &group, &self.target, &mut store)?;
                rewriter.rewrite_group(graph, &group, kernel)?;
                stats.kernels_compiled += 1;
            }
            rewriter.finish(graph)?;
            stats.regions_lowered += 1;
        }

        stats.lowering_time = start.elapsed();
        debug!(
            regions = stats.regions_lowered,
            kernels = stats.kernels_compiled,
            "group lowering complete"
        );
        Ok(stats)
    }
}

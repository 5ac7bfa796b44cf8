//! Fusion group lowering for dataflow-program graphs.
//!
//! Given a module whose fusion regions mark lowering candidates, this crate
//! erases redundant shape broadcasts, partitions each region's operations
//! into fusable groups, propagates symbolic shape information, hands every
//! group to an external kernel compiler, and rewrites the graph so each
//! group becomes a single kernel-call operation — preserving external data
//! dependencies and result ordering throughout.
//!
//! # Example
//!
//! ```no_run
//! use kiln_ir::{FusionGraph, KernelHandle, ShapeAnalysis};
//! use kiln_lower::{
//!     ArtifactStore, Group, GroupLoweringPass, KernelCompiler, Result, TargetDescriptor,
//! };
//!
//! struct Backend;
//!
//! impl KernelCompiler for Backend {
//!     fn compile(
//!         &mut self,
//!         graph: &FusionGraph,
//!         group: &Group,
//!         _target: &TargetDescriptor,
//!         _store: &mut ArtifactStore,
//!     ) -> Result<KernelHandle> {
//!         let result_types = group
//!             .output_values
//!             .iter()
//!             .map(|&v| graph.value_type(v).clone())
//!             .collect();
//!         Ok(KernelHandle::new(group.name(), 0, result_types))
//!     }
//! }
//!
//! let mut graph = FusionGraph::new();
//! // ... build fusion regions ...
//! let analysis = ShapeAnalysis::new();
//! let mut pass = GroupLoweringPass::new(&analysis, Backend, TargetDescriptor::default_gpu());
//! if pass.can_apply_on(&graph) {
//!     let stats = pass.run(&mut graph)?;
//!     println!("compiled {} kernels", stats.kernels_compiled);
//! }
//! # Ok::<(), kiln_lower::LoweringError>(())
//! ```

pub mod backend;
pub mod boundary;
pub mod cluster;
pub mod group;
pub mod pass;
pub mod rewrite;
pub mod simplify;

mod error;

pub use backend::{ArtifactStore, DeviceKind, KernelCompiler, TargetDescriptor};
pub use error::{LoweringError, Result};
pub use group::Group;
pub use pass::{GroupLoweringPass, LoweringStats};
pub use rewrite::GroupRewriter;

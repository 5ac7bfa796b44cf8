//! Kernel-compiler backend seam.
//!
//! The lowering core never generates code itself; it hands each group to a
//! [`KernelCompiler`] together with the target descriptor and the shared
//! artifact store, and receives back an opaque [`KernelHandle`]. Backend
//! failure is fatal to the pass invocation — no partial kernel is accepted
//! and retry policy belongs to the caller.

use kiln_ir::{FusionGraph, KernelHandle};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;

use crate::group::Group;
use crate::Result;

/// Device class a kernel is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu,
    Cpu,
}

/// Compilation target: device class plus architecture string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub device: DeviceKind,
    pub arch: String,
}

impl TargetDescriptor {
    pub fn new(device: DeviceKind, arch: impl Into<String>) -> Self {
        Self {
            device,
            arch: arch.into(),
        }
    }

    /// Default GPU target.
    pub fn default_gpu() -> Self {
        Self::new(DeviceKind::Gpu, "sm_80")
    }

    pub fn host() -> Self {
        Self::new(DeviceKind::Cpu, "native")
    }
}

/// Artifact store shared by every group compiled within one pass invocation.
///
/// Blobs are interned by content so repeated constant/weight data is
/// registered once. The store lives exactly as long as the invocation; no
/// cross-invocation caching happens at this layer.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    blobs: Vec<Vec<u8>>,
    by_hash: FxHashMap<u64, u64>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blob, returning its artifact id. Identical contents get
    /// the same id.
    pub fn intern(&mut self, bytes: &[u8]) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        hasher.write(bytes);
        let hash = hasher.finish();
        if let Some(&id) = self.by_hash.get(&hash) {
            if self.blobs[id as usize] == bytes {
                return id;
            }
        }
        let id = self.blobs.len() as u64;
        self.blobs.push(bytes.to_vec());
        self.by_hash.insert(hash, id);
        id
    }

    pub fn get(&self, id: u64) -> Option<&[u8]> {
        self.blobs.get(id as usize).map(|b| b.as_slice())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

/// External kernel compiler.
///
/// `compile` is synchronous and may be long-running; it may register
/// intermediate artifacts in the shared store. Implementations report
/// unsupported groups through [`LoweringError::CompilationFailure`] — there
/// is no degraded-kernel path.
///
/// [`LoweringError::CompilationFailure`]: crate::LoweringError::CompilationFailure
pub trait KernelCompiler {
    fn compile(
        &mut self,
        graph: &FusionGraph,
        group: &Group,
        target: &TargetDescriptor,
        store: &mut ArtifactStore,
    ) -> Result<KernelHandle>;
}

//! Helio Radiance Cascades - hierarchical octahedral probe cache
//!
//! A set of nested probe grids where every coarser level covers longer ray
//! distances at a lower spatial and higher angular density. Coarse radiance is
//! merged into the finer levels to propagate indirect light cheaply.
//!
//! The crate is split leaf-first:
//!
//! - [`config`] - user-facing configuration and the resolver that derives
//!   probe counts, level count and atlas dimensions
//! - [`atlas`] - Morton-ordered probe slots inside the shared 2D probe atlas,
//!   probe placement and octahedral seam stitching
//! - [`build`] - fills every active level with direct radiance
//! - [`merge`] - composites coarser levels into finer ones, coarsest first
//! - [`cascades`] - the owned cascade state and the dirty-flag rebuild gate
//! - [`compute`] - the compute capability the passes run on
//! - [`cpu`] - a reference [`ComputeBackend`] running the kernels with rayon
//!
//! GPU execution lives in the `helio-pass-radiance-cascades` crate, which
//! implements [`ComputeBackend`] on top of wgpu.

pub mod atlas;
pub mod build;
pub mod cascades;
pub mod compute;
pub mod config;
pub mod cpu;
pub mod merge;
pub mod morton;
pub mod octahedral;

pub use atlas::{AtlasLayout, ProbeSlot};
pub use cascades::{AtlasSource, RadianceCascades, RebuildPass, RebuildStats, TickReport};
pub use compute::{
    AtlasDesc, AtlasFormat, AtlasId, ComputeBackend, DispatchParams, Kernel, ProbeAtlasPair,
};
pub use config::{
    apply_edit, resolve, CascadeConfig, ConfigEdit, EditSignal, GpuCascadeConfig, MergeParams,
    ResolvedConfig,
};
pub use cpu::{CpuAtlas, CpuBackend, RadianceSampler};
pub use merge::ParentGather;

/// Result type for cascade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a compute backend
///
/// None of these are fatal to the cascade state: the scheduler skips the
/// affected pass and keeps the rebuild pending.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Kernel not available: {0:?}")]
    KernelUnavailable(Kernel),

    #[error("Atlas allocation failed: {0}")]
    Allocation(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Unknown atlas: {0:?}")]
    UnknownAtlas(AtlasId),

    #[error("Configuration buffer has not been uploaded")]
    ConfigNotUploaded,
}

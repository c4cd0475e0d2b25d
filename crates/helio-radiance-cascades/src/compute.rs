//! The compute capability the cascade passes are recorded against

use crate::config::{GpuCascadeConfig, ResolvedConfig, TEXEL_BYTE_SIZE};
use crate::Result;

/// Opaque handle to an atlas owned by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtlasId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtlasFormat {
    Rgba32Float,
}

impl AtlasFormat {
    pub fn texel_size(&self) -> u64 {
        match self {
            AtlasFormat::Rgba32Float => TEXEL_BYTE_SIZE,
        }
    }
}

/// Dimensions of a layered probe atlas, one layer per cascade level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtlasDesc {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: AtlasFormat,
}

impl AtlasDesc {
    pub fn for_config(resolved: &ResolvedConfig) -> Self {
        Self {
            width: resolved.base_diameter,
            height: resolved.base_diameter,
            layers: resolved.total_levels,
            format: AtlasFormat::Rgba32Float,
        }
    }

    pub fn byte_size(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.layers as u64 * self.format.texel_size()
    }
}

/// Kernels a backend must provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    /// Sample direct radiance into one level
    Build,
    /// Fold the next coarser level into one level
    Merge,
    /// Repair the padding border of every probe of one level
    Stitch,
}

impl Kernel {
    pub fn label(&self) -> &'static str {
        match self {
            Kernel::Build => "rc_build",
            Kernel::Merge => "rc_merge",
            Kernel::Stitch => "rc_stitch",
        }
    }
}

/// Per-dispatch parameters
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DispatchParams {
    pub level: u32,
    /// Ray interval start (build only)
    pub ray_min: f32,
    /// Ray interval end (build only)
    pub ray_max: f32,
    /// Gather tap distance in parent texels (merge only)
    pub gather_offset: f32,
    /// Weight of the gathered coarse radiance (merge only)
    pub gather_ratio: f32,
}

impl DispatchParams {
    pub fn for_level(level: u32) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }
}

/// Compute operations the cascade passes are expressed in
///
/// Commands are recorded in call order. Work on either side of a
/// [`barrier`](ComputeBackend::barrier) may not overlap; everything between
/// two barriers may run concurrently. Nothing is guaranteed to have executed
/// before [`submit`](ComputeBackend::submit) returns.
pub trait ComputeBackend {
    fn allocate_atlas(&mut self, desc: &AtlasDesc, label: &str) -> Result<AtlasId>;

    fn release_atlas(&mut self, atlas: AtlasId);

    /// Push the resolved configuration every kernel reads
    fn upload_config(&mut self, config: &GpuCascadeConfig) -> Result<()>;

    /// Zero every layer of `atlas`
    fn clear_atlas(&mut self, atlas: AtlasId) -> Result<()>;

    /// Copy every layer of `src` into `dst`; both share one descriptor
    fn copy_atlas(&mut self, src: AtlasId, dst: AtlasId) -> Result<()>;

    /// Run `kernel` over `work_items` invocations against `atlas`
    fn dispatch(
        &mut self,
        kernel: Kernel,
        atlas: AtlasId,
        params: &DispatchParams,
        work_items: u64,
    ) -> Result<()>;

    /// Make all prior writes visible to later commands
    fn barrier(&mut self);

    fn submit(&mut self) -> Result<()>;
}

/// The working atlas and its post-build snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeAtlasPair {
    /// Built, then merged in place
    pub working: AtlasId,
    /// Copy of the working atlas taken between build and merge
    pub original: AtlasId,
    pub desc: AtlasDesc,
}

impl ProbeAtlasPair {
    /// Allocate both atlases, releasing the first if the second fails
    pub fn allocate<B: ComputeBackend + ?Sized>(backend: &mut B, desc: AtlasDesc) -> Result<Self> {
        let working = backend.allocate_atlas(&desc, "Radiance Cascades Atlas")?;
        let original = match backend.allocate_atlas(&desc, "Radiance Cascades Original Atlas") {
            Ok(id) => id,
            Err(e) => {
                backend.release_atlas(working);
                return Err(e);
            }
        };
        Ok(Self {
            working,
            original,
            desc,
        })
    }

    pub fn release<B: ComputeBackend + ?Sized>(self, backend: &mut B) {
        backend.release_atlas(self.working);
        backend.release_atlas(self.original);
    }

    /// Bytes held by both atlases
    pub fn byte_size(&self) -> u64 {
        self.desc.byte_size() * 2
    }
}

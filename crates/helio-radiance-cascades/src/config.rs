//! Cascade configuration and the resolver that derives the atlas layout

use bytemuck::{Pod, Zeroable};

/// Largest supported level-0 grid diameter (probes per axis)
pub const MAX_GRID_DIAMETER: u32 = 1024;
/// Largest supported level-0 probe patch edge in texels
pub const MAX_ATLAS_PROBE_DIAMETER: u32 = 64;
/// Texels of padding on every side of a probe patch
pub const PROBE_PADDING: u32 = 1;
/// Bytes per atlas texel (RGBA32F)
pub const TEXEL_BYTE_SIZE: u64 = 16;

const MIN_RAY_LENGTH: f32 = 0.01;
const MIN_SCALE: f32 = 0.01;
const MAX_SCALE: f32 = 10.0;
const MAX_GATHER_OFFSET: f32 = 10.0;

/// Edge length of a probe patch including its padding border
pub const fn padded_diameter(probe_diameter: u32) -> u32 {
    probe_diameter + PROBE_PADDING * 2
}

/// User-facing cascade configuration
///
/// `grid_diameter` and `atlas_probe_diameter` are structural: changing them
/// changes the atlas dimensions. Everything else only needs a recompute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeConfig {
    /// Probes per axis at level 0
    pub grid_diameter: u32,
    /// Ray extent of level 0 in world units
    pub ray_length: f32,
    /// World spacing between level-0 probes
    pub scale: f32,
    /// Texels per level-0 probe edge, padding excluded
    pub atlas_probe_diameter: u32,
    /// Coarsest built level; -1 selects `total_levels - 2`
    pub max_level: i32,
    /// Merge fan-in exponent (1..=4)
    pub branching_factor: u32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            grid_diameter: 64,
            ray_length: 0.05,
            scale: 0.25,
            atlas_probe_diameter: 6,
            max_level: -1,
            branching_factor: 1,
        }
    }
}

impl CascadeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Rounded up to a power of two and clamped to [`MAX_GRID_DIAMETER`]; 0
    /// disables the cascades
    pub fn with_grid_diameter(mut self, diameter: u32) -> Self {
        self.grid_diameter = match diameter {
            0 => 0,
            d => d.min(MAX_GRID_DIAMETER).next_power_of_two(),
        };
        self
    }

    pub fn with_ray_length(mut self, length: f32) -> Self {
        self.ray_length = finite_or(length, Self::default().ray_length).max(MIN_RAY_LENGTH);
        self
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = finite_or(scale, Self::default().scale).clamp(MIN_SCALE, MAX_SCALE);
        self
    }

    pub fn with_atlas_probe_diameter(mut self, diameter: u32) -> Self {
        self.atlas_probe_diameter = diameter.clamp(1, MAX_ATLAS_PROBE_DIAMETER);
        self
    }

    /// Set the coarsest built level (-1 = automatic)
    ///
    /// Only the lower bound is known here; the resolver clamps the upper bound
    /// against the level count.
    pub fn with_max_level(mut self, level: i32) -> Self {
        self.max_level = level.max(-1);
        self
    }

    pub fn with_branching_factor(mut self, factor: u32) -> Self {
        self.branching_factor = factor.clamp(1, 4);
        self
    }

    /// Whether moving from `self` to `other` changes the atlas dimensions
    pub fn is_structural_change(&self, other: &CascadeConfig) -> bool {
        self.grid_diameter != other.grid_diameter
            || self.atlas_probe_diameter != other.atlas_probe_diameter
    }

    /// Apply every builder clamp to the raw field values
    fn sanitized(&self) -> Self {
        Self::default()
            .with_grid_diameter(self.grid_diameter)
            .with_ray_length(self.ray_length)
            .with_scale(self.scale)
            .with_atlas_probe_diameter(self.atlas_probe_diameter)
            .with_max_level(self.max_level)
            .with_branching_factor(self.branching_factor)
    }
}

/// Tunable bias controlling how much coarse angular data is folded into a
/// finer level during merge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    /// Tap distance, in parent texels, of the four angular gather taps
    pub gather_offset: f32,
    /// Weight of the gathered coarse radiance added to the direct sample
    pub gather_ratio: f32,
}

impl Default for MergeParams {
    fn default() -> Self {
        Self {
            gather_offset: 1.0,
            gather_ratio: 0.75,
        }
    }
}

impl MergeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gather_offset(mut self, offset: f32) -> Self {
        self.gather_offset =
            finite_or(offset, Self::default().gather_offset).clamp(0.0, MAX_GATHER_OFFSET);
        self
    }

    pub fn with_gather_ratio(mut self, ratio: f32) -> Self {
        self.gather_ratio = finite_or(ratio, Self::default().gather_ratio).clamp(0.0, 1.0);
        self
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Configuration with every derived structural parameter filled in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedConfig {
    /// Clamped configuration; `grid_diameter` is a power of two (or 0)
    pub config: CascadeConfig,
    /// `grid_diameter^3`
    pub cascade0_probe_count: u32,
    /// Probes per atlas row/column at level 0
    pub atlas_grid_diameter: u32,
    /// Atlas texture edge in texels
    pub base_diameter: u32,
    /// Number of cascade levels (atlas layers)
    pub total_levels: u32,
}

impl ResolvedConfig {
    /// True for the degenerate zero-probe configuration
    pub fn is_empty(&self) -> bool {
        self.total_levels == 0
    }

    /// Coarsest level the builder fills; -1 when nothing is built
    pub fn effective_max_level(&self) -> i32 {
        if self.config.max_level == -1 {
            self.total_levels as i32 - 2
        } else {
            self.config.max_level
        }
    }

    /// Levels filled by the builder, coarsest first
    pub fn active_levels(&self) -> impl Iterator<Item = u32> {
        let top = self.effective_max_level();
        (0..=top).rev().map(|level| level as u32)
    }

    /// First level processed by the merge walk
    pub fn merge_top_level(&self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let top = (self.effective_max_level() + 1).max(0) as u32;
        Some(top.min(self.total_levels - 1))
    }

    /// Probes per axis at `level`
    pub fn level_grid_diameter(&self, level: u32) -> u32 {
        self.config.grid_diameter.checked_shr(level).unwrap_or(0)
    }

    /// Probes stored at `level`
    pub fn level_probe_count(&self, level: u32) -> u32 {
        (self.cascade0_probe_count as u64)
            .checked_shr(level * 3)
            .unwrap_or(0) as u32
    }

    /// Probe patch edge at `level`, padding excluded
    pub fn level_probe_diameter(&self, level: u32) -> u32 {
        self.config.atlas_probe_diameter << level
    }

    /// Probe patch edge at `level`, padding included
    pub fn level_padded_diameter(&self, level: u32) -> u32 {
        padded_diameter(self.level_probe_diameter(level))
    }

    /// Directions (texels) stored per probe at `level`
    pub fn level_texels_per_probe(&self, level: u32) -> u32 {
        let d = self.level_probe_diameter(level);
        d * d
    }

    /// Size of a single atlas in bytes
    pub fn atlas_byte_size(&self) -> u64 {
        let edge = self.base_diameter as u64;
        edge * edge * TEXEL_BYTE_SIZE * self.total_levels as u64
    }

    /// Layout pushed to the GPU-visible configuration buffer
    pub fn to_gpu(&self) -> GpuCascadeConfig {
        GpuCascadeConfig {
            grid_diameter: self.config.grid_diameter,
            ray_length: self.config.ray_length,
            scale: self.config.scale,
            atlas_probe_diameter: self.config.atlas_probe_diameter,
            atlas_grid_diameter: self.atlas_grid_diameter,
            base_diameter: self.base_diameter,
            max_level: self.config.max_level,
            branching_factor: self.config.branching_factor,
            cascade0_probe_count: self.cascade0_probe_count,
            total_levels: self.total_levels,
            _pad0: 0,
            _pad1: 0,
        }
    }
}

/// GPU layout of the resolved configuration (48 bytes, std140 compatible)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuCascadeConfig {
    pub grid_diameter: u32,
    pub ray_length: f32,
    pub scale: f32,
    pub atlas_probe_diameter: u32,
    pub atlas_grid_diameter: u32,
    pub base_diameter: u32,
    pub max_level: i32,
    pub branching_factor: u32,
    pub cascade0_probe_count: u32,
    pub total_levels: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl From<&GpuCascadeConfig> for ResolvedConfig {
    fn from(gpu: &GpuCascadeConfig) -> Self {
        Self {
            config: CascadeConfig {
                grid_diameter: gpu.grid_diameter,
                ray_length: gpu.ray_length,
                scale: gpu.scale,
                atlas_probe_diameter: gpu.atlas_probe_diameter,
                max_level: gpu.max_level,
                branching_factor: gpu.branching_factor,
            },
            cascade0_probe_count: gpu.cascade0_probe_count,
            atlas_grid_diameter: gpu.atlas_grid_diameter,
            base_diameter: gpu.base_diameter,
            total_levels: gpu.total_levels,
        }
    }
}

/// Derive probe counts, level count and atlas dimensions from `config`
///
/// Out-of-range values are clamped rather than rejected. A zero grid resolves
/// to zero levels, which every pass treats as nothing to do.
pub fn resolve(config: &CascadeConfig) -> ResolvedConfig {
    let mut config = config.sanitized();
    if config.grid_diameter > 0 {
        // Morton slots are only dense for power-of-two grids
        config.grid_diameter = config.grid_diameter.next_power_of_two();
    }

    let cascade0_probe_count = config.grid_diameter.pow(3);
    let atlas_grid_diameter = ceil_sqrt(cascade0_probe_count).next_power_of_two();
    let base_diameter =
        (atlas_grid_diameter * padded_diameter(config.atlas_probe_diameter)).next_power_of_two();

    let mut total_levels = 0u32;
    while (cascade0_probe_count as u64) >> (total_levels * 3) >= 1 {
        total_levels += 1;
    }

    let max_level_bound = (total_levels as i32 - 2).max(-1);
    config.max_level = config.max_level.clamp(-1, max_level_bound);

    log::debug!(
        "Resolved cascades: grid {} -> {} probes, {} levels, atlas {}x{} ({} probes per row)",
        config.grid_diameter,
        cascade0_probe_count,
        total_levels,
        base_diameter,
        base_diameter,
        atlas_grid_diameter
    );

    ResolvedConfig {
        config,
        cascade0_probe_count,
        atlas_grid_diameter,
        base_diameter,
        total_levels,
    }
}

fn ceil_sqrt(n: u32) -> u32 {
    let n = n as u64;
    let mut root = (n as f64).sqrt() as u64;
    while root * root > n {
        root -= 1;
    }
    if root * root < n {
        root += 1;
    }
    root as u32
}

/// A single discrete change to the cascade settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigEdit {
    GridDiameter(u32),
    RayLength(f32),
    Scale(f32),
    AtlasProbeDiameter(u32),
    MaxLevel(i32),
    BranchingFactor(u32),
    GatherOffset(f32),
    GatherRatio(f32),
    Replace(CascadeConfig),
}

/// What an edit did to the settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EditSignal {
    /// Any value changed; a rebuild is required
    pub changed: bool,
    /// The atlas dimensions may have changed
    pub structural: bool,
}

impl EditSignal {
    /// Combine the signals of two consecutive edits
    pub fn merge(self, other: EditSignal) -> EditSignal {
        EditSignal {
            changed: self.changed || other.changed,
            structural: self.structural || other.structural,
        }
    }
}

/// Apply `edit`, returning the new settings and the resulting signal
pub fn apply_edit(
    config: &CascadeConfig,
    merge: &MergeParams,
    edit: ConfigEdit,
) -> (CascadeConfig, MergeParams, EditSignal) {
    let current = config.sanitized();
    let mut next_config = current;
    let mut next_merge = *merge;

    match edit {
        ConfigEdit::GridDiameter(v) => next_config = next_config.with_grid_diameter(v),
        ConfigEdit::RayLength(v) => next_config = next_config.with_ray_length(v),
        ConfigEdit::Scale(v) => next_config = next_config.with_scale(v),
        ConfigEdit::AtlasProbeDiameter(v) => next_config = next_config.with_atlas_probe_diameter(v),
        ConfigEdit::MaxLevel(v) => next_config = next_config.with_max_level(v),
        ConfigEdit::BranchingFactor(v) => next_config = next_config.with_branching_factor(v),
        ConfigEdit::GatherOffset(v) => next_merge = next_merge.with_gather_offset(v),
        ConfigEdit::GatherRatio(v) => next_merge = next_merge.with_gather_ratio(v),
        ConfigEdit::Replace(replacement) => next_config = replacement.sanitized(),
    }

    let signal = EditSignal {
        changed: next_config != current || next_merge != *merge,
        structural: current.is_structural_change(&next_config),
    };
    (next_config, next_merge, signal)
}

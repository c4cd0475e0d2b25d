//! Probe addressing inside the layered probe atlas
//!
//! Every level owns one atlas layer. A probe's 3D grid coordinate is Morton
//! encoded into its index, and the same index decoded in 2D gives its cell in
//! the layer. Each cell is a padded octahedral patch: the interior holds the
//! probe's directions and a one-texel border duplicates the texels across the
//! octahedral folds so bilinear taps never bleed into a neighbour.

use glam::{UVec2, UVec3, Vec3};

use crate::compute::{AtlasId, ComputeBackend, DispatchParams, Kernel};
use crate::config::{ResolvedConfig, PROBE_PADDING};
use crate::merge::{self, ParentGather};
use crate::{morton, Result};

/// Placement of a single probe patch in its atlas layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSlot {
    /// Top-left texel of the padded patch
    pub origin: UVec2,
    pub padded_diameter: u32,
    pub probe_diameter: u32,
}

impl ProbeSlot {
    /// Top-left texel of the interior
    pub fn interior_origin(&self) -> UVec2 {
        self.origin + UVec2::splat(PROBE_PADDING)
    }

    /// Atlas texel of an interior coordinate
    pub fn interior_texel(&self, texel: UVec2) -> UVec2 {
        self.interior_origin() + texel
    }

    /// Atlas texel of a padded-patch coordinate
    pub fn padded_texel(&self, texel: UVec2) -> UVec2 {
        self.origin + texel
    }
}

/// Addressing for every level of a resolved configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtlasLayout {
    resolved: ResolvedConfig,
}

impl AtlasLayout {
    pub fn new(resolved: &ResolvedConfig) -> Self {
        Self {
            resolved: *resolved,
        }
    }

    pub fn resolved(&self) -> &ResolvedConfig {
        &self.resolved
    }

    pub fn total_levels(&self) -> u32 {
        self.resolved.total_levels
    }

    /// Probe count of every level, finest first
    pub fn level_probe_counts(&self) -> Vec<u32> {
        (0..self.resolved.total_levels)
            .map(|level| self.resolved.level_probe_count(level))
            .collect()
    }

    /// Grid coordinate of the probe stored at Morton `index`
    ///
    /// Defined for every index of the `atlas_grid_diameter` cube, not only the
    /// probes `level` holds.
    pub fn grid_pos_of(&self, _level: u32, index: u32) -> UVec3 {
        debug_assert!((index as u64) < self.addressable_indices());
        morton::decode3(index)
    }

    /// Inverse of [`grid_pos_of`](Self::grid_pos_of) for coordinates below
    /// `atlas_grid_diameter`
    pub fn index_of(&self, _level: u32, grid_pos: UVec3) -> u32 {
        debug_assert!(grid_pos.max_element() < self.resolved.atlas_grid_diameter.max(1));
        morton::encode3(grid_pos)
    }

    fn addressable_indices(&self) -> u64 {
        (self.resolved.atlas_grid_diameter.max(1) as u64).pow(3)
    }

    pub fn slot_of(&self, level: u32, index: u32) -> ProbeSlot {
        let padded_diameter = self.resolved.level_padded_diameter(level);
        ProbeSlot {
            origin: morton::decode2(index) * padded_diameter,
            padded_diameter,
            probe_diameter: self.resolved.level_probe_diameter(level),
        }
    }

    /// World-space distance between neighbouring probes of `level`
    pub fn cell_size(&self, level: u32) -> f32 {
        self.resolved.config.scale * (1u32 << level) as f32
    }

    /// World position of a probe; every level is centred on the origin
    pub fn probe_world_position(&self, level: u32, grid_pos: UVec3) -> Vec3 {
        let cell = self.cell_size(level);
        let radius = self.resolved.level_grid_diameter(level) as f32 * 0.5;
        (grid_pos.as_vec3() - Vec3::splat(radius)) * cell + Vec3::splat(cell * 0.5)
    }

    /// Grid coordinate of the probe cell containing `point`, clamped into the
    /// grid
    pub fn probe_at_world_position(&self, level: u32, point: Vec3) -> Option<UVec3> {
        let diameter = self.resolved.level_grid_diameter(level);
        if level >= self.resolved.total_levels || diameter == 0 {
            return None;
        }
        let radius = diameter as f32 * 0.5;
        let cell = (point / self.cell_size(level) + Vec3::splat(radius)).floor();
        let max = (diameter - 1) as f32;
        Some(cell.clamp(Vec3::ZERO, Vec3::splat(max)).as_uvec3())
    }

    /// Parent probes a probe of `level` gathers from during merge
    pub fn parents_of(&self, level: u32, grid_pos: UVec3) -> Option<ParentGather> {
        merge::parents_of(&self.resolved, level, grid_pos)
    }
}

/// Padding texels per probe patch of interior size `probe_diameter`
pub fn border_texel_count(probe_diameter: u32) -> u32 {
    4 * (probe_diameter + 1)
}

/// Padded-patch coordinate of the `i`th border texel
///
/// Top row first, then the bottom row, then the left and right columns
/// without their corners.
pub fn border_texel(i: u32, probe_diameter: u32) -> UVec2 {
    let n = probe_diameter;
    let row = n + 2;
    if i < row {
        UVec2::new(i, 0)
    } else if i < row * 2 {
        UVec2::new(i - row, n + 1)
    } else if i < row * 2 + n {
        UVec2::new(0, i - row * 2 + 1)
    } else {
        UVec2::new(n + 1, i - row * 2 - n + 1)
    }
}

/// Interior texel duplicated into a padding texel, `None` for interior texels
///
/// The octahedral edges fold back onto themselves: the top and bottom rows
/// mirror the first and last interior rows horizontally, the side columns
/// mirror the first and last interior columns vertically, and each corner
/// takes the diagonally opposite interior corner.
pub fn stitch_source(padded_texel: UVec2, probe_diameter: u32) -> Option<UVec2> {
    let n = probe_diameter;
    let last = n - 1;
    let (x, y) = (padded_texel.x, padded_texel.y);
    let on_left = x == 0;
    let on_right = x == n + 1;
    let on_top = y == 0;
    let on_bottom = y == n + 1;

    let source = match (on_left, on_right, on_top, on_bottom) {
        (true, _, true, _) => UVec2::new(last, last),
        (_, true, true, _) => UVec2::new(0, last),
        (true, _, _, true) => UVec2::new(last, 0),
        (_, true, _, true) => UVec2::new(0, 0),
        (_, _, true, _) => UVec2::new(n - x, 0),
        (_, _, _, true) => UVec2::new(n - x, last),
        (true, _, _, _) => UVec2::new(0, n - y),
        (_, true, _, _) => UVec2::new(last, n - y),
        _ => return None,
    };
    Some(source)
}

/// Repair the padding of every probe of `level`
pub fn stitch_level<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    resolved: &ResolvedConfig,
    atlas: AtlasId,
    level: u32,
) -> Result<()> {
    let probes = resolved.level_probe_count(level) as u64;
    let work_items = probes * border_texel_count(resolved.level_probe_diameter(level)) as u64;
    log::trace!("Stitching level {} of {:?} ({} texels)", level, atlas, work_items);
    backend.dispatch(
        Kernel::Stitch,
        atlas,
        &DispatchParams::for_level(level),
        work_items,
    )
}

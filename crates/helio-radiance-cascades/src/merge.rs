//! Coarse-to-fine merging of the cascade levels
//!
//! Every probe of level L blends the eight nearest probes of level L+1
//! trilinearly. From each parent it gathers four bilinear taps around the
//! direction of the fine texel, so one fine texel integrates the 2x2 block of
//! parent directions it subdivides.

use glam::{UVec2, UVec3, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::atlas::{stitch_level, AtlasLayout, ProbeSlot};
use crate::cascades::RebuildPass;
use crate::compute::{AtlasId, ComputeBackend, DispatchParams, Kernel};
use crate::config::{MergeParams, ResolvedConfig, PROBE_PADDING};
use crate::{morton, Error, Result};

/// The eight level L+1 probes a level L probe gathers from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParentGather {
    /// Level the parents live on
    pub level: u32,
    /// Parent grid coordinates in Morton octant order
    pub parents: [UVec3; 8],
    /// Trilinear weight of each parent; sums to one
    pub weights: [f32; 8],
    /// Fractional position between the lower and upper parents
    pub uvw: Vec3,
}

/// Parents of the probe at `grid_pos` on `level`, `None` on the coarsest level
pub fn parents_of(resolved: &ResolvedConfig, level: u32, grid_pos: UVec3) -> Option<ParentGather> {
    let parent_level = level + 1;
    if parent_level >= resolved.total_levels {
        return None;
    }
    let max = Vec3::splat((resolved.level_grid_diameter(parent_level) - 1) as f32);

    let p = grid_pos.as_vec3() + Vec3::splat(0.5);
    let lower = (p * 0.5 - Vec3::splat(0.5)).floor();
    let t = p * 0.5 + Vec3::splat(0.5);
    let uvw = t - t.floor();

    let mut parents = [UVec3::ZERO; 8];
    let mut weights = [0.0; 8];
    for octant in 0..8u32 {
        let offset = morton::decode3(octant);
        parents[octant as usize] = (lower + offset.as_vec3()).clamp(Vec3::ZERO, max).as_uvec3();

        let axis_weights = Vec3::select(offset.cmpeq(UVec3::ONE), uvw, Vec3::ONE - uvw);
        weights[octant as usize] = axis_weights.x * axis_weights.y * axis_weights.z;
    }

    Some(ParentGather {
        level: parent_level,
        parents,
        weights,
        uvw,
    })
}

/// Bilinear fetch inside a padded patch; `pos` is in interior texel units
fn sample_patch(slot: &ProbeSlot, pos: Vec2, fetch: &impl Fn(UVec2) -> Vec4) -> Vec4 {
    let last = slot.padded_diameter - 1;
    let p = (pos + Vec2::splat(PROBE_PADDING as f32 - 0.5))
        .clamp(Vec2::ZERO, Vec2::splat(last as f32));
    let base = p.floor();
    let f = p - base;
    let i0 = base.as_uvec2();
    let i1 = (i0 + UVec2::ONE).min(UVec2::splat(last));

    let t00 = fetch(slot.padded_texel(i0));
    let t10 = fetch(slot.padded_texel(UVec2::new(i1.x, i0.y)));
    let t01 = fetch(slot.padded_texel(UVec2::new(i0.x, i1.y)));
    let t11 = fetch(slot.padded_texel(i1));
    t00.lerp(t10, f.x).lerp(t01.lerp(t11, f.x), f.y)
}

/// Coarse radiance gathered for one texel of a level L probe
///
/// `fetch` reads an atlas texel of layer L+1. Returns zero on the coarsest
/// level.
pub fn gather_upper(
    layout: &AtlasLayout,
    level: u32,
    grid_pos: UVec3,
    texel: UVec2,
    gather_offset: f32,
    fetch: impl Fn(UVec2) -> Vec4,
) -> Vec4 {
    let Some(gather) = layout.parents_of(level, grid_pos) else {
        return Vec4::ZERO;
    };
    let resolved = layout.resolved();
    let diameter = resolved.level_probe_diameter(level) as f32;
    let parent_diameter = resolved.level_probe_diameter(gather.level) as f32;

    let uv = (texel.as_vec2() + Vec2::splat(0.5)) / diameter;
    let centre = uv * parent_diameter;
    let h = gather_offset * 0.5;
    let taps = [
        Vec2::new(-h, -h),
        Vec2::new(h, -h),
        Vec2::new(-h, h),
        Vec2::new(h, h),
    ];

    let mut upper = Vec4::ZERO;
    for (parent, weight) in gather.parents.iter().zip(gather.weights) {
        if weight == 0.0 {
            continue;
        }
        let slot = layout.slot_of(gather.level, morton::encode3(*parent));
        let sum = taps
            .iter()
            .fold(Vec4::ZERO, |acc, tap| acc + sample_patch(&slot, centre + *tap, &fetch));
        upper += sum * (0.25 * weight);
    }
    upper
}

/// Combine direct and gathered radiance; alpha stays the direct alpha
pub fn merge_texel(direct: Vec4, upper: Vec4, gather_ratio: f32) -> Vec4 {
    (direct.xyz() + upper.xyz() * gather_ratio).extend(direct.w)
}

pub fn merge_level<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    resolved: &ResolvedConfig,
    params: &MergeParams,
    atlas: AtlasId,
    level: u32,
) -> Result<()> {
    let work_items =
        resolved.level_probe_count(level) as u64 * resolved.level_texels_per_probe(level) as u64;
    log::trace!("Merging level {} of {:?} ({} texels)", level, atlas, work_items);
    backend.dispatch(
        Kernel::Merge,
        atlas,
        &DispatchParams {
            level,
            gather_offset: params.gather_offset,
            gather_ratio: params.gather_ratio,
            ..Default::default()
        },
        work_items,
    )
}

/// Merge and stitch every level from the merge top level down to 0
///
/// Each level is fenced on both sides so level L only ever reads level L+1
/// after its own merge and stitch landed. Failed passes are returned; the
/// walk continues past them.
pub fn merge_levels<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    resolved: &ResolvedConfig,
    params: &MergeParams,
    atlas: AtlasId,
) -> Vec<(RebuildPass, Error)> {
    let mut failures = Vec::new();
    let Some(top) = resolved.merge_top_level() else {
        return failures;
    };
    log::debug!("Merging levels {}..=0", top);

    for level in (0..=top).rev() {
        backend.barrier();
        if let Err(e) = merge_level(backend, resolved, params, atlas, level) {
            failures.push((RebuildPass::Merge(level), e));
        }
        backend.barrier();
        if let Err(e) = stitch_level(backend, resolved, atlas, level) {
            failures.push((RebuildPass::Stitch(level), e));
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CascadeConfig};

    fn resolved(grid_diameter: u32) -> ResolvedConfig {
        resolve(&CascadeConfig {
            grid_diameter,
            atlas_probe_diameter: 4,
            ..CascadeConfig::default()
        })
    }

    #[test]
    fn weights_sum_to_one() {
        let r = resolved(8);
        for level in 0..r.total_levels - 1 {
            let d = r.level_grid_diameter(level);
            for i in 0..r.level_probe_count(level) {
                let g = parents_of(&r, level, morton::decode3(i)).unwrap();
                let sum: f32 = g.weights.iter().sum();
                assert!((sum - 1.0).abs() < 1e-5, "level {} probe {}", level, i);
                for p in g.parents {
                    assert!(p.max_element() < (d / 2).max(1));
                }
            }
        }
    }

    #[test]
    fn interior_probe_blends_its_neighbourhood() {
        let r = resolved(8);
        let g = parents_of(&r, 0, UVec3::new(3, 3, 3)).unwrap();
        assert_eq!(g.level, 1);
        assert_eq!(g.uvw, Vec3::splat(0.25));
        assert_eq!(g.parents[0], UVec3::ONE);
        assert_eq!(g.parents[7], UVec3::splat(2));
        assert_eq!(g.parents[1], UVec3::new(2, 1, 1));
        assert!((g.weights[0] - 0.75f32.powi(3)).abs() < 1e-6);
        assert!((g.weights[7] - 0.25f32.powi(3)).abs() < 1e-6);
    }

    #[test]
    fn edge_parents_are_clamped() {
        let r = resolved(8);
        let g = parents_of(&r, 0, UVec3::ZERO).unwrap();
        assert_eq!(g.parents[0], UVec3::ZERO);
        assert_eq!(g.parents[7], UVec3::ZERO);
        let g = parents_of(&r, 0, UVec3::splat(7)).unwrap();
        assert_eq!(g.parents[7], UVec3::splat(3));
    }

    #[test]
    fn coarsest_level_has_no_parents() {
        let r = resolved(8);
        assert!(parents_of(&r, 3, UVec3::ZERO).is_none());
        assert!(parents_of(&r, 2, UVec3::ZERO).is_some());
    }

    #[test]
    fn constant_parents_gather_their_constant() {
        let layout = AtlasLayout::new(&resolved(8));
        let value = Vec4::new(0.5, 0.25, 2.0, 1.0);
        for texel in [UVec2::ZERO, UVec2::new(3, 1), UVec2::new(3, 3)] {
            for offset in [0.0, 1.0, 10.0] {
                let upper = gather_upper(&layout, 0, UVec3::new(5, 2, 0), texel, offset, |_| value);
                assert!(upper.abs_diff_eq(value, 1e-5), "{:?} {}", texel, offset);
            }
        }
        let top = gather_upper(&layout, 3, UVec3::ZERO, UVec2::ZERO, 1.0, |_| value);
        assert_eq!(top, Vec4::ZERO);
    }

    #[test]
    fn gather_stays_inside_the_parent_patches() {
        let layout = AtlasLayout::new(&resolved(8));
        let grid = UVec3::new(1, 6, 4);
        let gather = layout.parents_of(0, grid).unwrap();
        let slots: Vec<ProbeSlot> = gather
            .parents
            .iter()
            .map(|p| layout.slot_of(1, morton::encode3(*p)))
            .collect();
        for y in 0..4 {
            for x in 0..4 {
                gather_upper(&layout, 0, grid, UVec2::new(x, y), 10.0, |t| {
                    assert!(slots.iter().any(|s| {
                        t.x >= s.origin.x
                            && t.y >= s.origin.y
                            && t.x < s.origin.x + s.padded_diameter
                            && t.y < s.origin.y + s.padded_diameter
                    }));
                    Vec4::ONE
                });
            }
        }
    }

    #[test]
    fn merged_texel_keeps_direct_alpha() {
        let direct = Vec4::new(1.0, 0.0, 0.0, 0.5);
        let upper = Vec4::new(0.0, 2.0, 0.0, 1.0);
        assert_eq!(merge_texel(direct, upper, 0.75), Vec4::new(1.0, 1.5, 0.0, 0.5));
        assert_eq!(merge_texel(direct, upper, 0.0), direct);
    }
}

//! Direct radiance pass
//!
//! Each level traces its own ray interval; the intervals of consecutive
//! levels tile the ray without overlap, growing by 4x per level.

use crate::cascades::RebuildPass;
use crate::compute::{AtlasId, ComputeBackend, DispatchParams, Kernel};
use crate::config::ResolvedConfig;
use crate::{Error, Result};

/// Ray interval `[t_min, t_max]` traced by `level`
pub fn ray_range(level: u32, ray_length: f32) -> (f32, f32) {
    if level == 0 {
        return (0.0, ray_length);
    }
    let start = (1u64 << ((level - 1) * 2)) as f32;
    let end = (1u64 << (level * 2)) as f32;
    (start * ray_length, end * ray_length)
}

/// Fill the interior of every probe of `level` with sampled radiance
pub fn build_level<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    resolved: &ResolvedConfig,
    atlas: AtlasId,
    level: u32,
) -> Result<()> {
    let (ray_min, ray_max) = ray_range(level, resolved.config.ray_length);
    let work_items =
        resolved.level_probe_count(level) as u64 * resolved.level_texels_per_probe(level) as u64;
    log::trace!(
        "Building level {} ({} texels, rays {:.3}..{:.3})",
        level,
        work_items,
        ray_min,
        ray_max
    );
    backend.dispatch(
        Kernel::Build,
        atlas,
        &DispatchParams {
            level,
            ray_min,
            ray_max,
            ..Default::default()
        },
        work_items,
    )
}

/// Build every active level, coarsest first
///
/// Levels are independent so no barrier is recorded between them. Returns
/// the levels that failed.
pub fn build_levels<B: ComputeBackend + ?Sized>(
    backend: &mut B,
    resolved: &ResolvedConfig,
    atlas: AtlasId,
) -> Vec<(RebuildPass, Error)> {
    log::debug!("Building levels {}..=0", resolved.effective_max_level());
    resolved
        .active_levels()
        .filter_map(|level| {
            build_level(backend, resolved, atlas, level)
                .err()
                .map(|e| (RebuildPass::Build(level), e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_intervals_tile_the_ray() {
        assert_eq!(ray_range(0, 0.05), (0.0, 0.05));
        assert_eq!(ray_range(1, 1.0), (1.0, 4.0));
        assert_eq!(ray_range(2, 1.0), (4.0, 16.0));
        assert_eq!(ray_range(3, 0.5), (8.0, 32.0));
        for level in 1..8 {
            assert_eq!(ray_range(level, 0.25).0, ray_range(level - 1, 0.25).1);
        }
    }
}

//! Owned cascade state and the dirty-flag rebuild gate

use crate::atlas::{stitch_level, AtlasLayout};
use crate::build::build_levels;
use crate::compute::{AtlasDesc, AtlasId, ComputeBackend, ProbeAtlasPair};
use crate::config::{
    self, resolve, CascadeConfig, ConfigEdit, EditSignal, MergeParams, ResolvedConfig,
};
use crate::merge::merge_levels;
use crate::Error;

/// Which atlas a consumer samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AtlasSource {
    /// Fully merged radiance
    #[default]
    Merged,
    /// Direct radiance snapshot taken before merging
    Original,
}

/// A single step of a rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPass {
    Allocate,
    UploadConfig,
    Clear,
    Build(u32),
    Snapshot,
    StitchOriginal(u32),
    Merge(u32),
    Stitch(u32),
    Submit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RebuildStats {
    pub levels_built: u32,
    pub levels_merged: u32,
    /// The atlas pair was (re)allocated during this rebuild
    pub reallocated: bool,
}

/// Outcome of [`RadianceCascades::tick`]
#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    /// Nothing changed since the last rebuild
    Clean,
    /// The configuration holds no probes; nothing was recorded
    Empty,
    Rebuilt(RebuildStats),
    /// Some passes failed; the rebuild stays pending
    Deferred { skipped: Vec<(RebuildPass, Error)> },
}

/// A radiance cascade hierarchy bound to a compute backend
pub struct RadianceCascades<B: ComputeBackend> {
    backend: B,
    config: CascadeConfig,
    merge: MergeParams,
    resolved: ResolvedConfig,
    layout: AtlasLayout,
    atlases: Option<ProbeAtlasPair>,
    dirty: bool,
    /// A structural edit landed since the pair was last allocated
    realloc_pending: bool,
}

impl<B: ComputeBackend> RadianceCascades<B> {
    pub fn new(backend: B, config: CascadeConfig, merge: MergeParams) -> Self {
        let resolved = resolve(&config);
        Self {
            backend,
            config,
            merge,
            resolved,
            layout: AtlasLayout::new(&resolved),
            atlases: None,
            dirty: true,
            realloc_pending: false,
        }
    }

    pub fn with_defaults(backend: B) -> Self {
        Self::new(backend, CascadeConfig::default(), MergeParams::default())
    }

    /// Apply a settings change; any effective change schedules a rebuild
    pub fn apply_edit(&mut self, edit: ConfigEdit) -> EditSignal {
        let (config, merge, signal) = config::apply_edit(&self.config, &self.merge, edit);
        if signal.changed {
            log::debug!("Cascade edit {:?} (structural: {})", edit, signal.structural);
            self.config = config;
            self.merge = merge;
            self.resolved = resolve(&config);
            self.layout = AtlasLayout::new(&self.resolved);
            self.dirty = true;
            self.realloc_pending |= signal.structural;
        }
        signal
    }

    pub fn apply_edits(&mut self, edits: impl IntoIterator<Item = ConfigEdit>) -> EditSignal {
        edits
            .into_iter()
            .fold(EditSignal::default(), |acc, edit| acc.merge(self.apply_edit(edit)))
    }

    /// Schedule a rebuild after the scene changed
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn merge_params(&self) -> &MergeParams {
        &self.merge
    }

    pub fn resolved(&self) -> &ResolvedConfig {
        &self.resolved
    }

    pub fn layout(&self) -> &AtlasLayout {
        &self.layout
    }

    pub fn atlases(&self) -> Option<&ProbeAtlasPair> {
        self.atlases.as_ref()
    }

    pub fn sampled_atlas(&self, source: AtlasSource) -> Option<AtlasId> {
        self.atlases.map(|pair| match source {
            AtlasSource::Merged => pair.working,
            AtlasSource::Original => pair.original,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Release the atlases and hand the backend back
    pub fn into_backend(mut self) -> B {
        if let Some(pair) = self.atlases.take() {
            pair.release(&mut self.backend);
        }
        self.backend
    }

    /// Make sure the atlas pair matches the resolved configuration
    ///
    /// A structural edit always replaces the pair, even when the new layout
    /// happens to need a texture of the same size.
    fn ensure_atlases(&mut self) -> Result<(ProbeAtlasPair, bool), Error> {
        let desc = AtlasDesc::for_config(&self.resolved);
        if let Some(pair) = self.atlases {
            if pair.desc == desc && !self.realloc_pending {
                return Ok((pair, false));
            }
            log::debug!("Atlas layout changed, releasing {:?}", pair);
            pair.release(&mut self.backend);
            self.atlases = None;
        }

        let pair = ProbeAtlasPair::allocate(&mut self.backend, desc)?;
        log::info!("Radiance cascades atlas: {}x{} texels", desc.width, desc.height);
        log::info!("  total probes (level 0): {}", self.resolved.cascade0_probe_count);
        log::info!("  total levels: {}", self.resolved.total_levels);
        log::info!("  atlas grid diameter: {}", self.resolved.atlas_grid_diameter);
        log::info!(
            "  atlas pair size: {:.1} MB",
            pair.byte_size() as f64 / (1024.0 * 1024.0)
        );
        self.atlases = Some(pair);
        self.realloc_pending = false;
        Ok((pair, true))
    }

    /// Rebuild the whole hierarchy if anything changed since the last
    /// completed rebuild
    ///
    /// The dirty flag is only cleared once every pass completed, so a
    /// failed pass is retried on the next tick.
    pub fn tick(&mut self) -> TickReport {
        if !self.dirty {
            return TickReport::Clean;
        }
        if self.resolved.is_empty() {
            log::debug!("Radiance cascades hold no probes, skipping rebuild");
            self.dirty = false;
            return TickReport::Empty;
        }

        let (pair, reallocated) = match self.ensure_atlases() {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Radiance cascades rebuild deferred: {}", e);
                return TickReport::Deferred {
                    skipped: vec![(RebuildPass::Allocate, e)],
                };
            }
        };

        if let Err(e) = self.backend.upload_config(&self.resolved.to_gpu()) {
            log::warn!("Radiance cascades rebuild deferred: {}", e);
            return TickReport::Deferred {
                skipped: vec![(RebuildPass::UploadConfig, e)],
            };
        }

        let resolved = self.resolved;
        let mut skipped = Vec::new();

        if let Err(e) = self.backend.clear_atlas(pair.working) {
            skipped.push((RebuildPass::Clear, e));
        }
        self.backend.barrier();

        let build_failures = build_levels(&mut self.backend, &resolved, pair.working);
        let levels_built = resolved.active_levels().count() as u32 - build_failures.len() as u32;
        skipped.extend(build_failures);
        self.backend.barrier();

        match self.backend.copy_atlas(pair.working, pair.original) {
            Ok(()) => {
                self.backend.barrier();
                for level in resolved.active_levels() {
                    let stitched = stitch_level(&mut self.backend, &resolved, pair.original, level);
                    if let Err(e) = stitched {
                        skipped.push((RebuildPass::StitchOriginal(level), e));
                    }
                }
            }
            Err(e) => skipped.push((RebuildPass::Snapshot, e)),
        }

        let merge_failures = merge_levels(&mut self.backend, &resolved, &self.merge, pair.working);
        let merge_levels_total = resolved.merge_top_level().map_or(0, |top| top + 1);
        let levels_merged = merge_levels_total
            - merge_failures
                .iter()
                .filter(|(pass, _)| matches!(pass, RebuildPass::Merge(_)))
                .count() as u32;
        skipped.extend(merge_failures);

        if let Err(e) = self.backend.submit() {
            skipped.push((RebuildPass::Submit, e));
        }

        if skipped.is_empty() {
            self.dirty = false;
            log::debug!(
                "Radiance cascades rebuilt: {} levels built, {} merged",
                levels_built,
                levels_merged
            );
            TickReport::Rebuilt(RebuildStats {
                levels_built,
                levels_merged,
                reallocated,
            })
        } else {
            for (pass, e) in &skipped {
                log::warn!("Radiance cascades pass {:?} skipped: {}", pass, e);
            }
            TickReport::Deferred { skipped }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Kernel;
    use crate::cpu::{Command, CpuBackend};
    use glam::{Vec3, Vec4};

    fn flat(_o: Vec3, _d: Vec3, _t0: f32, _t1: f32) -> Vec4 {
        Vec4::ONE
    }

    type FlatBackend = CpuBackend<fn(Vec3, Vec3, f32, f32) -> Vec4>;

    fn cascades(grid_diameter: u32) -> RadianceCascades<FlatBackend> {
        RadianceCascades::new(
            CpuBackend::new(flat as fn(Vec3, Vec3, f32, f32) -> Vec4),
            CascadeConfig::default()
                .with_grid_diameter(grid_diameter)
                .with_atlas_probe_diameter(2),
            MergeParams::default(),
        )
    }

    #[test]
    fn new_instances_start_dirty() {
        let mut rc = cascades(4);
        assert!(rc.is_dirty());
        assert!(rc.sampled_atlas(AtlasSource::Merged).is_none());
        let report = rc.tick();
        assert_eq!(
            report,
            TickReport::Rebuilt(RebuildStats {
                levels_built: 2,
                levels_merged: 3,
                reallocated: true,
            })
        );
        assert!(!rc.is_dirty());
        assert_ne!(
            rc.sampled_atlas(AtlasSource::Merged),
            rc.sampled_atlas(AtlasSource::Original)
        );
    }

    #[test]
    fn clean_tick_records_nothing() {
        let mut rc = cascades(4);
        rc.tick();
        rc.backend_mut().clear_commands();
        assert_eq!(rc.tick(), TickReport::Clean);
        assert!(rc.backend().commands().is_empty());
    }

    #[test]
    fn unchanged_edit_keeps_the_instance_clean() {
        let mut rc = cascades(4);
        rc.tick();
        let signal = rc.apply_edit(ConfigEdit::GridDiameter(4));
        assert!(!signal.changed);
        assert!(!rc.is_dirty());

        let signal = rc.apply_edit(ConfigEdit::GatherRatio(0.1));
        assert!(signal.changed && !signal.structural);
        assert!(rc.is_dirty());
    }

    #[test]
    fn failed_merge_keeps_the_rebuild_pending() {
        let mut rc = cascades(4);
        rc.backend_mut().set_kernel_available(Kernel::Merge, false);
        match rc.tick() {
            TickReport::Deferred { skipped } => {
                assert_eq!(skipped.len(), 3);
                assert!(skipped
                    .iter()
                    .all(|(pass, e)| matches!(pass, RebuildPass::Merge(_))
                        && *e == Error::KernelUnavailable(Kernel::Merge)));
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert!(rc.is_dirty());
        assert!(rc
            .backend()
            .commands()
            .iter()
            .any(|c| matches!(c, Command::Submit)));
    }

    #[test]
    fn structural_edit_reallocates_a_same_sized_pair() {
        let mut rc = cascades(4);
        rc.tick();
        let first = *rc.atlases().unwrap();

        let signal = rc.apply_edit(ConfigEdit::AtlasProbeDiameter(1));
        assert!(signal.changed && signal.structural);
        assert_eq!(AtlasDesc::for_config(rc.resolved()), first.desc);

        match rc.tick() {
            TickReport::Rebuilt(stats) => assert!(stats.reallocated),
            other => panic!("unexpected report {:?}", other),
        }
        let second = *rc.atlases().unwrap();
        assert_eq!(second.desc, first.desc);
        assert_ne!(second.working, first.working);
        assert_ne!(second.original, first.original);
        assert_eq!(rc.backend().atlas_count(), 2);

        // The next rebuild reuses the new pair
        rc.mark_dirty();
        match rc.tick() {
            TickReport::Rebuilt(stats) => assert!(!stats.reallocated),
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn structural_reallocation_survives_a_failed_allocation() {
        let mut rc = cascades(4);
        rc.tick();
        rc.apply_edit(ConfigEdit::AtlasProbeDiameter(1));
        rc.backend_mut().set_max_atlas_bytes(0);
        assert!(matches!(rc.tick(), TickReport::Deferred { .. }));
        assert!(rc.atlases().is_none());

        rc.backend_mut().set_max_atlas_bytes(u64::MAX);
        match rc.tick() {
            TickReport::Rebuilt(stats) => assert!(stats.reallocated),
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[test]
    fn into_backend_releases_the_atlases() {
        let mut rc = cascades(2);
        rc.tick();
        assert_eq!(rc.backend().atlas_count(), 2);
        let backend = rc.into_backend();
        assert_eq!(backend.atlas_count(), 0);
    }
}

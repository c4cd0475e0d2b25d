//! Reference compute backend
//!
//! Runs the kernels on the CPU with rayon, executing every command as soon as
//! it is recorded. Keeps a command log and tracks layer accesses between
//! barriers so ordering mistakes surface as [`Hazard`]s.

use std::collections::{HashMap, HashSet};

use glam::{UVec2, Vec3, Vec4};
use rayon::prelude::*;

use crate::atlas::{border_texel, border_texel_count, stitch_source, AtlasLayout, ProbeSlot};
use crate::compute::{AtlasDesc, AtlasId, ComputeBackend, DispatchParams, Kernel};
use crate::config::{GpuCascadeConfig, ResolvedConfig};
use crate::merge::{gather_upper, merge_texel};
use crate::{octahedral, Error, Result};

/// Atlas budget of a [`CpuBackend`] unless overridden
pub const DEFAULT_MAX_ATLAS_BYTES: u64 = 1 << 30;

/// Scene radiance along a ray segment
pub trait RadianceSampler: Send + Sync {
    fn sample(&self, origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Vec4;
}

impl<F> RadianceSampler for F
where
    F: Fn(Vec3, Vec3, f32, f32) -> Vec4 + Send + Sync,
{
    fn sample(&self, origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Vec4 {
        self(origin, direction, t_min, t_max)
    }
}

/// Host copy of a layered atlas
#[derive(Debug, Clone, PartialEq)]
pub struct CpuAtlas {
    desc: AtlasDesc,
    texels: Vec<Vec4>,
}

impl CpuAtlas {
    fn new(desc: AtlasDesc) -> Self {
        let len = desc.width as usize * desc.height as usize * desc.layers as usize;
        Self {
            desc,
            texels: vec![Vec4::ZERO; len],
        }
    }

    pub fn desc(&self) -> &AtlasDesc {
        &self.desc
    }

    pub fn texel(&self, layer: u32, p: UVec2) -> Vec4 {
        self.texels[self.offset(layer, p)]
    }

    /// Every texel of one layer, row-major
    pub fn layer(&self, layer: u32) -> &[Vec4] {
        let size = self.desc.width as usize * self.desc.height as usize;
        let start = layer as usize * size;
        &self.texels[start..start + size]
    }

    fn set(&mut self, layer: u32, p: UVec2, value: Vec4) {
        let offset = self.offset(layer, p);
        self.texels[offset] = value;
    }

    fn offset(&self, layer: u32, p: UVec2) -> usize {
        debug_assert!(p.x < self.desc.width && p.y < self.desc.height && layer < self.desc.layers);
        let w = self.desc.width as usize;
        let h = self.desc.height as usize;
        (layer as usize * h + p.y as usize) * w + p.x as usize
    }
}

/// A recorded backend command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Allocate(AtlasId),
    Release(AtlasId),
    UploadConfig,
    Clear(AtlasId),
    Copy { src: AtlasId, dst: AtlasId },
    Dispatch {
        kernel: Kernel,
        atlas: AtlasId,
        level: u32,
        work_items: u64,
    },
    Barrier,
    Submit,
}

/// A read of a layer that was written after the last barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hazard {
    /// Index of the offending command in the command log
    pub command: usize,
    pub atlas: AtlasId,
    pub layer: u32,
}

/// Tracks which atlas layers have unfenced writes
#[derive(Debug, Default)]
pub struct AccessTracker {
    pending_writes: HashSet<(AtlasId, u32)>,
    hazards: Vec<Hazard>,
}

impl AccessTracker {
    pub fn read(&mut self, command: usize, atlas: AtlasId, layer: u32) {
        if self.pending_writes.contains(&(atlas, layer)) {
            log::warn!(
                "Hazard: command {} reads layer {} of {:?} before a barrier",
                command,
                layer,
                atlas
            );
            self.hazards.push(Hazard {
                command,
                atlas,
                layer,
            });
        }
    }

    pub fn write(&mut self, atlas: AtlasId, layer: u32) {
        self.pending_writes.insert((atlas, layer));
    }

    pub fn barrier(&mut self) {
        self.pending_writes.clear();
    }

    pub fn hazards(&self) -> &[Hazard] {
        &self.hazards
    }

    fn forget(&mut self, atlas: AtlasId) {
        self.pending_writes.retain(|(id, _)| *id != atlas);
    }
}

/// Invocations a kernel expects for one level
pub fn expected_work_items(kernel: Kernel, resolved: &ResolvedConfig, level: u32) -> u64 {
    let probes = resolved.level_probe_count(level) as u64;
    match kernel {
        Kernel::Build | Kernel::Merge => probes * resolved.level_texels_per_probe(level) as u64,
        Kernel::Stitch => probes * border_texel_count(resolved.level_probe_diameter(level)) as u64,
    }
}

/// [`ComputeBackend`] executing on the host
pub struct CpuBackend<S: RadianceSampler> {
    sampler: S,
    config: Option<ResolvedConfig>,
    atlases: HashMap<AtlasId, CpuAtlas>,
    next_id: u32,
    unavailable: HashSet<Kernel>,
    max_atlas_bytes: u64,
    commands: Vec<Command>,
    tracker: AccessTracker,
}

impl<S: RadianceSampler> CpuBackend<S> {
    pub fn new(sampler: S) -> Self {
        Self {
            sampler,
            config: None,
            atlases: HashMap::new(),
            next_id: 0,
            unavailable: HashSet::new(),
            max_atlas_bytes: DEFAULT_MAX_ATLAS_BYTES,
            commands: Vec::new(),
            tracker: AccessTracker::default(),
        }
    }

    /// Refuse atlases larger than `bytes`
    pub fn with_max_atlas_bytes(mut self, bytes: u64) -> Self {
        self.max_atlas_bytes = bytes;
        self
    }

    pub fn set_max_atlas_bytes(&mut self, bytes: u64) {
        self.max_atlas_bytes = bytes;
    }

    /// Make `kernel` fail with [`Error::KernelUnavailable`] until re-enabled
    pub fn set_kernel_available(&mut self, kernel: Kernel, available: bool) {
        if available {
            self.unavailable.remove(&kernel);
        } else {
            self.unavailable.insert(kernel);
        }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn atlas(&self, id: AtlasId) -> Option<&CpuAtlas> {
        self.atlases.get(&id)
    }

    pub fn atlas_count(&self) -> usize {
        self.atlases.len()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }

    pub fn hazards(&self) -> &[Hazard] {
        self.tracker.hazards()
    }

    fn record(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    fn atlas_ref(&self, id: AtlasId) -> Result<&CpuAtlas> {
        self.atlases.get(&id).ok_or(Error::UnknownAtlas(id))
    }

    fn atlas_mut(&mut self, id: AtlasId) -> Result<&mut CpuAtlas> {
        self.atlases.get_mut(&id).ok_or(Error::UnknownAtlas(id))
    }

    fn run_build(
        &mut self,
        layout: &AtlasLayout,
        atlas: AtlasId,
        params: &DispatchParams,
    ) -> Result<()> {
        let level = params.level;
        let resolved = layout.resolved();
        let d = resolved.level_probe_diameter(level);
        let sampler = &self.sampler;

        let probes: Vec<(ProbeSlot, Vec<Vec4>)> = (0..resolved.level_probe_count(level))
            .into_par_iter()
            .map(|i| {
                let origin = layout.probe_world_position(level, layout.grid_pos_of(level, i));
                let texels = (0..d * d)
                    .map(|t| {
                        let direction = octahedral::texel_direction(UVec2::new(t % d, t / d), d);
                        sampler.sample(origin, direction, params.ray_min, params.ray_max)
                    })
                    .collect();
                (layout.slot_of(level, i), texels)
            })
            .collect();

        let target = self.atlas_mut(atlas)?;
        for (slot, texels) in probes {
            for (t, value) in (0u32..).zip(texels) {
                target.set(level, slot.interior_texel(UVec2::new(t % d, t / d)), value);
            }
        }
        Ok(())
    }

    fn run_merge(
        &mut self,
        layout: &AtlasLayout,
        atlas: AtlasId,
        params: &DispatchParams,
    ) -> Result<()> {
        let level = params.level;
        let resolved = layout.resolved();
        let d = resolved.level_probe_diameter(level);
        let source = self.atlas_ref(atlas)?;

        let probes: Vec<(ProbeSlot, Vec<Vec4>)> = (0..resolved.level_probe_count(level))
            .into_par_iter()
            .map(|i| {
                let grid_pos = layout.grid_pos_of(level, i);
                let slot = layout.slot_of(level, i);
                let texels = (0..d * d)
                    .map(|t| {
                        let texel = UVec2::new(t % d, t / d);
                        let direct = source.texel(level, slot.interior_texel(texel));
                        let fetch = |p| source.texel(level + 1, p);
                        let upper = gather_upper(
                            layout,
                            level,
                            grid_pos,
                            texel,
                            params.gather_offset,
                            fetch,
                        );
                        merge_texel(direct, upper, params.gather_ratio)
                    })
                    .collect();
                (slot, texels)
            })
            .collect();

        let target = self.atlas_mut(atlas)?;
        for (slot, texels) in probes {
            for (t, value) in (0u32..).zip(texels) {
                target.set(level, slot.interior_texel(UVec2::new(t % d, t / d)), value);
            }
        }
        Ok(())
    }

    fn run_stitch(&mut self, layout: &AtlasLayout, atlas: AtlasId, level: u32) -> Result<()> {
        let resolved = layout.resolved();
        let d = resolved.level_probe_diameter(level);
        let source = self.atlas_ref(atlas)?;

        let borders: Vec<(UVec2, Vec4)> = (0..resolved.level_probe_count(level))
            .into_par_iter()
            .flat_map_iter(|i| {
                let slot = layout.slot_of(level, i);
                (0..border_texel_count(d)).filter_map(move |b| {
                    let border = border_texel(b, d);
                    stitch_source(border, d).map(|src| {
                        (slot.padded_texel(border), source.texel(level, slot.interior_texel(src)))
                    })
                })
            })
            .collect();

        let target = self.atlas_mut(atlas)?;
        for (texel, value) in borders {
            target.set(level, texel, value);
        }
        Ok(())
    }
}

impl<S: RadianceSampler> ComputeBackend for CpuBackend<S> {
    fn allocate_atlas(&mut self, desc: &AtlasDesc, label: &str) -> Result<AtlasId> {
        let bytes = desc.byte_size();
        if bytes > self.max_atlas_bytes {
            return Err(Error::Allocation(format!(
                "{} needs {} bytes, limit is {}",
                label, bytes, self.max_atlas_bytes
            )));
        }

        let id = AtlasId(self.next_id);
        self.next_id += 1;
        self.atlases.insert(id, CpuAtlas::new(*desc));
        log::debug!(
            "Allocated {} {:?} ({}x{}x{})",
            label,
            id,
            desc.width,
            desc.height,
            desc.layers
        );
        self.record(Command::Allocate(id));
        Ok(id)
    }

    fn release_atlas(&mut self, atlas: AtlasId) {
        if self.atlases.remove(&atlas).is_some() {
            self.tracker.forget(atlas);
            self.record(Command::Release(atlas));
        }
    }

    fn upload_config(&mut self, config: &GpuCascadeConfig) -> Result<()> {
        self.config = Some(ResolvedConfig::from(config));
        self.record(Command::UploadConfig);
        Ok(())
    }

    fn clear_atlas(&mut self, atlas: AtlasId) -> Result<()> {
        let target = self.atlas_mut(atlas)?;
        target.texels.fill(Vec4::ZERO);
        let layers = target.desc.layers;
        for layer in 0..layers {
            self.tracker.write(atlas, layer);
        }
        self.record(Command::Clear(atlas));
        Ok(())
    }

    fn copy_atlas(&mut self, src: AtlasId, dst: AtlasId) -> Result<()> {
        let source = self.atlas_ref(src)?;
        let desc = source.desc;
        let texels = source.texels.clone();
        let target = self.atlas_mut(dst)?;
        if target.desc != desc {
            return Err(Error::Dispatch(format!(
                "cannot copy {:?} into {:?}: descriptors differ",
                src, dst
            )));
        }
        target.texels = texels;

        let index = self.record(Command::Copy { src, dst });
        for layer in 0..desc.layers {
            self.tracker.read(index, src, layer);
            self.tracker.write(dst, layer);
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        atlas: AtlasId,
        params: &DispatchParams,
        work_items: u64,
    ) -> Result<()> {
        if self.unavailable.contains(&kernel) {
            return Err(Error::KernelUnavailable(kernel));
        }
        let resolved = self.config.ok_or(Error::ConfigNotUploaded)?;
        self.atlas_ref(atlas)?;

        let level = params.level;
        if level >= resolved.total_levels {
            return Err(Error::Dispatch(format!(
                "{} targets level {} of {}",
                kernel.label(),
                level,
                resolved.total_levels
            )));
        }
        let expected = expected_work_items(kernel, &resolved, level);
        if work_items != expected {
            return Err(Error::Dispatch(format!(
                "{} on level {}: {} work items, expected {}",
                kernel.label(),
                level,
                work_items,
                expected
            )));
        }

        let index = self.record(Command::Dispatch {
            kernel,
            atlas,
            level,
            work_items,
        });
        match kernel {
            Kernel::Build => {}
            Kernel::Merge => {
                self.tracker.read(index, atlas, level);
                if level + 1 < resolved.total_levels {
                    self.tracker.read(index, atlas, level + 1);
                }
            }
            Kernel::Stitch => self.tracker.read(index, atlas, level),
        }
        self.tracker.write(atlas, level);

        let layout = AtlasLayout::new(&resolved);
        match kernel {
            Kernel::Build => self.run_build(&layout, atlas, params),
            Kernel::Merge => self.run_merge(&layout, atlas, params),
            Kernel::Stitch => self.run_stitch(&layout, atlas, level),
        }
    }

    fn barrier(&mut self) {
        self.tracker.barrier();
        self.record(Command::Barrier);
    }

    fn submit(&mut self) -> Result<()> {
        log::trace!("Submitting {} recorded commands", self.commands.len());
        self.record(Command::Submit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, CascadeConfig};

    fn direction_sampler(_origin: Vec3, direction: Vec3, _t_min: f32, t_max: f32) -> Vec4 {
        direction.extend(t_max)
    }

    fn setup() -> (CpuBackend<fn(Vec3, Vec3, f32, f32) -> Vec4>, ResolvedConfig, AtlasId) {
        let resolved = resolve(&CascadeConfig {
            grid_diameter: 4,
            atlas_probe_diameter: 3,
            ..CascadeConfig::default()
        });
        let mut backend = CpuBackend::new(direction_sampler as fn(Vec3, Vec3, f32, f32) -> Vec4);
        let atlas = backend
            .allocate_atlas(&AtlasDesc::for_config(&resolved), "test")
            .unwrap();
        backend.upload_config(&resolved.to_gpu()).unwrap();
        (backend, resolved, atlas)
    }

    fn build_params(level: u32) -> DispatchParams {
        DispatchParams {
            level,
            ray_min: 0.0,
            ray_max: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn build_writes_probe_interiors() {
        let (mut backend, resolved, atlas) = setup();
        let work = expected_work_items(Kernel::Build, &resolved, 0);
        backend.dispatch(Kernel::Build, atlas, &build_params(0), work).unwrap();

        let layout = AtlasLayout::new(&resolved);
        let slot = layout.slot_of(0, 5);
        let stored = backend.atlas(atlas).unwrap();
        for y in 0..3 {
            for x in 0..3 {
                let texel = UVec2::new(x, y);
                let expected = octahedral::texel_direction(texel, 3).extend(2.0);
                assert_eq!(stored.texel(0, slot.interior_texel(texel)), expected);
            }
        }
        // Padding untouched until stitched
        assert_eq!(stored.texel(0, slot.origin), Vec4::ZERO);
    }

    #[test]
    fn stitch_fills_the_padding() {
        let (mut backend, resolved, atlas) = setup();
        backend
            .dispatch(
                Kernel::Build,
                atlas,
                &build_params(1),
                expected_work_items(Kernel::Build, &resolved, 1),
            )
            .unwrap();
        backend.barrier();
        backend
            .dispatch(
                Kernel::Stitch,
                atlas,
                &DispatchParams::for_level(1),
                expected_work_items(Kernel::Stitch, &resolved, 1),
            )
            .unwrap();

        let slot = AtlasLayout::new(&resolved).slot_of(1, 3);
        let stored = backend.atlas(atlas).unwrap();
        assert_eq!(
            stored.texel(1, slot.origin),
            stored.texel(1, slot.interior_texel(UVec2::splat(5)))
        );
        assert_eq!(
            stored.texel(1, slot.padded_texel(UVec2::new(2, 0))),
            stored.texel(1, slot.interior_texel(UVec2::new(4, 0)))
        );
        assert!(backend.hazards().is_empty());
    }

    #[test]
    fn missing_barrier_is_reported() {
        let (mut backend, resolved, atlas) = setup();
        backend
            .dispatch(
                Kernel::Build,
                atlas,
                &build_params(0),
                expected_work_items(Kernel::Build, &resolved, 0),
            )
            .unwrap();
        backend
            .dispatch(
                Kernel::Stitch,
                atlas,
                &DispatchParams::for_level(0),
                expected_work_items(Kernel::Stitch, &resolved, 0),
            )
            .unwrap();
        assert_eq!(
            backend.hazards(),
            &[Hazard {
                command: 3,
                atlas,
                layer: 0
            }]
        );
    }

    #[test]
    fn failures_are_errors() {
        let resolved = resolve(&CascadeConfig::default().with_grid_diameter(4));
        let desc = AtlasDesc::for_config(&resolved);
        let mut backend = CpuBackend::new(direction_sampler as fn(Vec3, Vec3, f32, f32) -> Vec4)
            .with_max_atlas_bytes(desc.byte_size() - 1);
        assert!(matches!(
            backend.allocate_atlas(&desc, "too big"),
            Err(Error::Allocation(_))
        ));

        backend.set_max_atlas_bytes(desc.byte_size());
        let atlas = backend.allocate_atlas(&desc, "fits").unwrap();
        assert_eq!(
            backend.dispatch(Kernel::Build, atlas, &build_params(0), 1),
            Err(Error::ConfigNotUploaded)
        );

        backend.upload_config(&resolved.to_gpu()).unwrap();
        assert_eq!(
            backend.dispatch(Kernel::Build, AtlasId(99), &build_params(0), 1),
            Err(Error::UnknownAtlas(AtlasId(99)))
        );
        assert!(matches!(
            backend.dispatch(Kernel::Build, atlas, &build_params(0), 1),
            Err(Error::Dispatch(_))
        ));

        backend.set_kernel_available(Kernel::Merge, false);
        assert_eq!(
            backend.dispatch(Kernel::Merge, atlas, &DispatchParams::for_level(0), 0),
            Err(Error::KernelUnavailable(Kernel::Merge))
        );
        assert_eq!(backend.dispatch_count(), 0);
    }

    #[test]
    fn copy_requires_matching_atlases() {
        let (mut backend, resolved, atlas) = setup();
        let copy = backend
            .allocate_atlas(&AtlasDesc::for_config(&resolved), "copy")
            .unwrap();
        backend
            .dispatch(
                Kernel::Build,
                atlas,
                &build_params(0),
                expected_work_items(Kernel::Build, &resolved, 0),
            )
            .unwrap();
        backend.barrier();
        backend.copy_atlas(atlas, copy).unwrap();
        assert_eq!(backend.atlas(atlas).unwrap(), backend.atlas(copy).unwrap());

        let other = backend
            .allocate_atlas(
                &AtlasDesc {
                    layers: 1,
                    ..AtlasDesc::for_config(&resolved)
                },
                "other",
            )
            .unwrap();
        assert!(matches!(backend.copy_atlas(atlas, other), Err(Error::Dispatch(_))));
        backend.release_atlas(other);
        assert_eq!(backend.atlas_count(), 2);
    }
}

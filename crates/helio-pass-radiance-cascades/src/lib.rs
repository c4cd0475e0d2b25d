//! wgpu compute backend for `helio-radiance-cascades`
//!
//! Atlases are RGBA32F 2D array textures with one layer per cascade level.
//! Commands are recorded as they are issued and encoded on
//! [`submit`](ComputeBackend::submit): dispatches between two barriers share a
//! compute pass, copies run between passes, and every dispatch reads its
//! parameters from one slot of a dynamic-offset uniform buffer that is written
//! right before the command buffer is submitted.
//!
//! Merge and stitch read and write the same layer, which needs read-write
//! storage access to `Rgba32Float`. On adapters without it those kernels
//! report [`Error::KernelUnavailable`].

use std::collections::HashMap;
use std::sync::Arc;

use helio_radiance_cascades::{
    AtlasDesc, AtlasId, ComputeBackend, DispatchParams, Error, GpuCascadeConfig, Kernel, Result,
};

pub use pipelines::compose_source;
pub use uniforms::GpuDispatchParams;

mod pipelines;
mod uniforms;

use pipelines::{KernelLayouts, KernelPipelines};
use uniforms::PARAMS_SIZE;

const WORKGROUP_SIZE: u32 = 64;
const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;
const INITIAL_PARAM_SLOTS: u32 = 64;

/// Device features the backend can make use of on `adapter`
pub fn optional_features(adapter: &wgpu::Adapter) -> wgpu::Features {
    adapter.features() & wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES
}

/// Whether merge and stitch can run on a device created from `adapter`
pub fn supports_read_write_storage(adapter: &wgpu::Adapter, device: &wgpu::Device) -> bool {
    device
        .features()
        .contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
        && adapter
            .get_texture_format_features(wgpu::TextureFormat::Rgba32Float)
            .flags
            .contains(wgpu::TextureFormatFeatureFlags::STORAGE_READ_WRITE)
}

/// Split `work_items` invocations into a 2D workgroup grid
pub fn workgroup_grid(work_items: u32) -> (u32, u32) {
    let groups = work_items.div_ceil(WORKGROUP_SIZE);
    if groups == 0 {
        return (0, 0);
    }
    let x = groups.min(MAX_WORKGROUPS_PER_DIMENSION);
    (x, groups.div_ceil(x))
}

fn align_to(val: u32, alignment: u32) -> u32 { (val + alignment - 1) & !(alignment - 1) }

struct GpuAtlas {
    texture: wgpu::Texture,
    array_view: wgpu::TextureView,
    layer_views: Vec<wgpu::TextureView>,
    desc: AtlasDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Clear,
    Kernel(Kernel),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Dispatch {
        pipeline: Pipeline,
        atlas: AtlasId,
        layer: u32,
        param_slot: u32,
        groups: (u32, u32),
    },
    Copy {
        src: AtlasId,
        dst: AtlasId,
    },
    Barrier,
}

impl Op {
    fn touches(&self, id: AtlasId) -> bool {
        match *self {
            Op::Dispatch { atlas, .. } => atlas == id,
            Op::Copy { src, dst } => src == id || dst == id,
            Op::Barrier => false,
        }
    }
}

/// [`ComputeBackend`] recording into wgpu compute passes
pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    layouts: KernelLayouts,
    pipelines: KernelPipelines,
    config_buffer: wgpu::Buffer,
    config: Option<GpuCascadeConfig>,
    params_buffer: wgpu::Buffer,
    params_capacity: u32,
    params_stride: u32,
    staged_params: Vec<GpuDispatchParams>,
    atlases: HashMap<AtlasId, GpuAtlas>,
    next_id: u32,
    empty_view: wgpu::TextureView,
    ops: Vec<Op>,
}

impl WgpuBackend {
    /// Create the backend; `read_write_storage` enables merge and stitch (see
    /// [`supports_read_write_storage`])
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        read_write_storage: bool,
    ) -> Result<Self> {
        log::info!(
            "Initializing radiance cascades compute backend (read-write storage: {})",
            read_write_storage
        );
        let layouts = KernelLayouts::new(&device, read_write_storage);
        let pipelines = KernelPipelines::new(&device, &layouts)?;

        let config_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rc_config"),
            size: std::mem::size_of::<GpuCascadeConfig>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let params_stride = align_to(
            PARAMS_SIZE as u32,
            device.limits().min_uniform_buffer_offset_alignment,
        );
        let params_buffer = create_params_buffer(&device, params_stride, INITIAL_PARAM_SLOTS);

        // Bound as the parent layer when merging the coarsest level
        let empty = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("rc_empty_level"),
            size: wgpu::Extent3d { width: 1, height: 1, depth_or_array_layers: 1 },
            mip_level_count: 1, sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let empty_view = empty.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Self {
            device,
            queue,
            layouts,
            pipelines,
            config_buffer,
            config: None,
            params_buffer,
            params_capacity: INITIAL_PARAM_SLOTS,
            params_stride,
            staged_params: Vec::new(),
            atlases: HashMap::new(),
            next_id: 0,
            empty_view,
            ops: Vec::new(),
        })
    }

    /// Inject the scene's radiance function and compile the build kernel
    ///
    /// `wgsl` must define `fn sample_radiance(origin: vec3<f32>, dir: vec3<f32>,
    /// t_min: f32, t_max: f32) -> vec4<f32>`.
    /// It may declare its own bindings in group 1 or above only if the
    /// caller also extends the pipeline layout, so analytic scenes are the
    /// common case.
    pub fn set_scene_sampler(&mut self, wgsl: &str) -> Result<()> {
        match KernelPipelines::create_build(&self.device, &self.layouts, wgsl) {
            Ok(pipeline) => {
                self.pipelines.build = Some(pipeline);
                Ok(())
            }
            Err(e) => {
                self.pipelines.build = None;
                Err(e)
            }
        }
    }

    pub fn is_kernel_available(&self, kernel: Kernel) -> bool {
        self.pipelines.for_kernel(kernel).is_some()
    }

    /// Array view over every level of `atlas`, for sampling by renderers
    pub fn atlas_view(&self, atlas: AtlasId) -> Option<&wgpu::TextureView> {
        self.atlases.get(&atlas).map(|a| &a.array_view)
    }

    /// Single-level view of `atlas`
    pub fn atlas_layer_view(&self, atlas: AtlasId, level: u32) -> Option<&wgpu::TextureView> {
        self.atlases
            .get(&atlas)
            .and_then(|a| a.layer_views.get(level as usize))
    }

    pub fn atlas_texture(&self, atlas: AtlasId) -> Option<&wgpu::Texture> {
        self.atlases.get(&atlas).map(|a| &a.texture)
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    /// Commands recorded since the last submit
    pub fn pending_commands(&self) -> usize {
        self.ops.len()
    }

    fn stage_params(&mut self, params: GpuDispatchParams) -> u32 {
        self.staged_params.push(params);
        self.staged_params.len() as u32 - 1
    }

    fn upload_params(&mut self) {
        let count = self.staged_params.len() as u32;
        if count > self.params_capacity {
            let capacity = count.next_power_of_two();
            log::debug!("Growing dispatch parameter buffer to {} slots", capacity);
            self.params_buffer = create_params_buffer(&self.device, self.params_stride, capacity);
            self.params_capacity = capacity;
        }

        let stride = self.params_stride as usize;
        let mut bytes = vec![0u8; stride * count as usize];
        for (slot, params) in self.staged_params.iter().enumerate() {
            let offset = slot * stride;
            bytes[offset..offset + PARAMS_SIZE as usize]
                .copy_from_slice(bytemuck::bytes_of(params));
        }
        if !bytes.is_empty() {
            self.queue.write_buffer(&self.params_buffer, 0, &bytes);
        }
        self.staged_params.clear();
    }

    fn create_bind_group(
        &self,
        pipeline: Pipeline,
        atlas: &GpuAtlas,
        layer: u32,
    ) -> Result<wgpu::BindGroup> {
        let (layout, kernel) = match pipeline {
            Pipeline::Clear => (&self.layouts.write, None),
            Pipeline::Kernel(kernel) => (
                self.layouts
                    .for_kernel(kernel)
                    .ok_or(Error::KernelUnavailable(kernel))?,
                Some(kernel),
            ),
        };
        let target = atlas
            .layer_views
            .get(layer as usize)
            .ok_or_else(|| Error::Dispatch(format!("atlas has no layer {}", layer)))?;

        let params = wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: &self.params_buffer,
            offset: 0,
            size: wgpu::BufferSize::new(PARAMS_SIZE),
        });
        let mut entries = vec![
            wgpu::BindGroupEntry { binding: 0, resource: self.config_buffer.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: params },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: wgpu::BindingResource::TextureView(target),
            },
        ];
        if kernel == Some(Kernel::Merge) {
            let upper = atlas.layer_views.get(layer as usize + 1).unwrap_or(&self.empty_view);
            entries.push(wgpu::BindGroupEntry {
                binding: 3,
                resource: wgpu::BindingResource::TextureView(upper),
            });
        }

        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("rc_dispatch_bg"),
            layout,
            entries: &entries,
        }))
    }
}

fn create_params_buffer(device: &wgpu::Device, stride: u32, slots: u32) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("rc_dispatch_params"),
        size: stride as u64 * slots as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

impl ComputeBackend for WgpuBackend {
    fn allocate_atlas(&mut self, desc: &AtlasDesc, label: &str) -> Result<AtlasId> {
        let limits = self.device.limits();
        if desc.width > limits.max_texture_dimension_2d
            || desc.height > limits.max_texture_dimension_2d
            || desc.layers > limits.max_texture_array_layers
            || desc.layers == 0
        {
            return Err(Error::Allocation(format!(
                "{} ({}x{}x{}) exceeds device limits",
                label, desc.width, desc.height, desc.layers
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Allocation(format!("{}: {}", label, err)));
        }

        let array_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(label),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            array_layer_count: Some(desc.layers),
            ..Default::default()
        });
        let layer_views = (0..desc.layers)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(label),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        let id = AtlasId(self.next_id);
        self.next_id += 1;
        log::debug!(
            "Allocated {} {:?} ({}x{}x{})",
            label,
            id,
            desc.width,
            desc.height,
            desc.layers
        );
        self.atlases.insert(id, GpuAtlas { texture, array_view, layer_views, desc: *desc });
        Ok(id)
    }

    fn release_atlas(&mut self, atlas: AtlasId) {
        if self.atlases.remove(&atlas).is_some() {
            let before = self.ops.len();
            self.ops.retain(|op| !op.touches(atlas));
            if self.ops.len() != before {
                let dropped = before - self.ops.len();
                log::warn!("Dropped {} pending commands on released {:?}", dropped, atlas);
            }
        }
    }

    fn upload_config(&mut self, config: &GpuCascadeConfig) -> Result<()> {
        self.queue.write_buffer(&self.config_buffer, 0, bytemuck::bytes_of(config));
        self.config = Some(*config);
        Ok(())
    }

    fn clear_atlas(&mut self, atlas: AtlasId) -> Result<()> {
        let desc = self.atlases.get(&atlas).ok_or(Error::UnknownAtlas(atlas))?.desc;
        let texels = desc.width.checked_mul(desc.height).ok_or_else(|| {
            Error::Dispatch(format!("{:?} is too large to clear", atlas))
        })?;
        for layer in 0..desc.layers {
            let param_slot = self.stage_params(GpuDispatchParams::clear(layer, texels));
            self.ops.push(Op::Dispatch {
                pipeline: Pipeline::Clear,
                atlas,
                layer,
                param_slot,
                groups: workgroup_grid(texels),
            });
        }
        Ok(())
    }

    fn copy_atlas(&mut self, src: AtlasId, dst: AtlasId) -> Result<()> {
        let src_desc = self.atlases.get(&src).ok_or(Error::UnknownAtlas(src))?.desc;
        let dst_desc = self.atlases.get(&dst).ok_or(Error::UnknownAtlas(dst))?.desc;
        if src_desc != dst_desc {
            return Err(Error::Dispatch(format!(
                "cannot copy {:?} into {:?}: descriptors differ",
                src, dst
            )));
        }
        self.ops.push(Op::Copy { src, dst });
        Ok(())
    }

    fn dispatch(
        &mut self,
        kernel: Kernel,
        atlas: AtlasId,
        params: &DispatchParams,
        work_items: u64,
    ) -> Result<()> {
        if !self.is_kernel_available(kernel) {
            return Err(Error::KernelUnavailable(kernel));
        }
        if self.config.is_none() {
            return Err(Error::ConfigNotUploaded);
        }
        let desc = self.atlases.get(&atlas).ok_or(Error::UnknownAtlas(atlas))?.desc;
        if params.level >= desc.layers {
            return Err(Error::Dispatch(format!(
                "{} targets level {} of {}",
                kernel.label(),
                params.level,
                desc.layers
            )));
        }
        let work_items = u32::try_from(work_items).map_err(|_| {
            Error::Dispatch(format!("{} work items exceed one dispatch", work_items))
        })?;

        let groups = workgroup_grid(work_items);
        if groups.0 == 0 {
            return Ok(());
        }
        log::trace!("{} level {}: {:?} workgroups", kernel.label(), params.level, groups);
        let param_slot = self.stage_params(GpuDispatchParams::new(params, work_items));
        self.ops.push(Op::Dispatch {
            pipeline: Pipeline::Kernel(kernel),
            atlas,
            layer: params.level,
            param_slot,
            groups,
        });
        Ok(())
    }

    fn barrier(&mut self) {
        if !matches!(self.ops.last(), None | Some(Op::Barrier)) {
            self.ops.push(Op::Barrier);
        }
    }

    fn submit(&mut self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        self.upload_params();

        // Bind groups for every dispatch, created up front so passes only borrow them
        let mut bind_groups = Vec::with_capacity(ops.len());
        for op in &ops {
            let bind_group = match *op {
                Op::Dispatch { pipeline, atlas, layer, .. } => {
                    let target = self.atlases.get(&atlas).ok_or(Error::UnknownAtlas(atlas))?;
                    Some(self.create_bind_group(pipeline, target, layer)?)
                }
                Op::Copy { src, dst } => {
                    for id in [src, dst] {
                        if !self.atlases.contains_key(&id) {
                            return Err(Error::UnknownAtlas(id));
                        }
                    }
                    None
                }
                Op::Barrier => None,
            };
            bind_groups.push(bind_group);
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Radiance Cascades Encoder"),
        });

        let mut passes = 0;
        let mut i = 0;
        while i < ops.len() {
            match ops[i] {
                Op::Barrier => i += 1,
                Op::Copy { src, dst } => {
                    let (Some(src), Some(dst)) = (self.atlases.get(&src), self.atlases.get(&dst))
                    else {
                        i += 1;
                        continue;
                    };
                    encoder.copy_texture_to_texture(
                        wgpu::ImageCopyTexture {
                            texture: &src.texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d::ZERO,
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::ImageCopyTexture {
                            texture: &dst.texture,
                            mip_level: 0,
                            origin: wgpu::Origin3d::ZERO,
                            aspect: wgpu::TextureAspect::All,
                        },
                        wgpu::Extent3d {
                            width: src.desc.width,
                            height: src.desc.height,
                            depth_or_array_layers: src.desc.layers,
                        },
                    );
                    i += 1;
                }
                Op::Dispatch { .. } => {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("Radiance Cascades Pass"),
                        timestamp_writes: None,
                    });
                    while let Some(Op::Dispatch {
                        pipeline,
                        param_slot,
                        groups,
                        ..
                    }) = ops.get(i).copied()
                    {
                        let compute_pipeline = match pipeline {
                            Pipeline::Clear => Some(&self.pipelines.clear),
                            Pipeline::Kernel(kernel) => self.pipelines.for_kernel(kernel),
                        };
                        if let (Some(compute_pipeline), Some(bind_group)) =
                            (compute_pipeline, &bind_groups[i])
                        {
                            pass.set_pipeline(compute_pipeline);
                            pass.set_bind_group(0, bind_group, &[param_slot * self.params_stride]);
                            pass.dispatch_workgroups(groups.0, groups.1, 1);
                        }
                        i += 1;
                    }
                    passes += 1;
                }
            }
        }

        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Dispatch(err.to_string()));
        }
        log::trace!("Submitted {} commands in {} compute passes", ops.len(), passes);
        Ok(())
    }
}

//! Compute pipelines for the cascade kernels

use helio_radiance_cascades::{Error, Kernel, Result};

const COMMON_WGSL: &str = include_str!("../shaders/common.wgsl");
const CLEAR_WGSL: &str = include_str!("../shaders/clear.wgsl");
const BUILD_WGSL: &str = include_str!("../shaders/build.wgsl");
const MERGE_WGSL: &str = include_str!("../shaders/merge.wgsl");
const STITCH_WGSL: &str = include_str!("../shaders/stitch.wgsl");

/// Compose a kernel module from the shared prelude, optional injected code and
/// the kernel body
pub fn compose_source(injected: Option<&str>, body: &str) -> String {
    let mut source = String::with_capacity(COMMON_WGSL.len() + body.len() + 256);
    source.push_str(COMMON_WGSL);
    source.push('\n');
    if let Some(code) = injected {
        source.push_str(code);
        source.push('\n');
    }
    source.push_str(body);
    source
}

/// Bind group layouts shared by the kernels
pub struct KernelLayouts {
    /// Config, params, write-only layer (clear and build)
    pub write: wgpu::BindGroupLayout,
    /// Config, params, read-write layer (stitch)
    pub read_write: Option<wgpu::BindGroupLayout>,
    /// Config, params, read-write layer, sampled parent layer (merge)
    pub merge: Option<wgpu::BindGroupLayout>,
}

impl KernelLayouts {
    pub fn new(device: &wgpu::Device, read_write_storage: bool) -> Self {
        let write = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("rc_write_bgl"),
            entries: &[
                bgl_uniform(0),
                bgl_uniform_dynamic(1),
                bgl_storage_tex(2, wgpu::StorageTextureAccess::WriteOnly),
            ],
        });

        let (read_write, merge) = if read_write_storage {
            let read_write = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("rc_read_write_bgl"),
                entries: &[
                    bgl_uniform(0),
                    bgl_uniform_dynamic(1),
                    bgl_storage_tex(2, wgpu::StorageTextureAccess::ReadWrite),
                ],
            });
            let merge = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("rc_merge_bgl"),
                entries: &[
                    bgl_uniform(0),
                    bgl_uniform_dynamic(1),
                    bgl_storage_tex(2, wgpu::StorageTextureAccess::ReadWrite),
                    bgl_tex2d(3),
                ],
            });
            (Some(read_write), Some(merge))
        } else {
            (None, None)
        };

        Self {
            write,
            read_write,
            merge,
        }
    }

    pub fn for_kernel(&self, kernel: Kernel) -> Option<&wgpu::BindGroupLayout> {
        match kernel {
            Kernel::Build => Some(&self.write),
            Kernel::Merge => self.merge.as_ref(),
            Kernel::Stitch => self.read_write.as_ref(),
        }
    }
}

/// Every pipeline the backend may dispatch
pub struct KernelPipelines {
    pub clear: wgpu::ComputePipeline,
    pub build: Option<wgpu::ComputePipeline>,
    pub merge: Option<wgpu::ComputePipeline>,
    pub stitch: Option<wgpu::ComputePipeline>,
}

impl KernelPipelines {
    pub fn new(device: &wgpu::Device, layouts: &KernelLayouts) -> Result<Self> {
        let clear = create_pipeline(
            device,
            &layouts.write,
            "rc_clear",
            &compose_source(None, CLEAR_WGSL),
            "clear",
        )?;

        let merge = match &layouts.merge {
            Some(layout) => Some(create_pipeline(
                device,
                layout,
                Kernel::Merge.label(),
                &compose_source(None, MERGE_WGSL),
                "merge",
            )?),
            None => None,
        };
        let stitch = match &layouts.read_write {
            Some(layout) => Some(create_pipeline(
                device,
                layout,
                Kernel::Stitch.label(),
                &compose_source(None, STITCH_WGSL),
                "stitch",
            )?),
            None => None,
        };

        Ok(Self {
            clear,
            build: None,
            merge,
            stitch,
        })
    }

    /// Compile the build kernel against a scene sampler snippet
    pub fn create_build(
        device: &wgpu::Device,
        layouts: &KernelLayouts,
        scene_sampler: &str,
    ) -> Result<wgpu::ComputePipeline> {
        create_pipeline(
            device,
            &layouts.write,
            Kernel::Build.label(),
            &compose_source(Some(scene_sampler), BUILD_WGSL),
            "build",
        )
    }

    pub fn for_kernel(&self, kernel: Kernel) -> Option<&wgpu::ComputePipeline> {
        match kernel {
            Kernel::Build => self.build.as_ref(),
            Kernel::Merge => self.merge.as_ref(),
            Kernel::Stitch => self.stitch.as_ref(),
        }
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    bind_group_layout: &wgpu::BindGroupLayout,
    label: &str,
    source: &str,
    entry_point: &str,
) -> Result<wgpu::ComputePipeline> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[bind_group_layout],
        push_constant_ranges: &[],
    });
    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&layout),
        module: &shader,
        entry_point: Some(entry_point),
        compilation_options: Default::default(),
        cache: None,
    });

    match pollster::block_on(device.pop_error_scope()) {
        Some(err) => Err(Error::Dispatch(format!("{} failed to compile: {}", label, err))),
        None => {
            log::debug!("Created compute pipeline {}", label);
            Ok(pipeline)
        }
    }
}

fn bgl_uniform(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry { binding, visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Uniform, has_dynamic_offset: false, min_binding_size: None },
        count: None }
}
fn bgl_uniform_dynamic(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry { binding, visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Uniform, has_dynamic_offset: true, min_binding_size: None },
        count: None }
}
fn bgl_storage_tex(binding: u32, access: wgpu::StorageTextureAccess) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry { binding, visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::StorageTexture { access, format: wgpu::TextureFormat::Rgba32Float, view_dimension: wgpu::TextureViewDimension::D2 },
        count: None }
}
fn bgl_tex2d(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry { binding, visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture { sample_type: wgpu::TextureSampleType::Float { filterable: false }, view_dimension: wgpu::TextureViewDimension::D2, multisampled: false },
        count: None }
}

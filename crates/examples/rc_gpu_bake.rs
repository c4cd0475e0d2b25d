//! Bake a radiance cascade hierarchy with the wgpu compute backend on a
//! headless device.

use std::sync::Arc;

use helio_pass_radiance_cascades::{optional_features, supports_read_write_storage, WgpuBackend};
use helio_radiance_cascades::{
    AtlasSource, CascadeConfig, ConfigEdit, MergeParams, RadianceCascades, TickReport,
};

const SCENE_WGSL: &str = r#"
const LIGHT_CENTER: vec3<f32> = vec3<f32>(0.0, 1.5, 0.0);
const LIGHT_RADIUS: f32 = 0.5;

fn sample_radiance(origin: vec3<f32>, dir: vec3<f32>, t_min: f32, t_max: f32) -> vec4<f32> {
    let oc = origin - LIGHT_CENTER;
    let b = dot(oc, dir);
    let c = dot(oc, oc) - LIGHT_RADIUS * LIGHT_RADIUS;
    let disc = b * b - c;
    if (disc >= 0.0) {
        let t = -b - sqrt(disc);
        if (t >= t_min && t < t_max) {
            return vec4<f32>(4.0, 3.6, 3.0, 0.0);
        }
    }
    if (dir.y > 0.0) {
        return vec4<f32>(0.05, 0.07, 0.1, 1.0) * min(t_max - t_min, 1.0);
    }
    return vec4<f32>(0.0, 0.0, 0.0, 1.0);
}
"#;

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        force_fallback_adapter: false,
        compatible_surface: None,
    }))
    .expect("no suitable GPU adapter");
    log::info!("Using adapter: {:?}", adapter.get_info().name);

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("rc_gpu_bake"),
            required_features: optional_features(&adapter),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    ))
    .expect("failed to create device");
    let device = Arc::new(device);
    let queue = Arc::new(queue);

    let read_write = supports_read_write_storage(&adapter, &device);
    if !read_write {
        log::warn!(
            "Adapter lacks read-write Rgba32Float storage; merge and stitch will be skipped"
        );
    }

    let mut backend =
        WgpuBackend::new(device.clone(), queue, read_write).expect("failed to create backend");
    backend.set_scene_sampler(SCENE_WGSL).expect("scene sampler failed to compile");

    let config = CascadeConfig::default()
        .with_grid_diameter(32)
        .with_atlas_probe_diameter(8)
        .with_ray_length(0.1);
    let mut rc = RadianceCascades::new(backend, config, MergeParams::default());

    let start = std::time::Instant::now();
    match rc.tick() {
        TickReport::Rebuilt(stats) => log::info!("Initial bake: {:?}", stats),
        other => log::warn!("Initial bake: {:?}", other),
    }
    let _ = device.poll(wgpu::Maintain::Wait);
    log::info!("  took {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);

    rc.apply_edit(ConfigEdit::RayLength(0.2));
    let start = std::time::Instant::now();
    match rc.tick() {
        TickReport::Rebuilt(stats) => log::info!("Rebake after ray length edit: {:?}", stats),
        other => log::warn!("Rebake after ray length edit: {:?}", other),
    }
    let _ = device.poll(wgpu::Maintain::Wait);
    log::info!("  took {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);

    if let Some(atlas) = rc.sampled_atlas(AtlasSource::Merged) {
        let view = rc.backend().atlas_view(atlas);
        log::info!("Merged atlas {:?} ready for sampling: {}", atlas, view.is_some());
    }
}

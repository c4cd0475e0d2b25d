//! Bake a radiance cascade hierarchy on the CPU backend and print per-level
//! statistics.
//!
//! The scene is a single emissive sphere above the origin with a dim sky.
//! Run with `RUST_LOG=debug` to see the resolved layout and every pass.

use glam::{UVec2, Vec3, Vec4};
use helio_radiance_cascades::{
    AtlasSource, CascadeConfig, ConfigEdit, CpuBackend, MergeParams, RadianceCascades, TickReport,
};

const LIGHT_CENTER: Vec3 = Vec3::new(0.0, 1.5, 0.0);
const LIGHT_RADIUS: f32 = 0.5;
const LIGHT_COLOR: Vec3 = Vec3::new(4.0, 3.6, 3.0);
const SKY_COLOR: Vec3 = Vec3::new(0.05, 0.07, 0.1);

/// Radiance along one ray interval: the light if hit inside it, sky past the
/// last cascade, nothing otherwise. Alpha carries visibility.
fn sphere_light(origin: Vec3, dir: Vec3, t_min: f32, t_max: f32) -> Vec4 {
    let oc = origin - LIGHT_CENTER;
    let b = oc.dot(dir);
    let c = oc.length_squared() - LIGHT_RADIUS * LIGHT_RADIUS;
    let disc = b * b - c;
    if disc >= 0.0 {
        let t = -b - disc.sqrt();
        if t >= t_min && t < t_max {
            return LIGHT_COLOR.extend(0.0);
        }
    }
    if dir.y > 0.0 {
        SKY_COLOR.extend(1.0) * (t_max - t_min).min(1.0)
    } else {
        Vec4::new(0.0, 0.0, 0.0, 1.0)
    }
}

fn print_levels(rc: &RadianceCascades<CpuBackend<fn(Vec3, Vec3, f32, f32) -> Vec4>>) {
    let Some(merged) = rc.sampled_atlas(AtlasSource::Merged) else {
        return;
    };
    let Some(atlas) = rc.backend().atlas(merged) else {
        return;
    };
    let layout = rc.layout();
    let resolved = rc.resolved();

    for level in 0..resolved.total_levels {
        let probes = resolved.level_probe_count(level);
        let probe_diameter = resolved.level_probe_diameter(level);
        let mut sum = Vec3::ZERO;
        let mut peak = 0.0f32;
        for i in 0..probes {
            let slot = layout.slot_of(level, i);
            for y in 0..probe_diameter {
                for x in 0..probe_diameter {
                    let texel = atlas.texel(level, slot.interior_texel(UVec2::new(x, y)));
                    sum += texel.truncate();
                    peak = peak.max(texel.x.max(texel.y).max(texel.z));
                }
            }
        }
        let samples = (probes as u64 * probe_diameter as u64 * probe_diameter as u64).max(1) as f32;
        let mean = sum / samples;
        println!(
            "  level {}: {:>6} probes, {:>2}x{:<2} texels, mean ({:.3}, {:.3}, {:.3}), peak {:.3}",
            level, probes, probe_diameter, probe_diameter, mean.x, mean.y, mean.z, peak
        );
    }
}

fn report(label: &str, report: &TickReport) {
    match report {
        TickReport::Rebuilt(stats) => println!(
            "{}: rebuilt ({} built, {} merged, reallocated: {})",
            label, stats.levels_built, stats.levels_merged, stats.reallocated
        ),
        other => println!("{}: {:?}", label, other),
    }
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let sampler: fn(Vec3, Vec3, f32, f32) -> Vec4 = sphere_light;
    let config = CascadeConfig::default()
        .with_grid_diameter(16)
        .with_atlas_probe_diameter(8)
        .with_ray_length(0.1);
    let mut rc = RadianceCascades::new(CpuBackend::new(sampler), config, MergeParams::default());

    println!("=== Radiance Cascades CPU Bake ===");
    let start = std::time::Instant::now();
    let first = rc.tick();
    report("initial bake", &first);
    println!("  took {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);
    print_levels(&rc);

    // Nothing changed: the next tick is free
    report("idle tick", &rc.tick());

    let signal = rc.apply_edits([ConfigEdit::GatherRatio(0.5), ConfigEdit::MaxLevel(1)]);
    log::info!("Edit signal: {:?}", signal);
    let start = std::time::Instant::now();
    report("after edit", &rc.tick());
    println!("  took {:.1} ms", start.elapsed().as_secs_f64() * 1000.0);
    print_levels(&rc);

    let hazards = rc.backend().hazards();
    if !hazards.is_empty() {
        log::warn!("{} unfenced reads recorded", hazards.len());
    }
    let backend = rc.into_backend();
    log::info!("Released atlases, {} remain", backend.atlas_count());
}

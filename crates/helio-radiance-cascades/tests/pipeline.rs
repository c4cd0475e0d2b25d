use glam::{UVec2, Vec3, Vec4};
use helio_radiance_cascades::build::ray_range;
use helio_radiance_cascades::cpu::Command;
use helio_radiance_cascades::{
    AtlasSource, CascadeConfig, ConfigEdit, CpuAtlas, CpuBackend, Error, Kernel, MergeParams,
    RadianceCascades, RadianceSampler, RebuildPass, TickReport,
};

fn scene(origin: Vec3, direction: Vec3, t_min: f32, t_max: f32) -> Vec4 {
    let light = Vec3::new(0.3, 0.8, -0.2).normalize();
    let facing = direction.dot(light).max(0.0);
    Vec4::new(facing * (1.0 + origin.x.abs()), t_min, t_max * 0.1, 1.0)
}

fn small_config() -> CascadeConfig {
    CascadeConfig::default()
        .with_grid_diameter(4)
        .with_atlas_probe_diameter(2)
}

fn cascades<S: RadianceSampler>(
    sampler: S,
    config: CascadeConfig,
) -> RadianceCascades<CpuBackend<S>> {
    let _ = env_logger::builder().is_test(true).try_init();
    RadianceCascades::new(CpuBackend::new(sampler), config, MergeParams::default())
}

fn snapshot<S: RadianceSampler>(
    rc: &RadianceCascades<CpuBackend<S>>,
    source: AtlasSource,
) -> CpuAtlas {
    let id = rc.sampled_atlas(source).expect("atlas allocated");
    rc.backend().atlas(id).expect("atlas exists").clone()
}

fn bits(atlas: &CpuAtlas, layer: u32) -> Vec<[u32; 4]> {
    atlas
        .layer(layer)
        .iter()
        .map(|t| t.to_array().map(f32::to_bits))
        .collect()
}

#[test]
fn rebuilds_are_bit_identical() {
    let mut rc = cascades(scene, small_config());
    assert!(matches!(rc.tick(), TickReport::Rebuilt(_)));
    let first = snapshot(&rc, AtlasSource::Merged);

    rc.mark_dirty();
    assert!(matches!(rc.tick(), TickReport::Rebuilt(_)));
    let second = snapshot(&rc, AtlasSource::Merged);

    for layer in 0..rc.resolved().total_levels {
        assert_eq!(bits(&first, layer), bits(&second, layer), "layer {}", layer);
    }
}

#[test]
fn automatic_max_level_matches_the_explicit_level() {
    let mut auto = cascades(scene, small_config());
    let explicit_level = auto.resolved().total_levels as i32 - 2;
    let mut explicit = cascades(scene, small_config().with_max_level(explicit_level));
    auto.tick();
    explicit.tick();

    assert_eq!(auto.backend().commands(), explicit.backend().commands());
    let a = snapshot(&auto, AtlasSource::Merged);
    let b = snapshot(&explicit, AtlasSource::Merged);
    for layer in 0..auto.resolved().total_levels {
        assert_eq!(bits(&a, layer), bits(&b, layer));
    }
}

/// Command with the work item count dropped; the backend validates counts itself
fn shape(command: &Command) -> Command {
    match *command {
        Command::Dispatch {
            kernel,
            atlas,
            level,
            ..
        } => Command::Dispatch {
            kernel,
            atlas,
            level,
            work_items: 0,
        },
        other => other,
    }
}

#[test]
fn merge_is_fenced_on_both_sides() {
    let mut rc = cascades(scene, small_config());
    rc.tick();
    let backend = rc.backend();
    assert!(backend.hazards().is_empty(), "{:?}", backend.hazards());

    let working = rc.sampled_atlas(AtlasSource::Merged).unwrap();
    let mut expected = Vec::new();
    for level in (0..=2).rev() {
        for kernel in [Kernel::Merge, Kernel::Stitch] {
            expected.push(Command::Barrier);
            expected.push(Command::Dispatch {
                kernel,
                atlas: working,
                level,
                work_items: 0,
            });
        }
    }
    expected.push(Command::Submit);

    let commands = backend.commands();
    let tail: Vec<Command> = commands[commands.len() - expected.len()..]
        .iter()
        .map(shape)
        .collect();
    assert_eq!(tail, expected);
}

#[test]
fn build_traces_each_level_over_its_interval() {
    let mut rc = cascades(scene, small_config());
    rc.tick();
    let original = snapshot(&rc, AtlasSource::Original);
    let layout = *rc.layout();
    let ray_length = rc.config().ray_length;

    for level in rc.resolved().active_levels() {
        let (t_min, t_max) = ray_range(level, ray_length);
        let slot = layout.slot_of(level, 0);
        let texel = original.texel(level, slot.interior_texel(UVec2::ZERO));
        assert_eq!(texel.y, t_min);
        assert_eq!(texel.z, t_max * 0.1);
        assert_eq!(texel.w, 1.0);
    }

    // The coarsest level is never built
    let top = rc.resolved().total_levels - 1;
    assert!(original.layer(top).iter().all(|t| *t == Vec4::ZERO));
}

#[test]
fn coarse_radiance_accumulates_into_finer_levels() {
    let mut rc = cascades(|_: Vec3, _: Vec3, _: f32, _: f32| Vec4::ONE, small_config());
    rc.tick();
    let merged = snapshot(&rc, AtlasSource::Merged);
    let original = snapshot(&rc, AtlasSource::Original);
    let layout = *rc.layout();
    let ratio = rc.merge_params().gather_ratio;

    let expected = [1.0 + ratio, 1.0, 0.0];
    for (level, value) in expected.iter().enumerate() {
        let level = level as u32;
        for i in 0..rc.resolved().level_probe_count(level) {
            let slot = layout.slot_of(level, i);
            for y in 0..slot.padded_diameter {
                for x in 0..slot.padded_diameter {
                    let t = merged.texel(level, slot.padded_texel(UVec2::new(x, y)));
                    assert!((t.x - value).abs() < 1e-5, "level {} probe {}: {:?}", level, i, t);
                    assert!((t.y - value).abs() < 1e-5);
                }
            }
        }
    }

    let slot = layout.slot_of(0, 3);
    assert_eq!(original.texel(0, slot.origin), Vec4::ONE);
    assert_eq!(merged.texel(0, slot.interior_texel(UVec2::ONE)).w, 1.0);
}

#[test]
fn empty_configuration_leaves_the_atlas_untouched() {
    let mut rc = cascades(scene, small_config());
    rc.tick();
    let before = snapshot(&rc, AtlasSource::Merged);

    let signal = rc.apply_edit(ConfigEdit::GridDiameter(0));
    assert!(signal.structural);
    rc.backend_mut().clear_commands();

    assert_eq!(rc.tick(), TickReport::Empty);
    assert!(!rc.is_dirty());
    assert_eq!(rc.resolved().total_levels, 0);
    assert!(rc.backend().commands().is_empty());
    assert_eq!(snapshot(&rc, AtlasSource::Merged), before);
}

#[test]
fn unavailable_kernel_defers_until_it_returns() {
    let mut rc = cascades(scene, small_config());
    rc.backend_mut().set_kernel_available(Kernel::Build, false);

    match rc.tick() {
        TickReport::Deferred { skipped } => {
            let passes: Vec<RebuildPass> = skipped.iter().map(|(pass, _)| *pass).collect();
            assert_eq!(passes, vec![RebuildPass::Build(1), RebuildPass::Build(0)]);
            assert!(skipped
                .iter()
                .all(|(_, e)| *e == Error::KernelUnavailable(Kernel::Build)));
        }
        other => panic!("expected a deferred rebuild, got {:?}", other),
    }
    assert!(rc.is_dirty());

    rc.backend_mut().set_kernel_available(Kernel::Build, true);
    match rc.tick() {
        TickReport::Rebuilt(stats) => {
            assert_eq!(stats.levels_built, 2);
            assert!(!stats.reallocated);
        }
        other => panic!("expected a rebuild, got {:?}", other),
    }
    assert!(!rc.is_dirty());
    assert_eq!(rc.tick(), TickReport::Clean);
}

#[test]
fn failed_allocation_is_retried() {
    let backend = CpuBackend::new(scene).with_max_atlas_bytes(1024);
    let mut rc = RadianceCascades::new(backend, small_config(), MergeParams::default());

    match rc.tick() {
        TickReport::Deferred { skipped } => {
            assert_eq!(skipped.len(), 1);
            assert_eq!(skipped[0].0, RebuildPass::Allocate);
            assert!(matches!(skipped[0].1, Error::Allocation(_)));
        }
        other => panic!("expected a deferred rebuild, got {:?}", other),
    }
    assert!(rc.is_dirty());
    assert!(rc.sampled_atlas(AtlasSource::Merged).is_none());
    assert_eq!(rc.backend().atlas_count(), 0);

    rc.backend_mut().set_max_atlas_bytes(u64::MAX);
    assert!(matches!(rc.tick(), TickReport::Rebuilt(_)));
}

#[test]
fn structural_edits_reallocate_the_pair() {
    let mut rc = cascades(scene, small_config());
    rc.tick();
    let first = *rc.atlases().unwrap();

    let signal = rc.apply_edit(ConfigEdit::RayLength(0.2));
    assert!(signal.changed && !signal.structural);
    match rc.tick() {
        TickReport::Rebuilt(stats) => assert!(!stats.reallocated),
        other => panic!("{:?}", other),
    }
    assert_eq!(*rc.atlases().unwrap(), first);

    let signal = rc.apply_edit(ConfigEdit::AtlasProbeDiameter(3));
    assert!(signal.structural);
    match rc.tick() {
        TickReport::Rebuilt(stats) => assert!(stats.reallocated),
        other => panic!("{:?}", other),
    }
    let second = *rc.atlases().unwrap();
    assert_ne!(second.working, first.working);
    assert_ne!(second.desc, first.desc);
    assert_eq!(rc.backend().atlas_count(), 2);
    assert!(rc.backend().atlas(first.working).is_none());
}

//! Octahedral direction mapping
//!
//! Directions are folded onto an octahedron and unwrapped into the unit
//! square. The lower hemisphere lands in the four outer triangles.

use glam::{UVec2, Vec2, Vec3};

/// Map a direction to `[0, 1]^2`
pub fn encode(dir: Vec3) -> Vec2 {
    let n = dir / (dir.x.abs() + dir.y.abs() + dir.z.abs());
    let mut p = Vec2::new(n.x, n.y);
    if n.z < 0.0 {
        p = (Vec2::ONE - Vec2::new(p.y.abs(), p.x.abs())) * sign_not_zero(p);
    }
    p * 0.5 + Vec2::splat(0.5)
}

/// Map a point of `[0, 1]^2` back to a unit direction
pub fn decode(uv: Vec2) -> Vec3 {
    let f = uv * 2.0 - Vec2::ONE;
    let mut n = Vec3::new(f.x, f.y, 1.0 - f.x.abs() - f.y.abs());
    let t = (-n.z).max(0.0);
    n.x += if n.x >= 0.0 { -t } else { t };
    n.y += if n.y >= 0.0 { -t } else { t };
    n.normalize()
}

/// Direction through the centre of `texel` in a `diameter`-wide patch
pub fn texel_direction(texel: UVec2, diameter: u32) -> Vec3 {
    decode((texel.as_vec2() + Vec2::splat(0.5)) / diameter as f32)
}

fn sign_not_zero(v: Vec2) -> Vec2 {
    Vec2::new(
        if v.x >= 0.0 { 1.0 } else { -1.0 },
        if v.y >= 0.0 { 1.0 } else { -1.0 },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axes_map_to_expected_points() {
        assert!(encode(Vec3::Z).abs_diff_eq(Vec2::splat(0.5), 1e-6));
        assert!(encode(Vec3::X).abs_diff_eq(Vec2::new(1.0, 0.5), 1e-6));
        assert!(encode(Vec3::NEG_Y).abs_diff_eq(Vec2::new(0.5, 0.0), 1e-6));
        // -Z folds to a corner
        let corner = encode(Vec3::NEG_Z);
        assert!(corner.x == 0.0 || corner.x == 1.0);
        assert!(corner.y == 0.0 || corner.y == 1.0);
    }

    #[test]
    fn decode_inverts_encode() {
        let dirs = [
            Vec3::new(0.3, -0.8, 0.2),
            Vec3::new(-0.5, 0.5, -0.7),
            Vec3::new(0.9, 0.1, -0.4),
            Vec3::new(-0.2, -0.3, 0.9),
        ];
        for dir in dirs {
            let dir = dir.normalize();
            assert!(decode(encode(dir)).abs_diff_eq(dir, 1e-5), "{:?}", dir);
        }
    }

    #[test]
    fn texel_directions_are_unit_length() {
        for y in 0..6 {
            for x in 0..6 {
                let d = texel_direction(UVec2::new(x, y), 6);
                assert!((d.length() - 1.0).abs() < 1e-5);
            }
        }
    }
}

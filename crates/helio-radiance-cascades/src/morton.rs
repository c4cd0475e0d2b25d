//! Z-order helpers for probe indices
//!
//! Probes are stored in 3D Morton order; the same index decoded as a 2D Morton
//! code gives the probe's cell in the atlas. Both codes put x in the least
//! significant bit.

use glam::{UVec2, UVec3};
use morton_encoding::{morton_decode, morton_encode};

/// Interleave a 3D grid coordinate into a probe index
#[inline]
pub fn encode3(p: UVec3) -> u32 {
    let code: u128 = morton_encode([p.z, p.y, p.x]);
    code as u32
}

/// Inverse of [`encode3`]
#[inline]
pub fn decode3(index: u32) -> UVec3 {
    let zyx: [u32; 3] = morton_decode(index as u128);
    UVec3::new(zyx[2], zyx[1], zyx[0])
}

/// Interleave a 2D cell into an index
#[inline]
pub fn encode2(p: UVec2) -> u32 {
    let code: u64 = morton_encode([p.y, p.x]);
    code as u32
}

/// Decode `index` as a 2D Morton code
#[inline]
pub fn decode2(index: u32) -> UVec2 {
    let yx: [u32; 2] = morton_decode(index as u64);
    UVec2::new(yx[1], yx[0])
}

use bytemuck::{Pod, Zeroable};
use helio_radiance_cascades::DispatchParams;

/// Per-dispatch uniform block, one slot per recorded dispatch
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDispatchParams {
    pub level: u32,
    pub work_items: u32,
    pub ray_min: f32,
    pub ray_max: f32,
    pub gather_offset: f32,
    pub gather_ratio: f32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl GpuDispatchParams {
    pub fn new(params: &DispatchParams, work_items: u32) -> Self {
        Self {
            level: params.level,
            work_items,
            ray_min: params.ray_min,
            ray_max: params.ray_max,
            gather_offset: params.gather_offset,
            gather_ratio: params.gather_ratio,
            _pad0: 0,
            _pad1: 0,
        }
    }

    /// Clearing a layer only needs its texel count
    pub fn clear(layer: u32, texels: u32) -> Self {
        Self::new(&DispatchParams::for_level(layer), texels)
    }
}

pub const PARAMS_SIZE: u64 = std::mem::size_of::<GpuDispatchParams>() as u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_fit_a_uniform_block() {
        assert_eq!(PARAMS_SIZE, 32);
        assert_eq!(PARAMS_SIZE % 16, 0);
    }
}

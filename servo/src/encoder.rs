//! Electrical angle derivation and position rezeroing for the absolute
//! magnetic encoder.  The per-sector offset table absorbs encoder and winding
//! misalignment measured during motor calibration.

use core::f32::consts::PI;

use libm::roundf;

use crate::math::wrap_zero_to_two_pi;

pub const MAX_OFFSET_COUNT: usize = 1024;

const U16_TO_THETA: f32 = 2.0 * PI / 65536.0;

/// Per-sector electrical offsets, radians.  The active length is a power of
/// two dividing 65536, so sector selection is a shift in disguise.
#[derive(Clone, Debug, PartialEq)]
#[repr(C)]
pub struct OffsetTable {
    values: [f32; MAX_OFFSET_COUNT],
    len: usize,
}

impl Default for OffsetTable {
    fn default() -> Self {
        Self {
            values: [0.0; MAX_OFFSET_COUNT],
            len: 64,
        }
    }
}

impl OffsetTable {
    pub fn set(&mut self, values: &[f32]) {
        debug_assert!(!values.is_empty());
        debug_assert!(values.len() <= MAX_OFFSET_COUNT);
        debug_assert!(65536 % values.len() == 0);
        self.len = values.len().clamp(1, MAX_OFFSET_COUNT);
        self.values[..self.len].copy_from_slice(&values[..self.len]);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, index: usize) -> f32 {
        self.values[index]
    }
}

/// Electrical angle in [0, 2π) for a given (already inverted) position.
/// `position_constant` is poles / 2.
pub fn electrical_theta(position: u16, position_constant: i32, offsets: &OffsetTable) -> f32 {
    let index = position as usize * offsets.len() / 65536;
    wrap_zero_to_two_pi(
        ((position_constant * position as i32) % 65536) as f32 * U16_TO_THETA + offsets.get(index),
    )
}

/// Re-seed the unwrapped accumulator: pick the multiple of one revolution
/// that places the scaled position closest to `target`.
pub fn rezero_unwrapped(position: u16, target: f32, scale: f32) -> i32 {
    let zero_position = position as i16 as i32;
    let error = target - zero_position as f32 * scale / 65536.0;
    let integral_offsets = roundf(error / scale) as i32;
    zero_position.wrapping_add(integral_offsets.wrapping_mul(65536))
}

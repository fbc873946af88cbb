//! Rotor-frame transforms: Q31 angle conversion, sin/cos, and the combined
//! Clarke + Park projections between phase currents/voltages and the (d, q)
//! frame.

use core::f32::consts::PI;

use libm::{cosf, sinf};

const Q31_SCALE: f32 = 2_147_483_648.0;
const SQRT3_DIV_2: f32 = 0.866_025_4;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Vec3 {
    pub a: f32,
    pub b: f32,
    pub c: f32,
}

#[derive(Clone, Copy, Debug)]
pub struct SinCos {
    pub s: f32,
    pub c: f32,
}

/// Map radians onto the Q31 phase domain: [-π, π) becomes the full i32 range.
pub fn radians_to_q31(theta: f32) -> i32 {
    let mut normalized = theta / PI;
    while normalized >= 1.0 {
        normalized -= 2.0;
    }
    while normalized < -1.0 {
        normalized += 2.0;
    }
    (normalized * Q31_SCALE) as i32
}

pub fn sin_cos(q31: i32) -> SinCos {
    let theta = q31 as f32 / Q31_SCALE * PI;
    SinCos {
        s: sinf(theta),
        c: cosf(theta),
    }
}

/// Phase currents to the rotor frame (amplitude-invariant Clarke, then Park).
/// Returns (d, q).
pub fn dq_transform(sc: &SinCos, a: f32, b: f32, c: f32) -> (f32, f32) {
    let i_alpha = (2.0 / 3.0) * (a - 0.5 * b - 0.5 * c);
    let i_beta = (2.0 / 3.0) * SQRT3_DIV_2 * (b - c);

    let d = sc.c * i_alpha + sc.s * i_beta;
    let q = -sc.s * i_alpha + sc.c * i_beta;
    (d, q)
}

/// Rotor-frame (d, q) back to three phases.
pub fn inverse_dq_transform(sc: &SinCos, d: f32, q: f32) -> Vec3 {
    let v_alpha = sc.c * d - sc.s * q;
    let v_beta = sc.s * d + sc.c * q;

    Vec3 {
        a: v_alpha,
        b: -0.5 * v_alpha + SQRT3_DIV_2 * v_beta,
        c: -0.5 * v_alpha - SQRT3_DIV_2 * v_beta,
    }
}

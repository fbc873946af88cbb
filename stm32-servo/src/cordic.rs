//! Hardware CORDIC sin/cos for the control tick.
//!
//! The peripheral is left configured for the sine function in Q31 mode:
//! each conversion is one argument write and two result reads, which is what
//! keeps the per-tick trigonometry off the FPU.

use embassy_stm32::pac::cordic::vals;
use embassy_stm32::pac::{CORDIC, RCC};

use servo::dq::SinCos;

const Q31_SCALE: f32 = 2_147_483_648.0;

pub fn initialize() {
    RCC.ahb1enr().modify(|w| w.set_cordicen(true));
    RCC.ahb1rstr().modify(|w| w.set_cordicrst(true));
    RCC.ahb1rstr().modify(|w| w.set_cordicrst(false));

    CORDIC.csr().write(|w| {
        w.set_func(vals::Func::SINE);
        w.set_precision(vals::Precision::ITERS24);
        w.set_nargs(vals::Num::NUM1);
        w.set_nres(vals::Num::NUM2);
        w.set_scale(vals::Scale::A1_R1);
    });

    drain_results();
}

/// sin/cos of a Q31-scaled angle ([-pi, pi) mapped onto the i32 range).
pub fn sin_cos(theta_q31: i32) -> SinCos {
    CORDIC.wdata().write_value(theta_q31 as u32);
    let sin_q31 = CORDIC.rdata().read();
    let cos_q31 = CORDIC.rdata().read();
    SinCos {
        s: f32_from_q31(sin_q31),
        c: f32_from_q31(cos_q31),
    }
}

fn f32_from_q31(value: u32) -> f32 {
    value as i32 as f32 / Q31_SCALE
}

fn drain_results() {
    while CORDIC.csr().read().rrdy() {
        CORDIC.rdata().read();
    }
}

//! Register-level view of the timer, ADCs and debug DAC for the control
//! core, plus the one-time peripheral programming done at start.
//!
//! The five ADCs split as: ADC3/ADC1/ADC2 on the three phase shunts, ADC4 on
//! the bus divider, ADC5 walking FET temp / motor temp within each tick.
//! Analog pins are left in their reset (analog) state; only the sequences
//! and sample times are programmed here.

use embassy_stm32::pac;
use embassy_stm32::pac::adc::vals as adc_vals;
use embassy_stm32::pac::timer::vals as tim_vals;
use embassy_stm32::interrupt;
use embassy_stm32::interrupt::InterruptExt;

use servo::config::Config;
use servo::dq::SinCos;
use servo::hal::{AuxChannel, ClockedRegisters, MillisecondTimer};
use servo::servo::PWM_RATE_HZ;

use crate::cordic;

const TIMER_HZ: u32 = 170_000_000;
/// Center-aligned: one up/down sweep spans 2 * ARR counts.
pub const PWM_COUNTS: u32 = TIMER_HZ / (2 * PWM_RATE_HZ);

// Board channel map.
const CUR1_SQR: u8 = 1; // ADC3
const CUR2_SQR: u8 = 1; // ADC1
const CUR3_SQR: u8 = 1; // ADC2
const VSENSE_SQR: u8 = 3; // ADC4
const TSENSE_SQR: u8 = 4; // ADC5
const MSENSE_SQR: u8 = 13; // ADC5

// TIM1 CH1..3 on PA8..PA10; the monitors read the pins straight back.
const PHASE_PIN_MASK: u32 = (1 << 8) | (1 << 9) | (1 << 10);

/// Supported ADC sample durations in cycles; a configured count maps to the
/// smallest covering entry's register code.
const CYCLE_MAP: [u16; 8] = [2, 6, 12, 24, 47, 92, 247, 640];

fn map_cycles(value: u16) -> u32 {
    for (code, cycles) in CYCLE_MAP.iter().enumerate() {
        if value <= *cycles {
            return code as u32;
        }
    }
    CYCLE_MAP.len() as u32 - 1
}

/// The same 3-bit sample-time code for every channel of one ADC.
fn all_channel_cycles(code: u32) -> u32 {
    (0..10).fold(0, |acc, i| acc | (code << (3 * i)))
}

/// Busy-wait delay for bring-up sequencing only.
pub struct BusyWaitTimer;

impl MillisecondTimer for BusyWaitTimer {
    fn wait_us(&mut self, us: u32) {
        cortex_m::asm::delay(us * (TIMER_HZ / 1_000_000));
    }
}

fn wait_for_adc(adc: pac::adc::Adc) {
    while !adc.isr().read().eoc() {}
    adc.isr().write(|w| w.set_eoc(true));
}

pub struct G4Registers;

impl G4Registers {
    pub fn new() -> Self {
        Self
    }
}

impl ClockedRegisters for G4Registers {
    fn start_sample(&mut self) {
        pac::ADC1.cr().modify(|w| w.set_adstart(true));
        pac::ADC2.cr().modify(|w| w.set_adstart(true));
        pac::ADC3.cr().modify(|w| w.set_adstart(true));
        pac::ADC4.cr().modify(|w| w.set_adstart(true));
        pac::ADC5.cr().modify(|w| w.set_adstart(true));
    }

    fn wait_current_done(&mut self) {
        wait_for_adc(pac::ADC1);
        wait_for_adc(pac::ADC2);
        wait_for_adc(pac::ADC3);
    }

    fn current_raw(&self) -> [u16; 3] {
        [
            pac::ADC3.dr().read().0 as u16,
            pac::ADC1.dr().read().0 as u16,
            pac::ADC2.dr().read().0 as u16,
        ]
    }

    fn wait_aux_done(&mut self) {
        wait_for_adc(pac::ADC4);
        wait_for_adc(pac::ADC5);
    }

    fn aux4_raw(&self) -> u16 {
        pac::ADC4.dr().read().0 as u16
    }

    fn aux5_raw(&self) -> u16 {
        pac::ADC5.dr().read().0 as u16
    }

    fn wait_aux5_done(&mut self) {
        wait_for_adc(pac::ADC5);
    }

    fn select_aux5(&mut self, channel: AuxChannel) {
        let adc = pac::ADC5;
        // A stop gate is required before the sequence register may change.
        adc.cr().modify(|w| w.set_adstp(true));
        while adc.cr().read().adstp() {}

        let sqr = match channel {
            AuxChannel::VoltageSense => VSENSE_SQR,
            AuxChannel::FetTemp => TSENSE_SQR,
            AuxChannel::MotorTemp => MSENSE_SQR,
        };
        adc.sqr1().write(|w| {
            w.set_l(0);
            w.set_sq(0, sqr);
        });
    }

    fn start_aux5(&mut self) {
        pac::ADC5.cr().modify(|w| w.set_adstart(true));
    }

    fn outputs_high(&self) -> bool {
        (pac::GPIOA.idr().read().0 & PHASE_PIN_MASK) != 0
    }

    fn set_pwm(&mut self, counts: [u16; 3]) {
        let tim = pac::TIM1;
        tim.ccr(0).write(|w| w.set_ccr(counts[0]));
        tim.ccr(1).write(|w| w.set_ccr(counts[1]));
        tim.ccr(2).write(|w| w.set_ccr(counts[2]));
    }

    fn pwm_counts(&self) -> u32 {
        PWM_COUNTS
    }

    fn set_debug_dac(&mut self, value: u16) {
        pac::DAC1.dhr12r(0).write(|w| w.set_dhr(value));
    }

    fn sin_cos(&mut self, theta_q31: i32) -> SinCos {
        cordic::sin_cos(theta_q31)
    }
}

/// One-time ADC programming: regulator start, calibration, sample times and
/// conversion sequences for all five converters.
pub fn configure_adc(config: &Config, timer: &mut impl MillisecondTimer) {
    let adcs = [pac::ADC1, pac::ADC2, pac::ADC3, pac::ADC4, pac::ADC5];

    pac::RCC.ahb2enr().modify(|w| {
        w.set_adc12en(true);
        w.set_adc345en(true);
    });

    for adc in adcs {
        if adc.cr().read().aden() {
            adc.cr().modify(|w| w.set_addis(true));
            while adc.cr().read().aden() {}
        }
    }

    // Below /6 the channels crosstalk in a way that looks like
    // quantization noise.
    pac::ADC12_COMMON
        .ccr()
        .modify(|w| w.set_presc(adc_vals::Presc::DIV6));
    pac::ADC345_COMMON
        .ccr()
        .modify(|w| w.set_presc(adc_vals::Presc::DIV6));

    for adc in adcs {
        adc.cr().modify(|w| {
            w.set_deeppwd(false);
            w.set_advregen(true);
        });
    }
    // tADCVREG_S startup
    timer.wait_us(20);

    for adc in adcs {
        adc.cr().modify(|w| w.set_adcal(true));
    }
    for adc in adcs {
        while adc.cr().read().adcal() {}
    }
    timer.wait_us(1);

    for adc in adcs {
        adc.isr().write(|w| w.set_adrdy(true));
        adc.cr().modify(|w| w.set_aden(true));
        while !adc.isr().read().adrdy() {}
        adc.isr().write(|w| w.set_adrdy(true));
    }

    let cur_cycles = all_channel_cycles(map_cycles(config.adc_cur_cycles));
    let aux_cycles = all_channel_cycles(map_cycles(config.adc_aux_cycles));
    for adc in [pac::ADC1, pac::ADC2, pac::ADC3] {
        adc.smpr(0).write(|w| w.0 = cur_cycles);
        adc.smpr(1).write(|w| w.0 = cur_cycles);
    }
    for adc in [pac::ADC4, pac::ADC5] {
        adc.smpr(0).write(|w| w.0 = aux_cycles);
        adc.smpr(1).write(|w| w.0 = aux_cycles);
    }

    let set_single = |adc: pac::adc::Adc, sqr: u8| {
        adc.sqr1().write(|w| {
            w.set_l(0);
            w.set_sq(0, sqr);
        });
    };
    set_single(pac::ADC3, CUR1_SQR);
    set_single(pac::ADC1, CUR2_SQR);
    set_single(pac::ADC2, CUR3_SQR);
    set_single(pac::ADC4, VSENSE_SQR);
    set_single(pac::ADC5, TSENSE_SQR);
}

/// One-time PWM timer programming.  Center-aligned mode 2 with RCR = 1 fires
/// the update interrupt once per full up/down sweep; NVIC priority 0 keeps
/// the sampling window deterministic.
pub fn configure_pwm_timer() {
    let tim = pac::TIM1;

    pac::RCC.apb2enr().modify(|w| w.set_tim1en(true));

    tim.cr1().modify(|w| {
        w.set_cms(tim_vals::Cms::CENTER_ALIGNED2);
        w.set_arpe(true);
    });
    tim.rcr().write(|w| w.set_rep(1));
    tim.psc().write(|w| w.set_psc(0));
    tim.arr().write(|w| w.set_arr(PWM_COUNTS as u16));

    for channel in 0..3 {
        tim.ccmr_output(channel / 2).modify(|w| {
            w.set_ocm(channel % 2, tim_vals::Ocm::PWM_MODE1);
            w.set_ocpe(channel % 2, true);
        });
        tim.ccer().modify(|w| w.set_cce(channel, true));
        tim.ccr(channel).write(|w| w.set_ccr(0));
    }
    tim.bdtr().modify(|w| w.set_moe(true));

    tim.dier().modify(|w| w.set_uie(true));

    interrupt::TIM1_UP_TIM16.set_priority(interrupt::Priority::P0);
    unsafe {
        interrupt::TIM1_UP_TIM16.enable();
    }

    // Load everything, then run.
    tim.egr().write(|w| w.set_ug(true));
    tim.cr1().modify(|w| w.set_cen(true));
}

//! Persisted configuration entities.  All three are written by the
//! foreground (config load / update) and read by the ISR; `#[repr(C)]` keeps
//! their layout stable for the flash blob store.

use crate::encoder::OffsetTable;
use crate::pid::PidConfig;

/// Calibration-time description of the attached motor.
#[derive(Clone, Debug, PartialEq)]
#[repr(C)]
pub struct Motor {
    /// Magnetic pole count.  Zero means "not configured" and faults the
    /// first current-bearing dispatch.
    pub poles: u8,
    /// Encoder counts opposite to phase order.
    pub invert: bool,
    /// Phase-to-phase winding resistance.
    pub resistance_ohm: f32,
    /// Back-EMF constant, volts per electrical Hz.
    pub v_per_hz: f32,
    /// Output units per encoder revolution (gear ratio).
    pub unwrapped_position_scale: f32,
    pub offset: OffsetTable,
    pub rotation_current_cutoff_a: f32,
    pub rotation_current_scale: f32,
    pub rotation_torque_scale: f32,
}

impl Default for Motor {
    fn default() -> Self {
        Self {
            poles: 0,
            invert: false,
            resistance_ohm: 0.0,
            v_per_hz: 0.0,
            unwrapped_position_scale: 1.0,
            offset: OffsetTable::default(),
            rotation_current_cutoff_a: 10.0,
            rotation_current_scale: 0.05,
            rotation_torque_scale: 14.7,
        }
    }
}

/// Runtime limits and regulator gains.
#[derive(Clone, Debug, PartialEq)]
#[repr(C)]
pub struct Config {
    /// Current-sense amplifier gain.
    pub i_gain: f32,
    /// Volts per ADC count on the bus divider.
    pub v_scale_v: f32,
    pub max_voltage: f32,
    pub fault_temperature: f32,
    /// Temperature where the current limit starts folding back.
    pub derate_temperature: f32,
    /// Current limit remaining at the fault temperature.
    pub derate_current_a: f32,
    pub max_current_a: f32,
    /// Velocities inside this band read as zero for the position damper.
    pub velocity_threshold: f32,
    pub velocity_filter_length: usize,
    pub default_timeout_s: f32,
    pub timeout_max_torque_nm: f32,
    /// Dead-zone compensation for the FET bridge, as PWM fractions.
    pub pwm_min: f32,
    pub pwm_min_blend: f32,
    pub feedforward_scale: f32,
    /// Distance over which q current folds to zero outside position limits.
    pub position_derate: f32,
    /// Bus voltage where the flux brake engages; 0 disables it.
    pub flux_brake_min_voltage: f32,
    pub flux_brake_resistance_ohm: f32,
    pub pid_dq: PidConfig,
    pub pid_position: PidConfig,
    /// ADC sample durations, in cycles (rounded up to the supported steps).
    pub adc_cur_cycles: u16,
    pub adc_aux_cycles: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            i_gain: 20.0,
            v_scale_v: 0.018,
            max_voltage: 37.0,
            fault_temperature: 75.0,
            derate_temperature: 50.0,
            derate_current_a: 20.0,
            max_current_a: 100.0,
            velocity_threshold: 0.09,
            velocity_filter_length: 256,
            default_timeout_s: 0.1,
            timeout_max_torque_nm: 0.1,
            pwm_min: 0.006,
            pwm_min_blend: 0.01,
            feedforward_scale: 1.0,
            position_derate: 0.02,
            flux_brake_min_voltage: 0.0,
            flux_brake_resistance_ohm: 0.1,
            pid_dq: PidConfig {
                kp: 0.005,
                ki: 30.0,
                kd: 0.0,
                ilimit: 20.0,
            },
            pid_position: PidConfig {
                kp: 450.0,
                ki: 100.0,
                kd: 9.0,
                ilimit: 0.0,
            },
            adc_cur_cycles: 2,
            adc_aux_cycles: 47,
        }
    }
}

/// Soft position limits in output units.  NaN means no bound.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct PositionConfig {
    pub position_min: f32,
    pub position_max: f32,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            position_min: f32::NAN,
            position_max: f32::NAN,
        }
    }
}

//! ISR-owned observable state.  `Status` accumulates across ticks, `Control`
//! is rebuilt every tick.  The foreground only ever reads these.

use crate::dq::Vec3;
use crate::fault::Fault;
use crate::mode::Mode;
use crate::pid::PidState;

#[derive(Clone, Debug)]
pub struct Status {
    pub mode: Mode,
    pub fault: Fault,

    pub adc_cur1_raw: u16,
    pub adc_cur2_raw: u16,
    pub adc_cur3_raw: u16,
    pub adc_voltage_sense_raw: u16,
    pub adc_fet_temp_raw: u16,
    pub adc_motor_temp_raw: u16,

    pub adc_cur1_offset: u16,
    pub adc_cur2_offset: u16,
    pub adc_cur3_offset: u16,

    pub cur1_a: f32,
    pub cur2_a: f32,
    pub cur3_a: f32,

    pub bus_v: f32,
    /// Long (0.5 s) and short (1 ms) filtered bus voltage.
    pub filt_bus_v: f32,
    pub filt_1ms_bus_v: f32,

    pub position_raw: u16,
    pub position: u16,
    pub unwrapped_position_raw: i32,
    /// Scaled by the gear ratio, in output units.
    pub unwrapped_position: f32,
    pub velocity: f32,

    pub electrical_theta: f32,
    pub sin: f32,
    pub cos: f32,
    pub d_a: f32,
    pub q_a: f32,
    pub torque_nm: f32,

    pub fet_temp_c: f32,

    /// Watchdog remaining; NaN disables the countdown.
    pub timeout_s: f32,

    /// The active position setpoint, distinct from the commanded target.
    pub control_position: f32,
    /// Pending rezero target, consumed once the encoder is valid.
    pub position_to_set: f32,
    pub rezeroed: bool,

    pub pid_d: PidState,
    pub pid_q: PidState,
    pub pid_position: PidState,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            mode: Mode::Stopped,
            fault: Fault::Success,
            adc_cur1_raw: 0,
            adc_cur2_raw: 0,
            adc_cur3_raw: 0,
            adc_voltage_sense_raw: 0,
            adc_fet_temp_raw: 0,
            adc_motor_temp_raw: 0,
            adc_cur1_offset: 2048,
            adc_cur2_offset: 2048,
            adc_cur3_offset: 2048,
            cur1_a: 0.0,
            cur2_a: 0.0,
            cur3_a: 0.0,
            bus_v: 0.0,
            filt_bus_v: f32::NAN,
            filt_1ms_bus_v: f32::NAN,
            position_raw: 0,
            position: 0,
            unwrapped_position_raw: 0,
            unwrapped_position: 0.0,
            velocity: 0.0,
            electrical_theta: 0.0,
            sin: 0.0,
            cos: 0.0,
            d_a: 0.0,
            q_a: 0.0,
            torque_nm: 0.0,
            fet_temp_c: 0.0,
            timeout_s: 0.0,
            control_position: f32::NAN,
            // Startup forces the unwrapped position within one revolution
            // of zero as soon as the encoder reads valid.
            position_to_set: 0.0,
            rezeroed: false,
            pid_d: PidState::default(),
            pid_q: PidState::default(),
            pid_position: PidState::default(),
        }
    }
}

/// Per-tick output snapshot of the control pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct Control {
    pub pwm: Vec3,
    pub voltage: Vec3,
    pub d_v: f32,
    pub q_v: f32,
    pub i_d_a: f32,
    pub i_q_a: f32,
    pub torque_nm: f32,
}

impl Control {
    pub fn clear(&mut self) {
        *self = Control::default();
    }
}

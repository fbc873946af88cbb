//! Hardware seams.  The control core runs entirely against these traits;
//! the firmware provides register-level implementations, the tests provide
//! mocks.

use crate::dq::{self, SinCos};

/// Channels the second auxiliary ADC can be retargeted to between
/// conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuxChannel {
    VoltageSense,
    FetTemp,
    MotorTemp,
}

/// Thin typed view of the timer, ADC and DAC registers the ISR touches
/// directly.  Everything here must be non-blocking except the bounded EOC
/// spins.
pub trait ClockedRegisters {
    /// Kick all five ADC conversions in one shot.
    fn start_sample(&mut self);
    /// Spin until the three phase-current conversions complete.
    fn wait_current_done(&mut self);
    /// Phase-current data registers, in phase order.
    fn current_raw(&self) -> [u16; 3];
    /// Spin until both auxiliary conversions complete.
    fn wait_aux_done(&mut self);
    fn aux4_raw(&self) -> u16;
    fn aux5_raw(&self) -> u16;
    /// Spin until the re-triggered second aux conversion completes.
    fn wait_aux5_done(&mut self);
    /// Stop-gate the aux ADC, then point its sequence at `channel`.
    fn select_aux5(&mut self, channel: AuxChannel);
    fn start_aux5(&mut self);
    /// Phase monitor inputs: true if any motor output is already high.
    fn outputs_high(&self) -> bool;
    /// Write the three capture/compare registers, in phase order.
    fn set_pwm(&mut self, counts: [u16; 3]);
    /// Timer reload value; full duty equals this count.
    fn pwm_counts(&self) -> u32;
    /// Debug DAC output of the measured d-axis current.
    fn set_debug_dac(&mut self, value: u16);
    /// sin/cos of a Q31-scaled angle.  Parts with a CORDIC accelerator
    /// override this; the default is the portable software path.
    fn sin_cos(&mut self, theta_q31: i32) -> SinCos {
        dq::sin_cos(theta_q31)
    }
}

/// Absolute magnetic encoder behind a split SPI transaction: the sample is
/// kicked while the ADCs convert and collected afterwards.
pub trait PositionSensor {
    fn start_sample(&mut self);
    fn finish_sample(&mut self) -> u16;
}

/// Gate driver: chip enable, output enable, and the latched fault line.
pub trait MotorDriver {
    fn enable(&mut self, value: bool);
    fn power(&mut self, value: bool);
    fn fault(&mut self) -> bool;
}

/// Blocking microsecond delay, used only during one-time bring-up.
pub trait MillisecondTimer {
    fn wait_us(&mut self, us: u32);
}

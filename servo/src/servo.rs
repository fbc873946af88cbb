//! The servo controller.
//!
//! One instance owns the register view, the position sensor and the gate
//! driver, and is shared between two contexts:
//!
//! - `isr_update` runs from the PWM timer update interrupt at 40 kHz and is
//!   the exclusive writer of `Status`, `Control` and the regulator states.
//! - `command`, `poll_millisecond`, `update_config` and the accessors run
//!   from the foreground.  The embedding must serialize them against the ISR
//!   (the firmware holds the instance in a critical-section mutex); command
//!   data itself crosses over through the lock-free double buffer.

use core::f32::consts::PI;
use core::sync::atomic::{AtomicU32, Ordering};

use libm::fabsf;

use crate::command::{CommandBuffer, CommandData};
use crate::config::{Config, Motor, PositionConfig};
use crate::dq::{self, SinCos, Vec3};
use crate::encoder;
use crate::fault::Fault;
use crate::hal::{AuxChannel, ClockedRegisters, MotorDriver, PositionSensor};
use crate::math::{limit, offset, threshold};
use crate::mode::Mode;
use crate::pid::ApplyOptions;
use crate::status::{Control, Status};
use crate::thermistor;
use crate::torque::TorqueModel;
use crate::velocity::VelocityFilter;

pub const PWM_RATE_HZ: u32 = 40_000;
pub const RATE_HZ: f32 = PWM_RATE_HZ as f32;
pub const PERIOD_S: f32 = 1.0 / RATE_HZ;

/// Time the shunt amplifiers need while the low-side FETs conduct.  Reserving
/// it on both edges of the cycle bounds the usable duty range.
pub const CURRENT_SAMPLE_TIME_S: f32 = 1.85e-6;
pub const MIN_PWM: f32 = CURRENT_SAMPLE_TIME_S * 2.0 * RATE_HZ;
pub const MAX_PWM: f32 = 1.0 - MIN_PWM;

pub const CALIBRATE_COUNT: u16 = 256;

/// Largest believable per-tick encoder move: 28 krpm, the sensor's rated
/// maximum, expressed in counts per tick.
pub const MAX_POSITION_DELTA: i16 = (28000 / 60 * 65536 / 40000) as i16;

const DEFAULT_TORQUE_CONSTANT: f32 = 0.1;
const MAX_UNCONFIGURED_CURRENT: f32 = 5.0;
const CURRENT_SENSE_OHM: f32 = 0.0005;

/// Ticks of the millisecond supervisor before the encoder reads valid.
const STARTUP_VALID_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// The requested mode can only be entered internally.
    InvalidMode,
}

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Board revision; <= 4 multiplexes the aux ADC between bus voltage and
    /// FET temperature, >= 5 dedicates one ADC to the bus.
    pub hw_rev: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self { hw_rev: 7 }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ClearMode {
    IfInactive,
    Always,
}

pub struct Servo<R, S, D>
where
    R: ClockedRegisters,
    S: PositionSensor,
    D: MotorDriver,
{
    regs: R,
    sensor: S,
    driver: D,

    motor: Motor,
    config: Config,
    position_config: PositionConfig,

    status: Status,
    control: Control,
    commands: CommandBuffer,
    velocity_filter: VelocityFilter,

    calibrate_adc: [u32; 3],
    calibrate_count: u16,

    // Derived on update_config.
    torque_constant: f32,
    position_constant: i32,
    adc_scale: f32,

    startup_count: AtomicU32,
    clock: AtomicU32,
    hw_rev: u8,
}

impl<R, S, D> Servo<R, S, D>
where
    R: ClockedRegisters,
    S: PositionSensor,
    D: MotorDriver,
{
    pub fn new(regs: R, sensor: S, driver: D, options: Options) -> Self {
        let mut servo = Self {
            regs,
            sensor,
            driver,
            motor: Motor::default(),
            config: Config::default(),
            position_config: PositionConfig::default(),
            status: Status::default(),
            control: Control::default(),
            commands: CommandBuffer::new(),
            velocity_filter: VelocityFilter::new(1),
            calibrate_adc: [0; 3],
            calibrate_count: 0,
            torque_constant: DEFAULT_TORQUE_CONSTANT,
            position_constant: 0,
            adc_scale: 0.0,
            startup_count: AtomicU32::new(0),
            clock: AtomicU32::new(0),
            hw_rev: options.hw_rev,
        };
        servo.update_config();
        servo
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn motor(&self) -> &Motor {
        &self.motor
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn position_config(&self) -> &PositionConfig {
        &self.position_config
    }

    /// Config mutators for the foreground loader.  Call `update_config`
    /// afterwards so the derived constants follow.
    pub fn motor_mut(&mut self) -> &mut Motor {
        &mut self.motor
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn position_config_mut(&mut self) -> &mut PositionConfig {
        &mut self.position_config
    }

    /// ISR ticks since start.
    pub fn clock(&self) -> u32 {
        self.clock.load(Ordering::Relaxed)
    }

    pub fn is_torque_constant_configured(&self) -> bool {
        self.motor.v_per_hz != 0.0
    }

    fn torque_model(&self) -> TorqueModel {
        TorqueModel::new(
            self.torque_constant,
            self.motor.rotation_current_cutoff_a,
            self.motor.rotation_current_scale,
            self.motor.rotation_torque_scale,
        )
    }

    pub fn current_to_torque(&self, current: f32) -> f32 {
        self.torque_model().current_to_torque(current)
    }

    pub fn torque_to_current(&self, torque: f32) -> f32 {
        self.torque_model().torque_to_current(torque)
    }

    /// Recompute everything derived from the config entities.
    pub fn update_config(&mut self) {
        let kv = 0.5 * 60.0 / self.motor.v_per_hz;

        // This factor has no physical derivation, but is consistent across
        // every motor measured so far.  Keep it identical so calibrations
        // stay interchangeable.
        const FUDGE: f32 = 0.78;

        self.torque_constant = if self.is_torque_constant_configured() {
            FUDGE * 60.0 / (2.0 * PI * kv)
        } else {
            DEFAULT_TORQUE_CONSTANT
        };

        self.position_constant = self.motor.poles as i32 / 2;
        self.adc_scale = 3.3 / (4096.0 * CURRENT_SENSE_OHM * self.config.i_gain);
        self.velocity_filter = VelocityFilter::new(self.config.velocity_filter_length);
    }

    /// Foreground command intake.  Stages the request and publishes it to
    /// the ISR atomically.
    pub fn command(&mut self, data: &CommandData) -> Result<(), CommandError> {
        if !data.mode.commandable() {
            return Err(CommandError::InvalidMode);
        }

        let mut next = *data;

        // Position left unspecified but a velocity and stop position given:
        // point the velocity at the stop so the move actually happens.
        if next.position.is_nan()
            && !next.stop_position.is_nan()
            && !next.velocity.is_nan()
            && next.velocity != 0.0
        {
            next.velocity = fabsf(next.velocity)
                * if next.stop_position > self.status.unwrapped_position {
                    1.0
                } else {
                    -1.0
                };
        }

        if next.timeout_s == 0.0 {
            next.timeout_s = self.config.default_timeout_s;
        }

        self.commands.publish(&next);
        Ok(())
    }

    /// Millisecond supervisor tick, foreground context.  Finishes the
    /// Enabling -> Calibrating edge once the gate driver is up, and advances
    /// the startup counter gating encoder validity.
    pub fn poll_millisecond(&mut self) {
        if self.status.mode == Mode::Enabling {
            self.driver.enable(true);
            self.status.mode = Mode::Calibrating;
        }
        let count = self.startup_count.load(Ordering::Relaxed);
        if count <= STARTUP_VALID_MS {
            self.startup_count.store(count + 1, Ordering::Relaxed);
        }
    }

    /// One 40 kHz control tick.  Call from the timer update interrupt after
    /// the update flag has been taken.
    pub fn isr_update(&mut self) {
        // Conversions start immediately so they run while we get ready.
        self.regs.start_sample();

        self.isr_do_sense();

        let sin_cos = self
            .regs
            .sin_cos(dq::radians_to_q31(self.status.electrical_theta));
        self.status.sin = sin_cos.s;
        self.status.cos = sin_cos.c;

        self.isr_calculate_current_state(&sin_cos);
        self.isr_do_control(&sin_cos);

        self.clock.fetch_add(1, Ordering::Relaxed);
    }

    fn isr_do_sense(&mut self) {
        self.regs.wait_current_done();

        // Everything up to the current read limits the maximum duty cycle;
        // if a motor output is already high we sampled garbage.
        if self.status.mode != Mode::Fault
            && self.status.mode != Mode::Stopped
            && self.regs.outputs_high()
        {
            self.status.mode = Mode::Fault;
            self.status.fault = Fault::PwmCycleOverrun;
        }

        self.sensor.start_sample();

        if let Some(target) = self.commands.isr_with(|d| d.rezero_position.take()) {
            self.status.position_to_set = target;
            self.status.rezeroed = true;
        }

        // A NaN timeout is latched too; it disables the countdown.
        let timeout = self.commands.isr_with(|d| {
            if d.timeout_s.is_nan() || d.timeout_s != 0.0 {
                let value = d.timeout_s;
                d.timeout_s = 0.0;
                Some(value)
            } else {
                None
            }
        });
        if let Some(value) = timeout {
            self.status.timeout_s = value;
        }

        let cur = self.regs.current_raw();
        self.status.adc_cur1_raw = cur[0];
        self.status.adc_cur2_raw = cur[1];
        self.status.adc_cur3_raw = cur[2];

        self.regs.wait_aux_done();
        if self.hw_rev <= 4 {
            self.status.adc_motor_temp_raw = self.regs.aux4_raw();
            self.status.adc_voltage_sense_raw = self.regs.aux5_raw();
        } else {
            self.status.adc_voltage_sense_raw = self.regs.aux4_raw();
            self.status.adc_fet_temp_raw = self.regs.aux5_raw();
        }

        // Retarget the aux ADC for its second conversion of the tick.
        self.regs.select_aux5(if self.hw_rev <= 4 {
            AuxChannel::FetTemp
        } else {
            AuxChannel::MotorTemp
        });
        self.regs.start_aux5();

        let old_position = self.status.position;
        self.status.position_raw = self.sensor.finish_sample();
        self.status.position = if self.motor.invert {
            0u16.wrapping_sub(self.status.position_raw)
        } else {
            self.status.position_raw
        };

        self.status.electrical_theta = encoder::electrical_theta(
            self.status.position,
            self.position_constant,
            &self.motor.offset,
        );

        let delta_position = self.status.position.wrapping_sub(old_position) as i16;
        if self.status.mode != Mode::Stopped
            && self.status.mode != Mode::Fault
            && (delta_position as i32).abs() > MAX_POSITION_DELTA as i32
        {
            // Almost certainly a corrupted sensor read.
            self.status.mode = Mode::Fault;
            self.status.fault = Fault::EncoderFault;
        }

        // The encoder is not guaranteed valid until 10 ms after power-on, so
        // a pending rezero waits out the startup window.
        if !self.status.position_to_set.is_nan()
            && self.startup_count.load(Ordering::Relaxed) > STARTUP_VALID_MS
        {
            self.status.unwrapped_position_raw = encoder::rezero_unwrapped(
                self.status.position,
                self.status.position_to_set,
                self.motor.unwrapped_position_scale,
            );
            self.status.position_to_set = f32::NAN;
        } else {
            self.status.unwrapped_position_raw = self
                .status
                .unwrapped_position_raw
                .wrapping_add(delta_position as i32);
        }

        // The window total stays integer; the scale to physical units is the
        // only float step, so no rounding accumulates.
        self.velocity_filter.add(delta_position);
        self.status.velocity = self.velocity_filter.total() as f32
            * self.motor.unwrapped_position_scale
            * (1.0 / 65536.0)
            * RATE_HZ
            / self.velocity_filter.size() as f32;

        self.status.unwrapped_position = self.status.unwrapped_position_raw as f32
            * self.motor.unwrapped_position_scale
            * (1.0 / 65536.0);

        self.regs.wait_aux5_done();
        if self.hw_rev <= 4 {
            self.status.adc_fet_temp_raw = self.regs.aux5_raw();
        } else {
            self.status.adc_motor_temp_raw = self.regs.aux5_raw();
        }

        // Point the aux ADC back at its first channel for the next tick.
        self.regs.select_aux5(if self.hw_rev <= 4 {
            AuxChannel::VoltageSense
        } else {
            AuxChannel::FetTemp
        });
        self.regs.start_aux5();

        self.status.fet_temp_c = thermistor::temperature(self.status.adc_fet_temp_raw);
    }

    fn update_filtered_bus_v(filtered: &mut f32, bus_v: f32, period_s: f32) {
        if filtered.is_nan() {
            *filtered = bus_v;
        } else {
            let alpha = 1.0 / (RATE_HZ * period_s);
            *filtered = alpha * bus_v + (1.0 - alpha) * *filtered;
        }
    }

    fn isr_calculate_current_state(&mut self, sin_cos: &SinCos) {
        self.status.cur1_a =
            (self.status.adc_cur1_raw as f32 - self.status.adc_cur1_offset as f32) * self.adc_scale;
        self.status.cur2_a =
            (self.status.adc_cur2_raw as f32 - self.status.adc_cur2_offset as f32) * self.adc_scale;
        self.status.cur3_a =
            (self.status.adc_cur3_raw as f32 - self.status.adc_cur3_offset as f32) * self.adc_scale;
        self.status.bus_v = self.status.adc_voltage_sense_raw as f32 * self.config.v_scale_v;

        Self::update_filtered_bus_v(&mut self.status.filt_bus_v, self.status.bus_v, 0.5);
        Self::update_filtered_bus_v(&mut self.status.filt_1ms_bus_v, self.status.bus_v, 0.001);

        let (d_a, q_a) = dq::dq_transform(
            sin_cos,
            self.status.cur1_a,
            self.status.cur2_a,
            self.status.cur3_a,
        );
        self.status.d_a = d_a;
        self.status.q_a = q_a;

        self.status.torque_nm = if self.status.mode.torque_on() {
            self.current_to_torque(self.status.q_a) / self.motor.unwrapped_position_scale
        } else {
            0.0
        };

        let dac = 1024 + ((1024.0 * self.status.d_a / 30.0) as i32).clamp(0, 2047);
        self.regs.set_debug_dac(dac as u16);
    }

    fn isr_do_control(&mut self, sin_cos: &SinCos) {
        let data = self.commands.isr_snapshot();

        self.control.clear();

        if data.set_position.is_some() {
            if let Some(position) = self.commands.isr_with(|d| d.set_position.take()) {
                self.status.unwrapped_position_raw = (position * 65536.0) as i32;
            }
        }

        if !self.status.timeout_s.is_nan() && self.status.timeout_s > 0.0 {
            self.status.timeout_s = (self.status.timeout_s - PERIOD_S).max(0.0);
        }

        if data.mode != self.status.mode {
            self.isr_maybe_change_mode(&data);
        }

        // Latched fault sources, checked every tick while the outputs could
        // be live.
        if self.status.mode != Mode::Stopped && self.status.mode != Mode::Fault {
            if self.driver.fault() {
                self.status.mode = Mode::Fault;
                self.status.fault = Fault::MotorDriverFault;
            }
            if self.status.bus_v > self.config.max_voltage {
                self.status.mode = Mode::Fault;
                self.status.fault = Fault::OverVoltage;
            }
            if self.status.fet_temp_c > self.config.fault_temperature {
                self.status.mode = Mode::Fault;
                self.status.fault = Fault::OverTemperature;
            }
        }

        if (self.status.mode == Mode::Position || self.status.mode == Mode::StayWithinBounds)
            && !self.status.timeout_s.is_nan()
            && self.status.timeout_s <= 0.0
        {
            self.status.mode = Mode::PositionTimeout;
        }

        // Regulators not used by the current mode must hold zeroed state.
        self.isr_clear_pid(ClearMode::IfInactive);

        if self.status.mode != Mode::Fault {
            self.status.fault = Fault::Success;
        }

        match self.status.mode {
            Mode::Stopped => self.isr_do_stopped(),
            Mode::Fault => self.isr_do_fault(),
            Mode::Enabling => {}
            Mode::Calibrating => self.isr_do_calibrating(),
            Mode::CalibrationComplete => {}
            Mode::Pwm => self.isr_do_pwm_control(data.pwm),
            Mode::Voltage => self.isr_do_voltage_control(data.phase_v),
            Mode::VoltageFoc => self.isr_do_voltage_foc(data.theta, data.voltage),
            Mode::VoltageDq => self.isr_do_voltage_dq(sin_cos, data.d_v, data.q_v),
            Mode::Current => self.isr_do_current(sin_cos, data.i_d_a, data.i_q_a),
            Mode::Position => self.isr_do_position(sin_cos, &data),
            Mode::PositionTimeout | Mode::ZeroVelocity => self.isr_do_zero_velocity(sin_cos, &data),
            Mode::StayWithinBounds => self.isr_do_stay_within_bounds(sin_cos, &data),
        }
    }

    fn isr_maybe_change_mode(&mut self, data: &CommandData) {
        match data.mode {
            // Internal states never arrive through the command path.
            Mode::Fault | Mode::Calibrating | Mode::CalibrationComplete => {}
            // Enabling finishes from the millisecond supervisor, not here.
            Mode::Enabling => {}
            Mode::Stopped => {
                self.status.mode = Mode::Stopped;
            }
            Mode::Pwm
            | Mode::Voltage
            | Mode::VoltageFoc
            | Mode::VoltageDq
            | Mode::Current
            | Mode::Position
            | Mode::PositionTimeout
            | Mode::ZeroVelocity
            | Mode::StayWithinBounds => match self.status.mode {
                Mode::Fault => {
                    // Only an explicit stop leaves a fault.
                }
                Mode::Stopped => {
                    // Active modes are reached through the calibration
                    // ladder.
                    self.isr_start_calibrating();
                }
                Mode::Enabling | Mode::Calibrating => {
                    // Wait for calibration to finish.
                }
                Mode::PositionTimeout => {
                    // Terminal; only a stop leaves it.
                }
                Mode::CalibrationComplete
                | Mode::Pwm
                | Mode::Voltage
                | Mode::VoltageFoc
                | Mode::VoltageDq
                | Mode::Current
                | Mode::Position
                | Mode::ZeroVelocity
                | Mode::StayWithinBounds => {
                    if (data.mode == Mode::Position || data.mode == Mode::StayWithinBounds)
                        && self.isr_is_outside_limits()
                    {
                        self.status.mode = Mode::Fault;
                        self.status.fault = Fault::StartOutsideLimit;
                    } else {
                        self.status.mode = data.mode;
                        self.isr_clear_pid(ClearMode::Always);
                    }
                }
            },
        }
    }

    fn isr_is_outside_limits(&self) -> bool {
        (!self.position_config.position_min.is_nan()
            && self.status.unwrapped_position < self.position_config.position_min)
            || (!self.position_config.position_max.is_nan()
                && self.status.unwrapped_position > self.position_config.position_max)
    }

    fn isr_start_calibrating(&mut self) {
        // The millisecond supervisor moves us on to Calibrating once the
        // gate driver is enabled.
        self.status.mode = Mode::Enabling;

        self.regs.set_pwm([0, 0, 0]);
        self.driver.power(false);

        self.calibrate_adc = [0; 3];
        self.calibrate_count = 0;
    }

    fn isr_clear_pid(&mut self, clear_mode: ClearMode) {
        let force = clear_mode == ClearMode::Always;

        if force || !self.status.mode.current_pid_active() {
            self.status.pid_d.clear();
            self.status.pid_q.clear();
            // Current control always starts from a zero request.
            self.status.pid_d.desired = 0.0;
            self.status.pid_q.desired = 0.0;
        }

        if force || !self.status.mode.position_pid_active() {
            self.status.pid_position.clear();
            self.status.control_position = f32::NAN;
        }
    }

    fn isr_do_stopped(&mut self) {
        self.driver.enable(false);
        self.driver.power(false);
        self.regs.set_pwm([0, 0, 0]);
    }

    fn isr_do_fault(&mut self) {
        self.driver.power(false);
        self.regs.set_pwm([0, 0, 0]);
    }

    fn isr_do_calibrating(&mut self) {
        self.calibrate_adc[0] += self.status.adc_cur1_raw as u32;
        self.calibrate_adc[1] += self.status.adc_cur2_raw as u32;
        self.calibrate_adc[2] += self.status.adc_cur3_raw as u32;
        self.calibrate_count += 1;

        if self.calibrate_count < CALIBRATE_COUNT {
            return;
        }

        let offset1 = (self.calibrate_adc[0] / CALIBRATE_COUNT as u32) as u16;
        let offset2 = (self.calibrate_adc[1] / CALIBRATE_COUNT as u32) as u16;
        let offset3 = (self.calibrate_adc[2] / CALIBRATE_COUNT as u32) as u16;

        let in_range = |value: u16| (value as i32 - 2048).abs() <= 200;
        if !in_range(offset1) || !in_range(offset2) || !in_range(offset3) {
            self.status.mode = Mode::Fault;
            self.status.fault = Fault::CalibrationFault;
            return;
        }

        self.status.adc_cur1_offset = offset1;
        self.status.adc_cur2_offset = offset2;
        self.status.adc_cur3_offset = offset3;
        self.status.mode = Mode::CalibrationComplete;
    }

    fn limit_pwm(&self, value: f32) -> f32 {
        // Full duty would leave no window to sample the currents.
        limit(value, MIN_PWM, MAX_PWM)
    }

    fn isr_do_pwm_control(&mut self, pwm: Vec3) {
        self.control.pwm = Vec3 {
            a: self.limit_pwm(pwm.a),
            b: self.limit_pwm(pwm.b),
            c: self.limit_pwm(pwm.c),
        };

        let counts = self.regs.pwm_counts() as f32;
        self.regs.set_pwm([
            (self.control.pwm.a * counts) as u16,
            (self.control.pwm.b * counts) as u16,
            (self.control.pwm.c * counts) as u16,
        ]);

        self.driver.power(true);
    }

    fn isr_voltage_to_pwm(&self, v: f32) -> f32 {
        0.5 + offset(
            self.config.pwm_min,
            self.config.pwm_min_blend,
            v / self.status.filt_bus_v,
        )
    }

    fn isr_do_voltage_control(&mut self, voltage: Vec3) {
        self.control.voltage = voltage;

        self.isr_do_pwm_control(Vec3 {
            a: self.isr_voltage_to_pwm(voltage.a),
            b: self.isr_voltage_to_pwm(voltage.b),
            c: self.isr_voltage_to_pwm(voltage.c),
        });
    }

    fn isr_do_voltage_foc(&mut self, theta: f32, voltage: f32) {
        let sin_cos = self.regs.sin_cos(dq::radians_to_q31(theta));
        let max_voltage = (0.5 - MIN_PWM) * self.status.filt_bus_v;
        let phase = dq::inverse_dq_transform(&sin_cos, limit(voltage, -max_voltage, max_voltage), 0.0);
        self.isr_do_voltage_control(phase);
    }

    fn isr_do_voltage_dq(&mut self, sin_cos: &SinCos, d_v: f32, q_v: f32) {
        if self.motor.poles == 0 {
            // Not configured; we cannot commutate.
            self.status.mode = Mode::Fault;
            self.status.fault = Fault::MotorNotConfigured;
            return;
        }

        self.control.d_v = d_v;
        self.control.q_v = q_v;

        let max_voltage = (0.5 - MIN_PWM) * self.status.filt_bus_v;
        let phase = dq::inverse_dq_transform(
            sin_cos,
            limit(self.control.d_v, -max_voltage, max_voltage),
            limit(self.control.q_v, -max_voltage, max_voltage),
        );
        self.isr_do_voltage_control(phase);
    }

    /// Fold the q request back to zero in the direction that would push
    /// further outside the position limits.
    fn limit_q_current(&self, i_q_a: f32) -> f32 {
        if !self.position_config.position_max.is_nan()
            && self.status.unwrapped_position > self.position_config.position_max
            && i_q_a > 0.0
        {
            return i_q_a
                * (1.0
                    - (self.status.unwrapped_position - self.position_config.position_max)
                        / self.config.position_derate)
                    .max(0.0);
        }
        if !self.position_config.position_min.is_nan()
            && self.status.unwrapped_position < self.position_config.position_min
            && i_q_a < 0.0
        {
            return i_q_a
                * (1.0
                    - (self.position_config.position_min - self.status.unwrapped_position)
                        / self.config.position_derate)
                    .max(0.0);
        }
        i_q_a
    }

    /// Thermal foldback between the derate and fault temperatures.
    fn limit_either_current(&self, in_a: f32) -> f32 {
        let derate_fraction = (self.status.fet_temp_c - self.config.derate_temperature)
            / (self.config.fault_temperature - self.config.derate_temperature);
        let temp_limit_a = (derate_fraction * (self.config.derate_current_a - self.config.max_current_a)
            + self.config.max_current_a)
            .max(0.0)
            .min(self.config.max_current_a);
        limit(in_a, -temp_limit_a, temp_limit_a)
    }

    fn isr_do_current(&mut self, sin_cos: &SinCos, i_d_a_in: f32, i_q_a_in: f32) {
        let i_q_a = self.limit_either_current(self.limit_q_current(i_q_a_in));
        let i_d_a = self.limit_either_current(i_d_a_in);

        self.control.i_d_a = i_d_a;
        self.control.i_q_a = i_q_a;

        let d_v = self.config.feedforward_scale * i_d_a * self.motor.resistance_ohm
            + self.config.pid_dq.apply(
                &mut self.status.pid_d,
                self.status.d_a,
                i_d_a,
                0.0,
                0.0,
                RATE_HZ,
                &ApplyOptions::default(),
            );

        let q_v = self.config.feedforward_scale
            * (i_q_a * self.motor.resistance_ohm
                - self.status.velocity * self.motor.v_per_hz / self.motor.unwrapped_position_scale)
            + self.config.pid_dq.apply(
                &mut self.status.pid_q,
                self.status.q_a,
                i_q_a,
                0.0,
                0.0,
                RATE_HZ,
                &ApplyOptions::default(),
            );

        self.isr_do_voltage_dq(sin_cos, d_v, q_v);
    }

    /// Pull the commanded position target out of the active slot, clearing
    /// it so it applies exactly once.
    fn isr_consume_command_position(&self) -> f32 {
        self.commands.isr_with(|d| {
            let position = d.position;
            if !position.is_nan() {
                d.position = f32::NAN;
            }
            position
        })
    }

    fn isr_do_position(&mut self, sin_cos: &SinCos, data: &CommandData) {
        let command_position = self.isr_consume_command_position();
        let options = ApplyOptions {
            kp_scale: data.kp_scale,
            kd_scale: data.kd_scale,
        };
        self.isr_do_position_common(
            sin_cos,
            command_position,
            data.stop_position,
            &options,
            data.max_torque_nm,
            data.feedforward_nm,
            data.velocity,
        );
    }

    fn isr_do_zero_velocity(&mut self, sin_cos: &SinCos, data: &CommandData) {
        let command_position = self.isr_consume_command_position();
        let options = ApplyOptions {
            kp_scale: 0.0,
            kd_scale: 1.0,
        };
        self.isr_do_position_common(
            sin_cos,
            command_position,
            data.stop_position,
            &options,
            self.config.timeout_max_torque_nm,
            0.0,
            0.0,
        );
    }

    fn isr_do_position_common(
        &mut self,
        sin_cos: &SinCos,
        command_position: f32,
        stop_position: f32,
        pid_options: &ApplyOptions,
        max_torque_nm: f32,
        feedforward_nm: f32,
        velocity: f32,
    ) {
        if !command_position.is_nan() {
            self.status.control_position = command_position;
        } else if self.status.control_position.is_nan() {
            self.status.control_position = self.status.unwrapped_position;
        }

        let mut velocity_command = velocity;

        let old_position = self.status.control_position;
        self.status.control_position = limit(
            self.status.control_position + velocity_command / RATE_HZ,
            self.position_config.position_min,
            self.position_config.position_max,
        );
        if !stop_position.is_nan()
            && (self.status.control_position - stop_position) * velocity_command > 0.0
        {
            // Moving away from the stop position; pin to it.
            self.status.control_position = stop_position;
        }
        if self.status.control_position == old_position {
            // A limit was hit; the setpoint is no longer moving.
            velocity_command = 0.0;
        }

        let measured_velocity = threshold(
            self.status.velocity,
            -self.config.velocity_threshold,
            self.config.velocity_threshold,
        );

        let unlimited_torque_nm = self.config.pid_position.apply(
            &mut self.status.pid_position,
            self.status.unwrapped_position,
            self.status.control_position,
            measured_velocity,
            velocity_command,
            RATE_HZ,
            pid_options,
        ) + feedforward_nm;

        let limited_torque_nm = limit(unlimited_torque_nm, -max_torque_nm, max_torque_nm);
        self.control.torque_nm = limited_torque_nm;

        let limited_q_a =
            self.torque_to_current(limited_torque_nm * self.motor.unwrapped_position_scale);
        let q_a = if self.is_torque_constant_configured() {
            limited_q_a
        } else {
            limit(
                limited_q_a,
                -MAX_UNCONFIGURED_CURRENT,
                MAX_UNCONFIGURED_CURRENT,
            )
        };

        // Flux brake: burn regenerated energy as d-axis current once the bus
        // pumps above the threshold.
        let d_a = if self.config.flux_brake_min_voltage <= 0.0 {
            0.0
        } else {
            let error = self.status.filt_1ms_bus_v - self.config.flux_brake_min_voltage;
            if error <= 0.0 {
                0.0
            } else {
                error / self.config.flux_brake_resistance_ohm
            }
        };

        self.isr_do_current(sin_cos, d_a, q_a);
    }

    fn isr_do_stay_within_bounds(&mut self, sin_cos: &SinCos, data: &CommandData) {
        let target_position = if !data.bounds_min.is_nan()
            && self.status.unwrapped_position < data.bounds_min
        {
            Some(data.bounds_min)
        } else if !data.bounds_max.is_nan() && self.status.unwrapped_position > data.bounds_max {
            Some(data.bounds_max)
        } else {
            None
        };

        let Some(target_position) = target_position else {
            // Free region: no position control, but feed-forward torque
            // still applies.
            self.status.pid_position.clear();
            self.status.control_position = f32::NAN;

            let limited_torque_nm =
                limit(data.feedforward_nm, -data.max_torque_nm, data.max_torque_nm);
            self.control.torque_nm = limited_torque_nm;
            let limited_q_a =
                self.torque_to_current(limited_torque_nm * self.motor.unwrapped_position_scale);

            self.isr_do_current(sin_cos, 0.0, limited_q_a);
            return;
        };

        // Outside: run position control toward the violated bound.
        let _ = self.isr_consume_command_position();
        let options = ApplyOptions {
            kp_scale: data.kp_scale,
            kd_scale: data.kd_scale,
        };
        self.isr_do_position_common(
            sin_cos,
            target_position,
            data.stop_position,
            &options,
            data.max_torque_nm,
            data.feedforward_nm,
            0.0,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid::PidState;

    const PWM_COUNTS: u32 = 4250;

    struct MockRegisters {
        cur: [u16; 3],
        vsense: u16,
        tsense: u16,
        msense: u16,
        channel: AuxChannel,
        cur_dr: [u16; 3],
        aux4_dr: u16,
        aux5_dr: u16,
        outputs_high: bool,
        pwm: [u16; 3],
        dac: u16,
    }

    impl MockRegisters {
        fn new() -> Self {
            Self {
                cur: [2048; 3],
                vsense: 1290, // ~23.2 V at the default divider scale
                tsense: 1024, // ~35 C, below the derate knee
                msense: 1024,
                channel: AuxChannel::FetTemp,
                cur_dr: [0; 3],
                aux4_dr: 0,
                aux5_dr: 0,
                outputs_high: false,
                pwm: [0; 3],
                dac: 0,
            }
        }

        fn aux_value(&self, channel: AuxChannel) -> u16 {
            match channel {
                AuxChannel::VoltageSense => self.vsense,
                AuxChannel::FetTemp => self.tsense,
                AuxChannel::MotorTemp => self.msense,
            }
        }
    }

    // Conversions latch into mock data registers when started, like the
    // hardware's DR behavior.
    impl ClockedRegisters for MockRegisters {
        fn start_sample(&mut self) {
            self.cur_dr = self.cur;
            self.aux4_dr = self.vsense;
            self.aux5_dr = self.aux_value(self.channel);
        }
        fn wait_current_done(&mut self) {}
        fn current_raw(&self) -> [u16; 3] {
            self.cur_dr
        }
        fn wait_aux_done(&mut self) {}
        fn aux4_raw(&self) -> u16 {
            self.aux4_dr
        }
        fn aux5_raw(&self) -> u16 {
            self.aux5_dr
        }
        fn wait_aux5_done(&mut self) {}
        fn select_aux5(&mut self, channel: AuxChannel) {
            self.channel = channel;
        }
        fn start_aux5(&mut self) {
            self.aux5_dr = self.aux_value(self.channel);
        }
        fn outputs_high(&self) -> bool {
            self.outputs_high
        }
        fn set_pwm(&mut self, counts: [u16; 3]) {
            self.pwm = counts;
        }
        fn pwm_counts(&self) -> u32 {
            PWM_COUNTS
        }
        fn set_debug_dac(&mut self, value: u16) {
            self.dac = value;
        }
    }

    struct MockSensor {
        value: u16,
    }

    impl PositionSensor for MockSensor {
        fn start_sample(&mut self) {}
        fn finish_sample(&mut self) -> u16 {
            self.value
        }
    }

    struct MockDriver {
        enabled: bool,
        powered: bool,
        fault: bool,
    }

    impl MotorDriver for MockDriver {
        fn enable(&mut self, value: bool) {
            self.enabled = value;
        }
        fn power(&mut self, value: bool) {
            self.powered = value;
        }
        fn fault(&mut self) -> bool {
            self.fault
        }
    }

    type TestServo = Servo<MockRegisters, MockSensor, MockDriver>;

    fn make_unconfigured_servo() -> TestServo {
        Servo::new(
            MockRegisters::new(),
            MockSensor { value: 0 },
            MockDriver {
                enabled: false,
                powered: false,
                fault: false,
            },
            Options::default(),
        )
    }

    fn make_servo() -> TestServo {
        let mut servo = make_unconfigured_servo();
        servo.motor_mut().poles = 14;
        servo.motor_mut().v_per_hz = 0.17;
        servo.update_config();
        servo
    }

    /// One millisecond of wall time: a supervisor poll plus 40 ISR ticks.
    fn run_ms(servo: &mut TestServo, ms: usize) {
        for _ in 0..ms {
            servo.poll_millisecond();
            for _ in 0..PWM_RATE_HZ as usize / 1000 {
                servo.isr_update();
            }
        }
    }

    fn position_command() -> CommandData {
        CommandData {
            mode: Mode::Position,
            timeout_s: f32::NAN,
            ..Default::default()
        }
    }

    /// Wait out the encoder-valid window, then command and ride the
    /// calibration ladder into the requested mode.
    fn boot_into(servo: &mut TestServo, data: &CommandData) {
        run_ms(servo, 12);
        servo.command(data).unwrap();
        run_ms(servo, 10);
    }

    #[test]
    fn test_cold_boot_ladder_to_position() {
        let mut servo = make_servo();
        run_ms(&mut servo, 12);
        assert_eq!(servo.status().mode, Mode::Stopped);

        let mut cmd = position_command();
        cmd.position = 0.25;
        cmd.max_torque_nm = 1.0;
        servo.command(&cmd).unwrap();

        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Enabling);
        assert!(!servo.driver.enabled);

        servo.poll_millisecond();
        assert_eq!(servo.status().mode, Mode::Calibrating);
        assert!(servo.driver.enabled);

        for _ in 0..255 {
            servo.isr_update();
        }
        assert_eq!(servo.status().mode, Mode::Calibrating);
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::CalibrationComplete);
        assert_eq!(servo.status().adc_cur1_offset, 2048);
        assert_eq!(servo.status().adc_cur2_offset, 2048);
        assert_eq!(servo.status().adc_cur3_offset, 2048);

        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Position);
        assert!(
            (servo.status().control_position - 0.25).abs() < 1e-4,
            "control_position = {}",
            servo.status().control_position
        );
        assert!(servo.driver.powered);
    }

    #[test]
    fn test_calibration_rejects_bad_offsets() {
        let mut servo = make_servo();
        servo.regs.cur = [1500, 2048, 2048];
        boot_into(&mut servo, &position_command());
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::CalibrationFault);
    }

    #[test]
    fn test_over_temperature_faults_and_zeros_pwm() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());
        assert_eq!(servo.status().mode, Mode::Position);

        servo.config_mut().fault_temperature = 50.0;
        servo.regs.tsense = 2560; // ~78 C
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::OverTemperature);
        assert_eq!(servo.regs.pwm, [0, 0, 0]);
        assert!(!servo.driver.powered);
    }

    #[test]
    fn test_stop_lands_same_tick() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());
        assert_eq!(servo.status().mode, Mode::Position);

        let cmd = CommandData {
            mode: Mode::Stopped,
            ..Default::default()
        };
        servo.command(&cmd).unwrap();
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Stopped);
        assert!(!servo.driver.enabled);
        assert!(!servo.driver.powered);
        assert_eq!(servo.regs.pwm, [0, 0, 0]);
    }

    #[test]
    fn test_stop_position_approach() {
        let mut servo = make_servo();
        let mut cmd = position_command();
        cmd.position = f32::NAN;
        cmd.velocity = -2.0; // wrong sign on purpose; intake must flip it
        cmd.stop_position = 1.0;
        boot_into(&mut servo, &cmd);
        assert_eq!(servo.status().mode, Mode::Position);

        let mut last = servo.status().control_position;
        for _ in 0..30_000 {
            servo.isr_update();
            let cp = servo.status().control_position;
            assert!(cp >= last - 1e-6, "setpoint moved backwards: {cp} < {last}");
            assert!(cp <= 1.0 + 1e-6, "setpoint crossed the stop: {cp}");
            last = cp;
        }
        assert!(
            (servo.status().control_position - 1.0).abs() < 1e-5,
            "did not pin at the stop: {}",
            servo.status().control_position
        );
    }

    #[test]
    fn test_start_outside_limit_rejected() {
        let mut servo = make_servo();
        servo.sensor.value = 39321; // 0.6 of a revolution
        servo.position_config_mut().position_min = -0.5;
        servo.position_config_mut().position_max = 0.5;
        run_ms(&mut servo, 12);

        let mut cmd = position_command();
        cmd.position = 0.0;
        cmd.rezero_position = Some(0.6);
        servo.command(&cmd).unwrap();
        run_ms(&mut servo, 10);

        assert!(servo.status().rezeroed);
        assert!((servo.status().unwrapped_position - 0.6).abs() < 1e-3);
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::StartOutsideLimit);
    }

    #[test]
    fn test_encoder_jump_faults() {
        let mut servo = make_servo();
        servo.sensor.value = 10000;
        boot_into(&mut servo, &position_command());
        assert_eq!(servo.status().mode, Mode::Position);

        servo.sensor.value = 11000; // 1000 counts in one tick
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::EncoderFault);
        assert_eq!(servo.regs.pwm, [0, 0, 0]);
    }

    #[test]
    fn test_timeout_promotes_and_is_terminal() {
        let mut servo = make_servo();
        let mut cmd = position_command();
        cmd.timeout_s = 0.05;
        boot_into(&mut servo, &cmd);

        // The countdown must be monotonic while positive.
        let mut last = servo.status().timeout_s;
        for _ in 0..40 {
            servo.isr_update();
            assert!(servo.status().timeout_s <= last);
            last = servo.status().timeout_s;
        }

        run_ms(&mut servo, 60);
        assert_eq!(servo.status().mode, Mode::PositionTimeout);

        // Only a stop gets us out.
        let mut active = position_command();
        active.mode = Mode::Current;
        servo.command(&active).unwrap();
        run_ms(&mut servo, 2);
        assert_eq!(servo.status().mode, Mode::PositionTimeout);

        let stop = CommandData {
            mode: Mode::Stopped,
            ..Default::default()
        };
        servo.command(&stop).unwrap();
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Stopped);
    }

    #[test]
    fn test_pwm_mode_clamps_duty() {
        let mut servo = make_servo();
        let cmd = CommandData {
            mode: Mode::Pwm,
            timeout_s: f32::NAN,
            pwm: Vec3 {
                a: 1.5,
                b: -0.3,
                c: 0.5,
            },
            ..Default::default()
        };
        boot_into(&mut servo, &cmd);
        assert_eq!(servo.status().mode, Mode::Pwm);

        let counts = PWM_COUNTS as f32;
        assert_eq!(
            servo.regs.pwm,
            [
                (MAX_PWM * counts) as u16,
                (MIN_PWM * counts) as u16,
                (0.5 * counts) as u16,
            ]
        );
        assert!(servo.driver.powered);
    }

    #[test]
    fn test_unconfigured_motor_faults_on_dq_dispatch() {
        let mut servo = make_unconfigured_servo();
        let cmd = CommandData {
            mode: Mode::VoltageDq,
            timeout_s: f32::NAN,
            d_v: 1.0,
            ..Default::default()
        };
        boot_into(&mut servo, &cmd);
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::MotorNotConfigured);
    }

    #[test]
    fn test_pwm_cycle_overrun() {
        let mut servo = make_servo();
        let cmd = CommandData {
            mode: Mode::Voltage,
            timeout_s: f32::NAN,
            ..Default::default()
        };
        boot_into(&mut servo, &cmd);
        assert_eq!(servo.status().mode, Mode::Voltage);

        servo.regs.outputs_high = true;
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::PwmCycleOverrun);
    }

    #[test]
    fn test_driver_fault_latches() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());

        servo.driver.fault = true;
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::MotorDriverFault);

        // Active requests cannot leave the fault; a stop can.
        servo.driver.fault = false;
        servo.command(&position_command()).unwrap();
        run_ms(&mut servo, 2);
        assert_eq!(servo.status().mode, Mode::Fault);

        let stop = CommandData {
            mode: Mode::Stopped,
            ..Default::default()
        };
        servo.command(&stop).unwrap();
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Stopped);
        assert_eq!(servo.status().fault, Fault::Success);
    }

    #[test]
    fn test_over_voltage_faults() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());

        servo.regs.vsense = 2500; // ~45 V
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::Fault);
        assert_eq!(servo.status().fault, Fault::OverVoltage);
    }

    #[test]
    fn test_rezero_command_reseeds_position() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());

        let mut cmd = position_command();
        cmd.rezero_position = Some(2.25);
        servo.command(&cmd).unwrap();
        servo.isr_update();
        assert!(servo.status().rezeroed);
        // Nearest whole revolution to the requested 2.25.
        assert!((servo.status().unwrapped_position - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_set_position_overrides_accumulator() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());

        let mut cmd = position_command();
        cmd.set_position = Some(2.0);
        servo.command(&cmd).unwrap();
        servo.isr_update();
        assert_eq!(servo.status().unwrapped_position_raw, 2 * 65536);
        servo.isr_update();
        assert!((servo.status().unwrapped_position - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_velocity_estimate() {
        let mut servo = make_servo();
        for _ in 0..300 {
            servo.sensor.value = servo.sensor.value.wrapping_add(100);
            servo.isr_update();
        }
        let expected = 100.0 * RATE_HZ / 65536.0;
        assert!(
            (servo.status().velocity - expected).abs() < 0.01,
            "velocity = {}, expected {expected}",
            servo.status().velocity
        );
    }

    #[test]
    fn test_stay_within_bounds() {
        let mut servo = make_servo();
        let cmd = CommandData {
            mode: Mode::StayWithinBounds,
            timeout_s: f32::NAN,
            bounds_min: -0.5,
            bounds_max: 0.5,
            feedforward_nm: 0.02,
            ..Default::default()
        };
        boot_into(&mut servo, &cmd);
        assert_eq!(servo.status().mode, Mode::StayWithinBounds);

        // Inside the interval: no position regulation, feed-forward only.
        assert!(servo.status().control_position.is_nan());
        assert_eq!(servo.status().pid_position, PidState::default());
        assert!((servo.control().torque_nm - 0.02).abs() < 1e-6);
        assert_eq!(servo.control().i_d_a, 0.0);

        // Push the rotor past the upper bound, under the encoder fault
        // threshold per tick.
        while servo.status().unwrapped_position < 0.55 {
            servo.sensor.value = servo.sensor.value.wrapping_add(700);
            servo.isr_update();
            assert_ne!(servo.status().mode, Mode::Fault);
        }
        servo.isr_update();
        assert_eq!(servo.status().mode, Mode::StayWithinBounds);
        assert!((servo.status().control_position - 0.5).abs() < 1e-6);
        assert!(
            servo.control().torque_nm < 0.0,
            "no pull toward the bound: {}",
            servo.control().torque_nm
        );
    }

    #[test]
    fn test_flux_brake_engages() {
        let mut servo = make_servo();
        boot_into(&mut servo, &position_command());

        servo.config_mut().flux_brake_min_voltage = 20.0;
        for _ in 0..500 {
            servo.isr_update();
        }
        // bus ~23.2 V, 3.2 V over the knee into 0.1 ohm.
        assert!(
            (servo.control().i_d_a - 32.2).abs() < 1.0,
            "i_d_a = {}",
            servo.control().i_d_a
        );
    }

    #[test]
    fn test_command_rejects_internal_modes() {
        let mut servo = make_servo();
        for mode in [
            Mode::Fault,
            Mode::Enabling,
            Mode::Calibrating,
            Mode::CalibrationComplete,
        ] {
            let cmd = CommandData {
                mode,
                ..Default::default()
            };
            assert_eq!(servo.command(&cmd), Err(CommandError::InvalidMode));
        }
    }
}

//! Foreground → ISR command handoff.
//!
//! Two pre-allocated slots and a published index: the foreground writes the
//! inactive slot, then publishes it with a release store.  The ISR reads the
//! active slot through an acquire load, so it always observes a whole
//! command record, never a tear.  One-shot fields (`set_position`,
//! `rezero_position`, `timeout_s`, and the consumed `position` target) are
//! written back into the active slot by the ISR; the foreground never
//! touches a slot after publishing it.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::dq::Vec3;
use crate::mode::Mode;

/// A complete request from the foreground.  NaN floats mean "unspecified".
#[derive(Clone, Copy, Debug)]
pub struct CommandData {
    pub mode: Mode,

    /// Pwm mode: per-phase duty cycles.
    pub pwm: Vec3,
    /// Voltage mode: per-phase volts.
    pub phase_v: Vec3,
    /// VoltageFoc mode: fixed electrical angle and magnitude.
    pub theta: f32,
    pub voltage: f32,
    /// VoltageDq mode.
    pub d_v: f32,
    pub q_v: f32,
    /// Current mode.
    pub i_d_a: f32,
    pub i_q_a: f32,

    /// Position mode target; consumed on the first tick it is seen.
    pub position: f32,
    pub velocity: f32,
    pub max_torque_nm: f32,
    pub stop_position: f32,
    pub feedforward_nm: f32,
    pub kp_scale: f32,
    pub kd_scale: f32,

    /// StayWithinBounds interval; NaN is unbounded on that side.
    pub bounds_min: f32,
    pub bounds_max: f32,

    /// Watchdog reload; 0 selects the configured default, NaN disables.
    pub timeout_s: f32,

    /// One-shot absolute override of the unwrapped position.
    pub set_position: Option<f32>,
    /// One-shot re-seed of the unwrapped accumulator near a target.
    pub rezero_position: Option<f32>,
}

impl Default for CommandData {
    fn default() -> Self {
        Self {
            mode: Mode::Stopped,
            pwm: Vec3::default(),
            phase_v: Vec3::default(),
            theta: 0.0,
            voltage: 0.0,
            d_v: 0.0,
            q_v: 0.0,
            i_d_a: 0.0,
            i_q_a: 0.0,
            position: f32::NAN,
            velocity: 0.0,
            max_torque_nm: 100.0,
            stop_position: f32::NAN,
            feedforward_nm: 0.0,
            kp_scale: 1.0,
            kd_scale: 1.0,
            bounds_min: f32::NAN,
            bounds_max: f32::NAN,
            timeout_s: 0.0,
            set_position: None,
            rezero_position: None,
        }
    }
}

pub struct CommandBuffer {
    slots: [UnsafeCell<CommandData>; 2],
    active: AtomicUsize,
}

// The slot protocol above keeps the two contexts on disjoint slots; the
// index handoff is the only shared word.
unsafe impl Sync for CommandBuffer {}

impl CommandBuffer {
    pub fn new() -> Self {
        Self {
            slots: [
                UnsafeCell::new(CommandData::default()),
                UnsafeCell::new(CommandData::default()),
            ],
            active: AtomicUsize::new(0),
        }
    }

    /// Foreground: stage `data` in the inactive slot and publish it.
    pub fn publish(&self, data: &CommandData) {
        let next = 1 - self.active.load(Ordering::Relaxed);
        unsafe {
            *self.slots[next].get() = *data;
        }
        self.active.store(next, Ordering::Release);
    }

    /// ISR: copy of the currently active command.
    pub fn isr_snapshot(&self) -> CommandData {
        let index = self.active.load(Ordering::Acquire);
        unsafe { *self.slots[index].get() }
    }

    /// ISR: operate on the active slot in place, for one-shot consumption.
    pub fn isr_with<R>(&self, f: impl FnOnce(&mut CommandData) -> R) -> R {
        let index = self.active.load(Ordering::Acquire);
        f(unsafe { &mut *self.slots[index].get() })
    }
}

impl Default for CommandBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_is_whole_record() {
        let buffer = CommandBuffer::new();
        let mut data = CommandData::default();
        data.mode = Mode::Position;
        data.position = 0.25;
        data.velocity = 2.0;
        buffer.publish(&data);

        let seen = buffer.isr_snapshot();
        assert_eq!(seen.mode, Mode::Position);
        assert_eq!(seen.position, 0.25);
        assert_eq!(seen.velocity, 2.0);
    }

    #[test]
    fn test_staging_slot_invisible_until_published() {
        let buffer = CommandBuffer::new();
        let mut data = CommandData::default();
        data.mode = Mode::Voltage;
        buffer.publish(&data);

        // A second publish alternates slots; the active one is untouched
        // while the next record is staged.
        data.mode = Mode::Current;
        let before = buffer.isr_snapshot();
        assert_eq!(before.mode, Mode::Voltage);
        buffer.publish(&data);
        assert_eq!(buffer.isr_snapshot().mode, Mode::Current);
    }

    #[test]
    fn test_one_shot_consumption_sticks() {
        let buffer = CommandBuffer::new();
        let mut data = CommandData::default();
        data.set_position = Some(1.5);
        buffer.publish(&data);

        let taken = buffer.isr_with(|d| d.set_position.take());
        assert_eq!(taken, Some(1.5));
        assert_eq!(buffer.isr_snapshot().set_position, None);
        // Second read sees the consumed sentinel.
        assert_eq!(buffer.isr_with(|d| d.set_position.take()), None);
    }
}

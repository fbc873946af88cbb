//! Interrupt trampoline and the controller singleton.
//!
//! The vector table needs a plain function, so the controller lives in a
//! critical-section mutex that both the timer interrupt and the foreground
//! tasks go through.  `install` is the only initializer; everything after it
//! reaches the controller via `with_servo`.

use core::cell::RefCell;

use critical_section::Mutex;
use embassy_stm32::interrupt;
use embassy_stm32::pac;
use embassy_stm32::pac::timer::vals as tim_vals;

use servo::servo::Servo;

use crate::as5047::As5047;
use crate::drv8323::Drv8323;
use crate::registers::G4Registers;

pub type ServoInstance = Servo<G4Registers, As5047, Drv8323>;

static SERVO: Mutex<RefCell<Option<ServoInstance>>> = Mutex::new(RefCell::new(None));

pub fn install(servo: ServoInstance) {
    critical_section::with(|cs| {
        SERVO.borrow(cs).replace(Some(servo));
    });
}

pub fn with_servo<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut ServoInstance) -> R,
{
    critical_section::with(|cs| SERVO.borrow(cs).borrow_mut().as_mut().map(f))
}

#[interrupt]
fn TIM1_UP_TIM16() {
    // Everything until the current samples are read limits the usable duty
    // cycle, so take the flags and get straight into the tick.
    let tim = pac::TIM1;
    let sr = tim.sr().read();
    let dir = tim.cr1().read().dir();
    tim.sr().write(|_| {});

    if sr.uif() && dir == tim_vals::Dir::DOWN {
        critical_section::with(|cs| {
            if let Some(servo) = SERVO.borrow(cs).borrow_mut().as_mut() {
                servo.isr_update();
            }
        });
    }
}

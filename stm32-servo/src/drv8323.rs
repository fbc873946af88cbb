//! Gate driver glue: chip enable, output enable and the latched nFAULT
//! line.  Register configuration over SPI happens out of band; the control
//! core only needs these three signals.

use embassy_stm32::gpio::{Input, Output};

use servo::hal::MotorDriver;

pub struct Drv8323 {
    enable: Output<'static>,
    gate: Output<'static>,
    nfault: Input<'static>,
}

impl Drv8323 {
    pub fn new(enable: Output<'static>, gate: Output<'static>, nfault: Input<'static>) -> Self {
        Self {
            enable,
            gate,
            nfault,
        }
    }
}

impl MotorDriver for Drv8323 {
    fn enable(&mut self, value: bool) {
        if value {
            self.enable.set_high();
        } else {
            self.enable.set_low();
        }
    }

    fn power(&mut self, value: bool) {
        if value {
            self.gate.set_high();
        } else {
            self.gate.set_low();
        }
    }

    fn fault(&mut self) -> bool {
        // Fault line is active low, and only meaningful while enabled.
        self.enable.is_set_high() && self.nfault.is_low()
    }
}

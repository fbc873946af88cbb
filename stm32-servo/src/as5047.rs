//! AS5047-class absolute encoder on SPI1.
//!
//! The control tick splits the read in two: `start_sample` drops chip select
//! and clocks the angle command out while the ADCs convert, `finish_sample`
//! collects and parity-checks the frame afterwards.  The embassy SPI
//! instance is kept only to own the pin and peripheral configuration; the
//! split transaction itself talks to the data register directly.

use embassy_stm32::gpio::Output;
use embassy_stm32::mode::Blocking;
use embassy_stm32::pac;
use embassy_stm32::spi::Spi;

use servo::hal::PositionSensor;

/// Read command for the measured-angle register, parity bit included.
const READ_ANGLE: u16 = to_read_command(0x3FFF);

const fn to_read_command(address: u16) -> u16 {
    let cmd = 0x4000u16 | (address & 0x3FFF);
    let parity = (cmd.count_ones() % 2) as u16;
    cmd | (parity << 15)
}

pub struct As5047 {
    _spi: Spi<'static, Blocking>,
    cs: Output<'static>,
    last_angle: u16,
}

impl As5047 {
    pub fn new(spi: Spi<'static, Blocking>, mut cs: Output<'static>) -> Self {
        cs.set_high();
        pac::SPI1.cr1().modify(|w| w.set_spe(true));
        Self {
            _spi: spi,
            cs,
            last_angle: 0,
        }
    }
}

impl PositionSensor for As5047 {
    fn start_sample(&mut self) {
        self.cs.set_low();
        pac::SPI1.dr().write(|w| w.set_dr(READ_ANGLE));
    }

    fn finish_sample(&mut self) -> u16 {
        let spi = pac::SPI1;
        while !spi.sr().read().rxne() {}
        let frame = spi.dr().read().dr();
        self.cs.set_high();

        // Even parity over the whole frame; bit 14 is the sensor's error
        // flag.  Hold the last good angle on a bad frame.
        if frame.count_ones() % 2 != 0 || frame & 0x4000 != 0 {
            return self.last_angle;
        }

        // 14 significant bits, widened onto the full 16-bit position scale.
        self.last_angle = (frame & 0x3FFF) << 2;
        self.last_angle
    }
}

#![no_std]
#![no_main]

mod as5047;
mod cordic;
mod drv8323;
mod flash_config;
mod isr;
mod registers;

use defmt::{info, warn};
use defmt_rtt as _;
use panic_probe as _;

use embassy_executor::Spawner;
use embassy_stm32::flash::Flash;
use embassy_stm32::gpio::{Input, Level, Output, OutputType, Pull, Speed};
use embassy_stm32::spi;
use embassy_stm32::time::hz;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_stm32::timer::low_level::CountingMode;
use embassy_time::Timer;

use servo::mode::Mode;
use servo::servo::{Options, Servo, PWM_RATE_HZ};

use crate::as5047::As5047;
use crate::drv8323::Drv8323;
use crate::registers::{BusyWaitTimer, G4Registers};

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let mut config = embassy_stm32::Config::default();
    {
        use embassy_stm32::rcc::*;
        // HSI 16 / 4 * 85 / 2 = 170 MHz
        config.rcc.pll = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL85,
            divp: None,
            divq: None,
            divr: Some(PllRDiv::DIV2),
        });
        config.rcc.sys = Sysclk::PLL1_R;
    }
    let p = embassy_stm32::init(config);
    info!("servo bring-up");

    // Phase PWM pins; the timer itself is reprogrammed below for the
    // center-aligned 40 kHz cycle the control loop expects.
    let pwm = SimplePwm::new(
        p.TIM1,
        Some(PwmPin::new_ch1(p.PA8, OutputType::PushPull)),
        Some(PwmPin::new_ch2(p.PA9, OutputType::PushPull)),
        Some(PwmPin::new_ch3(p.PA10, OutputType::PushPull)),
        None,
        hz(PWM_RATE_HZ),
        CountingMode::CenterAlignedBothInterrupts,
    );
    core::mem::forget(pwm);

    let encoder_spi = spi::Spi::new_blocking(p.SPI1, p.PA5, p.PA7, p.PA6, {
        let mut c = spi::Config::default();
        c.frequency = hz(10_000_000);
        c
    });
    let sensor = As5047::new(
        encoder_spi,
        Output::new(p.PA4, Level::High, Speed::VeryHigh),
    );

    let driver = Drv8323::new(
        Output::new(p.PB0, Level::Low, Speed::Low),
        Output::new(p.PB1, Level::Low, Speed::Low),
        Input::new(p.PC4, Pull::Up),
    );

    let mut servo = Servo::new(G4Registers::new(), sensor, driver, Options::default());

    let mut flash = Flash::new_blocking(p.FLASH);
    match flash_config::read_config(&mut flash) {
        Some(stored) => {
            flash_config::apply_to_servo(&mut servo, &stored);
            info!("configuration loaded, poles = {}", servo.motor().poles);
        }
        None => {
            info!("no stored configuration, using defaults");
        }
    }

    // One-time peripheral programming, then the interrupt owns the cycle.
    let mut delay = BusyWaitTimer;
    cordic::initialize();
    registers::configure_adc(servo.config(), &mut delay);
    isr::install(servo);
    registers::configure_pwm_timer();
    info!("control loop running at {} Hz", PWM_RATE_HZ);

    // Millisecond supervisor: finishes the Enabling edge and surfaces mode
    // changes and faults on the log.
    let mut last_mode = Mode::Stopped;
    loop {
        Timer::after_millis(1).await;
        let observed = isr::with_servo(|s| {
            s.poll_millisecond();
            (s.status().mode, s.status().fault)
        });
        if let Some((mode, fault)) = observed {
            if mode != last_mode {
                if mode == Mode::Fault {
                    warn!("fault: {}", fault);
                } else {
                    info!("mode {} -> {}", last_mode, mode);
                }
                last_mode = mode;
            }
        }
    }
}

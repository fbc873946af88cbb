/// Top-level controller mode.  `Stopped`, `Fault` and the calibration ladder
/// are managed internally; the remaining modes can be requested from the
/// foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Mode {
    Stopped = 0,
    Fault = 1,
    Enabling = 2,
    Calibrating = 3,
    CalibrationComplete = 4,
    Pwm = 5,
    Voltage = 6,
    VoltageFoc = 7,
    VoltageDq = 8,
    Current = 9,
    Position = 10,
    PositionTimeout = 11,
    ZeroVelocity = 12,
    StayWithinBounds = 13,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Stopped
    }
}

impl Mode {
    /// True for every mode that drives the power stage.
    pub fn torque_on(self) -> bool {
        match self {
            Mode::Stopped
            | Mode::Fault
            | Mode::Enabling
            | Mode::Calibrating
            | Mode::CalibrationComplete => false,
            Mode::Pwm
            | Mode::Voltage
            | Mode::VoltageFoc
            | Mode::VoltageDq
            | Mode::Current
            | Mode::Position
            | Mode::PositionTimeout
            | Mode::ZeroVelocity
            | Mode::StayWithinBounds => true,
        }
    }

    /// Modes whose control law runs the dq current regulators.
    pub fn current_pid_active(self) -> bool {
        matches!(
            self,
            Mode::Current
                | Mode::Position
                | Mode::PositionTimeout
                | Mode::ZeroVelocity
                | Mode::StayWithinBounds
        )
    }

    /// Modes whose control law runs the position regulator.
    pub fn position_pid_active(self) -> bool {
        matches!(
            self,
            Mode::Position | Mode::PositionTimeout | Mode::ZeroVelocity | Mode::StayWithinBounds
        )
    }

    /// Modes the foreground is allowed to request.  The calibration ladder
    /// and the fault state can only be entered internally.
    pub fn commandable(self) -> bool {
        !matches!(
            self,
            Mode::Fault | Mode::Enabling | Mode::Calibrating | Mode::CalibrationComplete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_families_nest() {
        // Every position-PID mode is also a current-PID mode.
        for mode in [
            Mode::Position,
            Mode::PositionTimeout,
            Mode::ZeroVelocity,
            Mode::StayWithinBounds,
        ] {
            assert!(mode.position_pid_active());
            assert!(mode.current_pid_active());
            assert!(mode.torque_on());
        }
        assert!(Mode::Current.current_pid_active());
        assert!(!Mode::Current.position_pid_active());
        assert!(!Mode::VoltageDq.current_pid_active());
    }

    #[test]
    fn test_commandable() {
        assert!(Mode::Stopped.commandable());
        assert!(Mode::Position.commandable());
        assert!(!Mode::Fault.commandable());
        assert!(!Mode::Enabling.commandable());
        assert!(!Mode::Calibrating.commandable());
        assert!(!Mode::CalibrationComplete.commandable());
    }
}

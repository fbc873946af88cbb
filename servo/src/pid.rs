/// PID regulator.  Gains live in the persisted config; the integrator and
/// error terms live in `Status` so they are visible over telemetry, which is
/// why `apply` takes the state explicitly instead of owning it.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct PidConfig {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Anti-windup clamp on the accumulated integral term.
    pub ilimit: f32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            ilimit: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PidState {
    pub integral: f32,
    pub desired: f32,
    pub error: f32,
    pub error_rate: f32,
}

impl PidState {
    pub fn clear(&mut self) {
        *self = PidState::default();
    }
}

/// Per-application gain scaling, used by the position law to blend between
/// stiffness and pure damping without touching the persisted gains.
#[derive(Clone, Copy, Debug)]
pub struct ApplyOptions {
    pub kp_scale: f32,
    pub kd_scale: f32,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            kp_scale: 1.0,
            kd_scale: 1.0,
        }
    }
}

impl PidConfig {
    pub fn apply(
        &self,
        state: &mut PidState,
        measured: f32,
        desired: f32,
        measured_rate: f32,
        desired_rate: f32,
        rate_hz: f32,
        options: &ApplyOptions,
    ) -> f32 {
        state.desired = desired;
        state.error = desired - measured;
        state.error_rate = desired_rate - measured_rate;

        state.integral += state.error * self.ki / rate_hz;
        if state.integral > self.ilimit {
            state.integral = self.ilimit;
        } else if state.integral < -self.ilimit {
            state.integral = -self.ilimit;
        }

        self.kp * options.kp_scale * state.error
            + self.kd * options.kd_scale * state.error_rate
            + state.integral
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_only() {
        let config = PidConfig {
            kp: 2.0,
            ..Default::default()
        };
        let mut state = PidState::default();
        let out = config.apply(&mut state, 1.0, 3.0, 0.0, 0.0, 1000.0, &Default::default());
        assert_eq!(out, 4.0);
        assert_eq!(state.error, 2.0);
    }

    #[test]
    fn test_integral_accumulates_and_clamps() {
        let config = PidConfig {
            ki: 100.0,
            ilimit: 0.5,
            ..Default::default()
        };
        let mut state = PidState::default();
        for _ in 0..10 {
            config.apply(&mut state, 0.0, 1.0, 0.0, 0.0, 100.0, &Default::default());
        }
        // 10 steps of error 1.0 at ki/rate = 1.0 per step, clamped at 0.5.
        assert_eq!(state.integral, 0.5);

        for _ in 0..20 {
            config.apply(&mut state, 1.0, 0.0, 0.0, 0.0, 100.0, &Default::default());
        }
        assert_eq!(state.integral, -0.5);
    }

    #[test]
    fn test_derivative_and_scales() {
        let config = PidConfig {
            kp: 1.0,
            kd: 2.0,
            ..Default::default()
        };
        let mut state = PidState::default();
        let options = ApplyOptions {
            kp_scale: 0.0,
            kd_scale: 1.0,
        };
        let out = config.apply(&mut state, 5.0, 0.0, 0.25, 0.0, 1000.0, &options);
        // kp fully scaled out, derivative term only.
        assert_eq!(out, 2.0 * (0.0 - 0.25));
    }

    #[test]
    fn test_clear_zeros_everything() {
        let config = PidConfig {
            kp: 1.0,
            ki: 10.0,
            ilimit: 1.0,
            ..Default::default()
        };
        let mut state = PidState::default();
        config.apply(&mut state, 1.0, 2.0, 0.5, 0.0, 100.0, &Default::default());
        assert!(state.integral != 0.0);
        state.clear();
        assert_eq!(state, PidState::default());
    }
}

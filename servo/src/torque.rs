use libm::{exp2f, fabsf, log2f};

/// Winding current to shaft torque and back.  Below the rotation cutoff the
/// relation is linear in the torque constant; beyond it magnetic saturation
/// bends the curve, modeled with a log2 compression so the inverse stays in
/// closed form.
#[derive(Clone, Copy, Debug)]
pub struct TorqueModel {
    pub torque_constant: f32,
    pub rotation_current_cutoff_a: f32,
    pub rotation_current_scale: f32,
    pub rotation_torque_scale: f32,
}

impl TorqueModel {
    pub fn new(
        torque_constant: f32,
        rotation_current_cutoff_a: f32,
        rotation_current_scale: f32,
        rotation_torque_scale: f32,
    ) -> Self {
        Self {
            torque_constant,
            rotation_current_cutoff_a,
            rotation_current_scale,
            rotation_torque_scale,
        }
    }

    pub fn current_to_torque(&self, current: f32) -> f32 {
        if fabsf(current) < self.rotation_current_cutoff_a {
            return current * self.torque_constant;
        }
        let sign = if current < 0.0 { -1.0 } else { 1.0 };
        self.torque_constant
            * sign
            * (self.rotation_current_cutoff_a
                + self.rotation_torque_scale
                    * log2f(
                        1.0 + (fabsf(current) - self.rotation_current_cutoff_a)
                            * self.rotation_current_scale,
                    ))
    }

    pub fn torque_to_current(&self, torque: f32) -> f32 {
        if fabsf(torque) < self.rotation_current_cutoff_a * self.torque_constant {
            return torque / self.torque_constant;
        }
        let sign = if torque < 0.0 { -1.0 } else { 1.0 };
        sign * ((exp2f(
            (fabsf(torque) / self.torque_constant - self.rotation_current_cutoff_a)
                / self.rotation_torque_scale,
        ) - 1.0)
            / self.rotation_current_scale
            + self.rotation_current_cutoff_a)
    }
}

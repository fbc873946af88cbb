use core::f32::consts::PI;

use libm::{fabsf, fmodf};

/// Clamp that passes NaN bounds through untouched.  Position limits use NaN
/// to mean "no bound", so the comparisons must simply fail open.
pub fn limit(value: f32, lower: f32, upper: f32) -> f32 {
    if value < lower {
        return lower;
    }
    if value > upper {
        return upper;
    }
    value
}

/// Zero the value inside the (lower, upper) dead band.
pub fn threshold(value: f32, lower: f32, upper: f32) -> f32 {
    if value > lower && value < upper {
        return 0.0;
    }
    value
}

/// Dead-zone compensation.  Zero maps to zero; inputs at or beyond the blend
/// width get the full minimum offset added in their sign; inside the blend
/// region the output ramps linearly from 0 to blend + minval.
pub fn offset(minval: f32, blend: f32, val: f32) -> f32 {
    if val == 0.0 {
        return 0.0;
    }
    if fabsf(val) >= blend {
        return if val < 0.0 { -minval + val } else { minval + val };
    }
    let ratio = val / blend;
    ratio * (blend + minval)
}

pub fn wrap_zero_to_two_pi(value: f32) -> f32 {
    let wrapped = fmodf(value, 2.0 * PI);
    if wrapped < 0.0 {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_basic() {
        assert_eq!(limit(0.5, 0.0, 1.0), 0.5);
        assert_eq!(limit(-0.5, 0.0, 1.0), 0.0);
        assert_eq!(limit(1.5, 0.0, 1.0), 1.0);
    }

    #[test]
    fn test_limit_nan_bounds_pass_through() {
        // NaN bounds mean unbounded, the value must survive unchanged.
        let v = limit(3.0, f32::NAN, f32::NAN);
        assert_eq!(v, 3.0);
        assert_eq!(limit(-7.0, f32::NAN, 1.0), -7.0);
        assert_eq!(limit(-7.0, -1.0, f32::NAN), -1.0);
    }

    #[test]
    fn test_threshold() {
        assert_eq!(threshold(0.05, -0.1, 0.1), 0.0);
        assert_eq!(threshold(-0.05, -0.1, 0.1), 0.0);
        assert_eq!(threshold(0.2, -0.1, 0.1), 0.2);
        assert_eq!(threshold(-0.2, -0.1, 0.1), -0.2);
    }

    #[test]
    fn test_offset_piecewise() {
        assert_eq!(offset(0.1, 0.2, 0.0), 0.0);
        // Beyond the blend: full offset in the input's sign.
        assert!((offset(0.1, 0.2, 0.5) - 0.6).abs() < 1e-6);
        assert!((offset(0.1, 0.2, -0.5) + 0.6).abs() < 1e-6);
        // At the blend edge the two segments agree.
        assert!((offset(0.1, 0.2, 0.2) - 0.3).abs() < 1e-6);
        // Halfway through the blend: half the edge value.
        assert!((offset(0.1, 0.2, 0.1) - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_wrap() {
        assert!((wrap_zero_to_two_pi(7.0) - (7.0 - 2.0 * PI)).abs() < 1e-6);
        assert!((wrap_zero_to_two_pi(-1.0) - (2.0 * PI - 1.0)).abs() < 1e-6);
        assert_eq!(wrap_zero_to_two_pi(0.0), 0.0);
    }
}

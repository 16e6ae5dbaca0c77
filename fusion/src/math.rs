//! Small math helpers shared by the filter.

use nalgebra::Vector3;

pub const DEG_TO_RAD: f32 = core::f32::consts::PI / 180.0;
pub const RAD_TO_DEG: f32 = 180.0 / core::f32::consts::PI;

/// Wrap an angle in degrees into `[0, 360)`. Non-finite input maps to 0.
pub fn wrap_degrees_360(angle: f32) -> f32 {
    if !angle.is_finite() {
        return 0.0;
    }
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for inputs just below zero
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Normalize a vector, returning the zero vector when the magnitude is zero
/// or not representable.
pub fn safe_normalize(v: Vector3<f32>) -> Vector3<f32> {
    let mag = v.norm();
    if mag.is_finite() && mag > 0.0 {
        v / mag
    } else {
        Vector3::zeros()
    }
}

//! Complementary AHRS filter over quaternions.
//!
//! Gyroscope integration with accelerometer gravity feedback and optional
//! magnetometer heading feedback. During an initial settling window the
//! correction gain ramps down from a high value to the configured gain so
//! the estimate converges quickly from the identity orientation.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::math::{safe_normalize, wrap_degrees_360, DEG_TO_RAD, RAD_TO_DEG};

/// Gain applied while the filter is settling.
const INITIAL_GAIN: f32 = 10.0;
/// Length of the settling ramp in seconds.
const INITIALISATION_PERIOD_S: f32 = 3.0;

/// Construction failure for [`Ahrs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AhrsError {
    /// The sample period must be finite and positive.
    InvalidSamplePeriod(f32),
}

impl core::fmt::Display for AhrsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AhrsError::InvalidSamplePeriod(p) => {
                write!(f, "invalid AHRS sample period: {p}")
            }
        }
    }
}

impl std::error::Error for AhrsError {}

/// Orientation estimator fed with gyro (deg/s), accelerometer (direction
/// only), and optionally magnetometer (µT) at a nominal sample period.
pub struct Ahrs {
    gain: f32,
    quaternion: UnitQuaternion<f32>,
    ramped_gain: f32,
    ramped_gain_step: f32,
    initialising: bool,
    initialized: bool,
}

impl Ahrs {
    /// Create a filter for the given nominal sample period and gain.
    ///
    /// A gain of 0.5 is the usual choice; values outside `[0, 1]` are
    /// accepted. Fails when `sample_period_s` is not finite and positive.
    pub fn new(sample_period_s: f32, gain: f32) -> Result<Self, AhrsError> {
        if !sample_period_s.is_finite() || sample_period_s <= 0.0 {
            return Err(AhrsError::InvalidSamplePeriod(sample_period_s));
        }
        Ok(Self {
            gain,
            quaternion: UnitQuaternion::identity(),
            ramped_gain: INITIAL_GAIN.max(gain),
            ramped_gain_step: (INITIAL_GAIN - gain).max(0.0) / INITIALISATION_PERIOD_S
                * sample_period_s,
            initialising: true,
            initialized: false,
        })
    }

    /// Reset to the identity orientation and restart the settling ramp.
    pub fn reset(&mut self) {
        self.quaternion = UnitQuaternion::identity();
        self.ramped_gain = INITIAL_GAIN.max(self.gain);
        self.initialising = true;
        self.initialized = false;
    }

    /// True after at least one successful update.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Advance the filter by one sample.
    ///
    /// `dt_s` is the time since the previous sample. Non-positive or
    /// non-finite `dt_s` is ignored. Zero gyro, zero accel, and missing
    /// magnetometer are all fine; a zero vector contributes no feedback.
    pub fn update(
        &mut self,
        gyro_degps: Vector3<f32>,
        accel: Vector3<f32>,
        magnetometer: Option<Vector3<f32>>,
        dt_s: f32,
    ) {
        if !dt_s.is_finite() || dt_s <= 0.0 {
            return;
        }

        if self.initialising {
            if self.ramped_gain > self.gain {
                self.ramped_gain = (self.ramped_gain - self.ramped_gain_step).max(self.gain);
            } else {
                self.initialising = false;
            }
        }

        let mut half_feedback = Vector3::zeros();

        let accel_dir = safe_normalize(accel);
        if accel_dir != Vector3::zeros() {
            half_feedback += feedback(accel_dir, self.half_gravity()) * 0.5;
        }

        let has_magnetometer = match magnetometer {
            Some(mag) => {
                let mag_dir = safe_normalize(mag);
                if mag_dir != Vector3::zeros() {
                    half_feedback += feedback(mag_dir, self.half_magnetic()) * 0.5;
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        let gain = if self.initialising {
            self.ramped_gain
        } else {
            self.gain
        };

        let half_gyro = gyro_degps * (DEG_TO_RAD * 0.5);
        let adjusted = half_gyro + half_feedback * gain;

        // dq/dt = q * (0, omega/2); first-order integration then renormalise
        let q = self.quaternion.into_inner();
        let derivative = q * Quaternion::from_parts(0.0, adjusted);
        self.quaternion = UnitQuaternion::from_quaternion(q + derivative * dt_s);

        // Without a heading reference the yaw would just integrate gyro
        // noise while settling, so hold it at zero until the ramp is done.
        if self.initialising && !has_magnetometer {
            self.zero_heading();
        }

        self.initialized = true;
    }

    /// Current orientation.
    pub fn quaternion(&self) -> UnitQuaternion<f32> {
        self.quaternion
    }

    /// Heading in degrees, wrapped to `[0, 360)`.
    pub fn yaw_deg(&self) -> f32 {
        let (_, _, yaw) = self.quaternion.euler_angles();
        wrap_degrees_360(yaw * RAD_TO_DEG)
    }

    /// Pitch in degrees.
    pub fn pitch_deg(&self) -> f32 {
        let (_, pitch, _) = self.quaternion.euler_angles();
        pitch * RAD_TO_DEG
    }

    /// Roll in degrees.
    pub fn roll_deg(&self) -> f32 {
        let (_, roll, _) = self.quaternion.euler_angles();
        roll * RAD_TO_DEG
    }

    /// Direction of gravity in the sensor frame, halved (NWU convention).
    fn half_gravity(&self) -> Vector3<f32> {
        let q = self.quaternion.as_ref();
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);
        Vector3::new(x * z - w * y, y * z + w * x, w * w - 0.5 + z * z)
    }

    /// Direction of the horizontal magnetic field in the sensor frame,
    /// halved (NWU convention: west component of the earth field).
    fn half_magnetic(&self) -> Vector3<f32> {
        let q = self.quaternion.as_ref();
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);
        Vector3::new(w * y + x * z, 0.5 - x * x - z * z, y * z - w * x)
    }

    fn zero_heading(&mut self) {
        let (roll, pitch, _) = self.quaternion.euler_angles();
        self.quaternion = UnitQuaternion::from_euler_angles(roll, pitch, 0.0);
    }
}

/// Error between a measured direction and its reference. Opposing vectors
/// would give a vanishing cross product, so normalise in that case.
fn feedback(sensor: Vector3<f32>, reference: Vector3<f32>) -> Vector3<f32> {
    let cross = sensor.cross(&reference);
    if sensor.dot(&reference) < 0.0 {
        safe_normalize(cross)
    } else {
        cross
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 0.01;

    fn level_accel() -> Vector3<f32> {
        Vector3::new(0.0, 0.0, 9.81)
    }

    #[test]
    fn rejects_bad_sample_period() {
        assert!(Ahrs::new(0.0, 0.5).is_err());
        assert!(Ahrs::new(-0.01, 0.5).is_err());
        assert!(Ahrs::new(f32::NAN, 0.5).is_err());
        assert!(Ahrs::new(f32::INFINITY, 0.5).is_err());
        assert!(Ahrs::new(0.01, 0.5).is_ok());
    }

    #[test]
    fn initialized_after_first_update() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        assert!(!ahrs.initialized());
        ahrs.update(Vector3::zeros(), level_accel(), None, DT);
        assert!(ahrs.initialized());
    }

    #[test]
    fn zero_dt_is_ignored() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        ahrs.update(Vector3::zeros(), level_accel(), None, 0.0);
        assert!(!ahrs.initialized());
        ahrs.update(Vector3::zeros(), level_accel(), None, f32::NAN);
        assert!(!ahrs.initialized());
    }

    #[test]
    fn yaw_always_in_range() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        let inputs = [
            (Vector3::zeros(), Vector3::zeros(), DT),
            (Vector3::new(500.0, -500.0, 900.0), level_accel(), DT),
            (Vector3::new(0.0, 0.0, -100.0), level_accel(), 1.0),
            (Vector3::new(1e-3, 0.0, 0.0), level_accel(), 1e-6),
        ];
        for (gyro, accel, dt) in inputs {
            ahrs.update(gyro, accel, None, dt);
            let yaw = ahrs.yaw_deg();
            assert!((0.0..360.0).contains(&yaw), "yaw out of range: {yaw}");
        }
    }

    #[test]
    fn settles_level_when_stationary() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        for _ in 0..400 {
            ahrs.update(Vector3::zeros(), level_accel(), None, DT);
        }
        assert!(ahrs.roll_deg().abs() < 1.0);
        assert!(ahrs.pitch_deg().abs() < 1.0);
    }

    #[test]
    fn integrates_z_rotation_into_yaw() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        // settle first so the heading hold during initialisation is over
        for _ in 0..400 {
            ahrs.update(Vector3::zeros(), level_accel(), None, DT);
        }
        // NWU: positive rotation about +z (up) is a counter-clockwise turn,
        // i.e. increasing mathematical yaw. 90 deg/s for one second.
        for _ in 0..100 {
            ahrs.update(Vector3::new(0.0, 0.0, 90.0), level_accel(), None, DT);
        }
        let yaw = ahrs.yaw_deg();
        assert!((yaw - 90.0).abs() < 5.0, "expected ~90, got {yaw}");
    }

    #[test]
    fn magnetometer_steers_heading() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        // Field pointing along +x (sensor facing magnetic reference)
        let mag = Vector3::new(40.0, 0.0, 0.0);
        for _ in 0..600 {
            ahrs.update(Vector3::zeros(), level_accel(), Some(mag), DT);
        }
        let settled = ahrs.yaw_deg();
        // Now rotate the field 90 degrees in the sensor frame and let the
        // filter converge again; heading must follow.
        let rotated = Vector3::new(0.0, 40.0, 0.0);
        for _ in 0..2000 {
            ahrs.update(Vector3::zeros(), level_accel(), Some(rotated), DT);
        }
        let moved = ahrs.yaw_deg();
        let delta = wrap_degrees_360(moved - settled);
        assert!(
            (delta - 90.0).abs() < 10.0 || (delta - 270.0).abs() < 10.0,
            "heading did not follow the field: {settled} -> {moved}"
        );
    }

    #[test]
    fn tolerates_out_of_range_gain() {
        for gain in [0.0, 1.0, -0.5, 5.0] {
            let mut ahrs = Ahrs::new(DT, gain).unwrap();
            for _ in 0..50 {
                ahrs.update(Vector3::new(1.0, 2.0, 3.0), level_accel(), None, DT);
            }
            assert!(ahrs.yaw_deg().is_finite());
        }
    }

    #[test]
    fn reset_clears_state() {
        let mut ahrs = Ahrs::new(DT, 0.5).unwrap();
        for _ in 0..500 {
            ahrs.update(Vector3::new(0.0, 0.0, 45.0), level_accel(), None, DT);
        }
        ahrs.reset();
        assert!(!ahrs.initialized());
        assert_eq!(ahrs.quaternion(), UnitQuaternion::identity());
    }
}

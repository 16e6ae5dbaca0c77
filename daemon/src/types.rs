//! Core data model: IMU samples, GPS fixes, and the weakly-typed JSON
//! coercion helpers used by every wire-facing module.

use nalgebra::Vector3;
use serde_json::Value;

/// Three-component vector used throughout the daemon.
pub type Vec3 = Vector3<f64>;

/// One inertial sample. Accelerometer and gyroscope are always present
/// together; the magnetometer is independent and may be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ImuSample {
    /// Acceleration in m/s², gravity included.
    pub accel: Vec3,
    /// Angular rate in deg/s.
    pub gyro: Vec3,
    /// Magnetic field in µT, when a magnetometer is available.
    pub magnetometer: Option<Vec3>,
}

/// Current GPS fix: position, speed, track, and validity.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    /// Latitude in degrees (positive north).
    pub lat: f64,
    /// Longitude in degrees (positive east).
    pub lon: f64,
    /// Altitude in meters.
    pub alt: f64,
    /// Ground speed in m/s, clamped to >= 0.
    pub speed_ms: f64,
    /// Course over ground in degrees, [0, 360).
    pub track: f64,
    /// Fix timestamp as an ISO-8601 UTC string, when known.
    pub time_iso: Option<String>,
    /// Whether the fix is usable; emitters output nothing otherwise.
    pub valid: bool,
    /// NMEA fix quality: 0 = no fix, 1 = GPS, 2 = DGPS.
    pub fix_quality: u8,
    /// Satellites used in the solution.
    pub num_sats: u32,
    /// Horizontal dilution of precision.
    pub hdop: f64,
}

impl Default for GpsFix {
    fn default() -> Self {
        Self {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            speed_ms: 0.0,
            track: 0.0,
            time_iso: None,
            valid: false,
            fix_quality: 0,
            num_sats: 0,
            hdop: 1.0,
        }
    }
}

/// Clamp a ground speed to the valid range (negative becomes 0).
pub fn clamp_speed(speed_ms: f64) -> f64 {
    if speed_ms.is_finite() && speed_ms > 0.0 {
        speed_ms
    } else {
        0.0
    }
}

/// Coerce a JSON value to f64. Numbers and numeric strings are accepted,
/// everything else fails; the wire protocol is weakly typed on purpose.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce a JSON value to a [`Vec3`]: a length-3-or-more array whose first
/// three elements all coerce to f64. Any failing element fails the whole
/// triple.
pub fn coerce_triple(value: &Value) -> Option<Vec3> {
    let arr = value.as_array()?;
    if arr.len() < 3 {
        return None;
    }
    Some(Vec3::new(
        coerce_f64(&arr[0])?,
        coerce_f64(&arr[1])?,
        coerce_f64(&arr[2])?,
    ))
}

/// Render a [`Vec3`] as a JSON array `[x, y, z]`.
pub fn triple_to_json(v: &Vec3) -> Value {
    serde_json::json!([v.x, v.y, v.z])
}

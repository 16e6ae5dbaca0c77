//! AHRS sensor fusion for heading estimation.
//!
//! This crate fuses gyroscope, accelerometer, and optionally magnetometer
//! readings into an orientation estimate using a complementary filter over
//! quaternions. The primary consumer is a navigation daemon that only cares
//! about yaw (heading), but roll and pitch are exposed as well.
//!
//! Units: gyroscope in deg/s, accelerometer in any consistent unit (only the
//! direction is used), magnetometer in µT.
//!
//! # Example
//!
//! ```
//! use nalgebra::Vector3;
//! use navit_fusion::Ahrs;
//!
//! let mut ahrs = Ahrs::new(0.01, 0.5).unwrap();
//! ahrs.update(
//!     Vector3::new(0.0, 0.0, 1.0),   // gyro deg/s
//!     Vector3::new(0.0, 0.0, 9.81),  // accel m/s^2
//!     None,                          // no magnetometer
//!     0.01,
//! );
//! assert!(ahrs.initialized());
//! let yaw = ahrs.yaw_deg();
//! assert!((0.0..360.0).contains(&yaw));
//! ```

mod ahrs;
mod math;

pub use ahrs::{Ahrs, AhrsError};
pub use math::{wrap_degrees_360, DEG_TO_RAD, RAD_TO_DEG};

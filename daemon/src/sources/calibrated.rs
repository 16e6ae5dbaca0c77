//! IMU source wrapper that applies calibration to each sample.

use std::sync::Arc;

use crate::calibration::CalibrationManager;
use crate::sources::ImuSource;
use crate::types::ImuSample;

/// Wraps an IMU source, subtracting the current bias/offset from every
/// sample.
///
/// The calibration is snapshotted from the manager on each read, so
/// control-API updates take effect on the very next sample. While a
/// gyro-bias run is collecting, the raw (uncalibrated) gyro is fed to it.
pub struct CalibratedImuSource<S> {
    inner: S,
    manager: Arc<CalibrationManager>,
}

impl<S: ImuSource> CalibratedImuSource<S> {
    pub fn new(inner: S, manager: Arc<CalibrationManager>) -> Self {
        Self { inner, manager }
    }
}

impl<S: ImuSource> ImuSource for CalibratedImuSource<S> {
    fn read_imu(&mut self) -> Option<ImuSample> {
        let sample = self.inner.read_imu()?;
        self.manager.add_gyro_sample(sample.gyro);
        let cal = self.manager.calibration();
        Some(ImuSample {
            accel: sample.accel - cal.accel_offset,
            gyro: sample.gyro - cal.gyro_bias,
            magnetometer: sample.magnetometer.map(|m| m - cal.magnetometer_bias),
        })
    }
}

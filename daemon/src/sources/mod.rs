//! Pluggable IMU and GPS data sources.
//!
//! Every backend implements the same two small traits; the engine does not
//! care whether samples come from local sysfs hardware, gpsd, or a phone
//! streaming JSON over TCP.

mod calibrated;
mod linux;
mod remote;

pub use calibrated::CalibratedImuSource;
pub use linux::{GpsdSource, LinuxImuSource, NoGpsSource};
pub use remote::{RemoteGpsSource, RemoteImuSource, RemoteSource};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};

use crate::config::Config;
use crate::iio;
use crate::types::{GpsFix, ImuSample};

/// Source of accelerometer/gyroscope (and optionally magnetometer)
/// samples. `None` means no sample is available right now; the call never
/// blocks.
pub trait ImuSource: Send {
    fn read_imu(&mut self) -> Option<ImuSample>;
}

/// Source of GPS fixes. `None` means nothing new; implementations may
/// block briefly (bounded by a socket timeout) since the GPS loop runs on
/// its own thread.
pub trait GpsSource: Send {
    fn read_fix(&mut self) -> Option<GpsFix>;
}

impl ImuSource for Box<dyn ImuSource> {
    fn read_imu(&mut self) -> Option<ImuSample> {
        (**self).read_imu()
    }
}

/// Build the Linux sources: IIO sysfs for the IMU, gpsd for position.
///
/// Returns `None` when no IIO accelerometer + gyroscope pair exists. A
/// missing gpsd is only a warning; position is then unavailable.
pub fn create_linux_sources(
    config: &Config,
) -> Option<(Box<dyn ImuSource>, Box<dyn GpsSource>)> {
    let base = std::path::Path::new(iio::IIO_BASE);
    let accel = iio::find_accel_device(base, config.accel_path.as_deref())?;
    let gyro = iio::find_gyro_device(base, config.gyro_path.as_deref(), Some(accel.as_path()))?;
    let magnetometer = iio::find_magnetometer_device(
        base,
        config.magnetometer_path.as_deref(),
        Some(accel.as_path()),
    );
    if let Some(path) = &magnetometer {
        info!("Magnetometer found at {}", path.display());
    }
    let reader = iio::IioReader::new(&accel, &gyro, magnetometer.as_deref());

    let gps: Box<dyn GpsSource> = match GpsdSource::connect(&config.gpsd_host, config.gpsd_port) {
        Ok(source) => Box::new(source),
        Err(e) => {
            warn!(
                "gpsd not available ({}); position will be unavailable",
                e
            );
            Box::new(NoGpsSource)
        }
    };
    let imu: Box<dyn ImuSource> = Box::new(LinuxImuSource::new(reader));
    Some((imu, gps))
}

/// Bind and start the remote source server. Bind failure is an error the
/// caller treats as fatal (or falls through from `auto`).
pub fn create_remote_source(
    host: &str,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<RemoteSource> {
    RemoteSource::start(host, port, shutdown)
}

//! Read accelerometer, gyroscope, and magnetometer from the Linux IIO
//! sysfs tree.
//!
//! Devices live under `/sys/bus/iio/devices/iio:deviceN/` and expose per
//! axis a `in_<kind>_<axis>_raw` value plus a per-axis or shared scale and
//! an optional per-axis offset. Output units: m/s² for accel, deg/s for
//! gyro, µT for magnetometer.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::types::Vec3;

/// Default sysfs root; tests inject their own.
pub const IIO_BASE: &str = "/sys/bus/iio/devices";

const AXES: [&str; 3] = ["x", "y", "z"];

/// A gyro scale smaller than this is in rad/s (deg/s scales for real
/// parts are on the order of 0.01..0.1).
const RAD_SCALE_THRESHOLD: f64 = 0.01;

const RAD_TO_DEG: f64 = 57.29577951308232;

/// IMU parts we recognise by their sysfs `name`. Matching is by prefix so
/// variants (e.g. lsm6ds3, lsm6dsm) are covered.
const KNOWN_IMU_NAMES: [&str; 7] = [
    "mpu6050", "mpu9250", "lsm6ds", "bno055", "icm20948", "icm-20948", "adxl345",
];

fn read_sysfs_f64(path: &Path) -> Option<f64> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse::<f64>().ok()
}

fn device_name(device: &Path) -> Option<String> {
    let text = std::fs::read_to_string(device.join("name")).ok()?;
    Some(text.trim().to_ascii_lowercase())
}

fn is_known_imu(name: &str) -> bool {
    KNOWN_IMU_NAMES.iter().any(|part| name.starts_with(part))
}

/// True when the device has x/y/z raw channels plus a usable scale
/// (shared or per-axis) for the given prefix (`in_accel`, `in_anglvel`,
/// `in_magn`).
fn has_channels(device: &Path, prefix: &str) -> bool {
    for axis in AXES {
        if !device.join(format!("{prefix}_{axis}_raw")).exists() {
            return false;
        }
    }
    device.join(format!("{prefix}_scale")).exists()
        || device.join(format!("{prefix}_x_scale")).exists()
}

/// All IIO device directories under `base`, sorted by name.
pub fn discover_devices(base: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(base) else {
        return Vec::new();
    };
    let mut devices: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("iio:device"))
                    .unwrap_or(false)
        })
        .collect();
    devices.sort();
    devices
}

/// Pick the first device with the wanted channels, preferring recognised
/// IMU parts so a board with both a cheap accelerometer and a proper IMU
/// picks the IMU.
fn find_device(base: &Path, prefix: &str) -> Option<PathBuf> {
    let devices = discover_devices(base);
    let candidates: Vec<&PathBuf> = devices
        .iter()
        .filter(|dev| has_channels(dev, prefix))
        .collect();
    candidates
        .iter()
        .find(|dev| {
            device_name(dev)
                .map(|name| is_known_imu(&name))
                .unwrap_or(false)
        })
        .or_else(|| candidates.first())
        .map(|dev| dev.to_path_buf())
}

fn check_override(override_path: Option<&str>, prefix: &str, what: &str) -> Option<PathBuf> {
    let path = Path::new(override_path?);
    if path.exists() && has_channels(path, prefix) {
        return Some(path.to_path_buf());
    }
    warn!("{} path {} missing or invalid", what, path.display());
    None
}

/// Find the accelerometer device, honoring an explicit override.
pub fn find_accel_device(base: &Path, override_path: Option<&str>) -> Option<PathBuf> {
    check_override(override_path, "in_accel", "Accel")
        .or_else(|| find_device(base, "in_accel"))
}

/// Find the gyroscope device. Prefers the accelerometer's device when it
/// also has gyro channels (combined parts like LSM6DSx or MPU6050).
pub fn find_gyro_device(
    base: &Path,
    override_path: Option<&str>,
    accel_device: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = check_override(override_path, "in_anglvel", "Gyro") {
        return Some(path);
    }
    if let Some(accel) = accel_device {
        if has_channels(accel, "in_anglvel") {
            return Some(accel.to_path_buf());
        }
    }
    find_device(base, "in_anglvel")
}

/// Find the magnetometer device, if any. Prefers the accelerometer's
/// device (e.g. MPU9250, ICM20948, BNO055 expose all three).
pub fn find_magnetometer_device(
    base: &Path,
    override_path: Option<&str>,
    accel_device: Option<&Path>,
) -> Option<PathBuf> {
    if let Some(path) = check_override(override_path, "in_magn", "Magnetometer") {
        return Some(path);
    }
    if let Some(accel) = accel_device {
        if has_channels(accel, "in_magn") {
            return Some(accel.to_path_buf());
        }
    }
    find_device(base, "in_magn")
}

/// Per-kind channel bundle: where to read and how to convert.
struct ChannelSet {
    device: PathBuf,
    prefix: &'static str,
    scale: [f64; 3],
    offset: [f64; 3],
}

impl ChannelSet {
    fn new(device: &Path, prefix: &'static str) -> Self {
        let shared_scale = read_sysfs_f64(&device.join(format!("{prefix}_scale"))).unwrap_or(1.0);
        let mut scale = [shared_scale; 3];
        let mut offset = [0.0; 3];
        for (i, axis) in AXES.iter().enumerate() {
            if let Some(s) = read_sysfs_f64(&device.join(format!("{prefix}_{axis}_scale"))) {
                scale[i] = s;
            }
            if let Some(o) = read_sysfs_f64(&device.join(format!("{prefix}_{axis}_offset"))) {
                offset[i] = o;
            }
        }
        debug!(
            "{} channels at {}: scale={:?} offset={:?}",
            prefix,
            device.display(),
            scale,
            offset
        );
        Self {
            device: device.to_path_buf(),
            prefix,
            scale,
            offset,
        }
    }

    /// Read one vector. Any missing or unparsable axis poisons the whole
    /// read.
    fn read(&self) -> Option<Vec3> {
        let mut out = [0.0; 3];
        for (i, axis) in AXES.iter().enumerate() {
            let raw = read_sysfs_f64(
                &self
                    .device
                    .join(format!("{}_{}_raw", self.prefix, axis)),
            )?;
            out[i] = raw * self.scale[i] - self.offset[i];
        }
        Some(Vec3::new(out[0], out[1], out[2]))
    }
}

/// Reader over the resolved accel/gyro/magnetometer devices. Scales and
/// offsets are loaded once at construction; raw channels are read on every
/// sample.
pub struct IioReader {
    accel: ChannelSet,
    gyro: ChannelSet,
    gyro_in_radians: bool,
    magnetometer: Option<ChannelSet>,
}

impl IioReader {
    pub fn new(accel_device: &Path, gyro_device: &Path, magnetometer_device: Option<&Path>) -> Self {
        let gyro = ChannelSet::new(gyro_device, "in_anglvel");
        let gyro_in_radians = gyro.scale[0].abs() < RAD_SCALE_THRESHOLD;
        Self {
            accel: ChannelSet::new(accel_device, "in_accel"),
            gyro,
            gyro_in_radians,
            magnetometer: magnetometer_device.map(|dev| ChannelSet::new(dev, "in_magn")),
        }
    }

    /// Acceleration in m/s², or `None` on any read error.
    pub fn read_accel(&self) -> Option<Vec3> {
        self.accel.read()
    }

    /// Angular rate in deg/s, or `None` on any read error.
    pub fn read_gyro(&self) -> Option<Vec3> {
        let v = self.gyro.read()?;
        if self.gyro_in_radians {
            Some(v * RAD_TO_DEG)
        } else {
            Some(v)
        }
    }

    /// Magnetic field in µT, or `None` without a magnetometer or on error.
    pub fn read_magnetometer(&self) -> Option<Vec3> {
        self.magnetometer.as_ref()?.read()
    }
}

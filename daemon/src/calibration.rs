//! IMU calibration state and its persistence.
//!
//! Bias/offset vectors are subtracted from raw readings before fusion:
//! `calibrated = raw - bias`. Units: gyro bias deg/s, accel offset m/s²,
//! magnetometer bias µT.
//!
//! [`CalibrationManager`] is the shared, thread-safe owner of the current
//! calibration plus an optional gyro-bias collection run. The control
//! server mutates it, the calibrated IMU source reads it on every sample.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};
use serde_json::{json, Value};

use crate::types::{coerce_f64, coerce_triple, triple_to_json, Vec3};

/// Bounds for a requested gyro-bias collection window, in seconds.
const GYRO_RUN_MIN_S: f64 = 0.5;
const GYRO_RUN_MAX_S: f64 = 60.0;

/// Static calibration applied to every IMU sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// Subtracted from raw gyro (deg/s).
    pub gyro_bias: Vec3,
    /// Subtracted from raw accel (m/s²).
    pub accel_offset: Vec3,
    /// Subtracted from raw magnetometer (µT) when one is present.
    pub magnetometer_bias: Vec3,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            gyro_bias: Vec3::zeros(),
            accel_offset: Vec3::zeros(),
            magnetometer_bias: Vec3::zeros(),
        }
    }
}

impl Calibration {
    /// Serialize to the JSON object stored on disk.
    pub fn to_json(&self) -> Value {
        json!({
            "gyro_bias": triple_to_json(&self.gyro_bias),
            "accel_offset": triple_to_json(&self.accel_offset),
            "magnetometer_bias": triple_to_json(&self.magnetometer_bias),
        })
    }

    /// Build from a JSON value. Anything that is not a well-formed triple
    /// (including the whole value not being an object) falls back to zeros
    /// for that field; unknown keys are ignored.
    pub fn from_json(value: &Value) -> Self {
        let field = |key: &str| {
            value
                .get(key)
                .and_then(coerce_triple)
                .unwrap_or_else(Vec3::zeros)
        };
        Self {
            gyro_bias: field("gyro_bias"),
            accel_offset: field("accel_offset"),
            magnetometer_bias: field("magnetometer_bias"),
        }
    }
}

/// Load calibration from a JSON file. A missing or unreadable or malformed
/// file yields the zero calibration; this is never an error.
pub fn load_calibration(path: Option<&Path>) -> Calibration {
    let Some(path) = path else {
        return Calibration::default();
    };
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Calibration::default(),
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Calibration::from_json(&value),
        Err(e) => {
            warn!("Calibration load failed {}: {}", path.display(), e);
            Calibration::default()
        }
    }
}

/// Write calibration to a JSON file atomically (temp file + rename, so a
/// failed write leaves any previous file intact). Returns true on success.
pub fn save_calibration(path: &Path, calibration: &Calibration) -> bool {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Calibration save failed {}: {}", path.display(), e);
        return false;
    }
    let mut body = calibration.to_json().to_string();
    body.push('\n');
    let result = tempfile::NamedTempFile::new_in(dir)
        .and_then(|mut tmp| {
            use std::io::Write;
            tmp.write_all(body.as_bytes())?;
            Ok(tmp)
        })
        .and_then(|tmp| tmp.persist(path).map_err(|e| e.error));
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("Calibration save failed {}: {}", path.display(), e);
            false
        }
    }
}

/// An in-progress gyro-bias estimation run.
#[derive(Debug, Clone, Copy)]
struct GyroBiasRun {
    samples_needed: usize,
    samples_collected: usize,
    accumulator: Vec3,
}

struct Inner {
    calibration: Calibration,
    run: Option<GyroBiasRun>,
}

/// Thread-safe calibration state and gyro-bias collection.
///
/// While a run is active the IMU path feeds raw gyro samples through
/// [`add_gyro_sample`](Self::add_gyro_sample); once enough are collected
/// the mean becomes the new gyro bias and the run ends.
pub struct CalibrationManager {
    inner: Mutex<Inner>,
    save_path: Option<PathBuf>,
    imu_rate_hz: f64,
}

impl CalibrationManager {
    pub fn new(calibration: Calibration, save_path: Option<PathBuf>, imu_rate_hz: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                calibration,
                run: None,
            }),
            save_path,
            imu_rate_hz,
        }
    }

    /// Snapshot of the current calibration. Read on every IMU sample so
    /// control-plane updates take effect on the very next read.
    pub fn calibration(&self) -> Calibration {
        self.inner
            .lock()
            .map(|g| g.calibration)
            .unwrap_or_default()
    }

    /// Replace the supplied fields; unspecified fields are untouched.
    pub fn set(
        &self,
        gyro_bias: Option<Vec3>,
        accel_offset: Option<Vec3>,
        magnetometer_bias: Option<Vec3>,
    ) {
        if let Ok(mut guard) = self.inner.lock() {
            if let Some(v) = gyro_bias {
                guard.calibration.gyro_bias = v;
            }
            if let Some(v) = accel_offset {
                guard.calibration.accel_offset = v;
            }
            if let Some(v) = magnetometer_bias {
                guard.calibration.magnetometer_bias = v;
            }
        }
        self.persist();
    }

    /// Start collecting gyro samples for bias estimation. `seconds` is
    /// clamped to a sane window; returns the number of samples needed.
    pub fn start_gyro_run(&self, seconds: f64) -> usize {
        let seconds = seconds.clamp(GYRO_RUN_MIN_S, GYRO_RUN_MAX_S);
        let samples_needed = if self.imu_rate_hz > 0.0 {
            ((seconds * self.imu_rate_hz).round() as usize).max(1)
        } else {
            1
        };
        if let Ok(mut guard) = self.inner.lock() {
            guard.run = Some(GyroBiasRun {
                samples_needed,
                samples_collected: 0,
                accumulator: Vec3::zeros(),
            });
        }
        samples_needed
    }

    /// Feed one raw gyro sample. No-op unless a run is active. When the
    /// target count is reached the mean becomes the gyro bias, the state
    /// is persisted (when configured), and the run ends.
    pub fn add_gyro_sample(&self, raw_gyro: Vec3) {
        let finished = {
            let Ok(mut guard) = self.inner.lock() else {
                return;
            };
            let Some(run) = guard.run.as_mut() else {
                return;
            };
            run.accumulator += raw_gyro;
            run.samples_collected += 1;
            if run.samples_collected >= run.samples_needed {
                let bias = run.accumulator / run.samples_collected as f64;
                guard.calibration.gyro_bias = bias;
                guard.run = None;
                info!(
                    "Gyro calibration done: bias=({:.4}, {:.4}, {:.4}) deg/s",
                    bias.x, bias.y, bias.z
                );
                true
            } else {
                false
            }
        };
        if finished {
            self.persist();
        }
    }

    /// Abandon any in-progress run (status back to idle) without touching
    /// the calibration. Used on shutdown.
    pub fn abandon_run(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.run = None;
        }
    }

    /// Full status object for the control API.
    pub fn status(&self) -> Value {
        let Ok(guard) = self.inner.lock() else {
            return json!({"error": "calibration state unavailable"});
        };
        let (status, collected, needed) = match guard.run {
            Some(run) => ("collecting", run.samples_collected, run.samples_needed),
            None => ("idle", 0, 0),
        };
        json!({
            "gyro_bias": triple_to_json(&guard.calibration.gyro_bias),
            "accel_offset": triple_to_json(&guard.calibration.accel_offset),
            "magnetometer_bias": triple_to_json(&guard.calibration.magnetometer_bias),
            "calibration_status": status,
            "samples_collected": collected,
            "samples_needed": needed,
        })
    }

    fn persist(&self) {
        if let Some(path) = &self.save_path {
            save_calibration(path, &self.calibration());
        }
    }
}

/// Parse the seconds argument of a calibrate_gyro request; the original
/// protocol defaults to 5 seconds when the key is absent.
pub fn gyro_run_seconds(request: &Value) -> Option<f64> {
    match request.get("seconds") {
        None => Some(5.0),
        Some(v) => coerce_f64(v),
    }
}

//! Linux data sources: IIO sysfs for the IMU, gpsd for GPS.

use std::io::Write;
use std::net::TcpStream;

use log::{debug, info, warn};
use serde_json::Value;

use crate::iio::IioReader;
use crate::net::{LineEvent, LineReader};
use crate::nmea::wrap_track;
use crate::sources::{GpsSource, ImuSource};
use crate::types::{clamp_speed, coerce_f64, GpsFix, ImuSample};

/// IMU samples from the Linux IIO sysfs tree.
pub struct LinuxImuSource {
    reader: IioReader,
}

impl LinuxImuSource {
    pub fn new(reader: IioReader) -> Self {
        Self { reader }
    }
}

impl ImuSource for LinuxImuSource {
    fn read_imu(&mut self) -> Option<ImuSample> {
        let accel = self.reader.read_accel()?;
        let gyro = self.reader.read_gyro()?;
        Some(ImuSample {
            accel,
            gyro,
            magnetometer: self.reader.read_magnetometer(),
        })
    }
}

/// Placeholder GPS source used when gpsd is unreachable; the daemon still
/// runs, position is just never available.
pub struct NoGpsSource;

impl GpsSource for NoGpsSource {
    fn read_fix(&mut self) -> Option<GpsFix> {
        None
    }
}

/// GPS fixes from a gpsd instance, via its JSON watcher protocol.
///
/// TPV reports carry the fix itself; SKY reports carry HDOP and the
/// satellite list, which are cached and merged into following fixes.
pub struct GpsdSource {
    reader: LineReader,
    hdop: f64,
    num_sats: u32,
    alive: bool,
}

impl GpsdSource {
    /// Connect and enable watcher mode.
    pub fn connect(host: &str, port: u16) -> std::io::Result<GpsdSource> {
        let mut stream = TcpStream::connect((host, port))?;
        stream.write_all(b"?WATCH={\"enable\":true,\"json\":true};\r\n")?;
        stream.flush()?;
        info!("Connected to gpsd at {}:{}", host, port);
        Ok(GpsdSource {
            reader: LineReader::new(stream)?,
            hdop: 1.0,
            num_sats: 0,
            alive: true,
        })
    }

    fn parse_report(&mut self, line: &str) -> Option<GpsFix> {
        let value: Value = serde_json::from_str(line).ok()?;
        match value.get("class").and_then(|c| c.as_str()) {
            Some("TPV") => Some(self.parse_tpv(&value)),
            Some("SKY") => {
                self.parse_sky(&value);
                None
            }
            _ => None,
        }
    }

    fn parse_tpv(&self, report: &Value) -> GpsFix {
        let mode = report.get("mode").and_then(|m| m.as_i64()).unwrap_or(0);
        let valid = mode >= 2;
        let field = |key: &str| report.get(key).and_then(coerce_f64);
        // DGPS shows up as status 2 on receivers that report it
        let fix_quality = match report.get("status").and_then(|s| s.as_i64()) {
            Some(status) if valid && status >= 2 => 2,
            _ if valid => 1,
            _ => 0,
        };
        GpsFix {
            lat: field("lat").unwrap_or(0.0),
            lon: field("lon").unwrap_or(0.0),
            alt: field("altMSL").or_else(|| field("alt")).unwrap_or(0.0),
            speed_ms: clamp_speed(field("speed").unwrap_or(0.0)),
            track: wrap_track(field("track").unwrap_or(0.0)),
            time_iso: report
                .get("time")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            valid,
            fix_quality,
            num_sats: self.num_sats,
            hdop: self.hdop,
        }
    }

    fn parse_sky(&mut self, report: &Value) {
        if let Some(hdop) = report.get("hdop").and_then(coerce_f64) {
            self.hdop = hdop;
        }
        if let Some(sats) = report.get("satellites").and_then(|s| s.as_array()) {
            self.num_sats = sats
                .iter()
                .filter(|s| s.get("used").and_then(|u| u.as_bool()).unwrap_or(false))
                .count() as u32;
        }
    }
}

impl GpsSource for GpsdSource {
    /// Drain whatever gpsd sent since the last poll and return the newest
    /// fix, if any. Blocks at most one socket timeout.
    fn read_fix(&mut self) -> Option<GpsFix> {
        if !self.alive {
            return None;
        }
        let mut newest = None;
        loop {
            match self.reader.poll_line() {
                LineEvent::Line(line) => {
                    if let Some(fix) = self.parse_report(&line) {
                        newest = Some(fix);
                    }
                }
                LineEvent::Timeout => break,
                LineEvent::Closed | LineEvent::Failed => {
                    warn!("gpsd connection lost");
                    self.alive = false;
                    break;
                }
            }
            if newest.is_some() {
                // Return promptly once a fix is in hand; the rest of the
                // backlog is picked up next poll.
                break;
            }
        }
        if let Some(fix) = &newest {
            debug!(
                "gpsd fix: valid={} lat={:.6} lon={:.6}",
                fix.valid, fix.lat, fix.lon
            );
        }
        newest
    }
}

//! The fusion engine: three cooperating loops at different rates.
//!
//! - IMU loop (`imu_rate_hz`, default 100): poll the calibrated IMU
//!   source, advance the AHRS.
//! - GPS loop: poll the GPS source (blocking reads are fine, it owns its
//!   thread), newest fix wins.
//! - Emit loop (`output_rate_hz`, default 5): snapshot fix + yaw, build
//!   NMEA, broadcast.
//!
//! A slow NMEA client can never delay the AHRS update: the emit loop only
//! enqueues into per-client queues, and the IMU loop shares nothing with
//! the network side except the mutex-guarded filter state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use nalgebra::Vector3;
use navit_fusion::Ahrs;

use crate::nmea;
use crate::output_server::NmeaServer;
use crate::sources::{GpsSource, ImuSource};
use crate::types::GpsFix;

/// How often the GPS source is polled for a new fix.
const GPS_POLL_HZ: f64 = 5.0;

/// Fixed-rate loop pacing: each tick is scheduled at `last + period`.
/// When the loop falls behind it skips sleeping instead of bunching up
/// ticks, so samples are never reordered and the schedule resynchronises.
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(rate_hz: f64) -> Self {
        let period = if rate_hz.is_finite() && rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / rate_hz)
        } else {
            Duration::from_secs(1)
        };
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Sleep until the next tick is due, then schedule the following one.
    pub fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
            self.next += self.period;
        } else {
            // behind schedule: run immediately, resync
            self.next = now + self.period;
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Everything the three loops share.
pub struct Engine {
    pub imu_source: Box<dyn ImuSource>,
    pub gps_source: Box<dyn GpsSource>,
    pub ahrs: Arc<Mutex<Ahrs>>,
    pub last_fix: Arc<Mutex<Option<GpsFix>>>,
    pub server: Arc<NmeaServer>,
    pub imu_rate_hz: f64,
    pub output_rate_hz: f64,
    pub shutdown: Arc<AtomicBool>,
}

impl Engine {
    /// Run until the shutdown flag is set. Spawns the IMU and GPS threads
    /// and drives the emit loop on the calling thread.
    pub fn run(self) {
        let Engine {
            mut imu_source,
            mut gps_source,
            ahrs,
            last_fix,
            server,
            imu_rate_hz,
            output_rate_hz,
            shutdown,
        } = self;

        let imu_dt = (1.0 / imu_rate_hz.max(f64::MIN_POSITIVE)) as f32;
        let imu_shutdown = Arc::clone(&shutdown);
        let imu_ahrs = Arc::clone(&ahrs);
        let imu_thread = std::thread::spawn(move || {
            let mut ticker = Ticker::new(imu_rate_hz);
            debug!("IMU loop period {:?}", ticker.period());
            while !imu_shutdown.load(Ordering::Relaxed) {
                ticker.wait();
                if let Some(sample) = imu_source.read_imu() {
                    let gyro = Vector3::new(
                        sample.gyro.x as f32,
                        sample.gyro.y as f32,
                        sample.gyro.z as f32,
                    );
                    let accel = Vector3::new(
                        sample.accel.x as f32,
                        sample.accel.y as f32,
                        sample.accel.z as f32,
                    );
                    let magnetometer = sample
                        .magnetometer
                        .map(|m| Vector3::new(m.x as f32, m.y as f32, m.z as f32));
                    if let Ok(mut filter) = imu_ahrs.lock() {
                        filter.update(gyro, accel, magnetometer, imu_dt);
                    }
                }
            }
            debug!("IMU loop stopped");
        });

        let gps_shutdown = Arc::clone(&shutdown);
        let gps_fix = Arc::clone(&last_fix);
        let gps_thread = std::thread::spawn(move || {
            // GPS reports arrive at ~1 Hz; poll a bit faster so a fresh
            // fix never waits long. Blocking sources add their own (socket
            // timeout bounded) delay on top.
            let mut ticker = Ticker::new(GPS_POLL_HZ);
            while !gps_shutdown.load(Ordering::Relaxed) {
                ticker.wait();
                if let Some(fix) = gps_source.read_fix() {
                    if let Ok(mut guard) = gps_fix.lock() {
                        *guard = Some(fix);
                    }
                }
            }
            debug!("GPS loop stopped");
        });

        info!("Entering emit loop at {:.1} Hz", output_rate_hz);
        let mut ticker = Ticker::new(output_rate_hz);
        while !shutdown.load(Ordering::Relaxed) {
            ticker.wait();
            let fix = last_fix.lock().ok().and_then(|g| g.clone());
            let yaw = ahrs
                .lock()
                .ok()
                .filter(|f| f.initialized())
                .map(|f| f.yaw_deg() as f64);
            if let Some((gga, rmc)) = nmea::fix_to_sentences(fix.as_ref(), yaw) {
                server.broadcast(&gga);
                server.broadcast(&rmc);
            }
        }

        let _ = imu_thread.join();
        let _ = gps_thread.join();
        info!("Fusion engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_period_from_rate() {
        assert_eq!(Ticker::new(100.0).period(), Duration::from_millis(10));
        assert_eq!(Ticker::new(5.0).period(), Duration::from_millis(200));
        // degenerate rates fall back to 1 Hz instead of dividing by zero
        assert_eq!(Ticker::new(0.0).period(), Duration::from_secs(1));
        assert_eq!(Ticker::new(f64::NAN).period(), Duration::from_secs(1));
    }

    #[test]
    fn ticker_resyncs_when_behind() {
        let mut ticker = Ticker::new(1000.0);
        // Miss several ticks, then verify the next wait doesn't try to
        // replay them all at once.
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        ticker.wait();
        ticker.wait();
        // one immediate tick plus roughly one period of sleep, not a
        // replay of every missed tick
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn ticker_paces_when_on_schedule() {
        let mut ticker = Ticker::new(100.0);
        let start = Instant::now();
        ticker.wait();
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}

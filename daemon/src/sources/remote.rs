//! Remote data source: TCP server accepting newline-delimited JSON from
//! Android/iOS or other clients (default port 2949).
//!
//! A line may carry IMU fields, GPS fields, or both:
//! `{"accel":[x,y,z],"gyro":[x,y,z],"magnetometer":[x,y,z],
//!   "lat":f,"lon":f,"alt":f,"speed_ms":f,"track":f,"time_iso":"..."}`
//!
//! The schema is weakly typed: numeric strings are accepted, malformed
//! fields are skipped, malformed lines are dropped whole. Nothing a client
//! sends can take the server down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, warn};
use serde_json::Value;

use crate::net::{bind_listener, LineEvent, LineReader, ACCEPT_POLL};
use crate::nmea::wrap_track;
use crate::types::{clamp_speed, coerce_f64, coerce_triple, GpsFix, ImuSample, Vec3};

/// Latest state received from remote clients. The magnetometer persists
/// across IMU-only updates until a client sends a new one.
#[derive(Debug, Default)]
struct Latest {
    accel: Option<Vec3>,
    gyro: Option<Vec3>,
    magnetometer: Option<Vec3>,
    fix: Option<GpsFix>,
}

/// Apply one wire line to the latest-known state. Pure so the parsing
/// rules are testable without sockets.
fn apply_line(latest: &mut Latest, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let Some(obj) = value.as_object() else {
        return;
    };

    if let (Some(accel_raw), Some(gyro_raw)) = (obj.get("accel"), obj.get("gyro")) {
        // Both vectors must coerce or the whole IMU update is discarded.
        if let (Some(accel), Some(gyro)) = (coerce_triple(accel_raw), coerce_triple(gyro_raw)) {
            latest.accel = Some(accel);
            latest.gyro = Some(gyro);
            if let Some(mag) = obj.get("magnetometer").and_then(coerce_triple) {
                latest.magnetometer = Some(mag);
            }
        }
    }

    if let (Some(lat_raw), Some(lon_raw)) = (obj.get("lat"), obj.get("lon")) {
        if let (Some(lat), Some(lon)) = (coerce_f64(lat_raw), coerce_f64(lon_raw)) {
            let field = |key: &str| obj.get(key).and_then(coerce_f64).unwrap_or(0.0);
            latest.fix = Some(GpsFix {
                lat,
                lon,
                alt: field("alt"),
                speed_ms: clamp_speed(field("speed_ms")),
                track: wrap_track(field("track")),
                time_iso: obj
                    .get("time_iso")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                valid: true,
                fix_quality: 1,
                num_sats: 0,
                hdop: 1.0,
            });
        }
    }
}

/// TCP server holding the latest remote IMU and GPS state. One instance
/// serves both the IMU and the GPS loop through cheap handles.
pub struct RemoteSource {
    latest: Arc<Mutex<Latest>>,
    local_addr: SocketAddr,
    acceptor: Option<JoinHandle<()>>,
}

impl RemoteSource {
    /// Bind and start accepting clients.
    pub fn start(
        host: &str,
        port: u16,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<RemoteSource> {
        let listener = bind_listener(host, port)?;
        let local_addr = listener.local_addr()?;
        info!(
            "Remote source listening on {} (Android/iOS clients)",
            local_addr
        );

        let latest = Arc::new(Mutex::new(Latest::default()));
        let latest_for_acceptor = Arc::clone(&latest);
        let acceptor = std::thread::spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        info!("Remote client connected from {}", peer);
                        let latest = Arc::clone(&latest_for_acceptor);
                        let shutdown = Arc::clone(&shutdown);
                        std::thread::spawn(move || {
                            serve_client(stream, peer, latest, shutdown);
                        });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("Remote accept error: {}", e);
                        std::thread::sleep(ACCEPT_POLL);
                    }
                }
            }
        });

        Ok(RemoteSource {
            latest,
            local_addr,
            acceptor: Some(acceptor),
        })
    }

    #[allow(dead_code)] // exercised by tests
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// IMU-side view of the shared state.
    pub fn imu_source(&self) -> RemoteImuSource {
        RemoteImuSource {
            latest: Arc::clone(&self.latest),
        }
    }

    /// GPS-side view of the shared state.
    pub fn gps_source(&self) -> RemoteGpsSource {
        RemoteGpsSource {
            latest: Arc::clone(&self.latest),
        }
    }

    /// Wait for the acceptor to notice shutdown and exit.
    pub fn join(&mut self) {
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
    }
}

fn serve_client(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    latest: Arc<Mutex<Latest>>,
    shutdown: Arc<AtomicBool>,
) {
    let Ok(mut reader) = LineReader::new(stream) else {
        return;
    };
    while !shutdown.load(Ordering::Relaxed) {
        match reader.poll_line() {
            LineEvent::Line(line) => {
                if let Ok(mut guard) = latest.lock() {
                    apply_line(&mut guard, &line);
                }
            }
            LineEvent::Timeout => continue,
            LineEvent::Closed | LineEvent::Failed => break,
        }
    }
    debug!("Remote client {} disconnected", peer);
}

/// IMU handle over the remote state.
pub struct RemoteImuSource {
    latest: Arc<Mutex<Latest>>,
}

impl super::ImuSource for RemoteImuSource {
    fn read_imu(&mut self) -> Option<ImuSample> {
        let guard = self.latest.lock().ok()?;
        match (guard.accel, guard.gyro) {
            (Some(accel), Some(gyro)) => Some(ImuSample {
                accel,
                gyro,
                magnetometer: guard.magnetometer,
            }),
            _ => None,
        }
    }
}

/// GPS handle over the remote state.
pub struct RemoteGpsSource {
    latest: Arc<Mutex<Latest>>,
}

impl super::GpsSource for RemoteGpsSource {
    fn read_fix(&mut self) -> Option<GpsFix> {
        self.latest.lock().ok()?.fix.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(lines: &[&str]) -> Latest {
        let mut latest = Latest::default();
        for line in lines {
            apply_line(&mut latest, line);
        }
        latest
    }

    #[test]
    fn imu_update_stores_both_vectors() {
        let latest = parse(&[r#"{"accel":[0.1,0.2,9.8],"gyro":[1,2,3]}"#]);
        assert_eq!(latest.accel, Some(Vec3::new(0.1, 0.2, 9.8)));
        assert_eq!(latest.gyro, Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(latest.magnetometer, None);
        assert!(latest.fix.is_none());
    }

    #[test]
    fn malformed_lines_leave_state_unchanged() {
        let bad = [
            "",
            "not json",
            "0",
            "[]",
            r#"{"accel":[1,2]}"#,
            r#"{"accel":[1,2,"x"],"gyro":[0,0,0]}"#,
            r#"{"accel":[1,2,3]}"#,
            r#"{"gyro":[1,2,3]}"#,
            r#"{"accel":null,"gyro":[0,0,0]}"#,
            "\u{1f4a5}",
        ];
        let latest = parse(&bad);
        assert!(latest.accel.is_none());
        assert!(latest.gyro.is_none());
        assert!(latest.magnetometer.is_none());
        assert!(latest.fix.is_none());
    }

    #[test]
    fn numeric_strings_are_coerced() {
        let latest = parse(&[r#"{"accel":["1","2","3"],"gyro":["0.5",0,0]}"#]);
        assert_eq!(latest.accel, Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(latest.gyro, Some(Vec3::new(0.5, 0.0, 0.0)));
    }

    #[test]
    fn magnetometer_persists_across_imu_only_updates() {
        let latest = parse(&[
            r#"{"accel":[0,0,9.8],"gyro":[0,0,0],"magnetometer":[10,20,30]}"#,
            r#"{"accel":[1,1,9.8],"gyro":[0,0,1]}"#,
        ]);
        assert_eq!(latest.magnetometer, Some(Vec3::new(10.0, 20.0, 30.0)));
        assert_eq!(latest.accel, Some(Vec3::new(1.0, 1.0, 9.8)));
    }

    #[test]
    fn invalid_magnetometer_does_not_block_imu_update() {
        let latest = parse(&[
            r#"{"accel":[0,0,9.8],"gyro":[0,0,0],"magnetometer":[1,2,3]}"#,
            r#"{"accel":[5,5,5],"gyro":[1,1,1],"magnetometer":[1,"x",3]}"#,
        ]);
        assert_eq!(latest.accel, Some(Vec3::new(5.0, 5.0, 5.0)));
        // old magnetometer survives the bad one
        assert_eq!(latest.magnetometer, Some(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn gps_update_with_defaults() {
        let latest = parse(&[r#"{"lat":52.5,"lon":10.25}"#]);
        let fix = latest.fix.unwrap();
        assert_eq!(fix.lat, 52.5);
        assert_eq!(fix.lon, 10.25);
        assert_eq!(fix.alt, 0.0);
        assert_eq!(fix.speed_ms, 0.0);
        assert_eq!(fix.track, 0.0);
        assert_eq!(fix.time_iso, None);
        assert!(fix.valid);
        assert_eq!(fix.fix_quality, 1);
    }

    #[test]
    fn gps_non_numeric_optionals_default_to_zero() {
        let latest = parse(&[
            r#"{"lat":1.0,"lon":2.0,"alt":"x","speed_ms":[],"track":null,"time_iso":42}"#,
        ]);
        let fix = latest.fix.unwrap();
        assert_eq!(fix.alt, 0.0);
        assert_eq!(fix.speed_ms, 0.0);
        assert_eq!(fix.track, 0.0);
        assert_eq!(fix.time_iso, None);
    }

    #[test]
    fn gps_speed_clamped_and_track_wrapped() {
        let latest = parse(&[r#"{"lat":0,"lon":0,"speed_ms":-3.0,"track":-10.0}"#]);
        let fix = latest.fix.unwrap();
        assert_eq!(fix.speed_ms, 0.0);
        assert_eq!(fix.track, 350.0);
    }

    #[test]
    fn gps_requires_both_lat_and_lon() {
        assert!(parse(&[r#"{"lat":1.0}"#]).fix.is_none());
        assert!(parse(&[r#"{"lon":1.0}"#]).fix.is_none());
        assert!(parse(&[r#"{"lat":"x","lon":1.0}"#]).fix.is_none());
    }

    #[test]
    fn combined_line_updates_both() {
        let latest = parse(&[
            r#"{"accel":[0,0,9.8],"gyro":[0,0,0],"lat":48.1,"lon":11.5,"speed_ms":3.5,"track":181.0,"time_iso":"2024-01-01T00:00:00Z"}"#,
        ]);
        assert!(latest.accel.is_some());
        let fix = latest.fix.unwrap();
        assert_eq!(fix.speed_ms, 3.5);
        assert_eq!(fix.track, 181.0);
        assert_eq!(fix.time_iso.as_deref(), Some("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn server_end_to_end() {
        use crate::sources::{GpsSource, ImuSource};
        use std::io::Write;
        use std::sync::atomic::AtomicBool;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut server = RemoteSource::start("127.0.0.1", 0, Arc::clone(&shutdown)).unwrap();
        let addr = server.local_addr();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client
            .write_all(b"{\"accel\":[0,0,9.8],\"gyro\":[1,2,3],\"lat\":52.0,\"lon\":10.0}\n")
            .unwrap();
        client.flush().unwrap();

        let mut imu = server.imu_source();
        let mut gps = server.gps_source();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let (Some(sample), Some(fix)) = (imu.read_imu(), gps.read_fix()) {
                assert_eq!(sample.gyro, Vec3::new(1.0, 2.0, 3.0));
                assert_eq!(fix.lat, 52.0);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no data received");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }

        shutdown.store(true, Ordering::Relaxed);
        server.join();
    }
}

//! navit-daemon: fuse GPS (gpsd) and IMU (IIO or remote clients) through
//! an AHRS filter and serve NMEA with a continuous heading over TCP.

mod calibration;
mod config;
mod control_server;
mod engine;
mod iio;
mod net;
mod nmea;
mod output_server;
mod sources;
mod types;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;
use log::{error, info};
use navit_fusion::{Ahrs, AhrsError};
use thiserror::Error;

use crate::calibration::{load_calibration, CalibrationManager};
use crate::config::{Config, SourceMode};
use crate::control_server::ControlServer;
use crate::engine::Engine;
use crate::output_server::NmeaServer;
use crate::sources::{CalibratedImuSource, GpsSource, ImuSource};

/// Fuse GPS (gpsd) and IMU (IIO) for Navit; output NMEA with heading.
#[derive(Parser, Debug)]
#[command(name = "navit-daemon", version, about)]
struct Args {
    /// Source: linux (IIO+gpsd), remote (TCP), auto
    #[arg(long, value_enum, default_value_t = SourceMode::Linux)]
    source: SourceMode,
    /// gpsd host
    #[arg(long, default_value = "127.0.0.1")]
    gpsd_host: String,
    /// gpsd port
    #[arg(long, default_value_t = 2947)]
    gpsd_port: u16,
    /// Bind address for the remote source
    #[arg(long, default_value = "0.0.0.0")]
    remote_host: String,
    /// Port for the remote source
    #[arg(long, default_value_t = 2949)]
    remote_port: u16,
    /// Bind address for the NMEA TCP server
    #[arg(long, default_value = "127.0.0.1")]
    nmea_bind: String,
    /// Port for the NMEA TCP server
    #[arg(long, default_value_t = 2948)]
    nmea_port: u16,
    /// IMU sample rate in Hz
    #[arg(long = "imu-rate", default_value_t = 100.0)]
    imu_rate_hz: f64,
    /// NMEA output rate in Hz
    #[arg(long = "output-rate", default_value_t = 5.0)]
    output_rate_hz: f64,
    /// AHRS fusion gain (0-1)
    #[arg(long, default_value_t = 0.5)]
    fusion_gain: f64,
    /// IIO sysfs path for the accelerometer
    #[arg(long)]
    accel_path: Option<String>,
    /// IIO sysfs path for the gyroscope
    #[arg(long)]
    gyro_path: Option<String>,
    /// IIO sysfs path for the magnetometer
    #[arg(long)]
    magnetometer_path: Option<String>,
    /// Load/save calibration from this JSON file
    #[arg(long)]
    calibration_file: Option<String>,
    /// TCP port for the calibration API (0 = disabled)
    #[arg(long, default_value_t = 0)]
    calibration_port: u16,
    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Config {
            source: args.source,
            gpsd_host: args.gpsd_host,
            gpsd_port: args.gpsd_port,
            remote_host: args.remote_host,
            remote_port: args.remote_port,
            nmea_bind: args.nmea_bind,
            nmea_port: args.nmea_port,
            imu_rate_hz: args.imu_rate_hz,
            output_rate_hz: args.output_rate_hz,
            fusion_gain: args.fusion_gain,
            accel_path: args.accel_path,
            gyro_path: args.gyro_path,
            magnetometer_path: args.magnetometer_path,
            calibration_file: args.calibration_file,
            calibration_port: args.calibration_port,
            debug: args.debug,
        }
    }
}

/// Fatal startup failures; anything past startup is handled locally.
#[derive(Debug, Error)]
enum StartError {
    #[error("IIO accel or gyro not found; use --source=remote for Android/iOS")]
    NoLinuxSource,
    #[error("auto source: no Linux IIO and remote bind failed: {0}")]
    NoSource(std::io::Error),
    #[error("remote source bind failed: {0}")]
    RemoteBind(std::io::Error),
    #[error("NMEA server bind failed: {0}")]
    NmeaBind(std::io::Error),
    #[error("calibration API bind failed: {0}")]
    CalibrationBind(std::io::Error),
    #[error("AHRS init failed: {0}")]
    Ahrs(#[from] AhrsError),
}

fn main() {
    let config: Config = Args::parse().into();

    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        error!("Failed to install signal handler: {}", e);
        std::process::exit(1);
    }

    match run(config, shutdown) {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Wire everything together and run the engine until shutdown.
fn run(config: Config, shutdown: Arc<AtomicBool>) -> Result<(), StartError> {
    let mut remote = None;
    let (imu_source, gps_source): (Box<dyn ImuSource>, Box<dyn GpsSource>) = match config.source {
        SourceMode::Linux => sources::create_linux_sources(&config)
            .ok_or(StartError::NoLinuxSource)?,
        SourceMode::Remote => {
            let server = sources::create_remote_source(
                &config.remote_host,
                config.remote_port,
                Arc::clone(&shutdown),
            )
            .map_err(StartError::RemoteBind)?;
            let pair = (
                Box::new(server.imu_source()) as Box<dyn ImuSource>,
                Box::new(server.gps_source()) as Box<dyn GpsSource>,
            );
            remote = Some(server);
            pair
        }
        SourceMode::Auto => match sources::create_linux_sources(&config) {
            Some(pair) => {
                info!("Using Linux source (IIO + gpsd)");
                pair
            }
            None => {
                let server = sources::create_remote_source(
                    &config.remote_host,
                    config.remote_port,
                    Arc::clone(&shutdown),
                )
                .map_err(StartError::NoSource)?;
                info!("Using remote source (waiting for Android/iOS client)");
                let pair = (
                    Box::new(server.imu_source()) as Box<dyn ImuSource>,
                    Box::new(server.gps_source()) as Box<dyn GpsSource>,
                );
                remote = Some(server);
                pair
            }
        },
    };

    let calibration_path = config.calibration_file.as_ref().map(PathBuf::from);
    let calibration = load_calibration(calibration_path.as_deref());
    let manager = Arc::new(CalibrationManager::new(
        calibration,
        calibration_path,
        config.imu_rate_hz,
    ));
    let imu_source: Box<dyn ImuSource> = Box::new(CalibratedImuSource::new(
        imu_source,
        Arc::clone(&manager),
    ));

    let mut control = None;
    if config.calibration_port > 0 {
        control = Some(
            ControlServer::start(
                "127.0.0.1",
                config.calibration_port,
                Arc::clone(&manager),
                Arc::clone(&shutdown),
            )
            .map_err(StartError::CalibrationBind)?,
        );
    }

    let sample_period = (1.0 / config.imu_rate_hz.max(f64::MIN_POSITIVE)) as f32;
    let ahrs = Ahrs::new(sample_period, config.fusion_gain as f32)?;

    let server = Arc::new(
        NmeaServer::start(&config.nmea_bind, config.nmea_port, Arc::clone(&shutdown))
            .map_err(StartError::NmeaBind)?,
    );

    let engine = Engine {
        imu_source,
        gps_source,
        ahrs: Arc::new(Mutex::new(ahrs)),
        last_fix: Arc::new(Mutex::new(None)),
        server: Arc::clone(&server),
        imu_rate_hz: config.imu_rate_hz,
        output_rate_hz: config.output_rate_hz,
        shutdown: Arc::clone(&shutdown),
    };
    engine.run();

    // Engine only returns on shutdown; wind the rest down in order.
    manager.abandon_run();
    if let Some(mut server) = remote {
        server.join();
    }
    if let Some(mut server) = control {
        server.join();
    }
    if let Ok(mut server) = Arc::try_unwrap(server) {
        server.join();
    }
    Ok(())
}

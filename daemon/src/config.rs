//! Runtime configuration consumed by the core.

use clap::ValueEnum;

/// Where IMU and GPS samples come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SourceMode {
    /// Linux hardware: IIO sysfs for the IMU, gpsd for position.
    #[default]
    Linux,
    /// TCP server fed by Android/iOS clients.
    Remote,
    /// Try linux first, fall back to remote.
    Auto,
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SourceMode::Linux => "linux",
            SourceMode::Remote => "remote",
            SourceMode::Auto => "auto",
        };
        f.write_str(name)
    }
}

/// Runtime configuration. Defaults match the CLI defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceMode,
    pub gpsd_host: String,
    pub gpsd_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub nmea_bind: String,
    pub nmea_port: u16,
    pub imu_rate_hz: f64,
    pub output_rate_hz: f64,
    pub fusion_gain: f64,
    pub accel_path: Option<String>,
    pub gyro_path: Option<String>,
    pub magnetometer_path: Option<String>,
    pub calibration_file: Option<String>,
    /// 0 disables the calibration API server.
    pub calibration_port: u16,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceMode::Linux,
            gpsd_host: "127.0.0.1".into(),
            gpsd_port: 2947,
            remote_host: "0.0.0.0".into(),
            remote_port: 2949,
            nmea_bind: "127.0.0.1".into(),
            nmea_port: 2948,
            imu_rate_hz: 100.0,
            output_rate_hz: 5.0,
            fusion_gain: 0.5,
            accel_path: None,
            gyro_path: None,
            magnetometer_path: None,
            calibration_file: None,
            calibration_port: 0,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_ports() {
        let config = Config::default();
        assert_eq!(config.gpsd_port, 2947);
        assert_eq!(config.nmea_port, 2948);
        assert_eq!(config.remote_port, 2949);
        assert_eq!(config.calibration_port, 0);
        assert_eq!(config.source, SourceMode::Linux);
        assert_eq!(config.imu_rate_hz, 100.0);
        assert_eq!(config.output_rate_hz, 5.0);
    }
}

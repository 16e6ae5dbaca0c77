//! Build NMEA 0183 sentences (GGA, RMC) for Navit/gpsd consumers.

use crate::types::GpsFix;

/// m/s to knots.
const MS_TO_KNOTS: f64 = 1.943844;

/// Above this ground speed GPS course over ground is trusted for heading.
const TRACK_SPEED_THRESHOLD_MS: f64 = 0.5;

/// NMEA checksum: XOR of all payload bytes (between `$` and `*`), as two
/// uppercase hex digits.
fn checksum(payload: &str) -> String {
    let c = payload.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{c:02X}")
}

/// Wrap a track angle into `[0, 360)` at one-decimal precision, so the
/// formatted field can never read `360.0`. Non-finite input maps to 0.
pub fn wrap_track(track_deg: f64) -> f64 {
    if !track_deg.is_finite() {
        return 0.0;
    }
    let wrapped = (track_deg.rem_euclid(360.0) * 10.0).round() / 10.0;
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Latitude as `ddmm.mmmm,N|S`.
fn lat_field(lat: f64) -> String {
    let abs = lat.abs();
    let deg = abs.trunc();
    let minutes = (abs - deg) * 60.0;
    let hem = if lat >= 0.0 { 'N' } else { 'S' };
    format!("{:02}{:07.4},{}", deg as i64, minutes, hem)
}

/// Longitude as `dddmm.mmmm,E|W`.
fn lon_field(lon: f64) -> String {
    let abs = lon.abs();
    let deg = abs.trunc();
    let minutes = (abs - deg) * 60.0;
    let hem = if lon >= 0.0 { 'E' } else { 'W' };
    format!("{:03}{:07.4},{}", deg as i64, minutes, hem)
}

/// `hhmmss.ss` from an ISO-8601 timestamp; `000000.00` when absent or
/// malformed. Inputs are expected to be UTC; offsets are not normalized.
fn time_field(time_iso: Option<&str>) -> String {
    let fallback = String::from("000000.00");
    let Some(iso) = time_iso else { return fallback };
    let Some((_, clock)) = iso.split_once('T') else {
        return fallback;
    };
    let clock = clock.split('.').next().unwrap_or("");
    let digits: String = clock.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() >= 6 {
        format!("{}.00", &digits[..6])
    } else {
        fallback
    }
}

/// `ddmmyy` from the date part of an ISO-8601 timestamp; `010100` when
/// absent or malformed.
fn date_field(time_iso: Option<&str>) -> String {
    let fallback = String::from("010100");
    let Some(iso) = time_iso else { return fallback };
    let Some((date, _)) = iso.split_once('T') else {
        return fallback;
    };
    let digits: String = date.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 8 {
        // YYYYMMDD -> ddmmyy
        format!("{}{}{}", &digits[6..8], &digits[4..6], &digits[2..4])
    } else {
        fallback
    }
}

fn wrap_sentence(payload: String) -> String {
    let ck = checksum(&payload);
    format!("${payload}*{ck}\r\n")
}

/// Build a GGA sentence (position, altitude, fix quality) from a fix.
///
/// Never panics, whatever the numeric fields hold; extreme values are
/// formatted as-is.
pub fn build_gga(fix: &GpsFix) -> String {
    let payload = format!(
        "GPGGA,{},{},{},{},{:02},{:.1},{:.1},M,,,,",
        time_field(fix.time_iso.as_deref()),
        lat_field(fix.lat),
        lon_field(fix.lon),
        fix.fix_quality,
        fix.num_sats,
        fix.hdop,
        fix.alt,
    );
    wrap_sentence(payload)
}

/// Build an RMC sentence (position, speed, track, date) from a fix and the
/// selected heading. Speed is converted to knots, the track wrapped into
/// `[0, 360)`.
pub fn build_rmc(fix: &GpsFix, track_deg: f64) -> String {
    let status = if fix.valid { 'A' } else { 'V' };
    let speed_knots = fix.speed_ms * MS_TO_KNOTS;
    let speed_knots = if speed_knots.is_finite() {
        speed_knots
    } else {
        0.0
    };
    let payload = format!(
        "GPRMC,{},{},{},{},{:.1},{:.1},{},,,",
        time_field(fix.time_iso.as_deref()),
        status,
        lat_field(fix.lat),
        lon_field(fix.lon),
        speed_knots,
        wrap_track(track_deg),
        date_field(fix.time_iso.as_deref()),
    );
    wrap_sentence(payload)
}

/// Pick the heading for the RMC track field.
///
/// Moving faster than the threshold the GPS course is reliable and wins.
/// Otherwise the AHRS yaw is used when available, falling back to the GPS
/// track (which may be zero).
pub fn select_heading(fix: &GpsFix, yaw_deg: Option<f64>) -> f64 {
    if fix.speed_ms > TRACK_SPEED_THRESHOLD_MS {
        fix.track
    } else {
        yaw_deg.unwrap_or(fix.track)
    }
}

/// Build the (GGA, RMC) pair for an emit tick, or `None` when there is
/// nothing to say: no fix, invalid fix, or a non-finite position.
pub fn fix_to_sentences(fix: Option<&GpsFix>, yaw_deg: Option<f64>) -> Option<(String, String)> {
    let fix = fix?;
    if !fix.valid || !fix.lat.is_finite() || !fix.lon.is_finite() {
        return None;
    }
    let heading = select_heading(fix, yaw_deg);
    Some((build_gga(fix), build_rmc(fix, heading)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> GpsFix {
        GpsFix {
            valid: true,
            fix_quality: 1,
            ..GpsFix::default()
        }
    }

    fn verify_framing(s: &str) {
        assert!(s.starts_with('$'));
        assert!(s.ends_with("\r\n"));
        assert_eq!(s.matches('*').count(), 1);
        let inner = &s[1..s.len() - 2];
        let (payload, ck) = inner.split_once('*').unwrap();
        assert_eq!(checksum(payload), ck);
    }

    #[test]
    fn gga_equator_exact() {
        let f = GpsFix {
            time_iso: Some("2024-01-01T12:00:00Z".into()),
            valid: true,
            fix_quality: 1,
            num_sats: 5,
            hdop: 1.0,
            ..GpsFix::default()
        };
        let s = build_gga(&f);
        verify_framing(&s);
        assert!(s.starts_with("$GPGGA,120000.00,0000.0000,N,00000.0000,E,1,05,1.0,0.0,M,,,,*"));
    }

    #[test]
    fn gga_southwest_hemispheres() {
        let mut f = fix();
        f.lat = -33.8688;
        f.lon = 151.2093;
        let s = build_gga(&f);
        assert!(s.contains(",S,"));
        assert!(s.contains(",E,"));

        f.lon = -70.6693;
        let s = build_gga(&f);
        assert!(s.contains(",S,"));
        assert!(s.contains(",W,"));
    }

    #[test]
    fn gga_degree_minute_conversion() {
        let mut f = fix();
        f.lat = 52.5;
        f.lon = 10.0;
        f.alt = 100.5;
        f.fix_quality = 2;
        f.num_sats = 8;
        f.hdop = 0.9;
        let s = build_gga(&f);
        assert!(s.contains("5230.0000,N"));
        assert!(s.contains("01000.0000,E"));
        assert!(s.contains(",2,08,0.9,100.5,M"));
    }

    #[test]
    fn gga_time_fallbacks() {
        let mut f = fix();
        f.time_iso = Some("not-iso".into());
        assert!(build_gga(&f).contains("000000.00"));
        f.time_iso = None;
        assert!(build_gga(&f).contains("000000.00"));
        f.time_iso = Some("2024-06-15T12:34:56.789Z".into());
        assert!(build_gga(&f).contains("123456.00"));
    }

    #[test]
    fn gga_extreme_inputs_do_not_panic() {
        for (lat, lon, alt) in [
            (91.0, 181.0, 1e18),
            (-90.0, -180.0, -1e18),
            (f64::NAN, f64::INFINITY, f64::NEG_INFINITY),
            (1e308, -1e308, 0.0),
        ] {
            let mut f = fix();
            f.lat = lat;
            f.lon = lon;
            f.alt = alt;
            verify_framing(&build_gga(&f));
        }
    }

    #[test]
    fn rmc_basic() {
        let mut f = fix();
        f.lat = 52.0;
        f.lon = 10.0;
        f.speed_ms = 5.0;
        f.time_iso = Some("2024-06-15T12:00:00Z".into());
        let s = build_rmc(&f, 90.0);
        verify_framing(&s);
        assert!(s.contains(",A,"));
        assert!(s.contains("5200.0000,N"));
        assert!(s.contains("01000.0000,E"));
        // 5 m/s = 9.7 knots
        assert!(s.contains(",9.7,"));
        assert!(s.contains(",90.0,"));
        assert!(s.contains(",150624,"));
    }

    #[test]
    fn rmc_invalid_fix_status_v() {
        let mut f = fix();
        f.valid = false;
        assert!(build_rmc(&f, 0.0).contains(",V,"));
    }

    #[test]
    fn rmc_date_fallback() {
        let f = fix();
        assert!(build_rmc(&f, 0.0).contains(",010100,"));
    }

    #[test]
    fn rmc_track_wraparound() {
        let f = fix();
        assert!(build_rmc(&f, -10.0).contains(",350.0,"));
        assert!(build_rmc(&f, 370.0).contains(",10.0,"));
        assert!(build_rmc(&f, 360.0).contains(",0.0,"));
        assert!(build_rmc(&f, 359.99).contains(",0.0,"));
        assert!(build_rmc(&f, f64::NAN).contains(",0.0,"));
    }

    #[test]
    fn wrap_track_range() {
        for t in [-720.5, -10.0, 0.0, 359.94, 360.0, 1234.5, f64::INFINITY] {
            let w = wrap_track(t);
            assert!((0.0..360.0).contains(&w), "{t} wrapped to {w}");
        }
    }

    #[test]
    fn heading_selection_by_speed() {
        let mut f = fix();
        f.track = 45.0;

        // stationary: AHRS yaw wins
        f.speed_ms = 0.1;
        assert_eq!(select_heading(&f, Some(137.0)), 137.0);
        // moving: GPS course wins
        f.speed_ms = 2.0;
        assert_eq!(select_heading(&f, Some(137.0)), 45.0);
        // stationary without AHRS: GPS track fallback
        f.speed_ms = 0.0;
        assert_eq!(select_heading(&f, None), 45.0);
    }

    #[test]
    fn sentences_skipped_without_usable_fix() {
        assert!(fix_to_sentences(None, Some(0.0)).is_none());

        let mut f = fix();
        f.valid = false;
        assert!(fix_to_sentences(Some(&f), Some(0.0)).is_none());

        let mut f = fix();
        f.lat = f64::NAN;
        assert!(fix_to_sentences(Some(&f), Some(0.0)).is_none());
    }

    #[test]
    fn sentences_for_valid_fix() {
        let mut f = fix();
        f.speed_ms = 0.1;
        f.track = 45.0;
        let (gga, rmc) = fix_to_sentences(Some(&f), Some(137.0)).unwrap();
        assert!(gga.starts_with("$GPGGA"));
        assert!(rmc.starts_with("$GPRMC"));
        assert!(rmc.contains(",137.0,"));
    }
}

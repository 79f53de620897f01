//! Pure, deterministic derived-quantity computations. No I/O, no shared
//! state — these are called once per reading by a driver's
//! `compute_derived` step and are exercised directly by property tests.

use chrono::{DateTime, Datelike, Timelike, Utc};
use std::f64::consts::PI;

/// NWS wind chill. Below 3 mph or above 50°F the wind has no
/// meaningful cooling effect, so the raw temperature passes through.
pub fn wind_chill(temp_f: f64, wind_mph: f64) -> f64 {
    if temp_f > 50.0 || wind_mph < 3.0 {
        return temp_f;
    }
    let v016 = wind_mph.powf(0.16);
    35.74 + 0.6215 * temp_f - 35.75 * v016 + 0.4275 * temp_f * v016
}

/// NWS heat index: Steadman's simple form below 80°F apparent
/// temperature, the Rothfusz regression above it, with the two
/// humidity-range adjustments. Never returns less than `temp_f`.
pub fn heat_index(temp_f: f64, rh_pct: f64) -> f64 {
    if temp_f < 77.0 {
        return temp_f;
    }

    let t = temp_f;
    let rh = rh_pct;

    let simple = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);
    if simple < 80.0 {
        return simple.max(t);
    }

    let mut hi = -42.379 + 2.04901523 * t + 10.14333127 * rh
        - 0.22475541 * t * rh
        - 0.00683783 * t * t
        - 0.05481717 * rh * rh
        + 0.00122874 * t * t * rh
        + 0.00085282 * t * rh * rh
        - 0.00000199 * t * t * rh * rh;

    if rh < 13.0 && (80.0..=112.0).contains(&t) {
        hi -= ((13.0 - rh) / 4.0) * ((17.0 - (t - 95.0).abs()) / 17.0).sqrt();
    } else if rh > 80.0 && (80.0..=87.0).contains(&t) {
        hi += ((rh - 85.0) / 10.0) * ((87.0 - t) / 5.0);
    }

    hi.max(t)
}

/// EPA breakpoint: `(c_low, c_high, i_low, i_high)`.
struct Breakpoint {
    c_low: f64,
    c_high: f64,
    i_low: f64,
    i_high: f64,
}

const PM25_BREAKPOINTS: &[Breakpoint] = &[
    Breakpoint { c_low: 0.0, c_high: 12.0, i_low: 0.0, i_high: 50.0 },
    Breakpoint { c_low: 12.1, c_high: 35.4, i_low: 51.0, i_high: 100.0 },
    Breakpoint { c_low: 35.5, c_high: 55.4, i_low: 101.0, i_high: 150.0 },
    Breakpoint { c_low: 55.5, c_high: 150.4, i_low: 151.0, i_high: 200.0 },
    Breakpoint { c_low: 150.5, c_high: 250.4, i_low: 201.0, i_high: 300.0 },
    Breakpoint { c_low: 250.5, c_high: 350.4, i_low: 301.0, i_high: 400.0 },
    Breakpoint { c_low: 350.5, c_high: 500.4, i_low: 401.0, i_high: 500.0 },
];

const PM10_BREAKPOINTS: &[Breakpoint] = &[
    Breakpoint { c_low: 0.0, c_high: 54.0, i_low: 0.0, i_high: 50.0 },
    Breakpoint { c_low: 55.0, c_high: 154.0, i_low: 51.0, i_high: 100.0 },
    Breakpoint { c_low: 155.0, c_high: 254.0, i_low: 101.0, i_high: 150.0 },
    Breakpoint { c_low: 255.0, c_high: 354.0, i_low: 151.0, i_high: 200.0 },
    Breakpoint { c_low: 355.0, c_high: 424.0, i_low: 201.0, i_high: 300.0 },
    Breakpoint { c_low: 425.0, c_high: 504.0, i_low: 301.0, i_high: 400.0 },
    Breakpoint { c_low: 505.0, c_high: 604.0, i_low: 401.0, i_high: 500.0 },
];

fn aqi_from_breakpoints(concentration: f64, table: &[Breakpoint]) -> u32 {
    if concentration < 0.0 {
        return 0;
    }
    for bp in table {
        if concentration <= bp.c_high {
            let aqi = (bp.i_high - bp.i_low) / (bp.c_high - bp.c_low) * (concentration - bp.c_low)
                + bp.i_low;
            return aqi.round() as u32;
        }
    }
    500
}

/// EPA AQI for PM2.5 (µg/m³, 24-hr average), piecewise-linear between
/// breakpoints. Clamps to 500 above the top breakpoint, 0 for negative
/// input.
pub fn aqi_pm25(ug_m3: f64) -> u32 {
    aqi_from_breakpoints(ug_m3, PM25_BREAKPOINTS)
}

/// EPA AQI for PM10 (µg/m³, 24-hr average). Same contract as
/// [`aqi_pm25`].
pub fn aqi_pm10(ug_m3: f64) -> u32 {
    aqi_from_breakpoints(ug_m3, PM10_BREAKPOINTS)
}

const DEG: f64 = PI / 180.0;
const SOLAR_CONSTANT_W_M2: f64 = 1367.0;

/// Meridian longitude (degrees) for each whole-hour UTC offset from
/// -12 to +12, used instead of re-deriving the standard meridian from
/// longitude directly — the site's configured time zone decides which
/// meridian applies, not raw geography.
const HOUR_OFFSET_MERIDIANS: [f64; 25] = [
    -180.0, -165.0, -150.0, -135.0, -120.0, -105.0, -90.0, -75.0, -60.0, -45.0, -30.0, -15.0, 0.0,
    15.0, 30.0, 45.0, 60.0, 75.0, 90.0, 105.0, 120.0, 135.0, 150.0, 165.0, 180.0,
];

fn standard_meridian_for(lon_deg: f64) -> f64 {
    let offset = (lon_deg / 15.0).round().clamp(-12.0, 12.0) as i32;
    HOUR_OFFSET_MERIDIANS[(offset + 12) as usize]
}

/// ASCE-EWRI reference clear-sky solar radiation model. Returns 0 when
/// the sun is below the horizon.
///
/// * `time` — UTC instant of the estimate.
/// * `lat_deg`, `lon_deg` — site coordinates.
/// * `alt_m` — site altitude, meters.
/// * `temp_f`, `rh_pct` — ambient conditions, used for the vapour
///   pressure / precipitable-water terms.
pub fn clear_sky_irradiance(
    time: DateTime<Utc>,
    lat_deg: f64,
    lon_deg: f64,
    alt_m: f64,
    temp_f: f64,
    rh_pct: f64,
) -> f64 {
    let doy = time.ordinal() as f64;
    let hour_decimal =
        time.hour() as f64 + time.minute() as f64 / 60.0 + time.second() as f64 / 3600.0;

    // Earth-Sun distance factor (inverse relative distance).
    let dr = 1.0 + 0.033 * (2.0 * PI * doy / 365.0).cos();

    // Solar declination (Spencer 1971).
    let decl = 0.409 * (2.0 * PI * doy / 365.0 - 1.39).sin();

    // Seasonal correction for solar time (minutes), ASCE eq. 25.
    let b = 2.0 * PI * (doy - 81.0) / 364.0;
    let sc_min = 0.1645 * (2.0 * b).sin() - 0.1255 * b.cos() - 0.025 * b.sin();

    let lz = standard_meridian_for(lon_deg);
    let lm = lon_deg;
    let standard_time = hour_decimal + lz / 15.0;
    let solar_time = standard_time + (4.0 * (lm - lz) + sc_min * 60.0) / 3600.0;
    let omega = (PI / 12.0) * (solar_time - 12.0);

    let lat = lat_deg * DEG;
    let sin_elevation = lat.sin() * decl.sin() + lat.cos() * decl.cos() * omega.cos();
    if sin_elevation <= 0.0 {
        return 0.0;
    }

    // Extraterrestrial radiation on a horizontal surface, instantaneous.
    let ra = SOLAR_CONSTANT_W_M2 * dr * sin_elevation;

    // Atmospheric pressure at altitude (ASCE eq. 34), kPa.
    let p_kpa = 101.3 * ((293.0 - 0.0065 * alt_m) / 293.0).powf(5.26);

    // Saturation and actual vapour pressure (Tetens), kPa.
    let temp_c = (temp_f - 32.0) * 5.0 / 9.0;
    let es_kpa = 0.6108 * (17.27 * temp_c / (temp_c + 237.3)).exp();
    let ea_kpa = es_kpa * (rh_pct / 100.0).clamp(0.0, 1.0);

    // Precipitable water (ASCE eq. 29), mm.
    let w_mm = 0.14 * ea_kpa * p_kpa + 2.1;

    // Clearness coefficient: assume a clean atmosphere (Kt = 1.0).
    let kt = 1.0_f64;
    let kb = 0.98
        * (-0.00146 * p_kpa / (kt * sin_elevation) - 0.075 * (w_mm / sin_elevation).powf(0.4))
            .exp();
    let kd = if kb >= 0.15 {
        0.35 - 0.36 * kb
    } else {
        0.18 + 0.82 * kb
    };

    ((kb + kd) * ra).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wind_chill_passthrough_above_50f() {
        assert_eq!(wind_chill(55.0, 20.0), 55.0);
    }

    #[test]
    fn wind_chill_passthrough_below_3mph() {
        assert_eq!(wind_chill(20.0, 2.0), 20.0);
    }

    #[test]
    fn wind_chill_never_exceeds_temp_in_qualifying_range() {
        for t in (-20..=50).step_by(5) {
            for w in (3..=60).step_by(3) {
                let wc = wind_chill(t as f64, w as f64);
                assert!(wc <= t as f64, "wind_chill({t},{w}) = {wc} > {t}");
            }
        }
    }

    #[test]
    fn heat_index_passthrough_below_77f() {
        assert_eq!(heat_index(70.0, 50.0), 70.0);
    }

    #[test]
    fn heat_index_never_below_temp() {
        for t in (77..=115).step_by(2) {
            for rh in (0..=100).step_by(5) {
                let hi = heat_index(t as f64, rh as f64);
                assert!(hi >= t as f64, "heat_index({t},{rh}) = {hi} < {t}");
            }
        }
    }

    #[test]
    fn aqi_pm25_matches_breakpoints_exactly() {
        for bp in PM25_BREAKPOINTS {
            assert_eq!(aqi_pm25(bp.c_low), bp.i_low as u32);
            assert_eq!(aqi_pm25(bp.c_high), bp.i_high as u32);
        }
    }

    #[test]
    fn aqi_pm10_matches_breakpoints_exactly() {
        for bp in PM10_BREAKPOINTS {
            assert_eq!(aqi_pm10(bp.c_low), bp.i_low as u32);
            assert_eq!(aqi_pm10(bp.c_high), bp.i_high as u32);
        }
    }

    #[test]
    fn aqi_clamps_negative_to_zero() {
        assert_eq!(aqi_pm25(-5.0), 0);
        assert_eq!(aqi_pm10(-1.0), 0);
    }

    #[test]
    fn aqi_clamps_above_top_breakpoint_to_500() {
        assert_eq!(aqi_pm25(10_000.0), 500);
        assert_eq!(aqi_pm10(10_000.0), 500);
    }

    #[test]
    fn clear_sky_is_zero_at_midnight() {
        let t = "2024-06-21T07:00:00Z".parse().unwrap(); // local midnight at -105 lon (UTC-7)
        assert_eq!(clear_sky_irradiance(t, 40.0, -105.0, 1600.0, 70.0, 30.0), 0.0);
    }

    #[test]
    fn clear_sky_is_positive_at_solar_noon() {
        let t = "2024-06-21T19:00:00Z".parse().unwrap(); // local solar noon at -105 lon (UTC-7)
        let irr = clear_sky_irradiance(t, 40.0, -105.0, 1600.0, 85.0, 20.0);
        assert!(irr > 500.0, "expected strong midday irradiance, got {irr}");
    }
}

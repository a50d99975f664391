//! Raw SNMP values to physical units.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::probe::RawValue;
use crate::types::{Measured, UptimeReading};

/// Raw values that transceivers report when no module is inserted.
pub const GENERIC_SENTINELS: [i64; 4] = [-40_000, -65_535, -2_147_483_648, 2_147_483_647];

const TICKS_PER_SECOND: u64 = 100;
const WRAP: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot normalize {field}: {reason}")]
pub struct NormalizeError {
    pub field: String,
    pub reason: String,
}

impl NormalizeError {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// How a vendor encodes optical power in its raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEncoding {
    Dbm,
    CentiDbm,
    DeciDbm,
    MilliDbm,
    /// `raw * factor` dBm.
    Scaled(f64),
    MilliWatt,
    MicroWatt,
    TenthMicroWatt,
    /// ENTITY-SENSOR-MIB watts, scaled by the sensor's own scale/precision.
    EntitySensor,
}

/// What a raw value is expected to represent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueKind {
    Uptime,
    OpticalPower(PowerEncoding),
    Liveness,
    Text,
    /// Plain number with a multiplier (temperature, voltage).
    Scaled(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Alive,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedValue {
    Uptime(UptimeReading),
    Dbm(Measured<f64>),
    Liveness(Liveness),
    Text(Measured<String>),
    Number(Measured<f64>),
}

/// Normalize one raw value. `sentinels` are the profile's extra "no module"
/// markers; the generic ones always apply.
pub fn normalize(
    raw: &RawValue,
    kind: ValueKind,
    sentinels: &[i64],
) -> Result<NormalizedValue, NormalizeError> {
    match kind {
        ValueKind::Liveness => Ok(NormalizedValue::Liveness(liveness(Some(raw)))),
        ValueKind::Uptime => {
            let ticks = match raw {
                RawValue::TimeTicks(t) => *t,
                other => {
                    let v = other
                        .as_i64()
                        .ok_or_else(|| NormalizeError::new("uptime", format!("not a counter: {other}")))?;
                    // Counters above 32 bits are reduced modulo the wrap.
                    (v.rem_euclid(WRAP as i64)) as u32
                }
            };
            Ok(NormalizedValue::Uptime(uptime(ticks)))
        }
        ValueKind::OpticalPower(enc) => {
            if raw.is_absent() {
                return Ok(NormalizedValue::Dbm(Measured::Unknown));
            }
            let v = raw_number(raw, "optical_power")?;
            if is_sentinel_f64(v, sentinels) {
                return Ok(NormalizedValue::Dbm(Measured::Unknown));
            }
            Ok(NormalizedValue::Dbm(scale_power(v, enc)))
        }
        ValueKind::Text => Ok(NormalizedValue::Text(text(raw))),
        ValueKind::Scaled(factor) => {
            if raw.is_absent() {
                return Ok(NormalizedValue::Number(Measured::Unknown));
            }
            let v = raw_number(raw, "value")?;
            if is_sentinel_f64(v, sentinels) {
                return Ok(NormalizedValue::Number(Measured::Unknown));
            }
            Ok(NormalizedValue::Number(Measured::Value(round2(v * factor))))
        }
    }
}

fn raw_number(raw: &RawValue, field: &str) -> Result<f64, NormalizeError> {
    if let RawValue::OctetString(bytes) = raw {
        // Some agents return DDM readings as text, e.g. "-352" or "-3.52".
        let text = String::from_utf8_lossy(bytes);
        let trimmed = text.trim();
        return match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(NormalizeError::new(field, format!("non-numeric text `{trimmed}`"))),
        };
    }
    raw.as_i64()
        .map(|v| v as f64)
        .ok_or_else(|| NormalizeError::new(field, format!("unexpected value type: {raw:?}")))
}

fn is_sentinel_f64(v: f64, extra: &[i64]) -> bool {
    v.fract() == 0.0 && is_sentinel(v as i64, extra)
}

fn is_sentinel(v: i64, extra: &[i64]) -> bool {
    GENERIC_SENTINELS.contains(&v) || extra.contains(&v)
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Convert a raw integer to dBm. Sentinels and non-positive linear power
/// readings are `Unknown`, never zero.
pub fn optical_power(raw: i64, enc: PowerEncoding, sentinels: &[i64]) -> Measured<f64> {
    if is_sentinel(raw, sentinels) {
        return Measured::Unknown;
    }
    scale_power(raw as f64, enc)
}

fn scale_power(v: f64, enc: PowerEncoding) -> Measured<f64> {
    let dbm = match enc {
        PowerEncoding::Dbm => v,
        PowerEncoding::CentiDbm => v * 0.01,
        PowerEncoding::DeciDbm => v * 0.1,
        PowerEncoding::MilliDbm => v * 0.001,
        PowerEncoding::Scaled(f) => v * f,
        PowerEncoding::MilliWatt => return mw_to_dbm(v),
        PowerEncoding::MicroWatt => return mw_to_dbm(v / 1_000.0),
        PowerEncoding::TenthMicroWatt => return mw_to_dbm(v / 10_000.0),
        // Without scale/precision the value is taken as milliwatts.
        PowerEncoding::EntitySensor => return mw_to_dbm(v),
    };
    if dbm.is_finite() {
        Measured::Value(round2(dbm))
    } else {
        Measured::Unknown
    }
}

pub fn mw_to_dbm(mw: f64) -> Measured<f64> {
    if mw <= 0.0 || !mw.is_finite() {
        return Measured::Unknown;
    }
    Measured::Value(round2(10.0 * mw.log10()))
}

/// Multiplier for an ENTITY-SENSOR-MIB reading: `10^(3*(scale-9) - precision)`.
/// `scale` follows `EntitySensorDataScale` (1 = yocto .. 9 = units .. 17 = yotta).
pub fn entity_sensor_factor(scale: i64, precision: i64) -> Result<f64, NormalizeError> {
    if !(1..=17).contains(&scale) {
        return Err(NormalizeError::new("entPhySensorScale", format!("out of range: {scale}")));
    }
    if !(-8..=9).contains(&precision) {
        return Err(NormalizeError::new(
            "entPhySensorPrecision",
            format!("out of range: {precision}"),
        ));
    }
    let exp = 3 * (scale - 9) - precision;
    Ok(10f64.powi(exp as i32))
}

/// An ENTITY-SENSOR watts reading converted to dBm.
pub fn entity_sensor_dbm(raw: i64, factor: f64, sentinels: &[i64]) -> Measured<f64> {
    if is_sentinel(raw, sentinels) {
        return Measured::Unknown;
    }
    mw_to_dbm(raw as f64 * factor * 1_000.0)
}

pub fn uptime(ticks: u32) -> UptimeReading {
    let seconds = u64::from(ticks) / TICKS_PER_SECOND;
    UptimeReading {
        ticks,
        seconds,
        display: format_uptime(seconds),
    }
}

pub fn uptime_duration(ticks: u32) -> Duration {
    Duration::from_millis(u64::from(ticks) * 10)
}

pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    format!("{days} days, {hours} hours")
}

/// Elapsed time between two sysUpTime samples, accounting for one 32-bit
/// wrap between them.
pub fn uptime_delta(prev: u32, cur: u32) -> Duration {
    let ticks = if cur >= prev {
        u64::from(cur - prev)
    } else {
        WRAP - u64::from(prev) + u64::from(cur)
    };
    Duration::from_millis(ticks * 10)
}

pub fn liveness(raw: Option<&RawValue>) -> Liveness {
    match raw {
        Some(v) if !v.is_absent() => Liveness::Alive,
        _ => Liveness::Unreachable,
    }
}

/// Printable-ASCII filtered, trimmed text; empty becomes `Unknown`.
pub fn text(raw: &RawValue) -> Measured<String> {
    let s = match raw {
        RawValue::OctetString(bytes) => bytes
            .iter()
            .filter(|b| b.is_ascii_graphic() || **b == b' ')
            .map(|b| *b as char)
            .collect::<String>(),
        other => other.as_text().unwrap_or_default(),
    };
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Measured::Unknown
    } else {
        Measured::Value(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centi_dbm_scales_to_two_decimals() {
        assert_eq!(
            optical_power(-1250, PowerEncoding::Scaled(0.01), &[]),
            Measured::Value(-12.5)
        );
        assert_eq!(optical_power(-1250, PowerEncoding::CentiDbm, &[]), Measured::Value(-12.5));
        assert_eq!(optical_power(-35, PowerEncoding::DeciDbm, &[]), Measured::Value(-3.5));
        assert_eq!(optical_power(-3521, PowerEncoding::MilliDbm, &[]), Measured::Value(-3.52));
    }

    #[test]
    fn sentinels_are_unknown_not_zero() {
        for s in GENERIC_SENTINELS {
            assert_eq!(optical_power(s, PowerEncoding::CentiDbm, &[]), Measured::Unknown);
        }
        assert_eq!(optical_power(-1, PowerEncoding::CentiDbm, &[-1]), Measured::Unknown);
        assert_eq!(optical_power(0, PowerEncoding::MicroWatt, &[]), Measured::Unknown);
        assert_eq!(optical_power(-5, PowerEncoding::MilliWatt, &[]), Measured::Unknown);
    }

    #[test]
    fn linear_power_to_dbm() {
        assert_eq!(optical_power(1000, PowerEncoding::MicroWatt, &[]), Measured::Value(0.0));
        assert_eq!(optical_power(5012, PowerEncoding::TenthMicroWatt, &[]), Measured::Value(-3.0));
        assert_eq!(optical_power(1, PowerEncoding::MilliWatt, &[]), Measured::Value(0.0));
    }

    #[test]
    fn absent_power_is_unknown() {
        let out = normalize(&RawValue::NoSuchInstance, ValueKind::OpticalPower(PowerEncoding::Dbm), &[]).unwrap();
        assert_eq!(out, NormalizedValue::Dbm(Measured::Unknown));
    }

    #[test]
    fn malformed_power_is_an_error() {
        let err = normalize(
            &RawValue::OctetString(b"n/a".to_vec()),
            ValueKind::OpticalPower(PowerEncoding::CentiDbm),
            &[],
        )
        .unwrap_err();
        assert_eq!(err.field, "optical_power");
    }

    #[test]
    fn decimal_text_in_dbm() {
        let out = normalize(
            &RawValue::OctetString(b" -3.52 ".to_vec()),
            ValueKind::OpticalPower(PowerEncoding::Dbm),
            &[],
        )
        .unwrap();
        assert_eq!(out, NormalizedValue::Dbm(Measured::Value(-3.52)));
    }

    #[test]
    fn uptime_renders_days_and_hours() {
        // 3 days, 5 hours, 7 minutes
        let ticks = ((3 * 86_400 + 5 * 3_600 + 7 * 60) * 100) as u32;
        let up = uptime(ticks);
        assert_eq!(up.display, "3 days, 5 hours");
        assert_eq!(up.seconds, 3 * 86_400 + 5 * 3_600 + 420);
    }

    #[test]
    fn uptime_delta_across_wrap() {
        let prev = u32::MAX - 99;
        let cur = 100;
        assert_eq!(uptime_delta(prev, cur), Duration::from_millis(200 * 10));
        assert_eq!(uptime_delta(100, 300), Duration::from_secs(2));
    }

    #[test]
    fn oversized_counter_wraps() {
        let out = normalize(&RawValue::Unsigned(WRAP + 500), ValueKind::Uptime, &[]).unwrap();
        match out {
            NormalizedValue::Uptime(u) => assert_eq!(u.ticks, 500),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn text_is_filtered_and_trimmed() {
        assert_eq!(
            text(&RawValue::OctetString(b"  FINISAR\x00\x01 ".to_vec())),
            Measured::Value("FINISAR".to_string())
        );
        assert_eq!(text(&RawValue::OctetString(b"\x00\x00".to_vec())), Measured::Unknown);
    }

    #[test]
    fn liveness_requires_a_value() {
        assert_eq!(liveness(Some(&RawValue::Integer(1))), Liveness::Alive);
        assert_eq!(liveness(Some(&RawValue::NoSuchObject)), Liveness::Unreachable);
        assert_eq!(liveness(None), Liveness::Unreachable);
    }

    #[test]
    fn entity_sensor_scaling() {
        // micro (7), precision 1: raw 5012 -> 501.2 uW -> -3.0 dBm
        let f = entity_sensor_factor(7, 1).unwrap();
        assert_eq!(entity_sensor_dbm(5012, f, &[]), Measured::Value(-3.0));
        assert!(entity_sensor_factor(0, 0).is_err());
        assert!(entity_sensor_factor(9, 12).is_err());
    }
}

//! The send-telemetry service: pushes one sample of vehicle telemetry to ABRP.
//!
//! Callers post a [SendTelemetryRequest]. Numeric fields accept either JSON
//! numbers or numeric strings, ranges are checked by
//! [SendTelemetryRequest::validate], and `utc` defaults to the time of the
//! call. The resulting [TelemetryPayload] is JSON-encoded into the `tlm`
//! query parameter of `tlm/send`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Accepts `42`, `42.5` and `"42.5"`, like the service schema always has.
fn coerce_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        String(String),
    }

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got {:?}", s))),
    }
}

/// Accepts `1000`, `1000.0` and `"1000"`. Fractional values are rejected.
fn coerce_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Float(f64),
        String(String),
    }

    let invalid = |what: String| -> D::Error {
        serde::de::Error::custom(format!("expected an integer, got {}", what))
    };
    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Int(n)) => Ok(Some(n)),
        Some(IntOrString::Float(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Ok(Some(f as i64))
        }
        Some(IntOrString::Float(f)) => Err(invalid(f.to_string())),
        Some(IntOrString::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(format!("{:?}", s))),
    }
}

/// Accepts booleans, `"true"`/`"false"`, `"on"`/`"off"`, `"yes"`/`"no"`,
/// `"1"`/`"0"` and numbers (non-zero is true).
fn coerce_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrOther {
        Bool(bool),
        Number(f64),
        String(String),
    }

    match Option::<BoolOrOther>::deserialize(deserializer)? {
        None => Ok(None),
        Some(BoolOrOther::Bool(b)) => Ok(Some(b)),
        Some(BoolOrOther::Number(n)) => Ok(Some(n != 0.0)),
        Some(BoolOrOther::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "yes" | "enable" | "1" => Ok(Some(true)),
            "false" | "off" | "no" | "disable" | "0" => Ok(Some(false)),
            _ => Err(serde::de::Error::custom(format!(
                "expected a boolean, got {:?}",
                s
            ))),
        },
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SendTelemetryRequest {
    #[serde(default, deserialize_with = "coerce_i64")]
    pub utc: Option<i64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub soc: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub soh: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub power: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub lon: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub heading: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub ext_temp: Option<f64>,
    #[serde(default, deserialize_with = "coerce_f64")]
    pub batt_temp: Option<f64>,
    #[serde(default, deserialize_with = "coerce_bool")]
    pub is_charging: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
    #[error("utc must be a non-negative number of seconds, got {0}")]
    NegativeUtc(i64),
}

fn check_range(
    field: &'static str,
    value: Option<f64>,
    min: f64,
    max: f64,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !(min..=max).contains(&v) => Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            value: v,
        }),
        _ => Ok(()),
    }
}

impl SendTelemetryRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(utc) = self.utc.filter(|utc| *utc < 0) {
            return Err(ValidationError::NegativeUtc(utc));
        }
        let numbers = [
            ("soc", self.soc),
            ("soh", self.soh),
            ("power", self.power),
            ("lat", self.lat),
            ("lon", self.lon),
            ("heading", self.heading),
            ("ext_temp", self.ext_temp),
            ("batt_temp", self.batt_temp),
        ];
        for (field, value) in numbers {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(ValidationError::NotFinite { field });
            }
        }
        check_range("soc", self.soc, 0.0, 100.0)?;
        check_range("soh", self.soh, 0.0, 100.0)?;
        check_range("heading", self.heading, 0.0, 360.0)?;
        Ok(())
    }

    /// Validates the request and fills in `utc` with `now` when omitted.
    pub fn into_payload(self, now: DateTime<Utc>) -> Result<TelemetryPayload, ValidationError> {
        self.validate()?;
        Ok(TelemetryPayload {
            utc: self.utc.unwrap_or_else(|| now.timestamp()),
            soc: self.soc,
            soh: self.soh,
            power: self.power,
            lat: self.lat,
            lon: self.lon,
            heading: self.heading,
            ext_temp: self.ext_temp,
            batt_temp: self.batt_temp,
            is_charging: self.is_charging,
        })
    }
}

/// The `tlm` object sent to ABRP. Omitted fields are not serialized.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TelemetryPayload {
    pub utc: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batt_temp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_charging: Option<bool>,
}

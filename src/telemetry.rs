//! Typed decoding of the ABRP telemetry envelope.
//!
//! The `tlm/get_telemetry` endpoint answers with an envelope shaped like
//!
//! ```json
//! {"result": {"telemetry": {"soc": 42, "power": -3.2}, "timestamp": "2024-05-01 10:00:00", "telemetry_type": "live"}}
//! ```
//!
//! Some fields (`timestamp`, `telemetry_type`) live next to the `telemetry`
//! object instead of inside it. [TelemetrySnapshot::from_envelope] flattens
//! both levels into a single [TelemetrySnapshot], keeping only the known
//! fields that carry a value of the expected type.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// The telemetry fields we know how to expose as sensors.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryField {
    Power,
    Soc,
    Soh,
    Lat,
    Lon,
    Heading,
    ExtTemp,
    BattTemp,
    Timestamp,
    TelemetryType,
    Odometer,
    EstBatteryRange,
    Speed,
    Elevation,
    CalibRefCons,
}

/// Whether a field holds a number or a string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Number,
    Text,
}

impl TelemetryField {
    pub const ALL: [TelemetryField; 15] = [
        TelemetryField::Power,
        TelemetryField::Soc,
        TelemetryField::Soh,
        TelemetryField::Lat,
        TelemetryField::Lon,
        TelemetryField::Heading,
        TelemetryField::ExtTemp,
        TelemetryField::BattTemp,
        TelemetryField::Timestamp,
        TelemetryField::TelemetryType,
        TelemetryField::Odometer,
        TelemetryField::EstBatteryRange,
        TelemetryField::Speed,
        TelemetryField::Elevation,
        TelemetryField::CalibRefCons,
    ];

    /// The key of the field in the API payload.
    pub fn key(&self) -> &'static str {
        match self {
            TelemetryField::Power => "power",
            TelemetryField::Soc => "soc",
            TelemetryField::Soh => "soh",
            TelemetryField::Lat => "lat",
            TelemetryField::Lon => "lon",
            TelemetryField::Heading => "heading",
            TelemetryField::ExtTemp => "ext_temp",
            TelemetryField::BattTemp => "batt_temp",
            TelemetryField::Timestamp => "timestamp",
            TelemetryField::TelemetryType => "telemetry_type",
            TelemetryField::Odometer => "odometer",
            TelemetryField::EstBatteryRange => "est_battery_range",
            TelemetryField::Speed => "speed",
            TelemetryField::Elevation => "elevation",
            TelemetryField::CalibRefCons => "calib_ref_cons",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            TelemetryField::Timestamp | TelemetryField::TelemetryType => FieldKind::Text,
            _ => FieldKind::Number,
        }
    }
}

impl std::fmt::Display for TelemetryField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// A decoded field value. Numbers keep their JSON representation so that an
/// integer reported by the API is exposed as an integer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Number(Number),
    Text(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Number(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => n.as_f64(),
            FieldValue::Text(_) => None,
        }
    }
}

/// The raw response of `tlm/get_telemetry`.
#[derive(Deserialize, Debug, Default)]
pub struct TelemetryEnvelope {
    #[serde(default)]
    pub result: Option<TelemetryResult>,
}

#[derive(Deserialize, Debug, Default)]
pub struct TelemetryResult {
    #[serde(default)]
    pub telemetry: Option<Map<String, Value>>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub telemetry_type: Option<Value>,
}

/// The most recent complete set of telemetry fields.
///
/// A field is present only if the API returned a non-null value of the
/// expected type; nothing is ever defaulted.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    fields: BTreeMap<TelemetryField, FieldValue>,
}

impl TelemetrySnapshot {
    /// Flatten the envelope into a snapshot, promoting the outer `timestamp`
    /// and `telemetry_type` fields.
    pub fn from_envelope(envelope: TelemetryEnvelope) -> Self {
        let mut snapshot = Self::default();
        let Some(result) = envelope.result else {
            log::debug!("ABRP: response has no result object");
            return snapshot;
        };

        if let Some(telemetry) = result.telemetry {
            for (key, value) in telemetry {
                match TelemetryField::from_key(&key) {
                    Some(field) => snapshot.insert_raw(field, value),
                    None => log::debug!("ABRP: ignoring unknown telemetry field {}", key),
                }
            }
        }

        // The outer fields win over anything nested under `telemetry`
        if let Some(value) = result.timestamp.filter(|v| !v.is_null()) {
            snapshot.insert_raw(TelemetryField::Timestamp, value);
        }
        if let Some(value) = result.telemetry_type.filter(|v| !v.is_null()) {
            snapshot.insert_raw(TelemetryField::TelemetryType, value);
        }

        snapshot
    }

    fn insert_raw(&mut self, field: TelemetryField, value: Value) {
        let decoded = match (field.kind(), value) {
            (_, Value::Null) => return,
            (FieldKind::Number, Value::Number(n)) => FieldValue::Number(n),
            (FieldKind::Text, Value::String(s)) => FieldValue::Text(s),
            (_, other) => {
                log::warn!(
                    "ABRP: dropping telemetry field {} with unexpected value {}",
                    field,
                    other
                );
                return;
            }
        };
        self.fields.insert(field, decoded);
    }

    pub fn insert(&mut self, field: TelemetryField, value: FieldValue) {
        self.fields.insert(field, value);
    }

    pub fn get(&self, field: TelemetryField) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn timestamp(&self) -> Option<&str> {
        self.get(TelemetryField::Timestamp).and_then(FieldValue::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unparseable timestamp: {0:?}")]
pub struct TimestampParseError(pub String);

/// Parse an ABRP timestamp into an absolute UTC time.
///
/// Accepts RFC 3339 and the ISO 8601 variants with a space separator and/or
/// without a time-zone offset. A timestamp without an offset is UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampParseError> {
    let mut normalized = value.trim().replacen(' ', "T", 1);
    if normalized.ends_with(['Z', 'z']) {
        normalized.pop();
        normalized.push_str("+00:00");
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Ok(dt.with_timezone(&Utc));
    }
    // %#z also takes hour-only offsets such as +02
    for format in ["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&normalized, format) {
            return Ok(dt.and_utc());
        }
    }

    Err(TimestampParseError(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(body: Value) -> TelemetrySnapshot {
        TelemetrySnapshot::from_envelope(serde_json::from_value(body).unwrap())
    }

    #[test]
    fn flattens_known_fields() {
        let snap = snapshot(json!({
            "result": {"telemetry": {"soc": 42, "power": -3.5, "lat": 52.1}}
        }));
        assert_eq!(snap.len(), 3);
        assert_eq!(snap.get(TelemetryField::Soc), Some(&FieldValue::Number(42.into())));
        assert_eq!(snap.get(TelemetryField::Power).and_then(FieldValue::as_f64), Some(-3.5));
        assert_eq!(snap.get(TelemetryField::Soh), None);
    }

    #[test]
    fn keeps_zero_values() {
        let snap = snapshot(json!({"result": {"telemetry": {"soc": 0, "speed": 0.0}}}));
        assert_eq!(snap.get(TelemetryField::Soc), Some(&FieldValue::Number(0.into())));
        assert_eq!(snap.get(TelemetryField::Speed).and_then(FieldValue::as_f64), Some(0.0));
    }

    #[test]
    fn drops_nulls_and_mistyped_values() {
        let snap = snapshot(json!({
            "result": {"telemetry": {"soc": null, "power": "fast", "telemetry_type": 3, "utc": 1}}
        }));
        assert!(snap.is_empty());
    }

    #[test]
    fn promotes_outer_fields() {
        let snap = snapshot(json!({
            "result": {
                "telemetry": {"soc": 80, "timestamp": "2020-01-01 00:00:00"},
                "timestamp": "2024-05-01 10:00:00",
                "telemetry_type": "live"
            }
        }));
        assert_eq!(snap.timestamp(), Some("2024-05-01 10:00:00"));
        assert_eq!(
            snap.get(TelemetryField::TelemetryType),
            Some(&FieldValue::Text("live".to_string()))
        );
    }

    #[test]
    fn missing_telemetry_is_empty() {
        assert!(snapshot(json!({})).is_empty());
        assert!(snapshot(json!({"result": {}})).is_empty());

        let snap = snapshot(json!({"result": {"timestamp": "2024-05-01T10:00:00Z"}}));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.timestamp(), Some("2024-05-01T10:00:00Z"));
    }

    #[test]
    fn naive_timestamp_is_utc() {
        let naive = parse_timestamp("2024-05-01T10:00:00").unwrap();
        let explicit = parse_timestamp("2024-05-01T10:00:00+00:00").unwrap();
        assert_eq!(naive, explicit);

        let spaced = parse_timestamp("2024-05-01 10:00:00").unwrap();
        let spaced_explicit = parse_timestamp("2024-05-01 10:00:00+00:00").unwrap();
        assert_eq!(spaced, naive);
        assert_eq!(spaced_explicit, naive);
    }

    #[test]
    fn timestamp_offsets_are_applied() {
        let dt = parse_timestamp("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(dt, parse_timestamp("2024-05-01T10:00:00Z").unwrap());
        let fractional = parse_timestamp("2024-05-01 10:00:00.250").unwrap();
        assert_eq!(fractional.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn short_and_hour_only_offsets_are_accepted() {
        let ten_utc = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
        assert_eq!(parse_timestamp("2024-05-01T10:00Z").unwrap(), ten_utc);
        assert_eq!(parse_timestamp("2024-05-01 12:00+02:00").unwrap(), ten_utc);
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+02").unwrap(), ten_utc);
        assert_eq!(parse_timestamp("2024-05-01T12:00:00+0200").unwrap(), ten_utc);
        assert_eq!(parse_timestamp("2024-05-01 10:00:00.5z").unwrap().timestamp(), ten_utc.timestamp());
    }

    #[test]
    fn garbage_timestamp_fails() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("").is_err());
    }

    #[test]
    fn field_keys_round_trip() {
        for field in TelemetryField::ALL {
            assert_eq!(TelemetryField::from_key(field.key()), Some(field));
        }
        assert_eq!(TelemetryField::from_key("is_charging"), None);
    }
}

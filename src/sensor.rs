//! Sensors exposed for each config entry.
//!
//! There is a single generic sensor type: every sensor is one row of
//! [SENSORS], binding a [TelemetryField] to its display metadata. A
//! [SensorReading] is derived from the latest snapshot each time it is
//! requested and is never cached.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Number;

use crate::telemetry::{parse_timestamp, FieldValue, TelemetryField, TelemetrySnapshot};

pub const MANUFACTURER: &str = "Iternio";
pub const MODEL: &str = "A Better Route Planner";

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Power,
    Battery,
    Temperature,
    Timestamp,
    Distance,
    Speed,
    EnergyDistance,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Static description of one sensor.
#[derive(Debug, Clone, Copy)]
pub struct SensorDescriptor {
    pub field: TelemetryField,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
}

const fn sensor(
    field: TelemetryField,
    name: &'static str,
    unit: Option<&'static str>,
    device_class: Option<DeviceClass>,
    state_class: Option<StateClass>,
    icon: Option<&'static str>,
) -> SensorDescriptor {
    SensorDescriptor {
        field,
        name,
        unit,
        device_class,
        state_class,
        icon,
    }
}

use DeviceClass as D;
use StateClass as S;
use TelemetryField as F;

pub static SENSORS: [SensorDescriptor; 15] = [
    sensor(F::Power, "Power", Some("kW"), Some(D::Power), Some(S::Measurement), Some("mdi:lightning-bolt")),
    sensor(F::Soc, "State of charge", Some("%"), Some(D::Battery), Some(S::Measurement), None),
    sensor(F::Soh, "State of health", Some("%"), None, Some(S::Measurement), Some("mdi:heart-pulse")),
    sensor(F::Lon, "Longitude", None, None, None, Some("mdi:map-marker")),
    sensor(F::Lat, "Latitude", None, None, None, Some("mdi:map-marker")),
    sensor(F::Heading, "Heading", Some("°"), None, None, Some("mdi:compass")),
    sensor(F::ExtTemp, "External temperature", Some("°C"), Some(D::Temperature), Some(S::Measurement), None),
    sensor(F::BattTemp, "Battery temperature", Some("°C"), Some(D::Temperature), Some(S::Measurement), None),
    sensor(F::Timestamp, "Last telemetry", None, Some(D::Timestamp), None, Some("mdi:clock-outline")),
    sensor(F::TelemetryType, "Telemetry type", None, None, None, Some("mdi:information-outline")),
    sensor(F::Odometer, "Odometer", Some("km"), Some(D::Distance), Some(S::TotalIncreasing), Some("mdi:counter")),
    sensor(F::EstBatteryRange, "Estimated battery range", Some("km"), Some(D::Distance), Some(S::Measurement), Some("mdi:map-marker-distance")),
    sensor(F::Speed, "Speed", Some("km/h"), Some(D::Speed), Some(S::Measurement), Some("mdi:speedometer")),
    sensor(F::Elevation, "Elevation", Some("m"), Some(D::Distance), Some(S::Measurement), Some("mdi:elevation-rise")),
    sensor(F::CalibRefCons, "Calibrated reference consumption", Some("Wh/km"), Some(D::EnergyDistance), Some(S::Measurement), Some("mdi:chart-areaspline")),
];

pub fn descriptor(key: &str) -> Option<&'static SensorDescriptor> {
    SENSORS.iter().find(|d| d.field.key() == key)
}

/// The value of a sensor.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SensorValue {
    Number(Number),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl std::fmt::Display for SensorValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorValue::Number(n) => write!(f, "{}", n),
            SensorValue::Text(s) => f.write_str(s),
            SensorValue::Timestamp(t) => f.write_str(&t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        }
    }
}

impl SensorDescriptor {
    /// Reads this sensor from a snapshot.
    ///
    /// Returns `None` (unavailable) when the field is absent. The timestamp
    /// field is parsed into a UTC time; an unparseable timestamp is logged and
    /// reported as unavailable.
    pub fn value(&self, snapshot: &TelemetrySnapshot) -> Option<SensorValue> {
        let raw = snapshot.get(self.field)?;
        if self.field == TelemetryField::Timestamp {
            let text = raw.as_str()?;
            return match parse_timestamp(text) {
                Ok(dt) => Some(SensorValue::Timestamp(dt)),
                Err(e) => {
                    log::warn!("ABRP: failed to parse timestamp: {}", e);
                    None
                }
            };
        }
        Some(match raw {
            FieldValue::Number(n) => SensorValue::Number(n.clone()),
            FieldValue::Text(s) => SensorValue::Text(s.clone()),
        })
    }

    /// Formats a value with its unit for display.
    pub fn display(&self, value: &SensorValue) -> String {
        match self.unit {
            Some(unit) => format!("{} {}", value, unit),
            None => value.to_string(),
        }
    }

    pub fn reading(&self, entry_id: &str, snapshot: Option<&TelemetrySnapshot>) -> SensorReading {
        let value = snapshot.and_then(|s| self.value(s));
        SensorReading {
            unique_id: format!("{}_{}", entry_id, self.field.key()),
            key: self.field,
            translation_key: self.field.key(),
            name: self.name,
            unit: self.unit,
            device_class: self.device_class,
            state_class: self.state_class,
            icon: self.icon,
            display: value.as_ref().map(|v| self.display(v)),
            value,
        }
    }
}

/// One sensor as exposed to clients.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub unique_id: String,
    pub key: TelemetryField,
    pub translation_key: &'static str,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
    pub value: Option<SensorValue>,
    pub display: Option<String>,
}

/// Reads every sensor of an entry from its latest snapshot.
pub fn readings(entry_id: &str, snapshot: Option<&TelemetrySnapshot>) -> Vec<SensorReading> {
    SENSORS
        .iter()
        .map(|descriptor| descriptor.reading(entry_id, snapshot))
        .collect()
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

impl DeviceInfo {
    pub fn new(title: &str) -> Self {
        Self {
            name: title.to_string(),
            manufacturer: MANUFACTURER,
            model: MODEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryEnvelope;
    use serde_json::json;

    fn snapshot(telemetry: serde_json::Value) -> TelemetrySnapshot {
        let envelope: TelemetryEnvelope =
            serde_json::from_value(json!({"result": {"telemetry": telemetry}})).unwrap();
        TelemetrySnapshot::from_envelope(envelope)
    }

    #[test]
    fn every_field_has_one_sensor() {
        for field in TelemetryField::ALL {
            assert_eq!(SENSORS.iter().filter(|d| d.field == field).count(), 1, "{}", field);
        }
    }

    #[test]
    fn soc_reads_unmodified() {
        let snap = snapshot(json!({"soc": 42}));
        let soc = descriptor("soc").unwrap();
        assert_eq!(soc.value(&snap), Some(SensorValue::Number(42.into())));
        assert_eq!(soc.display(&soc.value(&snap).unwrap()), "42 %");
    }

    #[test]
    fn zero_is_a_value() {
        let snap = snapshot(json!({"soc": 0, "speed": 0, "heading": 0.0}));
        for key in ["soc", "speed", "heading"] {
            let value = descriptor(key).unwrap().value(&snap);
            assert!(value.is_some(), "{} should be available", key);
        }
        assert_eq!(
            descriptor("speed").unwrap().value(&snap),
            Some(SensorValue::Number(0.into()))
        );
    }

    #[test]
    fn missing_field_is_unavailable() {
        let snap = snapshot(json!({"soc": 42}));
        let readings = readings("entry", Some(&snap));
        assert_eq!(readings.len(), SENSORS.len());
        for reading in readings.iter().filter(|r| r.key != TelemetryField::Soc) {
            assert_eq!(reading.value, None);
            assert_eq!(reading.display, None);
        }
    }

    #[test]
    fn no_snapshot_means_unavailable() {
        assert!(readings("entry", None).iter().all(|r| r.value.is_none()));
    }

    #[test]
    fn timestamp_is_parsed() {
        let mut snap = TelemetrySnapshot::default();
        snap.insert(TelemetryField::Timestamp, FieldValue::Text("2024-05-01 10:00:00".into()));
        let sensor = descriptor("timestamp").unwrap();
        let value = sensor.value(&snap).unwrap();
        assert_eq!(
            value,
            SensorValue::Timestamp(parse_timestamp("2024-05-01T10:00:00+00:00").unwrap())
        );
        assert_eq!(sensor.display(&value), "2024-05-01T10:00:00Z");
    }

    #[test]
    fn bad_timestamp_is_unavailable() {
        let mut snap = TelemetrySnapshot::default();
        snap.insert(TelemetryField::Timestamp, FieldValue::Text("soon".into()));
        assert_eq!(descriptor("timestamp").unwrap().value(&snap), None);
    }

    #[test]
    fn reading_carries_metadata() {
        let snap = snapshot(json!({"power": 11.5, "calib_ref_cons": 160}));
        let power = descriptor("power").unwrap().reading("abc", Some(&snap));
        assert_eq!(power.unique_id, "abc_power");
        assert_eq!(power.unit, Some("kW"));
        assert_eq!(power.device_class, Some(DeviceClass::Power));
        assert_eq!(power.display.as_deref(), Some("11.5 kW"));

        let heading = descriptor("heading").unwrap();
        assert_eq!(heading.display(&SensorValue::Number(90.into())), "90 °");

        let cons = descriptor("calib_ref_cons").unwrap().reading("abc", Some(&snap));
        assert_eq!(cons.display.as_deref(), Some("160 Wh/km"));

        let json = serde_json::to_value(&power).unwrap();
        assert_eq!(json["key"], "power");
        assert_eq!(json["translation_key"], "power");
        assert_eq!(json["value"], 11.5);
        assert_eq!(json["state_class"], "measurement");
    }

    #[test]
    fn unknown_key_has_no_descriptor() {
        assert!(descriptor("is_charging").is_none());
    }
}

#![allow(dead_code)]
//! Fixtures shared by the integration tests.


use chrono::{TimeZone, Utc};
use safewatch::{
    core::{Measurement, NotificationEvent, SafetyStatus},
    pipeline::{IngestEvent, MeasurementChange},
    reference::ReferenceData,
};
use std::io::Write;
use tempfile::NamedTempFile;

/// A small reference document: a three-level jurisdiction tree and a mix of
/// regulated, banned and uncontrolled substances.
pub const REFERENCE_YAML: &str = r#"
substances:
  - id: lead
    name: Lead
    unit: ppb
  - id: nitrate
    name: Nitrate
    unit: mg/L
  - id: dissolved_oxygen
    name: Dissolved Oxygen
    unit: mg/L
    higher_is_bad: false
  - id: asbestos
    name: Asbestos
  - id: chloride
    name: Chloride
jurisdictions:
  - code: WHO
  - code: US
    parent_code: WHO
  - code: US-NY
    parent_code: US
  - code: EU
    parent_code: WHO
thresholds:
  - substance_id: lead
    jurisdiction_code: WHO
    limit_value: 10
  - substance_id: lead
    jurisdiction_code: US
    limit_value: 15
    warning_ratio: 0.8
  - substance_id: nitrate
    jurisdiction_code: WHO
    limit_value: 50
  - substance_id: dissolved_oxygen
    jurisdiction_code: WHO
    limit_value: 5
    warning_ratio: 1.5
  - substance_id: asbestos
    jurisdiction_code: EU
    status: banned
  - substance_id: chloride
    jurisdiction_code: US
    status: not_controlled
"#;

pub fn reference() -> ReferenceData {
    ReferenceData::from_yaml_str(REFERENCE_YAML).unwrap()
}

/// Writes `contents` to a temporary file that lives as long as the handle.
pub fn temp_file(contents: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    write!(file, "{}", contents).unwrap();
    file.flush().unwrap();
    file
}

/// A measurement change for `substance` at `location`, evaluated in `jurisdiction`.
pub fn measurement(
    location: &str,
    jurisdiction: &str,
    substance: &str,
    value: f64,
    previous_value: Option<f64>,
) -> IngestEvent {
    IngestEvent::Measurement(MeasurementChange {
        jurisdiction_code: jurisdiction.to_string(),
        current: Measurement {
            substance_id: substance.to_string(),
            location_key: location.to_string(),
            value,
            measured_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        },
        previous_value,
        unit: None,
    })
}

pub fn status_change(location: &str, old: SafetyStatus, new: SafetyStatus) -> NotificationEvent {
    NotificationEvent::status_change(location, "lead", old, new)
}

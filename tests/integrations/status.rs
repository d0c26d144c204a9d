//! Threshold resolution and status evaluation against a realistic
//! reference document.

use safewatch::core::{RegulatoryStatus, SafetyStatus, Threshold};
use safewatch::status::{assess, evaluate};

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::reference;

#[test]
fn test_fifteen_ppb_limit_with_default_ratio() {
    let data = reference();

    let status = |value| assess(&data, "lead", "US", value).status;

    assert_eq!(status(10.0), SafetyStatus::Safe);
    assert_eq!(status(12.0), SafetyStatus::Warning);
    assert_eq!(status(15.0), SafetyStatus::Danger);
    assert_eq!(status(16.0), SafetyStatus::Danger);
}

#[test]
fn test_child_jurisdiction_falls_back_to_parent_before_global() {
    let data = reference();

    let lead = data.resolve("lead", "US-NY").unwrap();
    assert_eq!(lead.jurisdiction_code, "US");

    let nitrate = data.resolve("nitrate", "US-NY").unwrap();
    assert_eq!(nitrate.jurisdiction_code, "WHO");

    let assessment = assess(&data, "lead", "US-NY", 12.0);
    assert_eq!(assessment.resolved_jurisdiction.as_deref(), Some("US"));
    assert_eq!(assessment.status, SafetyStatus::Warning);
}

#[test]
fn test_missing_threshold_is_danger() {
    let data = reference();

    // Asbestos is only listed for the EU.
    let assessment = assess(&data, "asbestos", "US", 0.0);
    assert_eq!(assessment.status, SafetyStatus::Danger);
    assert_eq!(assessment.resolved_jurisdiction, None);

    assert_eq!(assess(&data, "unobtainium", "WHO", 0.0).status, SafetyStatus::Danger);
}

#[test]
fn test_banned_and_uncontrolled_substances() {
    let data = reference();

    assert_eq!(assess(&data, "asbestos", "EU", 0.0).status, SafetyStatus::Danger);
    assert_eq!(assess(&data, "chloride", "US", 1e9).status, SafetyStatus::Safe);
}

#[test]
fn test_lower_is_bad_substance() {
    let data = reference();

    let status = |value| assess(&data, "dissolved_oxygen", "US-NY", value).status;

    assert_eq!(status(9.0), SafetyStatus::Safe);
    assert_eq!(status(7.0), SafetyStatus::Warning);
    assert_eq!(status(5.0), SafetyStatus::Danger);
    assert_eq!(status(2.0), SafetyStatus::Danger);
}

#[test]
fn test_severity_never_decreases_as_value_grows() {
    let threshold = Threshold::regulated("lead", "US", 15.0);
    let values: Vec<f64> = (0..=400).map(|i| i as f64 * 0.1).collect();

    for pair in values.windows(2) {
        assert!(evaluate(pair[0], Some(&threshold), true) <= evaluate(pair[1], Some(&threshold), true));
        assert!(evaluate(pair[0], Some(&threshold), false) >= evaluate(pair[1], Some(&threshold), false));
    }
}

#[test]
fn test_zero_limit_only_accepts_zero() {
    let threshold = Threshold {
        limit_value: Some(0.0),
        ..Threshold::regulated("lead", "WHO", 0.0)
    };

    assert_eq!(evaluate(0.0, Some(&threshold), true), SafetyStatus::Safe);
    assert_eq!(evaluate(1.0, Some(&threshold), true), SafetyStatus::Danger);
}

#[test]
fn test_evaluation_is_repeatable() {
    let data = reference();
    let threshold = Threshold {
        status: RegulatoryStatus::Regulated,
        warning_ratio: 0.5,
        ..Threshold::regulated("nitrate", "WHO", 50.0)
    };

    for value in [0.0, 24.9, 25.0, 49.9, 50.0, 1e6] {
        assert_eq!(evaluate(value, Some(&threshold), true), evaluate(value, Some(&threshold), true));
        assert_eq!(assess(&data, "nitrate", "EU", value), assess(&data, "nitrate", "EU", value));
    }
}

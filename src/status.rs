//! Maps a measured value onto a safety status.

use crate::core::{RegulatoryStatus, SafetyStatus, Threshold, DEFAULT_WARNING_RATIO};
use crate::reference::ReferenceData;

/// Evaluates `value` against a resolved threshold.
///
/// Pure and total: every input maps to exactly one status.
///
/// * No threshold, or a banned substance, is `Danger` regardless of value.
/// * A substance that is not controlled, or has no numeric limit, is `Safe`.
/// * A zero value against a zero limit is `Safe`.
/// * Otherwise the value is compared against the limit and the warning
///   point (`limit * warning_ratio`) in the direction given by
///   `higher_is_bad`.
pub fn evaluate(value: f64, threshold: Option<&Threshold>, higher_is_bad: bool) -> SafetyStatus {
    let threshold = match threshold {
        Some(t) if t.status != RegulatoryStatus::Banned => t,
        _ => return SafetyStatus::Danger,
    };
    let limit = match (threshold.status, threshold.limit_value) {
        (RegulatoryStatus::NotControlled, _) | (_, None) => return SafetyStatus::Safe,
        (_, Some(limit)) => limit,
    };
    let ratio = if threshold.warning_ratio.is_finite() {
        threshold.warning_ratio
    } else {
        DEFAULT_WARNING_RATIO
    };
    let warn_at = limit * ratio;

    if limit == 0.0 && value == 0.0 {
        return SafetyStatus::Safe;
    }

    if higher_is_bad {
        if value >= limit {
            SafetyStatus::Danger
        } else if value >= warn_at {
            SafetyStatus::Warning
        } else {
            SafetyStatus::Safe
        }
    } else if value <= limit {
        SafetyStatus::Danger
    } else if value <= warn_at {
        SafetyStatus::Warning
    } else {
        SafetyStatus::Safe
    }
}

/// The outcome of assessing one value in one jurisdiction.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub status: SafetyStatus,
    /// Jurisdiction whose threshold applied, if any did.
    pub resolved_jurisdiction: Option<String>,
    pub higher_is_bad: bool,
}

/// Resolves the threshold for `(substance_id, jurisdiction_code)` and
/// evaluates `value` against it. Unknown substances are treated as
/// higher-is-bad.
pub fn assess(
    reference: &ReferenceData,
    substance_id: &str,
    jurisdiction_code: &str,
    value: f64,
) -> Assessment {
    let higher_is_bad = reference
        .substance(substance_id)
        .map_or(true, |s| s.higher_is_bad);
    let threshold = reference.resolve(substance_id, jurisdiction_code);
    Assessment {
        status: evaluate(value, threshold, higher_is_bad),
        resolved_jurisdiction: threshold.map(|t| t.jurisdiction_code.clone()),
        higher_is_bad,
    }
}

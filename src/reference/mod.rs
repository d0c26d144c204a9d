//! Regulatory reference data and threshold resolution.
//!
//! Substances, jurisdictions and thresholds are immutable for the lifetime of
//! a [`ReferenceData`] snapshot. Snapshots are validated on construction and
//! swapped as a whole by [`ReferenceStore`].

pub mod store;

pub use store::ReferenceStore;

use crate::core::{Jurisdiction, Substance, Threshold, GLOBAL_JURISDICTION};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Jurisdiction trees are at most this many levels below the global root.
const MAX_JURISDICTION_DEPTH: usize = 2;

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("duplicate substance `{0}`")]
    DuplicateSubstance(String),

    #[error("duplicate jurisdiction `{0}`")]
    DuplicateJurisdiction(String),

    #[error("more than one threshold for substance `{substance_id}` in `{jurisdiction_code}`")]
    DuplicateThreshold {
        substance_id: String,
        jurisdiction_code: String,
    },

    #[error("threshold references unknown substance `{0}`")]
    UnknownSubstance(String),

    #[error("threshold references unknown jurisdiction `{0}`")]
    UnknownJurisdiction(String),

    #[error("jurisdiction `{code}` has unknown parent `{parent}`")]
    UnknownParent { code: String, parent: String },

    #[error("jurisdiction `{0}` is nested too deeply or forms a cycle")]
    HierarchyTooDeep(String),

    #[error("threshold for `{substance_id}` in `{jurisdiction_code}` has non-positive warning ratio {ratio}")]
    InvalidWarningRatio {
        substance_id: String,
        jurisdiction_code: String,
        ratio: f64,
    },

    #[error("failed to read reference data: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse reference data: {0}")]
    Parse(#[from] serde_yml::Error),
}

/// The on-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReferenceDocument {
    #[serde(default)]
    pub substances: Vec<Substance>,
    #[serde(default)]
    pub jurisdictions: Vec<Jurisdiction>,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

/// An immutable, validated snapshot of the regulatory reference data.
#[derive(Debug, Default, Clone)]
pub struct ReferenceData {
    substances: HashMap<String, Substance>,
    jurisdictions: HashMap<String, Jurisdiction>,
    thresholds: HashMap<(String, String), Threshold>,
}

impl ReferenceData {
    /// Builds a snapshot, enforcing key uniqueness and referential integrity.
    pub fn new(
        substances: Vec<Substance>,
        jurisdictions: Vec<Jurisdiction>,
        thresholds: Vec<Threshold>,
    ) -> Result<Self, ReferenceError> {
        let mut substance_map = HashMap::with_capacity(substances.len());
        for substance in substances {
            if substance_map.contains_key(&substance.id) {
                return Err(ReferenceError::DuplicateSubstance(substance.id));
            }
            substance_map.insert(substance.id.clone(), substance);
        }

        let mut jurisdiction_map = HashMap::with_capacity(jurisdictions.len());
        for jurisdiction in jurisdictions {
            if jurisdiction_map.contains_key(&jurisdiction.code) {
                return Err(ReferenceError::DuplicateJurisdiction(jurisdiction.code));
            }
            jurisdiction_map.insert(jurisdiction.code.clone(), jurisdiction);
        }
        Self::check_hierarchy(&jurisdiction_map)?;

        let mut threshold_map = HashMap::with_capacity(thresholds.len());
        for threshold in thresholds {
            if !substance_map.contains_key(&threshold.substance_id) {
                return Err(ReferenceError::UnknownSubstance(threshold.substance_id));
            }
            if !jurisdiction_map.contains_key(&threshold.jurisdiction_code) {
                return Err(ReferenceError::UnknownJurisdiction(threshold.jurisdiction_code));
            }
            if !(threshold.warning_ratio.is_finite() && threshold.warning_ratio > 0.0) {
                return Err(ReferenceError::InvalidWarningRatio {
                    substance_id: threshold.substance_id,
                    jurisdiction_code: threshold.jurisdiction_code,
                    ratio: threshold.warning_ratio,
                });
            }
            let key = (threshold.substance_id.clone(), threshold.jurisdiction_code.clone());
            if threshold_map.contains_key(&key) {
                return Err(ReferenceError::DuplicateThreshold {
                    substance_id: key.0,
                    jurisdiction_code: key.1,
                });
            }
            threshold_map.insert(key, threshold);
        }

        Ok(Self {
            substances: substance_map,
            jurisdictions: jurisdiction_map,
            thresholds: threshold_map,
        })
    }

    /// Parses and validates a YAML reference document.
    pub fn from_yaml_str(content: &str) -> Result<Self, ReferenceError> {
        let doc: ReferenceDocument = serde_yml::from_str(content)?;
        Self::new(doc.substances, doc.jurisdictions, doc.thresholds)
    }

    /// Loads a YAML reference document from disk.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ReferenceError> {
        let path = path.as_ref();
        info!("Loading reference data from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        let data = Self::from_yaml_str(&content)?;
        debug!(
            "Loaded {} substances, {} jurisdictions, {} thresholds",
            data.substances.len(),
            data.jurisdictions.len(),
            data.thresholds.len()
        );
        Ok(data)
    }

    /// Every parent must exist and no chain may exceed the depth limit.
    fn check_hierarchy(jurisdictions: &HashMap<String, Jurisdiction>) -> Result<(), ReferenceError> {
        for jurisdiction in jurisdictions.values() {
            let mut depth = 0;
            let mut current = jurisdiction;
            while let Some(parent_code) = &current.parent_code {
                let parent = jurisdictions.get(parent_code).ok_or_else(|| ReferenceError::UnknownParent {
                    code: current.code.clone(),
                    parent: parent_code.clone(),
                })?;
                depth += 1;
                if depth > MAX_JURISDICTION_DEPTH {
                    return Err(ReferenceError::HierarchyTooDeep(jurisdiction.code.clone()));
                }
                current = parent;
            }
        }
        Ok(())
    }

    pub fn substance(&self, substance_id: &str) -> Option<&Substance> {
        self.substances.get(substance_id)
    }

    pub fn jurisdiction(&self, code: &str) -> Option<&Jurisdiction> {
        self.jurisdictions.get(code)
    }

    /// Exact `(substance, jurisdiction)` lookup with no fallback.
    pub fn threshold(&self, substance_id: &str, jurisdiction_code: &str) -> Option<&Threshold> {
        self.thresholds
            .get(&(substance_id.to_string(), jurisdiction_code.to_string()))
    }

    /// Resolves the applicable threshold: the exact jurisdiction first, then
    /// its parent, then the global default. A miss is not an error.
    pub fn resolve(&self, substance_id: &str, jurisdiction_code: &str) -> Option<&Threshold> {
        if let Some(threshold) = self.threshold(substance_id, jurisdiction_code) {
            return Some(threshold);
        }
        let parent = self
            .jurisdictions
            .get(jurisdiction_code)
            .and_then(|j| j.parent_code.as_deref());
        if let Some(parent_code) = parent {
            if let Some(threshold) = self.threshold(substance_id, parent_code) {
                return Some(threshold);
            }
        }
        self.threshold(substance_id, GLOBAL_JURISDICTION)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.substances.len(), self.jurisdictions.len(), self.thresholds.len())
    }
}

//! Normalization payload
//!
//! The payload stored in `staged_normalized_data.normalized_data` is a tagged
//! progression: each phase composes its sub-record onto the previous ones and
//! never edits them. A phase can only extend the phase directly before it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::models::label::LabelNormalized;
use crate::models::statement::StatementNormalized;
use crate::models::unit::UnitNormalized;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("cannot apply {attempted} to a payload in phase {current}")]
    OutOfOrder {
        current: &'static str,
        attempted: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum NormalizedPayload {
    Staged,
    StatementNormalized {
        statement: StatementNormalized,
    },
    UnitNormalized {
        statement: StatementNormalized,
        unit: UnitNormalized,
    },
    LabelNormalized {
        statement: StatementNormalized,
        unit: UnitNormalized,
        label: LabelNormalized,
    },
}

impl NormalizedPayload {
    pub fn phase(&self) -> &'static str {
        match self {
            NormalizedPayload::Staged => "staged",
            NormalizedPayload::StatementNormalized { .. } => "statement_normalized",
            NormalizedPayload::UnitNormalized { .. } => "unit_normalized",
            NormalizedPayload::LabelNormalized { .. } => "label_normalized",
        }
    }

    pub fn with_statement(self, statement: StatementNormalized) -> Result<Self, PayloadError> {
        match self {
            NormalizedPayload::Staged => Ok(NormalizedPayload::StatementNormalized { statement }),
            other => Err(PayloadError::OutOfOrder {
                current: other.phase(),
                attempted: "statement_normalized",
            }),
        }
    }

    pub fn with_units(self, unit: UnitNormalized) -> Result<Self, PayloadError> {
        match self {
            NormalizedPayload::StatementNormalized { statement } => {
                Ok(NormalizedPayload::UnitNormalized { statement, unit })
            }
            other => Err(PayloadError::OutOfOrder {
                current: other.phase(),
                attempted: "unit_normalized",
            }),
        }
    }

    pub fn with_labels(self, label: LabelNormalized) -> Result<Self, PayloadError> {
        match self {
            NormalizedPayload::UnitNormalized { statement, unit } => {
                Ok(NormalizedPayload::LabelNormalized {
                    statement,
                    unit,
                    label,
                })
            }
            other => Err(PayloadError::OutOfOrder {
                current: other.phase(),
                attempted: "label_normalized",
            }),
        }
    }

    pub fn statement(&self) -> Option<&StatementNormalized> {
        match self {
            NormalizedPayload::Staged => None,
            NormalizedPayload::StatementNormalized { statement }
            | NormalizedPayload::UnitNormalized { statement, .. }
            | NormalizedPayload::LabelNormalized { statement, .. } => Some(statement),
        }
    }

    pub fn unit(&self) -> Option<&UnitNormalized> {
        match self {
            NormalizedPayload::UnitNormalized { unit, .. }
            | NormalizedPayload::LabelNormalized { unit, .. } => Some(unit),
            _ => None,
        }
    }

    pub fn label(&self) -> Option<&LabelNormalized> {
        match self {
            NormalizedPayload::LabelNormalized { label, .. } => Some(label),
            _ => None,
        }
    }

    /// Hex SHA-256 of the canonical JSON encoding
    pub fn content_hash(&self) -> serde_json::Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::statement::{SlotEntry, StatementMetadata, StatementSlot};
    use crate::models::unit::{UnitAnalysis, UnitSource};
    use std::collections::BTreeMap;

    fn statement() -> StatementNormalized {
        let slots = StatementSlot::ALL
            .into_iter()
            .map(|slot| (slot, SlotEntry::NotProvided))
            .collect::<BTreeMap<_, _>>();
        StatementNormalized {
            slots,
            metadata: StatementMetadata::default(),
        }
    }

    fn unit() -> UnitNormalized {
        UnitNormalized {
            source: UnitSource::Empty,
            classifier_version: "1.0".to_string(),
            analysis: UnitAnalysis::empty(),
        }
    }

    #[test]
    fn test_progression_in_order() {
        let payload = NormalizedPayload::Staged
            .with_statement(statement())
            .unwrap()
            .with_units(unit())
            .unwrap()
            .with_labels(LabelNormalized::new("1.0"))
            .unwrap();

        assert_eq!(payload.phase(), "label_normalized");
        assert!(payload.statement().is_some());
        assert!(payload.unit().is_some());
        assert!(payload.label().is_some());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let err = NormalizedPayload::Staged.with_units(unit()).unwrap_err();
        assert_eq!(
            err,
            PayloadError::OutOfOrder {
                current: "staged",
                attempted: "unit_normalized"
            }
        );

        let normalized = NormalizedPayload::Staged.with_statement(statement()).unwrap();
        assert!(normalized.clone().with_statement(statement()).is_err());
        assert!(normalized.with_labels(LabelNormalized::new("1.0")).is_err());
    }

    #[test]
    fn test_phase_tag_serialized() {
        let json = serde_json::to_value(NormalizedPayload::Staged).unwrap();
        assert_eq!(json["phase"], "staged");
    }

    #[test]
    fn test_content_hash_is_stable_and_content_sensitive() {
        let a = NormalizedPayload::Staged.with_statement(statement()).unwrap();
        let b = NormalizedPayload::Staged.with_statement(statement()).unwrap();
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
        assert_eq!(a.content_hash().unwrap().len(), 64);
        assert_ne!(
            a.content_hash().unwrap(),
            NormalizedPayload::Staged.content_hash().unwrap()
        );
    }
}

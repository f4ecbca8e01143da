//! Label mapping cache rows and the canonical label-normalized payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::models::statement::{Scope, StatementKind, StatementSlot};
use crate::models::unit::Representation;

/// Document-level label phase flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabelReviewStatus {
    Pending,
    PendingReview,
    Approved,
}

impl LabelReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelReviewStatus::Pending => "PENDING",
            LabelReviewStatus::PendingReview => "PENDING_REVIEW",
            LabelReviewStatus::Approved => "APPROVED",
        }
    }
}

impl FromStr for LabelReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(LabelReviewStatus::Pending),
            "PENDING_REVIEW" => Ok(LabelReviewStatus::PendingReview),
            "APPROVED" => Ok(LabelReviewStatus::Approved),
            other => Err(format!("unknown label review status '{}'", other)),
        }
    }
}

impl fmt::Display for LabelReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingStatus {
    PendingReview,
    Approved,
    Rejected,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::PendingReview => "PENDING_REVIEW",
            MappingStatus::Approved => "APPROVED",
            MappingStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for MappingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_REVIEW" => Ok(MappingStatus::PendingReview),
            "APPROVED" => Ok(MappingStatus::Approved),
            "REJECTED" => Ok(MappingStatus::Rejected),
            other => Err(format!("unknown mapping status '{}'", other)),
        }
    }
}

/// Provenance recorded with a newly discovered label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContext {
    pub doc_id: i64,
    pub ticker: String,
    /// Taxonomy statement key the vocabulary came from
    pub statement_key: String,
    pub statement_slot: StatementSlot,
    #[serde(default)]
    pub statement_currency: Option<String>,
    pub classifier_version: String,
}

/// One row of `label_mapping_cache`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelMapping {
    pub raw_label: String,
    pub domain_category: String,
    /// `None` is a legitimate "no confident match" outcome
    pub normalized_label: Option<String>,
    pub status: MappingStatus,
    pub source_context: Option<SourceContext>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_reviewed_at: Option<DateTime<Utc>>,
    pub reviewed_by: Option<String>,
}

/// A canonical fact with its original provenance flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFigure {
    pub value: Option<f64>,
    pub representation: Option<Representation>,
    #[serde(default)]
    pub currency_context: Option<String>,
    #[serde(default)]
    pub ratio_context: Option<String>,
    pub raw_label: String,
    #[serde(default)]
    pub suspect: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspect_reason: Option<String>,
}

pub type CanonicalStatement = BTreeMap<String, CanonicalFigure>;

/// Label phase sub-record: the final two-section canonical map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelNormalized {
    pub standalone: BTreeMap<StatementKind, CanonicalStatement>,
    pub consolidated: BTreeMap<StatementKind, CanonicalStatement>,
    pub classifier_version: String,
}

impl LabelNormalized {
    pub fn new(classifier_version: &str) -> Self {
        Self {
            classifier_version: classifier_version.to_string(),
            ..Default::default()
        }
    }

    pub fn statement(&self, slot: StatementSlot) -> Option<&CanonicalStatement> {
        self.section(slot.scope()).get(&slot.kind())
    }

    pub fn statement_mut(&mut self, slot: StatementSlot) -> &mut CanonicalStatement {
        let section = match slot.scope() {
            Scope::Standalone => &mut self.standalone,
            Scope::Consolidated => &mut self.consolidated,
        };
        section.entry(slot.kind()).or_default()
    }

    fn section(&self, scope: Scope) -> &BTreeMap<StatementKind, CanonicalStatement> {
        match scope {
            Scope::Standalone => &self.standalone,
            Scope::Consolidated => &self.consolidated,
        }
    }
}

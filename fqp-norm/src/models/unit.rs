//! Unit classification records
//!
//! `UnitAnalysis` mirrors the oracle's response shape. Reviewer corrections
//! are applied to a copy so the original analysis stays available for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reasoning stamped on figures a reviewer corrected
pub const HUMAN_CORRECTED_REASONING: &str = "Human reviewed and corrected";

/// Document-level unit phase flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitReviewStatus {
    Pending,
    AutoApproved,
    PendingReview,
    Approved,
}

impl UnitReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitReviewStatus::Pending => "PENDING",
            UnitReviewStatus::AutoApproved => "AUTO_APPROVED",
            UnitReviewStatus::PendingReview => "PENDING_REVIEW",
            UnitReviewStatus::Approved => "APPROVED",
        }
    }

    /// Label discovery may start only from these states
    pub fn is_settled(&self) -> bool {
        matches!(self, UnitReviewStatus::AutoApproved | UnitReviewStatus::Approved)
    }
}

impl FromStr for UnitReviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(UnitReviewStatus::Pending),
            "AUTO_APPROVED" => Ok(UnitReviewStatus::AutoApproved),
            "PENDING_REVIEW" => Ok(UnitReviewStatus::PendingReview),
            "APPROVED" => Ok(UnitReviewStatus::Approved),
            other => Err(format!("unknown unit review status '{}'", other)),
        }
    }
}

impl fmt::Display for UnitReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Representation {
    Currency,
    Percentage,
    Ratio,
    Count,
}

/// Oracle classification of a single figure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureUnit {
    pub label: String,
    #[serde(default)]
    pub value: Option<f64>,
    pub representation: Representation,
    #[serde(default)]
    pub currency_context: Option<String>,
    #[serde(default)]
    pub ratio_context: Option<String>,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Per-statement classification; `statement_type` echoes the slot name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementUnitAnalysis {
    pub statement_type: String,
    #[serde(default)]
    pub statement_currency: Option<String>,
    pub figures: Vec<FigureUnit>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilingAnalysis {
    #[serde(default)]
    pub requires_human_review: bool,
    #[serde(default)]
    pub overall_confidence: Option<Confidence>,
    #[serde(default)]
    pub currency_contexts_found: Vec<String>,
}

/// Full unit analysis of one filing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitAnalysis {
    pub filing_analysis: FilingAnalysis,
    pub statement_analyses: Vec<StatementUnitAnalysis>,
}

impl UnitAnalysis {
    /// Analysis for a filing with nothing to classify
    pub fn empty() -> Self {
        Self {
            filing_analysis: FilingAnalysis {
                requires_human_review: false,
                overall_confidence: Some(Confidence::High),
                currency_contexts_found: Vec::new(),
            },
            statement_analyses: Vec::new(),
        }
    }

    pub fn total_figures(&self) -> usize {
        self.statement_analyses.iter().map(|s| s.figures.len()).sum()
    }

    pub fn low_confidence_figures(&self) -> Vec<SuspiciousFigure> {
        self.statement_analyses
            .iter()
            .flat_map(|statement| {
                statement
                    .figures
                    .iter()
                    .filter(|figure| figure.confidence == Confidence::Low)
                    .map(move |figure| SuspiciousFigure {
                        statement_type: statement.statement_type.clone(),
                        statement_currency: statement.statement_currency.clone(),
                        figure: figure.clone(),
                    })
            })
            .collect()
    }

    /// Review is needed for any low-confidence figure or a filing-level request
    pub fn requires_review(&self) -> bool {
        self.filing_analysis.requires_human_review
            || self
                .statement_analyses
                .iter()
                .flat_map(|s| s.figures.iter())
                .any(|f| f.confidence == Confidence::Low)
    }

    /// Copy of this analysis with reviewer corrections applied
    ///
    /// A correction without `statement_type` applies to every statement
    /// carrying that label. Returns the number of figures touched.
    pub fn with_corrections(&self, corrections: &[FigureCorrection]) -> (Self, usize) {
        let mut corrected = self.clone();
        let mut touched = 0;

        for correction in corrections {
            let wanted = correction.label.trim();
            for statement in corrected.statement_analyses.iter_mut() {
                if let Some(ref statement_type) = correction.statement_type {
                    if statement.statement_type.trim() != statement_type.trim() {
                        continue;
                    }
                }
                for figure in statement
                    .figures
                    .iter_mut()
                    .filter(|f| f.label.trim() == wanted)
                {
                    if let Some(representation) = correction.representation {
                        figure.representation = representation;
                    }
                    figure.currency_context = correction.currency_context.clone();
                    figure.ratio_context = correction.ratio_context.clone();
                    figure.confidence = Confidence::High;
                    figure.reasoning = Some(HUMAN_CORRECTED_REASONING.to_string());
                    touched += 1;
                }
            }
        }

        corrected.filing_analysis.requires_human_review = false;
        (corrected, touched)
    }
}

/// Low-confidence figure copied into the review queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousFigure {
    pub statement_type: String,
    #[serde(default)]
    pub statement_currency: Option<String>,
    pub figure: FigureUnit,
}

/// Reviewer-facing subset stored in `unit_review_queue.filing_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilingReviewData {
    pub suspicious_figures: Vec<SuspiciousFigure>,
    pub total_figures_analyzed: usize,
    pub low_confidence_count: usize,
    pub requires_human_review: bool,
}

impl FilingReviewData {
    pub fn from_analysis(analysis: &UnitAnalysis) -> Self {
        let suspicious_figures = analysis.low_confidence_figures();
        Self {
            low_confidence_count: suspicious_figures.len(),
            suspicious_figures,
            total_figures_analyzed: analysis.total_figures(),
            requires_human_review: analysis.filing_analysis.requires_human_review,
        }
    }
}

/// A reviewer's correction of one figure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureCorrection {
    #[serde(default)]
    pub statement_type: Option<String>,
    pub label: String,
    #[serde(default)]
    pub representation: Option<Representation>,
    #[serde(default)]
    pub currency_context: Option<String>,
    #[serde(default)]
    pub ratio_context: Option<String>,
}

/// Where the unit analysis in a payload came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitSource {
    Oracle,
    Empty,
    HumanReview { review_id: i64 },
}

/// Unit phase sub-record of the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitNormalized {
    pub source: UnitSource,
    pub classifier_version: String,
    pub analysis: UnitAnalysis,
}

/// Status of a unit review queue row, set by the review actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewQueueStatus {
    PendingReview,
    Approved,
    Rejected,
}

impl ReviewQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewQueueStatus::PendingReview => "PENDING_REVIEW",
            ReviewQueueStatus::Approved => "APPROVED",
            ReviewQueueStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ReviewQueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_REVIEW" => Ok(ReviewQueueStatus::PendingReview),
            "APPROVED" => Ok(ReviewQueueStatus::Approved),
            "REJECTED" => Ok(ReviewQueueStatus::Rejected),
            other => Err(format!("unknown review queue status '{}'", other)),
        }
    }
}

/// One row of `unit_review_queue`
#[derive(Debug, Clone, Serialize)]
pub struct UnitReviewRow {
    pub id: i64,
    pub doc_id: i64,
    pub ticker: String,
    pub fiscal_date: String,
    pub analysis: UnitAnalysis,
    pub filing_data: FilingReviewData,
    pub status: ReviewQueueStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub human_corrections: Option<Vec<FigureCorrection>>,
    pub applied_at: Option<DateTime<Utc>>,
}

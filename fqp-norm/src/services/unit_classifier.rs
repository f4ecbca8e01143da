//! Unit classification (discovery and application)
//!
//! Discovery sends every figure of a document to the oracle in one request
//! and either merges the result directly (all figures high confidence) or
//! parks the document in the unit review queue. Application merges reviewed
//! analyses once a human has approved them.

use fqp_common::Result;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::db::{failures, staged, unit_reviews, Phase};
use crate::models::{
    FilingReviewData, NormalizedPayload, ReviewQueueStatus, StatementNormalized, UnitAnalysis,
    UnitNormalized, UnitReviewStatus, UnitSource,
};
use crate::services::oracle_client::{
    OracleError, UnitDiscoveryRequest, UnitFigureInput, UnitStatementInput,
};
use crate::services::{DocumentOutcome, PipelineContext};
use crate::utils::retry_on_lock;

/// Build the single per-document oracle request
///
/// Statements are keyed by slot name so the response can be matched back.
pub fn build_unit_request(statement: &StatementNormalized) -> UnitDiscoveryRequest {
    let statements = statement
        .provided()
        .filter(|(_, raw)| !raw.figures.is_empty())
        .map(|(slot, raw)| UnitStatementInput {
            statement_type: slot.as_str().to_string(),
            currency: raw.currency.clone(),
            figures: raw
                .figures
                .iter()
                .map(|figure| UnitFigureInput {
                    label: figure.label.trim().to_string(),
                    value: figure.value,
                })
                .collect(),
        })
        .collect();

    UnitDiscoveryRequest { statements }
}

impl UnitDiscoveryRequest {
    pub fn figure_count(&self) -> usize {
        self.statements.iter().map(|s| s.figures.len()).sum()
    }
}

#[derive(Clone)]
pub struct UnitClassifier {
    ctx: PipelineContext,
    classifier_version: String,
}

impl UnitClassifier {
    pub fn new(ctx: PipelineContext, classifier_version: impl Into<String>) -> Self {
        Self {
            ctx,
            classifier_version: classifier_version.into(),
        }
    }

    fn pool(&self) -> &SqlitePool {
        &self.ctx.pool
    }

    pub async fn pending_discovery(&self) -> Result<Vec<i64>> {
        staged::pending_unit_discovery_ids(self.pool(), &self.classifier_version).await
    }

    pub async fn pending_application(&self) -> Result<Vec<i64>> {
        unit_reviews::approved_unapplied_ids(self.pool()).await
    }

    /// Classify the units of one statement-normalized document
    pub async fn discover_document(&self, doc_id: i64) -> Result<DocumentOutcome> {
        let Some(record) = staged::load_staged(self.pool(), doc_id).await? else {
            return Ok(DocumentOutcome::Skipped);
        };
        if !record.statement_normalized || record.unit_review_status != UnitReviewStatus::Pending {
            return Ok(DocumentOutcome::Skipped);
        }
        let Some(statement) = record.payload.statement() else {
            error!(doc_id, phase = record.payload.phase(), "Statement-normalized flag set without statement payload");
            return Ok(DocumentOutcome::Failed);
        };

        if let Some(detail) =
            failures::active(self.pool(), doc_id, Phase::Unit, &self.classifier_version).await?
        {
            debug!(doc_id, detail = %detail, "Unit discovery blocked by recorded failure");
            return Ok(DocumentOutcome::Skipped);
        }

        let request = build_unit_request(statement);
        if request.figure_count() == 0 {
            info!(doc_id, "No figures to classify, auto-approving");
            let unit = UnitNormalized {
                source: UnitSource::Empty,
                classifier_version: self.classifier_version.clone(),
                analysis: UnitAnalysis::empty(),
            };
            return self.auto_approve(doc_id, record.payload, unit).await;
        }

        let Some(oracle) = self.ctx.oracle.clone() else {
            debug!(doc_id, "Oracle disabled, unit discovery skipped");
            return Ok(DocumentOutcome::Skipped);
        };

        let figures = request.figure_count();
        let response = self
            .ctx
            .backoff
            .retry("classify_units", &self.ctx.cancel, || oracle.classify_units(&request))
            .await;

        let analysis = match response {
            Ok(analysis) => analysis,
            Err(OracleError::Malformed(detail)) => {
                error!(doc_id, detail = %detail, "Oracle returned a malformed unit analysis");
                failures::record(
                    self.pool(),
                    doc_id,
                    Phase::Unit,
                    &self.classifier_version,
                    &detail,
                )
                .await?;
                return Ok(DocumentOutcome::Failed);
            }
            Err(e) => {
                warn!(doc_id, error = %e, "Unit discovery deferred, status unchanged");
                return Ok(DocumentOutcome::Deferred);
            }
        };

        if analysis.requires_review() {
            let review = FilingReviewData::from_analysis(&analysis);
            info!(
                doc_id,
                ticker = %record.ticker,
                figures,
                low_confidence = review.low_confidence_count,
                filing_flag = review.requires_human_review,
                "Unit analysis queued for review"
            );
            let queued = retry_on_lock("queue_unit_review", self.ctx.max_lock_wait_ms, || {
                self.queue_review(doc_id, &record.ticker, &record.fiscal_date, &analysis, &review)
            })
            .await?;
            return Ok(if queued {
                DocumentOutcome::Advanced
            } else {
                DocumentOutcome::Skipped
            });
        }

        info!(doc_id, ticker = %record.ticker, figures, "Unit analysis auto-approved");
        let unit = UnitNormalized {
            source: UnitSource::Oracle,
            classifier_version: self.classifier_version.clone(),
            analysis,
        };
        self.auto_approve(doc_id, record.payload, unit).await
    }

    async fn auto_approve(
        &self,
        doc_id: i64,
        payload: NormalizedPayload,
        unit: UnitNormalized,
    ) -> Result<DocumentOutcome> {
        let payload = match payload.with_units(unit) {
            Ok(payload) => payload,
            Err(e) => {
                error!(doc_id, error = %e, "Cannot attach unit analysis");
                return Ok(DocumentOutcome::Failed);
            }
        };

        let updated = retry_on_lock("auto_approve_units", self.ctx.max_lock_wait_ms, || {
            self.commit_units(
                doc_id,
                UnitReviewStatus::Pending,
                UnitReviewStatus::AutoApproved,
                &payload,
                None,
            )
        })
        .await?;

        Ok(if updated {
            DocumentOutcome::Advanced
        } else {
            DocumentOutcome::Skipped
        })
    }

    async fn queue_review(
        &self,
        doc_id: i64,
        ticker: &str,
        fiscal_date: &str,
        analysis: &UnitAnalysis,
        review: &FilingReviewData,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let moved = staged::transition_unit(
            &mut tx,
            doc_id,
            UnitReviewStatus::Pending,
            UnitReviewStatus::PendingReview,
            None,
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Ok(false);
        }
        unit_reviews::insert(&mut tx, doc_id, ticker, fiscal_date, analysis, review).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Merge one approved review into its document's payload
    pub async fn apply_review(&self, review_id: i64) -> Result<DocumentOutcome> {
        let Some(review) = unit_reviews::load(self.pool(), review_id).await? else {
            return Ok(DocumentOutcome::Skipped);
        };
        if review.status != ReviewQueueStatus::Approved || review.applied_at.is_some() {
            return Ok(DocumentOutcome::Skipped);
        }

        let Some(record) = staged::load_staged(self.pool(), review.doc_id).await? else {
            warn!(review_id, doc_id = review.doc_id, "Approved review has no staging record");
            return Ok(DocumentOutcome::Skipped);
        };
        if record.unit_review_status != UnitReviewStatus::PendingReview {
            warn!(
                review_id,
                doc_id = review.doc_id,
                status = %record.unit_review_status,
                "Document is not awaiting unit review"
            );
            return Ok(DocumentOutcome::Skipped);
        }

        let analysis = match review.human_corrections.as_deref() {
            Some(corrections) if !corrections.is_empty() => {
                let (corrected, touched) = review.analysis.with_corrections(corrections);
                if touched < corrections.len() {
                    warn!(
                        review_id,
                        corrections = corrections.len(),
                        touched,
                        "Some corrections matched no figure"
                    );
                }
                corrected
            }
            _ => review.analysis.clone(),
        };

        let unit = UnitNormalized {
            source: UnitSource::HumanReview { review_id },
            classifier_version: self.classifier_version.clone(),
            analysis,
        };
        let payload = match record.payload.with_units(unit) {
            Ok(payload) => payload,
            Err(e) => {
                error!(doc_id = review.doc_id, error = %e, "Cannot attach reviewed unit analysis");
                return Ok(DocumentOutcome::Failed);
            }
        };

        let updated = retry_on_lock("apply_unit_review", self.ctx.max_lock_wait_ms, || {
            self.commit_units(
                review.doc_id,
                UnitReviewStatus::PendingReview,
                UnitReviewStatus::Approved,
                &payload,
                Some(review_id),
            )
        })
        .await?;

        if updated {
            info!(review_id, doc_id = review.doc_id, "Reviewed unit analysis applied");
            Ok(DocumentOutcome::Advanced)
        } else {
            Ok(DocumentOutcome::Skipped)
        }
    }

    async fn commit_units(
        &self,
        doc_id: i64,
        from: UnitReviewStatus,
        to: UnitReviewStatus,
        payload: &NormalizedPayload,
        applied_review: Option<i64>,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        if !staged::transition_unit(&mut tx, doc_id, from, to, Some(payload)).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(review_id) = applied_review {
            unit_reviews::mark_applied(&mut tx, review_id).await?;
        }
        tx.commit().await?;
        Ok(true)
    }
}

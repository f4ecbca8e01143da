//! Label mapping (discovery and application)
//!
//! Discovery works per statement because each statement kind has its own
//! target vocabulary. Only labels missing from the `(raw_label,
//! domain_category)` cache are sent to the oracle; a label classified once
//! for a domain category is never sent again.
//!
//! Application is all-or-nothing per document: every distinct raw label must
//! have an `APPROVED` cache entry before the canonical map is built.

use fqp_common::Result;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::{documents, failures, label_cache, staged, Phase};
use crate::models::{
    CanonicalFigure, LabelMapping, LabelNormalized, LabelReviewStatus, MappingStatus,
    NormalizedPayload, SourceContext, StatementKind, StatementNormalized, StatementSlot,
    StatementUnitAnalysis, UnitNormalized,
};
use crate::services::oracle_client::{LabelDiscoveryRequest, OracleError};
use crate::services::taxonomy::{Playbook, PlaybookRegistry};
use crate::services::{DocumentOutcome, PipelineContext};
use crate::utils::retry_on_lock;

const INDIRECT_CASH_FLOW_MARKERS: [&str; 4] = [
    "profit before",
    "extraordinary",
    "adjustments",
    "working capital",
];
const DIRECT_CASH_FLOW_MARKERS: [&str; 2] = ["receipts from", "payments to"];

/// Taxonomy statement key for a slot
///
/// Cash-flow statements come in two presentations with different
/// vocabularies; the labels decide which one applies.
pub fn statement_key_for<S: AsRef<str>>(slot: StatementSlot, labels: &[S]) -> &'static str {
    match slot.kind() {
        StatementKind::Pnl => "pnl",
        StatementKind::BalanceSheet => "balance_sheet",
        StatementKind::CashFlow => {
            let lowered: Vec<String> = labels.iter().map(|l| l.as_ref().to_lowercase()).collect();
            let mentions = |markers: &[&str]| {
                lowered
                    .iter()
                    .any(|label| markers.iter().any(|m| label.contains(m)))
            };

            if mentions(&INDIRECT_CASH_FLOW_MARKERS) {
                "cash_flow_indirect"
            } else if mentions(&DIRECT_CASH_FLOW_MARKERS) {
                "cash_flow_direct"
            } else {
                "cash_flow_indirect"
            }
        }
    }
}

/// One statement of a document that has a vocabulary to map against
struct StatementPlan<'a> {
    slot: StatementSlot,
    statement_key: &'static str,
    analysis: &'a StatementUnitAnalysis,
    /// Distinct trimmed labels in first-seen order
    labels: Vec<String>,
    vocabulary: Vec<String>,
    currency: Option<String>,
}

fn distinct_labels(analysis: &StatementUnitAnalysis) -> Vec<String> {
    let mut seen = HashSet::new();
    analysis
        .figures
        .iter()
        .map(|f| f.label.trim())
        .filter(|label| !label.is_empty() && seen.insert(*label))
        .map(str::to_string)
        .collect()
}

/// Statements that can be mapped; the rest are logged and left out
fn plan_statements<'a>(
    doc_id: i64,
    unit: &'a UnitNormalized,
    statement: &StatementNormalized,
    playbook: &Playbook,
) -> Vec<StatementPlan<'a>> {
    let mut plans = Vec::new();

    for analysis in &unit.analysis.statement_analyses {
        let Some(slot) = StatementSlot::parse(&analysis.statement_type) else {
            warn!(
                doc_id,
                statement = %analysis.statement_type,
                "Unit analysis statement does not name a slot, skipping"
            );
            continue;
        };

        let labels = distinct_labels(analysis);
        let statement_key = statement_key_for(slot, &labels);
        let Some(vocabulary) = playbook.vocabulary(statement_key) else {
            warn!(
                doc_id,
                statement = %slot,
                statement_key,
                domain_category = %playbook.domain_category,
                "No vocabulary for statement, skipping"
            );
            continue;
        };

        let currency = analysis
            .statement_currency
            .clone()
            .or_else(|| statement.slot(slot).and_then(|s| s.currency.clone()));

        plans.push(StatementPlan {
            slot,
            statement_key,
            analysis,
            labels,
            vocabulary,
            currency,
        });
    }

    plans
}

fn all_labels(plans: &[StatementPlan<'_>]) -> Vec<String> {
    let mut seen = HashSet::new();
    plans
        .iter()
        .flat_map(|p| p.labels.iter())
        .filter(|label| seen.insert(label.as_str()))
        .cloned()
        .collect()
}

/// A discovered pair waiting to be written to the cache
struct Suggestion {
    raw_label: String,
    normalized_label: Option<String>,
    context: SourceContext,
}

#[derive(Clone)]
pub struct LabelMapper {
    ctx: PipelineContext,
    registry: Arc<PlaybookRegistry>,
    classifier_version: String,
}

impl LabelMapper {
    pub fn new(
        ctx: PipelineContext,
        registry: Arc<PlaybookRegistry>,
        classifier_version: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            registry,
            classifier_version: classifier_version.into(),
        }
    }

    fn pool(&self) -> &SqlitePool {
        &self.ctx.pool
    }

    pub async fn pending_discovery(&self) -> Result<Vec<i64>> {
        staged::pending_label_discovery_ids(self.pool(), &self.classifier_version).await
    }

    pub async fn pending_application(&self) -> Result<Vec<i64>> {
        staged::pending_label_application_ids(self.pool()).await
    }

    /// Domain category and playbook for a ticker, if both exist
    async fn taxonomy_for(&self, doc_id: i64, ticker: &str) -> Result<Option<(String, Arc<Playbook>)>> {
        let Some(domain_category) = documents::domain_category_for(self.pool(), ticker).await?
        else {
            warn!(doc_id, ticker, "No company context for ticker, skipping");
            return Ok(None);
        };

        match self.registry.playbook_for(&domain_category) {
            Some(playbook) => Ok(Some((domain_category, playbook))),
            None => {
                warn!(doc_id, ticker, domain_category = %domain_category, "No taxonomy for domain category, skipping");
                Ok(None)
            }
        }
    }

    /// Discover mappings for the uncached labels of one document
    pub async fn discover_document(&self, doc_id: i64) -> Result<DocumentOutcome> {
        let Some(record) = staged::load_staged(self.pool(), doc_id).await? else {
            return Ok(DocumentOutcome::Skipped);
        };
        if !record.unit_review_status.is_settled()
            || record.label_review_status != LabelReviewStatus::Pending
        {
            return Ok(DocumentOutcome::Skipped);
        }
        let (Some(statement), Some(unit)) = (record.payload.statement(), record.payload.unit())
        else {
            error!(doc_id, phase = record.payload.phase(), "Units settled without unit payload");
            return Ok(DocumentOutcome::Failed);
        };

        if let Some(detail) =
            failures::active(self.pool(), doc_id, Phase::Label, &self.classifier_version).await?
        {
            debug!(doc_id, detail = %detail, "Label discovery blocked by recorded failure");
            return Ok(DocumentOutcome::Skipped);
        }

        let Some((domain_category, playbook)) = self.taxonomy_for(doc_id, &record.ticker).await?
        else {
            return Ok(DocumentOutcome::Skipped);
        };

        let plans = plan_statements(doc_id, unit, statement, &playbook);
        let cached = label_cache::lookup(self.pool(), &domain_category, &all_labels(&plans)).await?;

        let mut requested: HashSet<String> = HashSet::new();
        let mut suggestions: Vec<Suggestion> = Vec::new();
        let mut complete = true;

        for plan in &plans {
            let new_labels: Vec<String> = plan
                .labels
                .iter()
                .filter(|l| !cached.contains_key(*l) && !requested.contains(*l))
                .cloned()
                .collect();

            if new_labels.is_empty() {
                debug!(doc_id, statement = %plan.slot, "All labels cached, no oracle call");
                continue;
            }

            let Some(oracle) = self.ctx.oracle.clone() else {
                debug!(doc_id, "Oracle disabled, label discovery skipped");
                return Ok(DocumentOutcome::Skipped);
            };

            let request = LabelDiscoveryRequest {
                domain_category: domain_category.clone(),
                statement_key: plan.statement_key.to_string(),
                standard_names: plan.vocabulary.clone(),
                raw_labels: new_labels,
                statement_currency: plan.currency.clone(),
            };

            let response = self
                .ctx
                .backoff
                .retry("map_labels", &self.ctx.cancel, || oracle.map_labels(&request))
                .await;

            let mut mapped = match response {
                Ok(mapped) => mapped,
                Err(OracleError::Malformed(detail)) => {
                    error!(doc_id, statement = %plan.slot, detail = %detail, "Oracle returned a malformed label mapping");
                    failures::record(
                        self.pool(),
                        doc_id,
                        Phase::Label,
                        &self.classifier_version,
                        &detail,
                    )
                    .await?;
                    return Ok(DocumentOutcome::Failed);
                }
                Err(e) => {
                    warn!(doc_id, statement = %plan.slot, error = %e, "Label discovery deferred, status unchanged");
                    self.save_partial(doc_id, &domain_category, &suggestions).await?;
                    return Ok(DocumentOutcome::Deferred);
                }
            };

            let context = SourceContext {
                doc_id,
                ticker: record.ticker.clone(),
                statement_key: plan.statement_key.to_string(),
                statement_slot: plan.slot,
                statement_currency: plan.currency.clone(),
                classifier_version: self.classifier_version.clone(),
            };

            for raw_label in &request.raw_labels {
                requested.insert(raw_label.clone());
                match mapped.remove(raw_label) {
                    Some(normalized_label) => suggestions.push(Suggestion {
                        raw_label: raw_label.clone(),
                        normalized_label,
                        context: context.clone(),
                    }),
                    None => {
                        warn!(doc_id, statement = %plan.slot, raw_label = %raw_label, "Label missing from oracle response");
                        complete = false;
                    }
                }
            }
            for unexpected in mapped.keys() {
                warn!(doc_id, statement = %plan.slot, raw_label = %unexpected, "Oracle mapped a label that was not requested, ignoring");
            }
        }

        if !complete {
            self.save_partial(doc_id, &domain_category, &suggestions).await?;
            return Ok(DocumentOutcome::Deferred);
        }

        let moved = retry_on_lock("commit_label_discovery", self.ctx.max_lock_wait_ms, || {
            self.commit_discovery(doc_id, &domain_category, &suggestions)
        })
        .await?;

        if moved {
            info!(
                doc_id,
                ticker = %record.ticker,
                statements = plans.len(),
                new_labels = suggestions.len(),
                "Label discovery complete, awaiting review"
            );
            Ok(DocumentOutcome::Advanced)
        } else {
            Ok(DocumentOutcome::Skipped)
        }
    }

    /// Keep what was learned before a deferral so the next sweep asks less
    async fn save_partial(
        &self,
        doc_id: i64,
        domain_category: &str,
        suggestions: &[Suggestion],
    ) -> Result<()> {
        if suggestions.is_empty() {
            return Ok(());
        }
        retry_on_lock("save_label_suggestions", self.ctx.max_lock_wait_ms, || {
            self.commit_suggestions(domain_category, suggestions)
        })
        .await?;
        debug!(doc_id, saved = suggestions.len(), "Saved partial label suggestions");
        Ok(())
    }

    async fn commit_suggestions(&self, domain_category: &str, suggestions: &[Suggestion]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        upsert_all(&mut tx, domain_category, suggestions).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_discovery(
        &self,
        doc_id: i64,
        domain_category: &str,
        suggestions: &[Suggestion],
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        upsert_all(&mut tx, domain_category, suggestions).await?;
        let moved = staged::transition_label(
            &mut tx,
            doc_id,
            LabelReviewStatus::Pending,
            LabelReviewStatus::PendingReview,
            None,
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Ok(false);
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Build the canonical map once every label of the document is approved
    pub async fn apply_document(&self, doc_id: i64) -> Result<DocumentOutcome> {
        let Some(record) = staged::load_staged(self.pool(), doc_id).await? else {
            return Ok(DocumentOutcome::Skipped);
        };
        if record.label_review_status != LabelReviewStatus::PendingReview {
            return Ok(DocumentOutcome::Skipped);
        }
        let (Some(statement), Some(unit)) = (record.payload.statement(), record.payload.unit())
        else {
            error!(doc_id, phase = record.payload.phase(), "Label review pending without unit payload");
            return Ok(DocumentOutcome::Failed);
        };

        let Some((domain_category, playbook)) = self.taxonomy_for(doc_id, &record.ticker).await?
        else {
            return Ok(DocumentOutcome::Skipped);
        };

        let plans = plan_statements(doc_id, unit, statement, &playbook);
        let labels = all_labels(&plans);

        let outcome = retry_on_lock("apply_labels", self.ctx.max_lock_wait_ms, || {
            self.commit_application(doc_id, &record.payload, statement, &plans, &domain_category, &labels)
        })
        .await?;

        if outcome == DocumentOutcome::Advanced {
            info!(doc_id, ticker = %record.ticker, labels = labels.len(), "Canonical labels applied");
        }
        Ok(outcome)
    }

    /// Read the cache statuses, build the map and move the document in one transaction
    ///
    /// A reviewer decision committed after the read makes the final write
    /// fail on the stale snapshot, so the whole attempt is retried.
    async fn commit_application(
        &self,
        doc_id: i64,
        current: &NormalizedPayload,
        statement: &StatementNormalized,
        plans: &[StatementPlan<'_>],
        domain_category: &str,
        labels: &[String],
    ) -> Result<DocumentOutcome> {
        let mut tx = self.pool().begin().await?;
        let cached = label_cache::lookup(&mut *tx, domain_category, labels).await?;

        let blocking = labels
            .iter()
            .filter(|label| {
                cached
                    .get(*label)
                    .map_or(true, |m| m.status != MappingStatus::Approved)
            })
            .count();
        if blocking > 0 {
            tx.rollback().await?;
            debug!(doc_id, labels = labels.len(), blocking, "Labels not yet approved, application blocked");
            return Ok(DocumentOutcome::Skipped);
        }

        let label = build_canonical_map(doc_id, plans, statement, &cached, &self.classifier_version);
        let payload = match current.clone().with_labels(label) {
            Ok(payload) => payload,
            Err(e) => {
                tx.rollback().await?;
                error!(doc_id, error = %e, "Cannot attach canonical labels");
                return Ok(DocumentOutcome::Failed);
            }
        };

        let moved = staged::transition_label(
            &mut tx,
            doc_id,
            LabelReviewStatus::PendingReview,
            LabelReviewStatus::Approved,
            Some(&payload),
        )
        .await?;
        if !moved {
            tx.rollback().await?;
            return Ok(DocumentOutcome::Skipped);
        }
        tx.commit().await?;
        Ok(DocumentOutcome::Advanced)
    }
}

async fn upsert_all(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    domain_category: &str,
    suggestions: &[Suggestion],
) -> Result<()> {
    for s in suggestions {
        label_cache::upsert_pending(
            tx,
            &s.raw_label,
            domain_category,
            s.normalized_label.as_deref(),
            &s.context,
        )
        .await?;
    }
    Ok(())
}

fn build_canonical_map(
    doc_id: i64,
    plans: &[StatementPlan<'_>],
    statement: &StatementNormalized,
    cached: &HashMap<String, LabelMapping>,
    classifier_version: &str,
) -> LabelNormalized {
    let mut label = LabelNormalized::new(classifier_version);

    for plan in plans {
        let canonical = label.statement_mut(plan.slot);
        for figure in &plan.analysis.figures {
            let raw_label = figure.label.trim();
            let Some(id) = cached
                .get(raw_label)
                .and_then(|m| m.normalized_label.as_deref())
            else {
                continue;
            };

            if let Some(existing) = canonical.get(id) {
                warn!(
                    doc_id,
                    statement = %plan.slot,
                    canonical_id = id,
                    kept = %existing.raw_label,
                    dropped = raw_label,
                    "Two labels map to one canonical id, keeping the first"
                );
                continue;
            }

            let raw = statement.raw_figure(plan.slot, raw_label);
            canonical.insert(
                id.to_string(),
                CanonicalFigure {
                    value: figure.value.or_else(|| raw.and_then(|r| r.value)),
                    representation: Some(figure.representation),
                    currency_context: figure.currency_context.clone(),
                    ratio_context: figure.ratio_context.clone(),
                    raw_label: raw_label.to_string(),
                    suspect: raw.map_or(false, |r| r.suspect),
                    suspect_reason: raw.and_then(|r| r.suspect_reason.clone()),
                },
            );
        }
    }

    label
}

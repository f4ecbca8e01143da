//! Normalization orchestrator
//!
//! Runs each phase as an independent sweep: fetch the ids in the phase's
//! pending state, then process them with a small bounded worker pool.
//! Document order is never relied upon; every per-document step is
//! idempotent and re-checks its status before acting.

use fqp_common::config::TomlConfig;
use fqp_common::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::models::StageVersions;
use crate::services::{
    CompletenessStage, DocumentOutcome, LabelMapper, Oracle, PipelineContext, PlaybookRegistry,
    QualityEngine, QualityReport, StatementClassifier, UnitClassifier,
};
use crate::utils::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPhase {
    Statement,
    UnitDiscovery,
    UnitApplication,
    LabelDiscovery,
    LabelApplication,
}

impl SweepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepPhase::Statement => "statement",
            SweepPhase::UnitDiscovery => "unit_discovery",
            SweepPhase::UnitApplication => "unit_application",
            SweepPhase::LabelDiscovery => "label_discovery",
            SweepPhase::LabelApplication => "label_application",
        }
    }
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-phase tally of one sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: SweepPhase,
    pub total: usize,
    pub advanced: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub failed: usize,
    /// Database or internal errors; the document is retried next sweep
    pub errors: usize,
}

impl PhaseReport {
    fn new(phase: SweepPhase, total: usize) -> Self {
        Self {
            phase,
            total,
            advanced: 0,
            skipped: 0,
            deferred: 0,
            failed: 0,
            errors: 0,
        }
    }

    fn count(&mut self, outcome: DocumentOutcome) {
        match outcome {
            DocumentOutcome::Advanced => self.advanced += 1,
            DocumentOutcome::Skipped => self.skipped += 1,
            DocumentOutcome::Deferred => self.deferred += 1,
            DocumentOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub sweep_id: Uuid,
    pub staged: usize,
    pub phases: Vec<PhaseReport>,
    pub quality: Option<QualityReport>,
    pub cancelled: bool,
}

impl SweepSummary {
    pub fn phase(&self, phase: SweepPhase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

pub struct NormalizationOrchestrator {
    statements: StatementClassifier,
    units: UnitClassifier,
    labels: LabelMapper,
    quality: QualityEngine,
    workers: usize,
    discovery_enabled: bool,
    cancel: CancellationToken,
}

impl NormalizationOrchestrator {
    /// Wire every phase from configuration
    ///
    /// Passing no oracle disables both discovery phases; the deterministic
    /// and application phases still run.
    pub fn from_config(
        pool: SqlitePool,
        config: &TomlConfig,
        registry: Arc<PlaybookRegistry>,
        oracle: Option<Arc<dyn Oracle>>,
        cancel: CancellationToken,
    ) -> Self {
        let max_lock_wait_ms = config.database.max_lock_wait_ms;
        let discovery_enabled = oracle.is_some();

        let mut ctx = PipelineContext::new(pool.clone(), max_lock_wait_ms)
            .with_backoff(BackoffPolicy::from_config(&config.oracle))
            .with_cancel(cancel.clone());
        if let Some(oracle) = oracle {
            ctx = ctx.with_oracle(oracle);
        }

        let versions = StageVersions(config.stages.versions());
        let mut quality = QualityEngine::new(pool.clone(), versions.clone(), max_lock_wait_ms);
        if let Some(stage_1) = versions.current(1) {
            quality = quality.with_runner(Arc::new(CompletenessStage::new(
                pool.clone(),
                Arc::clone(&registry),
                stage_1,
            )));
        }

        Self {
            statements: StatementClassifier::new(pool, max_lock_wait_ms),
            units: UnitClassifier::new(ctx.clone(), &config.pipeline.unit_classifier_version),
            labels: LabelMapper::new(ctx, registry, &config.pipeline.label_classifier_version),
            quality,
            workers: config.pipeline.effective_workers(),
            discovery_enabled,
            cancel,
        }
    }

    /// Run every phase once, in pipeline order
    pub async fn run_sweep(&self) -> Result<SweepSummary> {
        let sweep_id = Uuid::new_v4();
        let span = info_span!("sweep", %sweep_id);
        self.sweep(sweep_id).instrument(span).await
    }

    async fn sweep(&self, sweep_id: Uuid) -> Result<SweepSummary> {
        info!(workers = self.workers, discovery = self.discovery_enabled, "Sweep started");

        let mut summary = SweepSummary {
            sweep_id,
            staged: self.statements.stage_new_documents().await?,
            phases: Vec::new(),
            quality: None,
            cancelled: false,
        };

        let ids = self.statements.pending_documents().await?;
        summary.phases.push(
            self.run_phase(SweepPhase::Statement, ids, |id| {
                self.statements.normalize_document(id)
            })
            .await,
        );

        if self.discovery_enabled && !self.cancel.is_cancelled() {
            let ids = self.units.pending_discovery().await?;
            summary.phases.push(
                self.run_phase(SweepPhase::UnitDiscovery, ids, |id| {
                    self.units.discover_document(id)
                })
                .await,
            );
        }

        if !self.cancel.is_cancelled() {
            let ids = self.units.pending_application().await?;
            summary.phases.push(
                self.run_phase(SweepPhase::UnitApplication, ids, |id| {
                    self.units.apply_review(id)
                })
                .await,
            );
        }

        if self.discovery_enabled && !self.cancel.is_cancelled() {
            let ids = self.labels.pending_discovery().await?;
            summary.phases.push(
                self.run_phase(SweepPhase::LabelDiscovery, ids, |id| {
                    self.labels.discover_document(id)
                })
                .await,
            );
        }

        if !self.cancel.is_cancelled() {
            let ids = self.labels.pending_application().await?;
            summary.phases.push(
                self.run_phase(SweepPhase::LabelApplication, ids, |id| {
                    self.labels.apply_document(id)
                })
                .await,
            );
        }

        if self.cancel.is_cancelled() {
            summary.cancelled = true;
            info!("Sweep cancelled");
            return Ok(summary);
        }

        summary.quality = Some(self.quality.run_sweep().await?);
        info!(staged = summary.staged, "Sweep complete");
        Ok(summary)
    }

    async fn run_phase<F, Fut>(&self, phase: SweepPhase, ids: Vec<i64>, step: F) -> PhaseReport
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = Result<DocumentOutcome>>,
    {
        let mut report = PhaseReport::new(phase, ids.len());
        if ids.is_empty() {
            return report;
        }

        let results: Vec<(i64, Option<Result<DocumentOutcome>>)> = stream::iter(ids)
            .map(|doc_id| {
                let cancel = self.cancel.clone();
                let work = step(doc_id);
                async move {
                    if cancel.is_cancelled() {
                        return (doc_id, None);
                    }
                    (doc_id, Some(work.await))
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for (doc_id, result) in results {
            match result {
                None => report.count(DocumentOutcome::Skipped),
                Some(Ok(outcome)) => report.count(outcome),
                Some(Err(e)) => {
                    error!(phase = %phase, id = doc_id, error = %e, "Phase step failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            phase = %phase,
            total = report.total,
            advanced = report.advanced,
            skipped = report.skipped,
            deferred = report.deferred,
            failed = report.failed,
            errors = report.errors,
            "Phase complete"
        );
        report
    }
}

//! Quality engine: stage run seeding, waterfall reset and gated stages
//!
//! Stage k+1 is attempted only while stage k has PASSED at its currently
//! deployed version. Only label-approved documents take part.

use async_trait::async_trait;
use fqp_common::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::{documents, stage_runs, staged, StageOutcome, StagedRecord};
use crate::models::{StageRun, StageStatus, StageVersions, COMPLETENESS_ERROR, STAGE_COUNT};
use crate::services::completeness::check_completeness;
use crate::services::taxonomy::PlaybookRegistry;
use crate::services::waterfall::{run_waterfall, WaterfallReport};
use crate::utils::retry_on_lock;

/// One pluggable quality stage
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// 1-based stage number
    fn stage(&self) -> usize;

    fn version(&self) -> &str;

    /// Evaluate one document; `None` leaves the stage untouched this sweep
    async fn run(&self, record: &StagedRecord) -> Result<Option<StageOutcome>>;
}

/// Stage 1: every provided statement covers its expected taxonomy leaves
pub struct CompletenessStage {
    pool: SqlitePool,
    registry: Arc<PlaybookRegistry>,
    version: String,
}

impl CompletenessStage {
    pub fn new(pool: SqlitePool, registry: Arc<PlaybookRegistry>, version: impl Into<String>) -> Self {
        Self {
            pool,
            registry,
            version: version.into(),
        }
    }

    fn failed(reason: String, details: Option<Value>) -> StageOutcome {
        StageOutcome {
            status: StageStatus::Failed(COMPLETENESS_ERROR.to_string()),
            version: None,
            failure_reason: Some(reason),
            details,
        }
    }
}

#[async_trait]
impl StageRunner for CompletenessStage {
    fn stage(&self) -> usize {
        1
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn run(&self, record: &StagedRecord) -> Result<Option<StageOutcome>> {
        let (Some(statement), Some(label)) = (record.payload.statement(), record.payload.label())
        else {
            return Ok(Some(Self::failed(
                format!("Canonical labels missing (payload phase '{}')", record.payload.phase()),
                None,
            )));
        };

        let Some(domain_category) =
            documents::domain_category_for(&self.pool, &record.ticker).await?
        else {
            warn!(doc_id = record.doc_id, ticker = %record.ticker, "No company context, completeness not checked");
            return Ok(None);
        };
        let Some(playbook) = self.registry.playbook_for(&domain_category) else {
            warn!(doc_id = record.doc_id, domain_category = %domain_category, "No taxonomy for domain category, completeness not checked");
            return Ok(None);
        };

        let mut unexpected = Map::new();
        for (slot, _) in statement.provided() {
            let expected = playbook.completeness_leaves(slot.kind());
            let result = check_completeness(label.statement(slot), &expected);
            if result.passed {
                if !result.unexpected_ids.is_empty() {
                    unexpected.insert(slot.to_string(), json!(result.unexpected_ids));
                }
                continue;
            }

            debug!(
                doc_id = record.doc_id,
                statement = %slot,
                missing = result.missing_ids.len(),
                "Completeness check failed"
            );
            return Ok(Some(Self::failed(
                format!("Completeness check failed on: {}", slot),
                Some(result.details()),
            )));
        }

        // Ids outside the leaf set never fail the stage but stay visible
        let details = (!unexpected.is_empty())
            .then(|| json!({ "passed": true, "unexpected_ids": Value::Object(unexpected) }));

        Ok(Some(StageOutcome {
            status: StageStatus::Passed,
            version: Some(self.version.clone()),
            failure_reason: None,
            details,
        }))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityReport {
    pub seeded: u64,
    pub waterfall: WaterfallReport,
    pub attempted: usize,
    pub passed: usize,
    pub failed: usize,
}

pub struct QualityEngine {
    pool: SqlitePool,
    versions: StageVersions,
    runners: Vec<Arc<dyn StageRunner>>,
    max_lock_wait_ms: u64,
}

impl QualityEngine {
    pub fn new(pool: SqlitePool, versions: StageVersions, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            versions,
            runners: Vec::new(),
            max_lock_wait_ms,
        }
    }

    /// Register a stage; its version must match the deployed one to run
    pub fn with_runner(mut self, runner: Arc<dyn StageRunner>) -> Self {
        if self.versions.current(runner.stage()) != Some(runner.version()) {
            warn!(
                stage = runner.stage(),
                runner_version = runner.version(),
                deployed = ?self.versions.current(runner.stage()),
                "Stage runner version is not the deployed version, not registering"
            );
            return self;
        }
        self.runners.push(runner);
        self
    }

    fn runner(&self, stage: usize) -> Option<&Arc<dyn StageRunner>> {
        self.runners.iter().find(|r| r.stage() == stage)
    }

    /// Seed, reset drifted runs, then attempt every stage whose gate is open
    pub async fn run_sweep(&self) -> Result<QualityReport> {
        let mut report = QualityReport {
            seeded: retry_on_lock("seed_stage_runs", self.max_lock_wait_ms, || {
                stage_runs::seed_missing(&self.pool)
            })
            .await?,
            ..Default::default()
        };
        report.waterfall = run_waterfall(&self.pool, &self.versions, self.max_lock_wait_ms).await?;

        for mut run in stage_runs::list_label_approved(&self.pool).await? {
            self.advance_run(&mut run, &mut report).await?;
        }

        info!(
            seeded = report.seeded,
            waterfall_resets = report.waterfall.total(),
            attempted = report.attempted,
            passed = report.passed,
            failed = report.failed,
            "Quality sweep complete"
        );
        Ok(report)
    }

    async fn advance_run(&self, run: &mut StageRun, report: &mut QualityReport) -> Result<()> {
        let mut record: Option<StagedRecord> = None;

        for stage in 1..=STAGE_COUNT {
            if self.versions.is_current(run, stage) {
                continue;
            }
            if !self.versions.may_attempt(run, stage) {
                break;
            }
            let Some(runner) = self.runner(stage) else {
                break;
            };

            if record.is_none() {
                record = staged::load_staged(&self.pool, run.doc_id).await?;
            }
            let Some(ref staged_record) = record else {
                warn!(doc_id = run.doc_id, "Stage run without staging record");
                break;
            };

            let Some(outcome) = runner.run(staged_record).await? else {
                break;
            };
            report.attempted += 1;

            let expected = run.stages[stage - 1].status.clone();
            let stored = retry_on_lock("record_stage_outcome", self.max_lock_wait_ms, || {
                stage_runs::record_outcome(&self.pool, run.run_id, stage, &expected, &outcome)
            })
            .await?;
            if !stored {
                debug!(doc_id = run.doc_id, stage, "Stage run changed under us, leaving it");
                break;
            }

            let state = &mut run.stages[stage - 1];
            state.status = outcome.status.clone();
            state.version = outcome.version.clone();

            if outcome.status == StageStatus::Passed {
                report.passed += 1;
            } else {
                report.failed += 1;
                info!(
                    doc_id = run.doc_id,
                    stage,
                    status = %outcome.status,
                    reason = outcome.failure_reason.as_deref().unwrap_or(""),
                    "Stage failed"
                );
                break;
            }
        }

        Ok(())
    }
}

//! Quality engine: completeness stage, gating and version drift

mod helpers;

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fqp_norm::db::{stage_runs, StageOutcome, StagedRecord};
use fqp_norm::models::{StageStatus, StageVersions, COMPLETENESS_ERROR};
use fqp_norm::services::{
    CompletenessStage, DocumentOutcome, LabelMapper, QualityEngine, StageRunner, UnitClassifier,
};

use helpers::*;

fn versions(v: [Option<&str>; 5]) -> StageVersions {
    StageVersions(v.map(|s| s.map(str::to_string)))
}

/// Push one document through every normalization phase to label approval
async fn label_approved_document(pool: &SqlitePool, doc_id: i64, figures: &[(&str, f64)]) {
    label_approved_document_with(pool, doc_id, figures, &bank_label_answers()).await;
}

async fn label_approved_document_with(
    pool: &SqlitePool,
    doc_id: i64,
    figures: &[(&str, f64)],
    answers: &[(&str, Option<&str>)],
) {
    insert_document(pool, doc_id, TICKER, &pnl_content(figures)).await;
    stage_and_classify(pool).await;

    let analysis = unit_analysis(
        "standalone_pnl",
        figures
            .iter()
            .map(|(label, value)| figure(label, *value, "currency", "high"))
            .collect(),
        false,
    );
    let oracle = ScriptedOracle::new();
    oracle.push_units(Ok(analysis));
    oracle.answer_all(answers);

    let ctx = test_context(pool, Some(oracle));
    let units = UnitClassifier::new(ctx.clone(), "1.0");
    assert_eq!(units.discover_document(doc_id).await.unwrap(), DocumentOutcome::Advanced);

    let labels = LabelMapper::new(ctx, test_registry(), "1.0");
    assert_ne!(labels.discover_document(doc_id).await.unwrap(), DocumentOutcome::Failed);
    approve_pending_labels(pool).await;
    assert_eq!(labels.apply_document(doc_id).await.unwrap(), DocumentOutcome::Advanced);
}

async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let (dir, pool) = create_test_db().await;
    insert_company(&pool, TICKER, Some(DOMAIN)).await;
    (dir, pool)
}

fn engine(pool: &SqlitePool, stage_1: &str, runner_version: &str) -> QualityEngine {
    QualityEngine::new(
        pool.clone(),
        versions([Some(stage_1), None, None, None, None]),
        LOCK_WAIT_MS,
    )
    .with_runner(Arc::new(CompletenessStage::new(
        pool.clone(),
        test_registry(),
        runner_version,
    )))
}

/// Stage double that always passes and counts its calls
struct CountingStage {
    stage: usize,
    version: String,
    calls: AtomicUsize,
}

impl CountingStage {
    fn new(stage: usize, version: &str) -> Arc<Self> {
        Arc::new(Self {
            stage,
            version: version.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageRunner for CountingStage {
    fn stage(&self) -> usize {
        self.stage
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn run(&self, _record: &StagedRecord) -> fqp_common::Result<Option<StageOutcome>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(StageOutcome {
            status: StageStatus::Passed,
            version: Some(self.version.clone()),
            failure_reason: None,
            details: None,
        }))
    }
}

#[tokio::test]
async fn test_complete_document_passes_stage_one() {
    let (_dir, pool) = test_pool().await;
    label_approved_document(&pool, 1, &bank_figures()).await;

    let engine = engine(&pool, "1.0", "1.0");
    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.seeded, 1);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.passed, 1);

    let run = stage_runs::load(&pool, 1).await.unwrap().unwrap();
    assert_eq!(run.stages[0].status, StageStatus::Passed);
    assert_eq!(run.stages[0].version.as_deref(), Some("1.0"));

    // Already current: nothing to do on the next sweep
    let again = engine.run_sweep().await.unwrap();
    assert_eq!(again.seeded, 0);
    assert_eq!(again.attempted, 0);
}

#[tokio::test]
async fn test_pass_records_ids_outside_leaf_set() {
    let (_dir, pool) = test_pool().await;
    let mut figures = bank_figures();
    figures.push(("Diluted EPS", 21.4));
    let mut answers = bank_label_answers();
    answers.push(("Diluted EPS", Some("earnings_per_share_diluted")));
    label_approved_document_with(&pool, 1, &figures, &answers).await;

    let report = engine(&pool, "1.0", "1.0").run_sweep().await.unwrap();
    assert_eq!(report.passed, 1);

    let run = stage_runs::load(&pool, 1).await.unwrap().unwrap();
    assert_eq!(run.stages[0].status, StageStatus::Passed);
    assert_eq!(
        run.details,
        Some(json!({
            "passed": true,
            "unexpected_ids": { "standalone_pnl": ["earnings_per_share_diluted"] }
        }))
    );
}

#[tokio::test]
async fn test_missing_leaf_fails_with_exact_ids() {
    let (_dir, pool) = test_pool().await;
    label_approved_document(&pool, 1, &[("Interest Earned", 1000.0), ("Net Profit", 120.0)]).await;

    let report = engine(&pool, "1.0", "1.0").run_sweep().await.unwrap();
    assert_eq!(report.failed, 1);

    let run = stage_runs::load(&pool, 1).await.unwrap().unwrap();
    assert_eq!(
        run.stages[0].status,
        StageStatus::Failed(COMPLETENESS_ERROR.to_string())
    );
    assert_eq!(run.stages[0].version, None);
    assert_eq!(
        run.failure_reason.as_deref(),
        Some("Completeness check failed on: standalone_pnl")
    );
    assert_eq!(
        run.details,
        Some(json!({ "passed": false, "missing_ids": ["capital_adequacy_ratio"] }))
    );
}

#[tokio::test]
async fn test_documents_before_label_approval_not_attempted() {
    let (_dir, pool) = test_pool().await;
    insert_document(&pool, 1, TICKER, &pnl_content(&bank_figures())).await;
    stage_and_classify(&pool).await;

    let report = engine(&pool, "1.0", "1.0").run_sweep().await.unwrap();
    assert_eq!(report.seeded, 1);
    assert_eq!(report.attempted, 0);

    let run = stage_runs::load(&pool, 1).await.unwrap().unwrap();
    assert_eq!(run.stages[0].status, StageStatus::Pending);
}

#[tokio::test]
async fn test_later_stage_waits_for_current_pass() {
    let (_dir, pool) = test_pool().await;
    label_approved_document(&pool, 1, &[("Interest Earned", 1000.0)]).await;
    label_approved_document(&pool, 2, &bank_figures()).await;

    let stage_2 = CountingStage::new(2, "1.0");
    let engine = QualityEngine::new(
        pool.clone(),
        versions([Some("1.0"), Some("1.0"), None, None, None]),
        LOCK_WAIT_MS,
    )
    .with_runner(Arc::new(CompletenessStage::new(pool.clone(), test_registry(), "1.0")))
    .with_runner(stage_2.clone());

    let report = engine.run_sweep().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.passed, 2);
    // Only the complete document reached stage 2
    assert_eq!(stage_2.calls(), 1);

    let blocked = stage_runs::load(&pool, 1).await.unwrap().unwrap();
    assert_eq!(blocked.stages[1].status, StageStatus::Pending);
    let advanced = stage_runs::load(&pool, 2).await.unwrap().unwrap();
    assert_eq!(advanced.stages[1].status, StageStatus::Passed);
    assert_eq!(advanced.stages[1].version.as_deref(), Some("1.0"));
}

#[tokio::test]
async fn test_runner_at_stale_version_not_registered() {
    let (_dir, pool) = test_pool().await;
    label_approved_document(&pool, 1, &bank_figures()).await;

    let report = engine(&pool, "1.1", "1.0").run_sweep().await.unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test]
async fn test_version_bump_rechecks_passed_documents() {
    let (_dir, pool) = test_pool().await;
    label_approved_document(&pool, 1, &bank_figures()).await;

    let stage_2 = CountingStage::new(2, "1.0");
    let deployed = versions([Some("1.0"), Some("1.0"), None, None, None]);
    QualityEngine::new(pool.clone(), deployed, LOCK_WAIT_MS)
        .with_runner(Arc::new(CompletenessStage::new(pool.clone(), test_registry(), "1.0")))
        .with_runner(stage_2.clone())
        .run_sweep()
        .await
        .unwrap();
    assert_eq!(stage_2.calls(), 1);

    let bumped = versions([Some("1.1"), Some("1.0"), None, None, None]);
    let report = QualityEngine::new(pool.clone(), bumped, LOCK_WAIT_MS)
        .with_runner(Arc::new(CompletenessStage::new(pool.clone(), test_registry(), "1.1")))
        .with_runner(stage_2.clone())
        .run_sweep()
        .await
        .unwrap();

    assert_eq!(report.waterfall.resets[0], 1);
    assert_eq!(report.attempted, 2);
    assert_eq!(stage_2.calls(), 2);

    let run = stage_runs::load(&pool, 1).await.unwrap().unwrap();
    assert_eq!(run.stages[0].version.as_deref(), Some("1.1"));
    assert_eq!(run.stages[1].status, StageStatus::Passed);
}

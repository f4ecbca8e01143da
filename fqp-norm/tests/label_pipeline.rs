//! Label mapping: cached discovery, review blocking, canonical application

mod helpers;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use fqp_norm::db::{failures, label_cache, staged, Phase};
use fqp_norm::models::{
    LabelNormalized, LabelReviewStatus, MappingStatus, Representation, SourceContext, StatementKind, StatementSlot,
};
use fqp_norm::services::{DocumentOutcome, LabelMapper, OracleError, UnitClassifier};
use sqlx::SqlitePool;

use helpers::*;

/// Documents 1..=count with the fixture figures, units auto-approved
async fn settled_documents(
    category: Option<&str>,
    count: i64,
) -> (tempfile::TempDir, SqlitePool, Arc<ScriptedOracle>) {
    let (dir, pool) = create_test_db().await;
    insert_company(&pool, TICKER, category).await;
    for doc_id in 1..=count {
        insert_document(&pool, doc_id, TICKER, &pnl_content(&bank_figures())).await;
    }
    stage_and_classify(&pool).await;

    let oracle = ScriptedOracle::new();
    let units = UnitClassifier::new(test_context(&pool, Some(oracle.clone())), "1.0");
    for doc_id in 1..=count {
        oracle.push_units(Ok(confident_bank_analysis()));
        assert_eq!(
            units.discover_document(doc_id).await.unwrap(),
            DocumentOutcome::Advanced
        );
    }
    (dir, pool, oracle)
}

fn mapper(pool: &SqlitePool, oracle: &Arc<ScriptedOracle>) -> LabelMapper {
    LabelMapper::new(test_context(pool, Some(oracle.clone())), test_registry(), "1.0")
}

async fn label_status(pool: &SqlitePool, doc_id: i64) -> LabelReviewStatus {
    staged::load_staged(pool, doc_id)
        .await
        .unwrap()
        .unwrap()
        .label_review_status
}

async fn cache_rows(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM label_mapping_cache")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_discovery_caches_suggestions_and_awaits_review() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.pending_discovery().await.unwrap(), vec![1]);
    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::PendingReview);

    let requests = oracle.label_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].statement_key, "pnl");
    assert_eq!(requests[0].domain_category, DOMAIN);
    assert_eq!(requests[0].statement_currency.as_deref(), Some("in lacs"));
    assert_eq!(
        requests[0].standard_names,
        vec![
            "interest_earned",
            "net_profit",
            "capital_adequacy_ratio",
            "earnings_per_share_diluted"
        ]
    );

    let pending = label_cache::list(&pool, Some(MappingStatus::PendingReview), 100)
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);
    let net_profit = pending.iter().find(|m| m.raw_label == "Net Profit").unwrap();
    assert_eq!(net_profit.normalized_label.as_deref(), Some("net_profit"));
    let context = net_profit.source_context.as_ref().unwrap();
    assert_eq!(context.doc_id, 1);
    assert_eq!(context.statement_slot, StatementSlot::StandalonePnl);
    assert_eq!(context.classifier_version, "1.0");
}

#[tokio::test]
async fn test_cached_labels_never_sent_again() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 2).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);
    assert_eq!(oracle.label_calls(), 1);

    // Same labels, same domain: served from the cache
    assert_eq!(labels.discover_document(2).await.unwrap(), DocumentOutcome::Advanced);
    assert_eq!(oracle.label_calls(), 1);
    assert_eq!(cache_rows(&pool).await, 3);

    // Re-running on a discovered document changes nothing
    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Skipped);
    assert_eq!(oracle.label_calls(), 1);
    assert_eq!(cache_rows(&pool).await, 3);
}

#[tokio::test]
async fn test_missing_label_defers_and_retries_only_the_gap() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    oracle.forget("Capital Adequacy Ratio (%)");
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Deferred);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::Pending);
    assert_eq!(cache_rows(&pool).await, 2);

    oracle.answer("Capital Adequacy Ratio (%)", Some("capital_adequacy_ratio"));
    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);

    let requests = oracle.label_requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].raw_labels, vec!["Capital Adequacy Ratio (%)"]);
    assert_eq!(cache_rows(&pool).await, 3);
}

#[tokio::test]
async fn test_partial_approval_blocks_application() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);
    labels.discover_document(1).await.unwrap();

    for raw_label in ["Interest Earned", "Net Profit"] {
        assert!(label_cache::approve(&pool, raw_label, DOMAIN, None, "analyst")
            .await
            .unwrap());
    }

    assert_eq!(labels.pending_application().await.unwrap(), vec![1]);
    assert_eq!(labels.apply_document(1).await.unwrap(), DocumentOutcome::Skipped);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::PendingReview);

    assert!(label_cache::approve(&pool, "Capital Adequacy Ratio (%)", DOMAIN, None, "analyst")
        .await
        .unwrap());

    assert_eq!(labels.apply_document(1).await.unwrap(), DocumentOutcome::Advanced);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::Approved);
    assert_eq!(labels.apply_document(1).await.unwrap(), DocumentOutcome::Skipped);
    assert!(labels.pending_application().await.unwrap().is_empty());

    let record = staged::load_staged(&pool, 1).await.unwrap().unwrap();
    let label = record.payload.label().expect("label payload");
    assert!(label.consolidated.is_empty());
    let pnl = &label.standalone[&StatementKind::Pnl];
    assert_eq!(pnl.len(), 3);
    assert_eq!(pnl["interest_earned"].value, Some(1000.0));
    assert_eq!(pnl["interest_earned"].raw_label, "Interest Earned");
    assert_eq!(
        pnl["capital_adequacy_ratio"].representation,
        Some(Representation::Percentage)
    );
}

#[tokio::test]
async fn test_rejected_label_keeps_document_blocked() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);
    labels.discover_document(1).await.unwrap();

    approve_pending_labels(&pool).await;
    assert!(label_cache::reject(&pool, "Net Profit", DOMAIN, "analyst")
        .await
        .unwrap());

    assert_eq!(labels.apply_document(1).await.unwrap(), DocumentOutcome::Skipped);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::PendingReview);
}

#[tokio::test]
async fn test_rejection_during_application_blocks_document() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);
    labels.discover_document(1).await.unwrap();
    approve_pending_labels(&pool).await;

    // Reviewer rejection is written but not yet committed when application starts
    let mut review = pool.begin().await.unwrap();
    sqlx::query(
        "UPDATE label_mapping_cache SET status = 'REJECTED', reviewed_by = 'analyst' \
         WHERE raw_label = ? AND domain_category = ?",
    )
    .bind("Net Profit")
    .bind(DOMAIN)
    .execute(&mut *review)
    .await
    .unwrap();

    let apply = tokio::spawn({
        let labels = labels.clone();
        async move { labels.apply_document(1).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    review.commit().await.unwrap();

    assert_eq!(apply.await.unwrap().unwrap(), DocumentOutcome::Skipped);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::PendingReview);
    let record = staged::load_staged(&pool, 1).await.unwrap().unwrap();
    assert!(record.payload.label().is_none());
}

#[tokio::test]
async fn test_discovery_never_overwrites_reviewer_decision() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    mapper(&pool, &oracle).discover_document(1).await.unwrap();

    assert!(label_cache::approve(&pool, "Net Profit", DOMAIN, Some("profit_after_tax"), "analyst")
        .await
        .unwrap());

    let context = SourceContext {
        doc_id: 1,
        ticker: TICKER.to_string(),
        statement_key: "pnl".to_string(),
        statement_slot: StatementSlot::StandalonePnl,
        statement_currency: None,
        classifier_version: "2.0".to_string(),
    };
    let mut tx = pool.begin().await.unwrap();
    let written = label_cache::upsert_pending(&mut tx, "Net Profit", DOMAIN, Some("net_profit"), &context)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(!written);

    let cached = label_cache::lookup(&pool, DOMAIN, &["Net Profit".to_string()])
        .await
        .unwrap();
    let entry = &cached["Net Profit"];
    assert_eq!(entry.status, MappingStatus::Approved);
    assert_eq!(entry.normalized_label.as_deref(), Some("profit_after_tax"));
    assert_eq!(entry.reviewed_by.as_deref(), Some("analyst"));
}

#[tokio::test]
async fn test_unmatched_label_stays_out_of_canonical_map() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.answer_all(&bank_label_answers());
    oracle.answer("Capital Adequacy Ratio (%)", None);
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);
    assert_eq!(approve_pending_labels(&pool).await, 3);
    assert_eq!(labels.apply_document(1).await.unwrap(), DocumentOutcome::Advanced);

    let record = staged::load_staged(&pool, 1).await.unwrap().unwrap();
    let pnl = &record.payload.label().unwrap().standalone[&StatementKind::Pnl];
    assert_eq!(pnl.len(), 2);
    assert!(!pnl.contains_key("capital_adequacy_ratio"));
}

#[tokio::test]
async fn test_malformed_mapping_recorded_as_hard_failure() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    oracle.push_label_error(OracleError::Malformed(
        "mapping for 'Net Profit' is neither a string nor null: 7".to_string(),
    ));
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Failed);
    assert_eq!(oracle.label_calls(), 1);
    assert!(failures::active(&pool, 1, Phase::Label, "1.0")
        .await
        .unwrap()
        .is_some());
    assert!(labels.pending_discovery().await.unwrap().is_empty());
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::Pending);
}

#[tokio::test]
async fn test_exhausted_retries_leave_document_pending() {
    let (_dir, pool, oracle) = settled_documents(Some(DOMAIN), 1).await;
    for _ in 0..3 {
        oracle.push_label_error(OracleError::Timeout);
    }
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Deferred);
    assert_eq!(oracle.label_calls(), 3);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::Pending);
    assert_eq!(cache_rows(&pool).await, 0);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);
}

#[tokio::test]
async fn test_domain_without_taxonomy_skipped() {
    let (_dir, pool, oracle) = settled_documents(Some("insurance"), 1).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Skipped);
    assert_eq!(oracle.label_calls(), 0);
    assert_eq!(label_status(&pool, 1).await, LabelReviewStatus::Pending);
}

#[tokio::test]
async fn test_missing_company_context_skipped() {
    let (_dir, pool, oracle) = settled_documents(None, 1).await;
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Skipped);
    assert_eq!(oracle.label_calls(), 0);
}

#[tokio::test]
async fn test_domain_alias_resolves_playbook() {
    let (_dir, pool, oracle) = settled_documents(Some(" Banks "), 1).await;
    oracle.answer_all(&bank_label_answers());
    let labels = mapper(&pool, &oracle);

    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);
    // Cache rows are scoped by the company's own category text
    let pending = label_cache::list(&pool, None, 100).await.unwrap();
    assert!(pending.iter().all(|m| m.domain_category == "Banks"));
}

/// Run one custom document through discovery, approval and application
async fn applied_labels(
    content: &Value,
    figures: Vec<Value>,
    answers: &[(&str, Option<&str>)],
) -> LabelNormalized {
    let (_dir, pool) = create_test_db().await;
    insert_company(&pool, TICKER, Some(DOMAIN)).await;
    insert_document(&pool, 1, TICKER, content).await;
    stage_and_classify(&pool).await;

    let oracle = ScriptedOracle::new();
    oracle.push_units(Ok(unit_analysis("standalone_pnl", figures, false)));
    oracle.answer_all(answers);
    let ctx = test_context(&pool, Some(oracle));
    UnitClassifier::new(ctx.clone(), "1.0")
        .discover_document(1)
        .await
        .unwrap();

    let labels = LabelMapper::new(ctx, test_registry(), "1.0");
    assert_eq!(labels.discover_document(1).await.unwrap(), DocumentOutcome::Advanced);
    approve_pending_labels(&pool).await;
    assert_eq!(labels.apply_document(1).await.unwrap(), DocumentOutcome::Advanced);

    let record = staged::load_staged(&pool, 1).await.unwrap().unwrap();
    record.payload.label().expect("label payload").clone()
}

#[tokio::test]
async fn test_suspect_flags_carried_into_canonical_map() {
    let mut content = pnl_content(&bank_figures());
    content["statements"][0]["figures"][1] = json!({
        "label": "Net Profit",
        "value": 120.0,
        "suspect": true,
        "suspect_reason": "sign differs from prior quarter"
    });
    let figures = vec![
        figure("Interest Earned", 1000.0, "currency", "high"),
        figure("Net Profit", 120.0, "currency", "high"),
        figure("Capital Adequacy Ratio (%)", 16.5, "percentage", "high"),
    ];

    let label = applied_labels(&content, figures, &bank_label_answers()).await;
    let pnl = &label.standalone[&StatementKind::Pnl];
    assert!(pnl["net_profit"].suspect);
    assert_eq!(
        pnl["net_profit"].suspect_reason.as_deref(),
        Some("sign differs from prior quarter")
    );
    assert!(!pnl["interest_earned"].suspect);
    assert_eq!(pnl["interest_earned"].suspect_reason, None);
}

#[tokio::test]
async fn test_first_label_wins_shared_canonical_id() {
    let mut raw = bank_figures();
    raw.push(("Profit for the period", 118.0));
    let figures = vec![
        figure("Interest Earned", 1000.0, "currency", "high"),
        figure("Net Profit", 120.0, "currency", "high"),
        figure("Capital Adequacy Ratio (%)", 16.5, "percentage", "high"),
        figure("Profit for the period", 118.0, "currency", "high"),
    ];
    let mut answers = bank_label_answers();
    answers.push(("Profit for the period", Some("net_profit")));

    let label = applied_labels(&pnl_content(&raw), figures, &answers).await;
    let pnl = &label.standalone[&StatementKind::Pnl];
    assert_eq!(pnl.len(), 3);
    assert_eq!(pnl["net_profit"].raw_label, "Net Profit");
    assert_eq!(pnl["net_profit"].value, Some(120.0));
}

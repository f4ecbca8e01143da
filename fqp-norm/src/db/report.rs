//! Pipeline status counts

use fqp_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub parsed_documents: i64,
    pub staged_documents: i64,
    pub statement_normalized: i64,
    pub unit_review_status: BTreeMap<String, i64>,
    pub label_review_status: BTreeMap<String, i64>,
    pub unit_review_queue: BTreeMap<String, i64>,
    pub label_mapping_cache: BTreeMap<String, i64>,
    pub stage_1_status: BTreeMap<String, i64>,
    pub phase_failures: BTreeMap<String, i64>,
    pub fully_label_approved: i64,
}

async fn count(pool: &SqlitePool, sql: &str) -> Result<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

async fn distribution(pool: &SqlitePool, sql: &str) -> Result<BTreeMap<String, i64>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(sql).fetch_all(pool).await?;
    Ok(rows.into_iter().collect())
}

pub async fn status_report(pool: &SqlitePool) -> Result<StatusReport> {
    Ok(StatusReport {
        parsed_documents: count(pool, "SELECT COUNT(*) FROM parsed_documents").await?,
        staged_documents: count(pool, "SELECT COUNT(*) FROM staged_normalized_data").await?,
        statement_normalized: count(
            pool,
            "SELECT COUNT(*) FROM staged_normalized_data WHERE statement_normalized = 1",
        )
        .await?,
        unit_review_status: distribution(
            pool,
            "SELECT unit_review_status, COUNT(*) FROM staged_normalized_data GROUP BY unit_review_status",
        )
        .await?,
        label_review_status: distribution(
            pool,
            "SELECT label_review_status, COUNT(*) FROM staged_normalized_data GROUP BY label_review_status",
        )
        .await?,
        unit_review_queue: distribution(
            pool,
            "SELECT status, COUNT(*) FROM unit_review_queue GROUP BY status",
        )
        .await?,
        label_mapping_cache: distribution(
            pool,
            "SELECT status, COUNT(*) FROM label_mapping_cache GROUP BY status",
        )
        .await?,
        stage_1_status: distribution(
            pool,
            "SELECT stage_1_status, COUNT(*) FROM stage_runs GROUP BY stage_1_status",
        )
        .await?,
        phase_failures: distribution(
            pool,
            "SELECT phase, COUNT(*) FROM phase_failures GROUP BY phase",
        )
        .await?,
        fully_label_approved: count(
            pool,
            "SELECT COUNT(*) FROM staged_normalized_data WHERE label_review_status = 'APPROVED'",
        )
        .await?,
    })
}

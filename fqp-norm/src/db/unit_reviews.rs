//! Unit review queue
//!
//! One row per document whose unit analysis needs a human. Rows stay after
//! approval; `purge_applied` removes them once the merge is durable.

use chrono::{DateTime, Utc};
use fqp_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};

use crate::models::{
    FigureCorrection, FilingReviewData, ReviewQueueStatus, UnitAnalysis, UnitReviewRow,
};

const SELECT_COLUMNS: &str = "SELECT id, doc_id, ticker, fiscal_date, llm_analysis, filing_data, \
     status, reviewed_by, reviewed_at, human_corrections, applied_at FROM unit_review_queue";

fn review_from_row(row: &SqliteRow) -> Result<UnitReviewRow> {
    let analysis: String = row.try_get("llm_analysis")?;
    let filing_data: String = row.try_get("filing_data")?;
    let status: String = row.try_get("status")?;
    let corrections: Option<String> = row.try_get("human_corrections")?;

    Ok(UnitReviewRow {
        id: row.try_get("id")?,
        doc_id: row.try_get("doc_id")?,
        ticker: row.try_get("ticker")?,
        fiscal_date: row.try_get("fiscal_date")?,
        analysis: serde_json::from_str(&analysis)?,
        filing_data: serde_json::from_str(&filing_data)?,
        status: status.parse().map_err(Error::Internal)?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: row.try_get::<Option<DateTime<Utc>>, _>("reviewed_at")?,
        human_corrections: corrections
            .as_deref()
            .map(serde_json::from_str::<Vec<FigureCorrection>>)
            .transpose()?,
        applied_at: row.try_get::<Option<DateTime<Utc>>, _>("applied_at")?,
    })
}

/// Queue a document for unit review
pub async fn insert(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    ticker: &str,
    fiscal_date: &str,
    analysis: &UnitAnalysis,
    filing_data: &FilingReviewData,
) -> Result<i64> {
    let analysis = serde_json::to_string(analysis)?;
    let filing_data = serde_json::to_string(filing_data)?;

    let result = sqlx::query(
        r#"
        INSERT INTO unit_review_queue (doc_id, ticker, fiscal_date, llm_analysis, filing_data, status)
        VALUES (?, ?, ?, ?, ?, 'PENDING_REVIEW')
        "#,
    )
    .bind(doc_id)
    .bind(ticker)
    .bind(fiscal_date)
    .bind(&analysis)
    .bind(&filing_data)
    .execute(&mut **tx)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn load<'c>(executor: impl SqliteExecutor<'c>, id: i64) -> Result<Option<UnitReviewRow>> {
    let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.as_ref().map(review_from_row).transpose()
}

pub async fn list(pool: &SqlitePool, status: Option<ReviewQueueStatus>) -> Result<Vec<UnitReviewRow>> {
    let sql = format!("{} WHERE ? IS NULL OR status = ? ORDER BY id", SELECT_COLUMNS);
    let rows = sqlx::query(&sql)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(pool)
        .await?;
    rows.iter().map(review_from_row).collect()
}

/// Approve a pending row, storing any reviewer corrections
pub async fn approve(
    pool: &SqlitePool,
    id: i64,
    reviewer: &str,
    corrections: Option<&[FigureCorrection]>,
) -> Result<bool> {
    let corrections = corrections.map(serde_json::to_string).transpose()?;

    let result = sqlx::query(
        r#"
        UPDATE unit_review_queue
        SET status = 'APPROVED', reviewed_by = ?, reviewed_at = ?, human_corrections = ?
        WHERE id = ? AND status = 'PENDING_REVIEW'
        "#,
    )
    .bind(reviewer)
    .bind(Utc::now())
    .bind(corrections)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn reject(pool: &SqlitePool, id: i64, reviewer: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE unit_review_queue
        SET status = 'REJECTED', reviewed_by = ?, reviewed_at = ?
        WHERE id = ? AND status = 'PENDING_REVIEW'
        "#,
    )
    .bind(reviewer)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Drop a rejected row and send its document back to unit discovery
///
/// Returns the document id when the requeue happened.
pub async fn requeue(pool: &SqlitePool, id: i64) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;

    let doc_id: Option<i64> = sqlx::query_scalar(
        "SELECT doc_id FROM unit_review_queue WHERE id = ? AND status = 'REJECTED'",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(doc_id) = doc_id else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM unit_review_queue WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE staged_normalized_data
        SET unit_review_status = 'PENDING', updated_at = CURRENT_TIMESTAMP
        WHERE doc_id = ? AND unit_review_status = 'PENDING_REVIEW'
        "#,
    )
    .bind(doc_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(doc_id))
}

/// Approved rows whose analysis has not been merged yet
pub async fn approved_unapplied_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM unit_review_queue WHERE status = 'APPROVED' AND applied_at IS NULL ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn mark_applied(tx: &mut Transaction<'_, Sqlite>, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE unit_review_queue SET applied_at = ? WHERE id = ? AND applied_at IS NULL",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete applied rows whose document is unit-approved
pub async fn purge_applied(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM unit_review_queue
        WHERE status = 'APPROVED'
          AND applied_at IS NOT NULL
          AND doc_id IN (
              SELECT doc_id FROM staged_normalized_data WHERE unit_review_status = 'APPROVED'
          )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

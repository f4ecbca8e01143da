//! Staging records: one normalization payload plus three phase flags per document
//!
//! Phase transitions are conditional updates (`WHERE <flag> = <expected>`) run
//! inside the caller's transaction; zero affected rows means another sweep
//! got there first.

use chrono::NaiveDate;
use fqp_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};

use crate::db::documents::DocumentPeriod;
use crate::models::{LabelReviewStatus, NormalizedPayload, UnitReviewStatus};

#[derive(Debug, Clone)]
pub struct StagedRecord {
    pub id: i64,
    pub doc_id: i64,
    pub ticker: String,
    pub fiscal_date: String,
    pub payload: NormalizedPayload,
    pub data_hash: Option<String>,
    pub statement_normalized: bool,
    pub unit_review_status: UnitReviewStatus,
    pub label_review_status: LabelReviewStatus,
}

fn record_from_row(row: &SqliteRow) -> Result<StagedRecord> {
    let payload: String = row.try_get("normalized_data")?;
    let unit: String = row.try_get("unit_review_status")?;
    let label: String = row.try_get("label_review_status")?;

    Ok(StagedRecord {
        id: row.try_get("id")?,
        doc_id: row.try_get("doc_id")?,
        ticker: row.try_get("ticker")?,
        fiscal_date: row.try_get("fiscal_date")?,
        payload: serde_json::from_str(&payload)?,
        data_hash: row.try_get("data_hash")?,
        statement_normalized: row.try_get::<i64, _>("statement_normalized")? != 0,
        unit_review_status: unit.parse().map_err(Error::Internal)?,
        label_review_status: label.parse().map_err(Error::Internal)?,
    })
}

pub async fn load_staged<'c>(
    executor: impl SqliteExecutor<'c>,
    doc_id: i64,
) -> Result<Option<StagedRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, doc_id, ticker, fiscal_date, normalized_data, data_hash,
               statement_normalized, unit_review_status, label_review_status
        FROM staged_normalized_data
        WHERE doc_id = ?
        "#,
    )
    .bind(doc_id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Create the staging record for a document; no-op if one exists
pub async fn insert_staged(
    pool: &SqlitePool,
    period: &DocumentPeriod,
    fiscal_date: NaiveDate,
    payload: &NormalizedPayload,
) -> Result<bool> {
    let data = serde_json::to_string(payload)?;
    let hash = payload.content_hash()?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO staged_normalized_data (doc_id, ticker, fiscal_date, normalized_data, data_hash)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(period.doc_id)
    .bind(&period.ticker)
    .bind(fiscal_date.format("%Y-%m-%d").to_string())
    .bind(&data)
    .bind(&hash)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn pending_statement_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT doc_id FROM staged_normalized_data WHERE statement_normalized = 0 ORDER BY doc_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Documents awaiting unit discovery, excluding hard failures at this version
pub async fn pending_unit_discovery_ids(
    pool: &SqlitePool,
    classifier_version: &str,
) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT doc_id FROM staged_normalized_data
        WHERE statement_normalized = 1
          AND unit_review_status = 'PENDING'
          AND doc_id NOT IN (
              SELECT doc_id FROM phase_failures
              WHERE phase = 'UNIT' AND classifier_version = ?
          )
        ORDER BY doc_id
        "#,
    )
    .bind(classifier_version)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Documents whose units are settled and whose labels are not yet discovered
pub async fn pending_label_discovery_ids(
    pool: &SqlitePool,
    classifier_version: &str,
) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        r#"
        SELECT doc_id FROM staged_normalized_data
        WHERE unit_review_status IN ('AUTO_APPROVED', 'APPROVED')
          AND label_review_status = 'PENDING'
          AND doc_id NOT IN (
              SELECT doc_id FROM phase_failures
              WHERE phase = 'LABEL' AND classifier_version = ?
          )
        ORDER BY doc_id
        "#,
    )
    .bind(classifier_version)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn pending_label_application_ids(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT doc_id FROM staged_normalized_data WHERE label_review_status = 'PENDING_REVIEW' ORDER BY doc_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Set the statement payload; only a not-yet-normalized record changes
pub async fn mark_statement_normalized(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    payload: &NormalizedPayload,
) -> Result<bool> {
    let data = serde_json::to_string(payload)?;
    let hash = payload.content_hash()?;

    let result = sqlx::query(
        r#"
        UPDATE staged_normalized_data
        SET normalized_data = ?, data_hash = ?, statement_normalized = 1,
            updated_at = CURRENT_TIMESTAMP
        WHERE doc_id = ? AND statement_normalized = 0
        "#,
    )
    .bind(&data)
    .bind(&hash)
    .bind(doc_id)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Move the unit flag `from -> to`, optionally replacing the payload
pub async fn transition_unit(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    from: UnitReviewStatus,
    to: UnitReviewStatus,
    payload: Option<&NormalizedPayload>,
) -> Result<bool> {
    transition(tx, doc_id, "unit_review_status", from.as_str(), to.as_str(), payload).await
}

/// Move the label flag `from -> to`, optionally replacing the payload
pub async fn transition_label(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    from: LabelReviewStatus,
    to: LabelReviewStatus,
    payload: Option<&NormalizedPayload>,
) -> Result<bool> {
    transition(tx, doc_id, "label_review_status", from.as_str(), to.as_str(), payload).await
}

async fn transition(
    tx: &mut Transaction<'_, Sqlite>,
    doc_id: i64,
    column: &'static str,
    from: &str,
    to: &str,
    payload: Option<&NormalizedPayload>,
) -> Result<bool> {
    let result = match payload {
        Some(payload) => {
            let data = serde_json::to_string(payload)?;
            let hash = payload.content_hash()?;
            let sql = format!(
                "UPDATE staged_normalized_data \
                 SET {column} = ?, normalized_data = ?, data_hash = ?, updated_at = CURRENT_TIMESTAMP \
                 WHERE doc_id = ? AND {column} = ?"
            );
            sqlx::query(&sql)
                .bind(to)
                .bind(&data)
                .bind(&hash)
                .bind(doc_id)
                .bind(from)
                .execute(&mut **tx)
                .await?
        }
        None => {
            let sql = format!(
                "UPDATE staged_normalized_data \
                 SET {column} = ?, updated_at = CURRENT_TIMESTAMP \
                 WHERE doc_id = ? AND {column} = ?"
            );
            sqlx::query(&sql)
                .bind(to)
                .bind(doc_id)
                .bind(from)
                .execute(&mut **tx)
                .await?
        }
    };

    Ok(result.rows_affected() == 1)
}

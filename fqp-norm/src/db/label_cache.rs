//! Industry-scoped label mapping cache
//!
//! Discovery inserts `PENDING_REVIEW` rows; only the review actor moves a
//! row to `APPROVED` or `REJECTED`, and discovery never touches a row after
//! that.

use chrono::{DateTime, Utc};
use fqp_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};
use std::collections::HashMap;

use crate::models::{LabelMapping, MappingStatus, SourceContext};

fn mapping_from_row(row: &SqliteRow) -> Result<LabelMapping> {
    let status: String = row.try_get("status")?;
    let context: Option<String> = row.try_get("source_context")?;

    Ok(LabelMapping {
        raw_label: row.try_get("raw_label")?,
        domain_category: row.try_get("domain_category")?,
        normalized_label: row.try_get("normalized_label")?,
        status: status.parse().map_err(Error::Internal)?,
        source_context: context
            .as_deref()
            .map(serde_json::from_str::<SourceContext>)
            .transpose()?,
        created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
        last_reviewed_at: row.try_get::<Option<DateTime<Utc>>, _>("last_reviewed_at")?,
        reviewed_by: row.try_get("reviewed_by")?,
    })
}

/// Cache entries for `labels` under one domain category, keyed by raw label
pub async fn lookup<'c>(
    executor: impl SqliteExecutor<'c>,
    domain_category: &str,
    labels: &[String],
) -> Result<HashMap<String, LabelMapping>> {
    if labels.is_empty() {
        return Ok(HashMap::new());
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT raw_label, domain_category, normalized_label, status, source_context, \
         created_at, last_reviewed_at, reviewed_by \
         FROM label_mapping_cache WHERE domain_category = ",
    );
    builder.push_bind(domain_category);
    builder.push(" AND raw_label IN (");
    let mut separated = builder.separated(", ");
    for label in labels {
        separated.push_bind(label.as_str());
    }
    separated.push_unseparated(")");

    let rows = builder.build().fetch_all(executor).await?;
    rows.iter()
        .map(|row| mapping_from_row(row).map(|m| (m.raw_label.clone(), m)))
        .collect()
}

/// Record a discovered mapping awaiting review
///
/// An existing row is refreshed only while it is still `PENDING_REVIEW`.
pub async fn upsert_pending(
    tx: &mut Transaction<'_, Sqlite>,
    raw_label: &str,
    domain_category: &str,
    normalized_label: Option<&str>,
    context: &SourceContext,
) -> Result<bool> {
    let context = serde_json::to_string(context)?;

    let result = sqlx::query(
        r#"
        INSERT INTO label_mapping_cache (raw_label, domain_category, normalized_label, status, source_context)
        VALUES (?, ?, ?, 'PENDING_REVIEW', ?)
        ON CONFLICT(raw_label, domain_category) DO UPDATE SET
            normalized_label = excluded.normalized_label,
            source_context = excluded.source_context
        WHERE label_mapping_cache.status = 'PENDING_REVIEW'
        "#,
    )
    .bind(raw_label)
    .bind(domain_category)
    .bind(normalized_label)
    .bind(&context)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Approve a mapping, optionally replacing the suggested label
pub async fn approve(
    pool: &SqlitePool,
    raw_label: &str,
    domain_category: &str,
    edited_label: Option<&str>,
    reviewer: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE label_mapping_cache
        SET status = 'APPROVED',
            normalized_label = COALESCE(?, normalized_label),
            last_reviewed_at = ?,
            reviewed_by = ?
        WHERE raw_label = ? AND domain_category = ?
        "#,
    )
    .bind(edited_label)
    .bind(Utc::now())
    .bind(reviewer)
    .bind(raw_label)
    .bind(domain_category)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn reject(
    pool: &SqlitePool,
    raw_label: &str,
    domain_category: &str,
    reviewer: &str,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE label_mapping_cache
        SET status = 'REJECTED', last_reviewed_at = ?, reviewed_by = ?
        WHERE raw_label = ? AND domain_category = ?
        "#,
    )
    .bind(Utc::now())
    .bind(reviewer)
    .bind(raw_label)
    .bind(domain_category)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Cache entries, optionally filtered by status, oldest first
pub async fn list(
    pool: &SqlitePool,
    status: Option<MappingStatus>,
    limit: i64,
) -> Result<Vec<LabelMapping>> {
    let rows = sqlx::query(
        r#"
        SELECT raw_label, domain_category, normalized_label, status, source_context,
               created_at, last_reviewed_at, reviewed_by
        FROM label_mapping_cache
        WHERE ? IS NULL OR status = ?
        ORDER BY created_at, raw_label
        LIMIT ?
        "#,
    )
    .bind(status.map(|s| s.as_str()))
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(mapping_from_row).collect()
}

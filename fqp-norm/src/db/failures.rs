//! Hard per-document discovery failures
//!
//! A failure blocks discovery only for the classifier version that produced
//! it; a version bump or an explicit clear re-enables the document.

use fqp_common::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Unit,
    Label,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Unit => "UNIT",
            Phase::Label => "LABEL",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNIT" => Ok(Phase::Unit),
            "LABEL" => Ok(Phase::Label),
            other => Err(format!("unknown phase '{}' (expected unit or label)", other)),
        }
    }
}

pub async fn record(
    pool: &SqlitePool,
    doc_id: i64,
    phase: Phase,
    classifier_version: &str,
    detail: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO phase_failures (doc_id, phase, classifier_version, detail)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(doc_id, phase) DO UPDATE SET
            classifier_version = excluded.classifier_version,
            detail = excluded.detail,
            recorded_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(doc_id)
    .bind(phase.as_str())
    .bind(classifier_version)
    .bind(detail)
    .execute(pool)
    .await?;

    Ok(())
}

/// Failure detail recorded for this document at `classifier_version`
pub async fn active(
    pool: &SqlitePool,
    doc_id: i64,
    phase: Phase,
    classifier_version: &str,
) -> Result<Option<String>> {
    let detail = sqlx::query_scalar(
        "SELECT detail FROM phase_failures WHERE doc_id = ? AND phase = ? AND classifier_version = ?",
    )
    .bind(doc_id)
    .bind(phase.as_str())
    .bind(classifier_version)
    .fetch_optional(pool)
    .await?;
    Ok(detail)
}

pub async fn clear(pool: &SqlitePool, doc_id: i64, phase: Phase) -> Result<bool> {
    let result = sqlx::query("DELETE FROM phase_failures WHERE doc_id = ? AND phase = ?")
        .bind(doc_id)
        .bind(phase.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

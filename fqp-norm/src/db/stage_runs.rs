//! Stage run persistence

use fqp_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteExecutor, SqlitePool, Transaction};

use crate::db::documents::PARSED_OK;
use crate::models::{StageRun, StageState, StageStatus, STAGE_COUNT};

const SELECT_COLUMNS: &str = "SELECT run_id, doc_id, \
     stage_1_status, stage_2_status, stage_3_status, stage_4_status, stage_5_status, \
     stage_1_version, stage_2_version, stage_3_version, stage_4_version, stage_5_version, \
     failure_reason, details FROM stage_runs";

fn check_stage(stage: usize) -> Result<()> {
    if (1..=STAGE_COUNT).contains(&stage) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("stage {} out of range", stage)))
    }
}

fn run_from_row(row: &SqliteRow) -> Result<StageRun> {
    let mut stages: [StageState; STAGE_COUNT] = Default::default();
    for (i, state) in stages.iter_mut().enumerate() {
        let status: String = row.try_get(format!("stage_{}_status", i + 1).as_str())?;
        state.status = StageStatus::from(status);
        state.version = row.try_get(format!("stage_{}_version", i + 1).as_str())?;
    }

    let details: Option<String> = row.try_get("details")?;

    Ok(StageRun {
        run_id: row.try_get("run_id")?,
        doc_id: row.try_get("doc_id")?,
        stages,
        failure_reason: row.try_get("failure_reason")?,
        details: details.as_deref().map(serde_json::from_str).transpose()?,
    })
}

/// Create a PENDING run for every parsed document that has none
pub async fn seed_missing(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO stage_runs (doc_id)
        SELECT p.doc_id FROM parsed_documents p
        WHERE p.parse_status = ?
          AND NOT EXISTS (SELECT 1 FROM stage_runs r WHERE r.doc_id = p.doc_id)
        "#,
    )
    .bind(PARSED_OK)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn load<'c>(executor: impl SqliteExecutor<'c>, doc_id: i64) -> Result<Option<StageRun>> {
    let sql = format!("{} WHERE doc_id = ?", SELECT_COLUMNS);
    let row = sqlx::query(&sql).bind(doc_id).fetch_optional(executor).await?;
    row.as_ref().map(run_from_row).transpose()
}

/// Runs whose document has passed label application
pub async fn list_label_approved(pool: &SqlitePool) -> Result<Vec<StageRun>> {
    let sql = format!(
        "{} WHERE doc_id IN (SELECT doc_id FROM staged_normalized_data \
         WHERE label_review_status = 'APPROVED') ORDER BY doc_id",
        SELECT_COLUMNS
    );
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(run_from_row).collect()
}

/// Outcome of one stage attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub version: Option<String>,
    pub failure_reason: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// Store a stage result if the stage still has the status it was read with
pub async fn record_outcome(
    pool: &SqlitePool,
    run_id: i64,
    stage: usize,
    expected: &StageStatus,
    outcome: &StageOutcome,
) -> Result<bool> {
    check_stage(stage)?;
    let details = outcome
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let sql = format!(
        "UPDATE stage_runs \
         SET stage_{k}_status = ?, stage_{k}_version = ?, failure_reason = ?, details = ?, \
             last_updated_at = CURRENT_TIMESTAMP \
         WHERE run_id = ? AND stage_{k}_status = ?",
        k = stage
    );
    let result = sqlx::query(&sql)
        .bind(outcome.status.as_str())
        .bind(outcome.version.as_deref())
        .bind(outcome.failure_reason.as_deref())
        .bind(details)
        .bind(run_id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Reset stage `stage` and every later stage where `stage` passed at a
/// version other than `current_version`
pub async fn reset_drifted_from(
    tx: &mut Transaction<'_, Sqlite>,
    stage: usize,
    current_version: &str,
) -> Result<u64> {
    check_stage(stage)?;

    let resets = (stage..=STAGE_COUNT)
        .map(|k| format!("stage_{k}_status = 'PENDING', stage_{k}_version = NULL"))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "UPDATE stage_runs \
         SET {resets}, failure_reason = ?, details = NULL, last_updated_at = CURRENT_TIMESTAMP \
         WHERE stage_{stage}_status = 'PASSED' \
           AND (stage_{stage}_version IS NULL OR stage_{stage}_version != ?)"
    );
    let reason = format!(
        "Resetting due to new Stage {} version '{}'",
        stage, current_version
    );

    let result = sqlx::query(&sql)
        .bind(reason)
        .bind(current_version)
        .execute(&mut **tx)
        .await?;

    Ok(result.rows_affected())
}

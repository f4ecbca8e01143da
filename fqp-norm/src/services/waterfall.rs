//! Waterfall reset of drifted stage runs
//!
//! A stage that passed under an older logic version is reset to PENDING
//! together with every later stage. Earlier stages are left alone.

use fqp_common::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::stage_runs;
use crate::models::{StageVersions, STAGE_COUNT};
use crate::utils::retry_on_lock;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaterfallReport {
    /// Runs reset by each stage's drift check, index 0 = stage 1
    pub resets: [u64; STAGE_COUNT],
}

impl WaterfallReport {
    pub fn total(&self) -> u64 {
        self.resets.iter().sum()
    }
}

/// Reset every run whose stamped version lags the deployed one
///
/// Stages are scanned 1 to 5 in one transaction; a run reset at stage k is
/// no longer PASSED at any later stage, so it is counted once.
pub async fn run_waterfall(
    pool: &SqlitePool,
    versions: &StageVersions,
    max_lock_wait_ms: u64,
) -> Result<WaterfallReport> {
    let report = retry_on_lock("waterfall_reset", max_lock_wait_ms, || {
        reset_all(pool, versions)
    })
    .await?;

    if report.total() > 0 {
        info!(resets = ?report.resets, "Waterfall reset stage runs");
    }
    Ok(report)
}

async fn reset_all(pool: &SqlitePool, versions: &StageVersions) -> Result<WaterfallReport> {
    let mut report = WaterfallReport::default();
    let mut tx = pool.begin().await?;

    for stage in 1..=STAGE_COUNT {
        let Some(current) = versions.current(stage) else {
            continue;
        };
        report.resets[stage - 1] = stage_runs::reset_drifted_from(&mut tx, stage, current).await?;
    }

    tx.commit().await?;
    Ok(report)
}

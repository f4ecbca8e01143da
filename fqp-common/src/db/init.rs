//! Database initialization
//!
//! Opens (or creates) the pipeline database and creates every table the
//! normalization and quality stages use. All statements are idempotent, so
//! this is safe to run at every process start.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Per-connection busy wait; longer contention is handled by `retry_on_lock`
const BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas go on the connect options so every pooled connection gets them
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    // Small pool: sweeps run at most 4 workers
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all pipeline tables and indexes
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_company_master_table(pool).await?;
    create_parsed_documents_table(pool).await?;
    create_staged_normalized_data_table(pool).await?;
    create_label_mapping_cache_table(pool).await?;
    create_unit_review_queue_table(pool).await?;
    create_stage_runs_table(pool).await?;
    create_phase_failures_table(pool).await?;

    info!("Database schema ready");
    Ok(())
}

async fn create_company_master_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS company_master (
            ticker TEXT PRIMARY KEY,
            company_name TEXT NOT NULL,
            domain_category TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Parsed documents are written by the extraction stage; read-only here
async fn create_parsed_documents_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsed_documents (
            doc_id INTEGER PRIMARY KEY,
            ticker TEXT NOT NULL,
            fiscal_year INTEGER NOT NULL,
            quarter INTEGER NOT NULL CHECK (quarter BETWEEN 1 AND 4),
            parse_status TEXT NOT NULL,
            content TEXT,
            parsed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_parsed_documents_status ON parsed_documents(parse_status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_staged_normalized_data_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staged_normalized_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id INTEGER NOT NULL UNIQUE REFERENCES parsed_documents(doc_id),
            ticker TEXT NOT NULL,
            fiscal_date TEXT NOT NULL,
            normalized_data TEXT NOT NULL,
            data_hash TEXT,
            statement_normalized INTEGER NOT NULL DEFAULT 0,
            unit_review_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (unit_review_status IN ('PENDING', 'AUTO_APPROVED', 'PENDING_REVIEW', 'APPROVED')),
            label_review_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (label_review_status IN ('PENDING', 'PENDING_REVIEW', 'APPROVED')),
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_staged_normalization_status
        ON staged_normalized_data(statement_normalized, unit_review_status, label_review_status)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Persistent, industry-scoped label approval cache
async fn create_label_mapping_cache_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS label_mapping_cache (
            raw_label TEXT NOT NULL,
            domain_category TEXT NOT NULL,
            normalized_label TEXT,
            status TEXT NOT NULL
                CHECK (status IN ('PENDING_REVIEW', 'APPROVED', 'REJECTED')),
            source_context TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_reviewed_at TIMESTAMP,
            reviewed_by TEXT,
            PRIMARY KEY (raw_label, domain_category)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_label_mapping_status ON label_mapping_cache(status)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_unit_review_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS unit_review_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id INTEGER NOT NULL UNIQUE REFERENCES parsed_documents(doc_id),
            ticker TEXT NOT NULL,
            fiscal_date TEXT NOT NULL,
            llm_analysis TEXT NOT NULL,
            filing_data TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING_REVIEW'
                CHECK (status IN ('PENDING_REVIEW', 'APPROVED', 'REJECTED')),
            reviewed_by TEXT,
            reviewed_at TIMESTAMP,
            human_corrections TEXT,
            applied_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-document five-stage quality state machine
async fn create_stage_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            doc_id INTEGER NOT NULL UNIQUE REFERENCES parsed_documents(doc_id),
            stage_1_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_2_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_3_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_4_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_5_status TEXT NOT NULL DEFAULT 'PENDING',
            stage_1_version TEXT,
            stage_2_version TEXT,
            stage_3_version TEXT,
            stage_4_version TEXT,
            stage_5_version TEXT,
            failure_reason TEXT,
            details TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Hard per-document discovery failures awaiting a version bump or manual fix
async fn create_phase_failures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS phase_failures (
            doc_id INTEGER NOT NULL REFERENCES parsed_documents(doc_id),
            phase TEXT NOT NULL CHECK (phase IN ('UNIT', 'LABEL')),
            classifier_version TEXT NOT NULL,
            detail TEXT NOT NULL,
            recorded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (doc_id, phase)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

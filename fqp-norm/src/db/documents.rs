//! Parsed documents and company context (read-only inputs)

use chrono::NaiveDate;
use fqp_common::Result;
use sqlx::{Row, SqliteExecutor, SqlitePool};

/// Parse status written by extraction for usable documents
pub const PARSED_OK: &str = "PARSED_OK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPeriod {
    pub doc_id: i64,
    pub ticker: String,
    pub fiscal_year: i32,
    pub quarter: u8,
}

/// Quarter-end date on the April-March fiscal calendar
///
/// Q1 ends 30 Jun of the fiscal year, Q4 ends 31 Mar of the next year.
pub fn fiscal_date(fiscal_year: i32, quarter: u8) -> Option<NaiveDate> {
    match quarter {
        1 => NaiveDate::from_ymd_opt(fiscal_year, 6, 30),
        2 => NaiveDate::from_ymd_opt(fiscal_year, 9, 30),
        3 => NaiveDate::from_ymd_opt(fiscal_year, 12, 31),
        4 => NaiveDate::from_ymd_opt(fiscal_year + 1, 3, 31),
        _ => None,
    }
}

/// Successfully parsed documents that have no staging record yet
pub async fn list_unstaged_documents(pool: &SqlitePool) -> Result<Vec<DocumentPeriod>> {
    let rows = sqlx::query(
        r#"
        SELECT p.doc_id, p.ticker, p.fiscal_year, p.quarter
        FROM parsed_documents p
        LEFT JOIN staged_normalized_data s ON s.doc_id = p.doc_id
        WHERE p.parse_status = ? AND s.id IS NULL
        ORDER BY p.doc_id
        "#,
    )
    .bind(PARSED_OK)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<DocumentPeriod> {
            Ok(DocumentPeriod {
                doc_id: row.try_get("doc_id")?,
                ticker: row.try_get("ticker")?,
                fiscal_year: row.try_get("fiscal_year")?,
                quarter: row.try_get::<i64, _>("quarter")? as u8,
            })
        })
        .collect()
}

/// Raw extracted content of a document, if any
pub async fn load_content<'c>(
    executor: impl SqliteExecutor<'c>,
    doc_id: i64,
) -> Result<Option<String>> {
    let content: Option<Option<String>> =
        sqlx::query_scalar("SELECT content FROM parsed_documents WHERE doc_id = ?")
            .bind(doc_id)
            .fetch_optional(executor)
            .await?;
    Ok(content.flatten())
}

/// Domain category from the company master, if the company is known
pub async fn domain_category_for<'c>(
    executor: impl SqliteExecutor<'c>,
    ticker: &str,
) -> Result<Option<String>> {
    let category: Option<Option<String>> =
        sqlx::query_scalar("SELECT domain_category FROM company_master WHERE ticker = ?")
            .bind(ticker)
            .fetch_optional(executor)
            .await?;
    Ok(category
        .flatten()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty()))
}

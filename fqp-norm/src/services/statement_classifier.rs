//! Statement classification
//!
//! Assigns each raw statement block to one of the six canonical slots using
//! the free-text -> slot hints produced during acquisition. No oracle call.

use fqp_common::Result;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

use crate::db::{self, documents, staged};
use crate::models::{
    DropReason, DroppedBlock, NormalizedPayload, ParsedContent, SlotEntry, StatementMetadata,
    StatementNormalized, StatementSlot,
};
use crate::services::DocumentOutcome;
use crate::utils::retry_on_lock;

/// Classify raw blocks into slots; every slot is present in the output
pub fn classify_statements(content: &ParsedContent) -> StatementNormalized {
    let statement_mapping: BTreeMap<String, String> = content
        .statements_found
        .iter()
        .map(|hint| (hint.statement_name.trim().to_string(), hint.mapping.clone()))
        .collect();

    let mut assigned: HashMap<StatementSlot, SlotEntry> = HashMap::new();
    let mut dropped = Vec::new();

    for block in &content.statements {
        let name = block.statement_type.trim();
        let mapping = statement_mapping.get(name);

        let Some(slot) = mapping.and_then(|m| StatementSlot::parse(m)) else {
            warn!(
                statement = name,
                mapping = ?mapping,
                "No slot for statement block, dropping"
            );
            dropped.push(DroppedBlock {
                statement_type: block.statement_type.clone(),
                reason: DropReason::Unmapped,
                mapping: mapping.cloned(),
            });
            continue;
        };

        if assigned.contains_key(&slot) {
            warn!(
                statement = name,
                slot = %slot,
                "Slot already filled by an earlier block, dropping duplicate"
            );
            dropped.push(DroppedBlock {
                statement_type: block.statement_type.clone(),
                reason: DropReason::DuplicateSlot,
                mapping: mapping.cloned(),
            });
            continue;
        }

        assigned.insert(slot, SlotEntry::Provided(block.clone()));
    }

    let mut slots = BTreeMap::new();
    let mut found_statements = Vec::new();
    let mut missing_statements = Vec::new();
    for slot in StatementSlot::ALL {
        match assigned.remove(&slot) {
            Some(entry) => {
                found_statements.push(slot);
                slots.insert(slot, entry);
            }
            None => {
                missing_statements.push(slot);
                slots.insert(slot, SlotEntry::NotProvided);
            }
        }
    }

    StatementNormalized {
        slots,
        metadata: StatementMetadata {
            found_statements,
            missing_statements,
            total_statements_processed: content.statements.len(),
            statement_mapping,
            dropped,
        },
    }
}

/// Stages parsed documents and runs statement classification on them
#[derive(Clone)]
pub struct StatementClassifier {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl StatementClassifier {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub async fn pending_documents(&self) -> Result<Vec<i64>> {
        staged::pending_statement_ids(&self.pool).await
    }

    /// Create staging records for parsed documents that have none
    pub async fn stage_new_documents(&self) -> Result<usize> {
        let pending = documents::list_unstaged_documents(&self.pool).await?;
        let initial = NormalizedPayload::Staged;
        let mut staged_count = 0;

        for period in &pending {
            let Some(date) = db::fiscal_date(period.fiscal_year, period.quarter) else {
                warn!(
                    doc_id = period.doc_id,
                    quarter = period.quarter,
                    "Invalid fiscal quarter, not staging"
                );
                continue;
            };

            let inserted = retry_on_lock("stage_document", self.max_lock_wait_ms, || {
                staged::insert_staged(&self.pool, period, date, &initial)
            })
            .await?;

            if inserted {
                debug!(doc_id = period.doc_id, ticker = %period.ticker, fiscal_date = %date, "Staged document");
                staged_count += 1;
            }
        }

        if staged_count > 0 {
            info!(count = staged_count, "Staged new documents");
        }
        Ok(staged_count)
    }

    /// Classify one staged document's statements
    pub async fn normalize_document(&self, doc_id: i64) -> Result<DocumentOutcome> {
        let Some(record) = staged::load_staged(&self.pool, doc_id).await? else {
            return Ok(DocumentOutcome::Skipped);
        };
        if record.statement_normalized {
            return Ok(DocumentOutcome::Skipped);
        }

        let Some(raw) = documents::load_content(&self.pool, doc_id).await? else {
            error!(doc_id, "Parsed document has no content");
            return Ok(DocumentOutcome::Failed);
        };
        let content: ParsedContent = match serde_json::from_str(&raw) {
            Ok(content) => content,
            Err(e) => {
                error!(doc_id, error = %e, "Parsed content has an unexpected structure");
                return Ok(DocumentOutcome::Failed);
            }
        };

        let statement = classify_statements(&content);
        let found = statement.metadata.found_statements.len();
        let payload = match record.payload.with_statement(statement) {
            Ok(payload) => payload,
            Err(e) => {
                error!(doc_id, error = %e, "Cannot attach statement classification");
                return Ok(DocumentOutcome::Failed);
            }
        };

        let updated = retry_on_lock("mark_statement_normalized", self.max_lock_wait_ms, || {
            self.commit_statement(doc_id, &payload)
        })
        .await?;

        if updated {
            info!(doc_id, ticker = %record.ticker, found, "Statement classification stored");
            Ok(DocumentOutcome::Advanced)
        } else {
            debug!(doc_id, "Statement classification already stored by another sweep");
            Ok(DocumentOutcome::Skipped)
        }
    }

    async fn commit_statement(&self, doc_id: i64, payload: &NormalizedPayload) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = staged::mark_statement_normalized(&mut tx, doc_id, payload).await?;
        tx.commit().await?;
        Ok(updated)
    }
}

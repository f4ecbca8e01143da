//! Test Helper Utilities
//!
//! Shared fixtures for the fqp-norm integration tests: a temporary
//! database, parsed-document fixtures, a small taxonomy and a scripted
//! oracle that counts its calls.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fqp_norm::db::label_cache;
use fqp_norm::models::{MappingStatus, UnitAnalysis};
use fqp_norm::services::oracle_client::{
    LabelDiscoveryRequest, LabelSuggestions, UnitDiscoveryRequest,
};
use fqp_norm::services::{
    Oracle, OracleError, PipelineContext, Playbook, PlaybookRegistry, StatementClassifier,
};
use fqp_norm::utils::BackoffPolicy;

pub const TICKER: &str = "HDFCBANK";
pub const DOMAIN: &str = "banking";
pub const LOCK_WAIT_MS: u64 = 2000;

/// Create temporary test database with the pipeline schema
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("create temp dir");
    let db_path = temp_dir.path().join("test_fqp.db");
    let pool = fqp_common::db::init_database(&db_path)
        .await
        .expect("init test database");
    (temp_dir, pool)
}

pub async fn insert_company(pool: &SqlitePool, ticker: &str, domain_category: Option<&str>) {
    sqlx::query(
        "INSERT INTO company_master (ticker, company_name, domain_category) VALUES (?, ?, ?)",
    )
    .bind(ticker)
    .bind(format!("{} Ltd", ticker))
    .bind(domain_category)
    .execute(pool)
    .await
    .expect("insert company");
}

pub async fn insert_document(pool: &SqlitePool, doc_id: i64, ticker: &str, content: &Value) {
    sqlx::query(
        r#"
        INSERT INTO parsed_documents (doc_id, ticker, fiscal_year, quarter, parse_status, content)
        VALUES (?, ?, 2024, 1, 'PARSED_OK', ?)
        "#,
    )
    .bind(doc_id)
    .bind(ticker)
    .bind(content.to_string())
    .execute(pool)
    .await
    .expect("insert parsed document");
}

/// One standalone P&L block with the given `(label, value)` figures
pub fn pnl_content(figures: &[(&str, f64)]) -> Value {
    let figures: Vec<Value> = figures
        .iter()
        .map(|(label, value)| json!({ "label": label, "value": value }))
        .collect();
    json!({
        "statements_found": [
            { "statement_name": "Standalone Financial Results", "mapping": "standalone_pnl" }
        ],
        "statements": [
            {
                "statement_type": "Standalone Financial Results",
                "currency": "in lacs",
                "figures": figures
            }
        ]
    })
}

/// The figures every "complete" fixture document carries
pub fn bank_figures() -> Vec<(&'static str, f64)> {
    vec![
        ("Interest Earned", 1000.0),
        ("Net Profit", 120.0),
        ("Capital Adequacy Ratio (%)", 16.5),
    ]
}

pub const TEST_PLAYBOOK: &str = r#"
statement: pnl
nodes:
  - id: income
    children:
      - id: interest_earned
  - id: net_profit
  - id: capital_adequacy_ratio
  - id: earnings_per_share_diluted
    extractable: false
---
statement: balance_sheet
nodes:
  - id: total_assets
"#;

pub fn test_registry() -> Arc<PlaybookRegistry> {
    let mut registry = PlaybookRegistry::default();
    registry.insert(Playbook::from_yaml_str(DOMAIN, TEST_PLAYBOOK).expect("parse test playbook"));
    registry.add_alias("banks", DOMAIN);
    Arc::new(registry)
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

pub fn test_context(pool: &SqlitePool, oracle: Option<Arc<ScriptedOracle>>) -> PipelineContext {
    let ctx = PipelineContext::new(pool.clone(), LOCK_WAIT_MS).with_backoff(fast_backoff());
    match oracle {
        Some(oracle) => ctx.with_oracle(oracle),
        None => ctx,
    }
}

/// Stage every parsed document and classify its statements
pub async fn stage_and_classify(pool: &SqlitePool) {
    let classifier = StatementClassifier::new(pool.clone(), LOCK_WAIT_MS);
    classifier.stage_new_documents().await.expect("stage documents");
    for doc_id in classifier.pending_documents().await.expect("pending statements") {
        classifier
            .normalize_document(doc_id)
            .await
            .expect("classify statements");
    }
}

/// Approve every label still awaiting review, keeping the suggested ids
pub async fn approve_pending_labels(pool: &SqlitePool) -> usize {
    let pending = label_cache::list(pool, Some(MappingStatus::PendingReview), 1000)
        .await
        .expect("list pending labels");
    for mapping in &pending {
        label_cache::approve(pool, &mapping.raw_label, &mapping.domain_category, None, "tester")
            .await
            .expect("approve label");
    }
    pending.len()
}

pub fn figure(label: &str, value: f64, representation: &str, confidence: &str) -> Value {
    let currency = (representation == "currency").then_some("lacs");
    json!({
        "label": label,
        "value": value,
        "representation": representation,
        "currency_context": currency,
        "confidence": confidence
    })
}

pub fn unit_analysis(statement_type: &str, figures: Vec<Value>, requires_review: bool) -> UnitAnalysis {
    serde_json::from_value(json!({
        "filing_analysis": {
            "requires_human_review": requires_review,
            "overall_confidence": if requires_review { "low" } else { "high" },
            "currency_contexts_found": ["lacs"]
        },
        "statement_analyses": [
            {
                "statement_type": statement_type,
                "statement_currency": "in lacs",
                "figures": figures
            }
        ]
    }))
    .expect("valid unit analysis")
}

/// High-confidence analysis matching `bank_figures`
pub fn confident_bank_analysis() -> UnitAnalysis {
    unit_analysis(
        "standalone_pnl",
        vec![
            figure("Interest Earned", 1000.0, "currency", "high"),
            figure("Net Profit", 120.0, "currency", "high"),
            figure("Capital Adequacy Ratio (%)", 16.5, "percentage", "high"),
        ],
        false,
    )
}

/// Suggested canonical ids for the fixture labels
pub fn bank_label_answers() -> Vec<(&'static str, Option<&'static str>)> {
    vec![
        ("Interest Earned", Some("interest_earned")),
        ("Net Profit", Some("net_profit")),
        ("Capital Adequacy Ratio (%)", Some("capital_adequacy_ratio")),
    ]
}

/// Oracle double with scripted answers and call counters
///
/// Unit calls pop scripted results in order; an empty script is a
/// transport error. Label calls first pop scripted errors, then answer
/// each requested label from the answer table, omitting unknown labels.
#[derive(Default)]
pub struct ScriptedOracle {
    unit_script: Mutex<VecDeque<Result<UnitAnalysis, OracleError>>>,
    label_errors: Mutex<VecDeque<OracleError>>,
    label_answers: Mutex<HashMap<String, Option<String>>>,
    label_requests: Mutex<Vec<LabelDiscoveryRequest>>,
    unit_calls: AtomicUsize,
    label_calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_units(&self, result: Result<UnitAnalysis, OracleError>) {
        self.unit_script.lock().unwrap().push_back(result);
    }

    pub fn push_label_error(&self, error: OracleError) {
        self.label_errors.lock().unwrap().push_back(error);
    }

    pub fn answer(&self, raw_label: &str, canonical_id: Option<&str>) {
        self.label_answers
            .lock()
            .unwrap()
            .insert(raw_label.to_string(), canonical_id.map(str::to_string));
    }

    pub fn answer_all(&self, answers: &[(&str, Option<&str>)]) {
        for (raw_label, id) in answers {
            self.answer(raw_label, *id);
        }
    }

    pub fn forget(&self, raw_label: &str) {
        self.label_answers.lock().unwrap().remove(raw_label);
    }

    pub fn unit_calls(&self) -> usize {
        self.unit_calls.load(Ordering::SeqCst)
    }

    pub fn label_calls(&self) -> usize {
        self.label_calls.load(Ordering::SeqCst)
    }

    /// Every raw label sent so far, in request order
    pub fn requested_labels(&self) -> Vec<String> {
        self.label_requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|r| r.raw_labels.iter().cloned())
            .collect()
    }

    pub fn label_requests(&self) -> Vec<LabelDiscoveryRequest> {
        self.label_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn classify_units(
        &self,
        _request: &UnitDiscoveryRequest,
    ) -> Result<UnitAnalysis, OracleError> {
        self.unit_calls.fetch_add(1, Ordering::SeqCst);
        self.unit_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::Transport("no scripted response".to_string())))
    }

    async fn map_labels(
        &self,
        request: &LabelDiscoveryRequest,
    ) -> Result<LabelSuggestions, OracleError> {
        self.label_calls.fetch_add(1, Ordering::SeqCst);
        self.label_requests.lock().unwrap().push(request.clone());

        if let Some(error) = self.label_errors.lock().unwrap().pop_front() {
            return Err(error);
        }

        let answers = self.label_answers.lock().unwrap();
        Ok(request
            .raw_labels
            .iter()
            .filter_map(|label| answers.get(label).map(|id| (label.clone(), id.clone())))
            .collect())
    }
}

//! Normalization phases and the quality engine
//!
//! Each phase exposes a `pending_*` query and a per-document entry point
//! that returns a [`DocumentOutcome`]; the orchestrator drives them as
//! independent sweeps.

pub mod completeness;
pub mod label_mapper;
pub mod oracle_client;
pub mod quality_engine;
pub mod statement_classifier;
pub mod taxonomy;
pub mod unit_classifier;
pub mod waterfall;

use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::utils::BackoffPolicy;

pub use completeness::{check_completeness, CompletenessResult};
pub use label_mapper::{statement_key_for, LabelMapper};
pub use oracle_client::{HttpOracleClient, Oracle, OracleError};
pub use quality_engine::{CompletenessStage, QualityEngine, QualityReport, StageRunner};
pub use statement_classifier::{classify_statements, StatementClassifier};
pub use taxonomy::{collect_leaves, Playbook, PlaybookRegistry, TaxonomyNode};
pub use unit_classifier::{build_unit_request, UnitClassifier};
pub use waterfall::{run_waterfall, WaterfallReport};

/// Result of one per-document phase step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentOutcome {
    /// Phase flag moved forward
    Advanced,
    /// Nothing to do, or another sweep already did it
    Skipped,
    /// Oracle retries exhausted; status left for the next sweep
    Deferred,
    /// Hard per-document failure
    Failed,
}

/// Handles shared by the oracle-backed phases
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: SqlitePool,
    /// `None` disables discovery
    pub oracle: Option<Arc<dyn Oracle>>,
    pub backoff: BackoffPolicy,
    pub cancel: CancellationToken,
    pub max_lock_wait_ms: u64,
}

impl PipelineContext {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            oracle: None,
            backoff: BackoffPolicy::default(),
            cancel: CancellationToken::new(),
            max_lock_wait_ms,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn Oracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

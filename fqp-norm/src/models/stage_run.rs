//! Per-document quality stage state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of quality stages tracked per document
pub const STAGE_COUNT: usize = 5;

/// Failure kind recorded by stage 1
pub const COMPLETENESS_ERROR: &str = "COMPLETENESS_ERROR";

/// Status of a single stage
///
/// Failure kinds are stage-specific, so anything other than `PENDING` or
/// `PASSED` is carried as a named failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageStatus {
    Pending,
    Passed,
    Failed(String),
}

impl StageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::Passed => "PASSED",
            StageStatus::Failed(kind) => kind,
        }
    }
}

impl From<String> for StageStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PENDING" => StageStatus::Pending,
            "PASSED" => StageStatus::Passed,
            _ => StageStatus::Failed(value),
        }
    }
}

impl From<StageStatus> for String {
    fn from(value: StageStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    /// Logic version stamped when the stage last completed
    pub version: Option<String>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: StageStatus::Pending,
            version: None,
        }
    }
}

/// One row of `stage_runs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRun {
    pub run_id: i64,
    pub doc_id: i64,
    pub stages: [StageState; STAGE_COUNT],
    pub failure_reason: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl StageRun {
    /// State of stage `stage` (1-based)
    pub fn stage(&self, stage: usize) -> Option<&StageState> {
        stage.checked_sub(1).and_then(|i| self.stages.get(i))
    }
}

/// Currently deployed logic version of each stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageVersions(pub [Option<String>; STAGE_COUNT]);

impl StageVersions {
    /// Deployed version of stage `stage` (1-based); `None` when not deployed
    pub fn current(&self, stage: usize) -> Option<&str> {
        stage
            .checked_sub(1)
            .and_then(|i| self.0.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Stage passed at the currently deployed version
    pub fn is_current(&self, run: &StageRun, stage: usize) -> bool {
        match (self.current(stage), run.stage(stage)) {
            (Some(version), Some(state)) => {
                state.status == StageStatus::Passed && state.version.as_deref() == Some(version)
            }
            _ => false,
        }
    }

    /// Gating rule: a stage may run when its logic is deployed, it has not
    /// already passed at that version, and the previous stage is current
    pub fn may_attempt(&self, run: &StageRun, stage: usize) -> bool {
        if self.current(stage).is_none() || self.is_current(run, stage) {
            return false;
        }
        stage == 1 || self.is_current(run, stage - 1)
    }
}

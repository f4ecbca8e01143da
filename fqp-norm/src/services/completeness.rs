//! Completeness check (quality stage 1)
//!
//! A statement passes when every expected taxonomy leaf is present with a
//! value. Extra ids are reported but never fail the check, so the taxonomy
//! can grow ahead of the data.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::models::CanonicalStatement;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletenessResult {
    pub passed: bool,
    pub missing_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unexpected_ids: Vec<String>,
    /// No canonical map at all, as opposed to an incomplete one
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub statement_missing: bool,
}

impl CompletenessResult {
    /// Structured detail stored on the stage run
    pub fn details(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Compare a canonical statement with the expected leaf ids
pub fn check_completeness(
    statement: Option<&CanonicalStatement>,
    expected: &[String],
) -> CompletenessResult {
    let expected: BTreeSet<&str> = expected.iter().map(String::as_str).collect();

    let Some(statement) = statement else {
        return CompletenessResult {
            passed: false,
            missing_ids: expected.into_iter().map(str::to_string).collect(),
            unexpected_ids: Vec::new(),
            statement_missing: true,
        };
    };

    let present: BTreeSet<&str> = statement
        .iter()
        .filter(|(_, figure)| figure.value.is_some())
        .map(|(id, _)| id.as_str())
        .collect();

    let missing_ids: Vec<String> = expected
        .difference(&present)
        .map(|id| id.to_string())
        .collect();
    let unexpected_ids: Vec<String> = present
        .difference(&expected)
        .map(|id| id.to_string())
        .collect();

    CompletenessResult {
        passed: missing_ids.is_empty(),
        missing_ids,
        unexpected_ids,
        statement_missing: false,
    }
}

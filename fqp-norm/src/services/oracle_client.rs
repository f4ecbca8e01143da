//! Classification oracle client
//!
//! The oracle is an external, rate-limited HTTP service. Callers receive an
//! explicit handle (`Arc<dyn Oracle>`) and never reach for global state. Each
//! trait method is a single attempt; retry policy belongs to the caller.

use async_trait::async_trait;
use fqp_common::config::OracleConfig;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::models::UnitAnalysis;
use crate::utils::Retryable;

const UNITS_PATH: &str = "/v1/units/classify";
const LABELS_PATH: &str = "/v1/labels/map";

/// Longest response excerpt kept in error messages
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle request timed out")]
    Timeout,

    #[error("oracle returned HTTP {0}: {1}")]
    Status(u16, String),

    /// Body received but not JSON at all
    #[error("oracle response is not JSON: {0}")]
    InvalidBody(String),

    /// JSON received but not in the expected shape
    #[error("malformed oracle response: {0}")]
    Malformed(String),

    #[error("oracle call cancelled")]
    Cancelled,

    #[error("oracle client is closed")]
    Closed,
}

impl Retryable for OracleError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            OracleError::Transport(_)
                | OracleError::Timeout
                | OracleError::Status(..)
                | OracleError::InvalidBody(_)
        )
    }

    fn cancelled() -> Self {
        OracleError::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFigureInput {
    pub label: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitStatementInput {
    /// Slot name; echoed back as `statement_type`
    #[serde(rename = "type")]
    pub statement_type: String,
    pub currency: Option<String>,
    pub figures: Vec<UnitFigureInput>,
}

/// One request per document, covering every figure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitDiscoveryRequest {
    pub statements: Vec<UnitStatementInput>,
}

/// One request per statement, covering only uncached labels
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelDiscoveryRequest {
    pub domain_category: String,
    pub statement_key: String,
    pub standard_names: Vec<String>,
    pub raw_labels: Vec<String>,
    pub statement_currency: Option<String>,
}

/// raw label -> canonical id, `None` for "no confident match"
pub type LabelSuggestions = BTreeMap<String, Option<String>>;

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn classify_units(&self, request: &UnitDiscoveryRequest)
        -> Result<UnitAnalysis, OracleError>;

    async fn map_labels(
        &self,
        request: &LabelDiscoveryRequest,
    ) -> Result<LabelSuggestions, OracleError>;
}

/// Validate and decode a unit discovery response
pub fn parse_unit_analysis(body: Value) -> Result<UnitAnalysis, OracleError> {
    let object = body
        .as_object()
        .ok_or_else(|| OracleError::Malformed("response is not a JSON object".to_string()))?;

    for section in ["filing_analysis", "statement_analyses"] {
        if !object.contains_key(section) {
            return Err(OracleError::Malformed(format!("missing '{}' section", section)));
        }
    }

    serde_json::from_value(body).map_err(|e| OracleError::Malformed(e.to_string()))
}

/// Validate and decode a label discovery response
///
/// Every value must be a string or `null`; blank strings count as `null`.
pub fn parse_label_suggestions(body: Value) -> Result<LabelSuggestions, OracleError> {
    let Value::Object(object) = body else {
        return Err(OracleError::Malformed(
            "response is not a JSON object".to_string(),
        ));
    };

    object
        .into_iter()
        .map(|(raw_label, value)| match value {
            Value::Null => Ok((raw_label.trim().to_string(), None)),
            Value::String(id) => {
                let id = id.trim();
                let id = (!id.is_empty()).then(|| id.to_string());
                Ok((raw_label.trim().to_string(), id))
            }
            other => Err(OracleError::Malformed(format!(
                "mapping for '{}' is neither a string nor null: {}",
                raw_label, other
            ))),
        })
        .collect()
}

type DirectRateLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// HTTP oracle client with a request deadline and a per-minute quota
pub struct HttpOracleClient {
    base_url: String,
    api_key: Option<String>,
    http: RwLock<Option<reqwest::Client>>,
    rate_limiter: DirectRateLimiter,
}

impl HttpOracleClient {
    /// Build the client; no request is made until the first call
    pub fn connect(config: &OracleConfig, api_key: Option<String>) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_minute(per_minute));

        info!(
            base_url = %config.base_url,
            requests_per_minute = per_minute.get(),
            timeout_secs = config.timeout_secs,
            "Oracle client connected"
        );

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            http: RwLock::new(Some(http)),
            rate_limiter,
        })
    }

    /// Release the HTTP client; later calls fail with `Closed`
    pub async fn close(&self) {
        if self.http.write().await.take().is_some() {
            info!("Oracle client closed");
        }
    }

    async fn post_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<Value, OracleError> {
        let http = self.http.read().await.clone().ok_or(OracleError::Closed)?;

        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Calling oracle");

        let mut request = http.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16(), excerpt(&text)));
        }

        serde_json::from_str(&text).map_err(|e| OracleError::InvalidBody(e.to_string()))
    }
}

#[async_trait]
impl Oracle for HttpOracleClient {
    async fn classify_units(
        &self,
        request: &UnitDiscoveryRequest,
    ) -> Result<UnitAnalysis, OracleError> {
        let body = self.post_json(UNITS_PATH, request).await?;
        parse_unit_analysis(body)
    }

    async fn map_labels(
        &self,
        request: &LabelDiscoveryRequest,
    ) -> Result<LabelSuggestions, OracleError> {
        let body = self.post_json(LABELS_PATH, request).await?;
        parse_label_suggestions(body)
    }
}

fn transport_error(err: reqwest::Error) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout
    } else {
        OracleError::Transport(err.to_string())
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(ERROR_BODY_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Confidence;
    use serde_json::json;

    #[test]
    fn test_unit_response_requires_both_sections() {
        let err = parse_unit_analysis(json!({ "statement_analyses": [] })).unwrap_err();
        assert_eq!(
            err,
            OracleError::Malformed("missing 'filing_analysis' section".to_string())
        );

        let err = parse_unit_analysis(json!({ "filing_analysis": {} })).unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));

        assert!(matches!(
            parse_unit_analysis(json!([1, 2])),
            Err(OracleError::Malformed(_))
        ));
    }

    #[test]
    fn test_unit_response_decoded() {
        let analysis = parse_unit_analysis(json!({
            "filing_analysis": { "requires_human_review": false },
            "statement_analyses": [{
                "statement_type": "standalone_pnl",
                "figures": [{
                    "label": "Interest earned",
                    "value": 1200.5,
                    "representation": "currency",
                    "currency_context": "lacs",
                    "ratio_context": null,
                    "confidence": "high",
                    "reasoning": "statement currency"
                }]
            }]
        }))
        .unwrap();

        assert_eq!(analysis.total_figures(), 1);
        assert_eq!(
            analysis.statement_analyses[0].figures[0].confidence,
            Confidence::High
        );
    }

    #[test]
    fn test_unit_response_bad_enum_is_malformed() {
        let err = parse_unit_analysis(json!({
            "filing_analysis": {},
            "statement_analyses": [{
                "statement_type": "standalone_pnl",
                "figures": [{
                    "label": "x", "value": 1.0, "representation": "currency",
                    "confidence": "medium"
                }]
            }]
        }))
        .unwrap_err();
        assert!(matches!(err, OracleError::Malformed(_)));
    }

    #[test]
    fn test_label_suggestions_allow_null() {
        let suggestions = parse_label_suggestions(json!({
            " Interest earned ": "interest_earned",
            "Obscure item": null,
            "Blank": "  "
        }))
        .unwrap();

        assert_eq!(
            suggestions.get("Interest earned"),
            Some(&Some("interest_earned".to_string()))
        );
        assert_eq!(suggestions.get("Obscure item"), Some(&None));
        assert_eq!(suggestions.get("Blank"), Some(&None));
    }

    #[test]
    fn test_label_suggestions_reject_non_string() {
        assert!(matches!(
            parse_label_suggestions(json!({ "x": 3 })),
            Err(OracleError::Malformed(_))
        ));
        assert!(matches!(
            parse_label_suggestions(json!(["x"])),
            Err(OracleError::Malformed(_))
        ));
    }

    #[test]
    fn test_retry_classification() {
        assert!(OracleError::Timeout.is_retryable());
        assert!(OracleError::Status(503, String::new()).is_retryable());
        assert!(OracleError::InvalidBody("eof".to_string()).is_retryable());
        assert!(!OracleError::Malformed("shape".to_string()).is_retryable());
        assert!(!OracleError::Cancelled.is_retryable());
        assert!(!OracleError::Closed.is_retryable());
    }

    #[test]
    fn test_unit_request_uses_type_key() {
        let request = UnitDiscoveryRequest {
            statements: vec![UnitStatementInput {
                statement_type: "standalone_pnl".to_string(),
                currency: Some("in lacs".to_string()),
                figures: vec![UnitFigureInput {
                    label: "Interest earned".to_string(),
                    value: Some(1.0),
                }],
            }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["statements"][0]["type"], "standalone_pnl");
    }
}

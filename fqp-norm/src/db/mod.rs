//! Database access for fqp-norm
//!
//! Schema creation lives in `fqp_common::db`; these modules hold the queries.

pub mod documents;
pub mod failures;
pub mod label_cache;
pub mod report;
pub mod stage_runs;
pub mod staged;
pub mod unit_reviews;

pub use documents::{fiscal_date, DocumentPeriod, PARSED_OK};
pub use failures::Phase;
pub use report::{status_report, StatusReport};
pub use stage_runs::StageOutcome;
pub use staged::StagedRecord;

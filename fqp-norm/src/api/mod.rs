//! HTTP API handlers for fqp-norm
//!
//! A small review surface: health, label cache decisions, unit review queue
//! decisions and the pipeline status report.

pub mod health;
pub mod review;

pub use health::health_routes;
pub use review::review_routes;

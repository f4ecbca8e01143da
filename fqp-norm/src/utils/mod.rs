//! Utility modules for fqp-norm

pub mod backoff;
pub mod db_retry;

pub use backoff::{BackoffPolicy, Retryable};
pub use db_retry::retry_on_lock;

//! # FQP Common Library
//!
//! Shared code for the filing quality pipeline crates:
//! - Error type used across the database and configuration layers
//! - TOML configuration loading with CLI/ENV/file/default priority
//! - SQLite bootstrap (pool options, pragmas, table creation)

pub mod config;
pub mod db;
pub mod error;

pub use error::{Error, Result};
